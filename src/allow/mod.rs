//! The on-disk allow-list.
//!
//! Layout: `<root>/queries/<name>.yaml`, one item per file, plus
//! `<root>/fragments/<name>.gql` with reusable fragments. In production the
//! allow-list bounds what the server may execute; arbitrary documents are
//! rejected.

mod apq;

pub use apq::{ApqCache, ApqEntry};

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::parser::FragmentFetcher;
use crate::{Error, Result};

const QUERIES_DIR: &str = "queries";
const FRAGMENTS_DIR: &str = "fragments";

/// One allow-list item as stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Item {
    /// Derived from the first named operation when absent.
    pub name: String,
    pub query: String,
    /// Declared variables JSON; doubles as the compile-time variables for
    /// mutations.
    pub vars: Option<serde_json::Value>,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Metadata {
    pub order: OrderMetadata,
}

/// Declares that `order_by: $var` takes one of a discrete set of values, so
/// each value gets its own compiled statement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderMetadata {
    pub var: Option<String>,
    pub values: Vec<String>,
}

#[derive(Debug)]
pub struct List {
    dir: PathBuf,
}

impl List {
    /// Open the allow-list root; the `queries` directory must exist.
    pub fn new(dir: &Path) -> Result<List> {
        let queries = dir.join(QUERIES_DIR);
        if !queries.is_dir() {
            return Err(Error::Config(format!(
                "allow list: dir not found: {}",
                queries.display()
            )));
        }
        Ok(List {
            dir: dir.to_path_buf(),
        })
    }

    /// Load every item, sorted by file name so startup compilation order is
    /// stable.
    pub fn load(&self) -> Result<Vec<Item>> {
        let dir = self.dir.join(QUERIES_DIR);
        let mut paths: Vec<PathBuf> = std::fs::read_dir(&dir)
            .map_err(|e| Error::Config(format!("allow list: {e}")))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| {
                matches!(
                    p.extension().and_then(|x| x.to_str()),
                    Some("yaml") | Some("yml")
                )
            })
            .collect();
        paths.sort();

        let mut items = Vec::with_capacity(paths.len());
        for path in paths {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| Error::Config(format!("allow list: {}: {e}", path.display())))?;
            let mut item: Item = serde_yaml::from_str(&text)
                .map_err(|e| Error::Config(format!("allow list: {}: {e}", path.display())))?;
            if item.query.is_empty() {
                continue;
            }
            if item.name.is_empty() {
                let (_, name) = crate::parser::operation(&item.query);
                item.name = if name.is_empty() {
                    "<anonymous>".to_string()
                } else {
                    name.to_string()
                };
            }
            items.push(item);
        }
        Ok(items)
    }

    /// A fetcher reading `<root>/fragments/<name>.gql`, handed to the parser
    /// so fragment resolution stays late-bound.
    pub fn fragment_fetcher(&self) -> FragmentFetcher {
        let dir = self.dir.join(FRAGMENTS_DIR);
        Arc::new(move |name: &str| {
            let mut path = dir.join(name);
            if path.extension().is_none() {
                path.set_extension("gql");
            }
            std::fs::read_to_string(&path)
                .map_err(|_| Error::parse(format!("fragment not found: {name}")))
        })
    }
}
