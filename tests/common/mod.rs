//! Shared fixtures: an in-memory pool that replays scripted rows and records
//! every statement, plus the catalog snapshot the tests compile against.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gqlc::db::{Connection, Param, Pool, RemoteClient, Row, Rows};
use gqlc::schema::DbInfo;
use gqlc::{Config, Result};

pub fn test_info() -> DbInfo {
    DbInfo::build("public")
        .table("users", |t| {
            t.pk("id", "bigint")
                .col("email", "text")
                .col("phone", "text")
                .col("stripe_id", "text")
        })
        .table("posts", |t| {
            t.pk("id", "bigint")
                .col("title", "text")
                .col("body", "text")
                .fk("user_id", "bigint", "users", "id")
                .tsv("tsv")
        })
        .table("chats", |t| t.pk("id", "bigint").col("body", "text"))
        .done()
}

pub fn base_config() -> Config {
    Config {
        disable_allow_list: true,
        ..Default::default()
    }
}

#[derive(Default)]
pub struct MockState {
    pub responses: Mutex<VecDeque<Rows>>,
    pub log: Mutex<Vec<(String, Vec<Param>)>>,
}

#[derive(Clone, Default)]
pub struct MockPool {
    pub state: Arc<MockState>,
}

impl MockPool {
    pub fn new() -> MockPool {
        MockPool::default()
    }

    /// Queue a single-row, single-column response holding `json` text.
    pub fn push_json(&self, json: &str) {
        self.state.responses.lock().unwrap().push_back(Rows {
            rows: vec![Row {
                values: vec![Some(json.as_bytes().to_vec())],
            }],
        });
    }

    /// Queue a row whose only column is SQL NULL (no matching rows).
    pub fn push_null(&self) {
        self.state.responses.lock().unwrap().push_back(Rows {
            rows: vec![Row {
                values: vec![None],
            }],
        });
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.log.lock().unwrap().iter().map(|(s, _)| s.clone()).collect()
    }

    pub fn bound_args(&self, idx: usize) -> Vec<Param> {
        self.state.log.lock().unwrap()[idx].1.clone()
    }
}

#[async_trait]
impl Pool for MockPool {
    async fn acquire(&self) -> Result<Box<dyn Connection>> {
        Ok(Box::new(MockConn {
            state: self.state.clone(),
        }))
    }
}

pub struct MockConn {
    state: Arc<MockState>,
}

#[async_trait]
impl Connection for MockConn {
    async fn exec(&mut self, sql: &str, args: &[Param]) -> Result<u64> {
        self.state
            .log
            .lock()
            .unwrap()
            .push((sql.to_string(), args.to_vec()));
        Ok(0)
    }

    async fn query(&mut self, sql: &str, args: &[Param]) -> Result<Rows> {
        self.state
            .log
            .lock()
            .unwrap()
            .push((sql.to_string(), args.to_vec()));
        Ok(self
            .state
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default())
    }
}

/// Replays one fixed JSON body for every URL and records the calls.
#[derive(Clone, Default)]
pub struct MockRemote {
    pub body: String,
    pub calls: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl RemoteClient for MockRemote {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        self.calls.lock().unwrap().push(url.to_string());
        Ok(self.body.as_bytes().to_vec())
    }
}
