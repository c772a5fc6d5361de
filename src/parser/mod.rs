//! GraphQL front end: lexing, parsing and fragment inlining.
//!
//! The parser is I/O-free. Fragment spreads that are not defined in the same
//! document are resolved through a caller-supplied [`FragmentFetcher`], so the
//! compiler can be unit-tested without touching disk.

pub mod ast;
pub mod lexer;

use std::collections::HashMap;
use std::sync::Arc;

use chumsky::{prelude::*, Stream};
use itertools::Itertools;

use self::ast::*;
use self::lexer::{Literal, TokenKind};
use crate::{Error, Result};

/// Resolves a fragment name to its GraphQL text.
pub type FragmentFetcher = Arc<dyn Fn(&str) -> Result<String> + Send + Sync>;

/// Spread nesting deeper than this is treated as a cycle.
const MAX_FRAGMENT_DEPTH: usize = 32;

/// Build a [`Document`] from a GraphQL source string.
pub fn parse(source: &str) -> Result<Document> {
    let tokens = lexer::lexer()
        .parse(source)
        .map_err(|errs| convert_lexer_errors(source, errs))?;

    let len = source.chars().count();
    let stream = Stream::from_iter(len..len + 1, tokens.into_iter().map(|t| (t.kind, t.span)));

    document().parse(stream).map_err(convert_parser_errors)
}

/// Parse and inline every fragment spread, consulting `fetcher` for fragments
/// not defined inside the document itself.
pub fn parse_with_fragments(source: &str, fetcher: Option<&FragmentFetcher>) -> Result<Document> {
    let doc = parse(source)?;
    resolve_fragments(doc, fetcher)
}

/// Classify a document without building an AST.
///
/// Scans past insignificant characters and reads at most the first keyword and
/// operation name, which makes it safe to call on every request before any
/// real work happens. Agrees with [`parse`] on all well-formed documents.
pub fn operation(query: &str) -> (OpKind, &str) {
    let mut rest = query;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == ',');
        if let Some(stripped) = rest.strip_prefix('#') {
            rest = stripped.split_once('\n').map(|(_, r)| r).unwrap_or("");
            continue;
        }
        break;
    }

    if rest.starts_with('{') {
        return (OpKind::Query, "");
    }

    let word_len = rest
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .unwrap_or(rest.len());
    let (word, mut rest) = rest.split_at(word_len);

    let kind = match word {
        "mutation" => OpKind::Mutation,
        "subscription" => OpKind::Subscription,
        _ => OpKind::Query,
    };

    rest = rest.trim_start();
    let name_len = rest
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .unwrap_or(rest.len());

    (kind, &rest[..name_len])
}

/// Inline fragment spreads. A missing fragment is fatal.
pub fn resolve_fragments(doc: Document, fetcher: Option<&FragmentFetcher>) -> Result<Document> {
    let mut defs: HashMap<String, Vec<Selection>> = doc
        .fragments
        .iter()
        .map(|f| (f.name.clone(), f.selection.clone()))
        .collect();

    let operations = doc
        .operations
        .into_iter()
        .map(|mut op| {
            op.selection = inline_spreads(op.selection, &mut defs, fetcher, 0)?;
            Ok(op)
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Document {
        operations,
        fragments: doc.fragments,
    })
}

fn inline_spreads(
    selection: Vec<Selection>,
    defs: &mut HashMap<String, Vec<Selection>>,
    fetcher: Option<&FragmentFetcher>,
    depth: usize,
) -> Result<Vec<Selection>> {
    if depth > MAX_FRAGMENT_DEPTH {
        return Err(Error::parse("fragment spreads nested too deeply"));
    }

    let mut out = Vec::with_capacity(selection.len());
    for sel in selection {
        match sel {
            Selection::Field(mut field) => {
                field.children = inline_spreads(field.children, defs, fetcher, depth + 1)?;
                out.push(Selection::Field(field));
            }
            Selection::InlineFragment(inner) => {
                out.extend(inline_spreads(inner, defs, fetcher, depth + 1)?);
            }
            Selection::FragmentSpread(name) => {
                let body = match defs.get(&name) {
                    Some(body) => body.clone(),
                    None => {
                        let fetcher = fetcher.ok_or_else(|| {
                            Error::parse(format!("fragment not found: {name}"))
                        })?;
                        let text = fetcher(&name)?;
                        let frag_doc = parse(&text)?;
                        for frag in frag_doc.fragments {
                            defs.insert(frag.name.clone(), frag.selection);
                        }
                        defs.get(&name)
                            .cloned()
                            .ok_or_else(|| Error::parse(format!("fragment not found: {name}")))?
                    }
                };
                out.extend(inline_spreads(body, defs, fetcher, depth + 1)?);
            }
        }
    }
    Ok(out)
}

fn ctrl(c: char) -> impl Parser<TokenKind, TokenKind, Error = Simple<TokenKind>> + Clone {
    just(TokenKind::Control(c))
}

fn name() -> impl Parser<TokenKind, String, Error = Simple<TokenKind>> + Clone {
    select! { TokenKind::Name(n) => n }
}

fn keyword(kw: &'static str) -> impl Parser<TokenKind, (), Error = Simple<TokenKind>> + Clone {
    just(TokenKind::Name(kw.to_string())).ignored()
}

fn value() -> impl Parser<TokenKind, Value, Error = Simple<TokenKind>> + Clone {
    recursive(|value| {
        let literal = select! {
            TokenKind::Literal(Literal::Null) => Value::Null,
            TokenKind::Literal(Literal::Bool(b)) => Value::Bool(b),
            TokenKind::Literal(Literal::Int(i)) => Value::Int(i),
            TokenKind::Literal(Literal::Float(text)) => {
                Value::Float(text.parse().unwrap_or(f64::NAN))
            },
            TokenKind::Literal(Literal::Str(s)) => Value::Str(s),
            TokenKind::Var(v) => Value::Var(v),
            TokenKind::Name(n) => Value::Enum(n),
        };

        let list = value
            .clone()
            .repeated()
            .delimited_by(ctrl('['), ctrl(']'))
            .map(Value::List);

        let object = name()
            .then_ignore(ctrl(':'))
            .then(value)
            .repeated()
            .delimited_by(ctrl('{'), ctrl('}'))
            .map(Value::Object);

        list.or(object).or(literal).labelled("value")
    })
}

fn arguments() -> impl Parser<TokenKind, Vec<(String, Value)>, Error = Simple<TokenKind>> + Clone {
    name()
        .then_ignore(ctrl(':'))
        .then(value())
        .repeated()
        .at_least(1)
        .delimited_by(ctrl('('), ctrl(')'))
        .labelled("arguments")
}

fn directives() -> impl Parser<TokenKind, Vec<Directive>, Error = Simple<TokenKind>> + Clone {
    select! { TokenKind::Directive(d) => d }
        .then(arguments().or_not())
        .map(|(name, args)| Directive {
            name,
            args: args.unwrap_or_default(),
        })
        .repeated()
}

fn selection_set() -> impl Parser<TokenKind, Vec<Selection>, Error = Simple<TokenKind>> + Clone {
    recursive(|sel_set| {
        let field = name()
            .then(ctrl(':').ignore_then(name()).or_not())
            .then(arguments().or_not())
            .then(directives())
            .then(sel_set.clone().or_not())
            .map(|((((first, second), args), directives), children)| {
                let (alias, name) = match second {
                    Some(name) => (Some(first), name),
                    None => (None, first),
                };
                Selection::Field(Field {
                    alias,
                    name,
                    args: args.unwrap_or_default(),
                    directives,
                    children: children.unwrap_or_default(),
                })
            });

        let inline_fragment = just(TokenKind::Spread)
            .ignore_then(keyword("on").ignore_then(name()).or_not())
            .then(sel_set)
            .map(|(_on, sel)| Selection::InlineFragment(sel));

        let spread = just(TokenKind::Spread)
            .ignore_then(name())
            .map(Selection::FragmentSpread);

        let selection = inline_fragment.or(spread).or(field);

        selection
            .repeated()
            .at_least(1)
            .delimited_by(ctrl('{'), ctrl('}'))
            .labelled("selection set")
    })
}

/// `[Int!]`, `String`, `ID!`, collapsed to a plain string plus the outer
/// non-null flag; the compiler only needs names for its metadata.
fn type_ref() -> impl Parser<TokenKind, (String, bool), Error = Simple<TokenKind>> + Clone {
    let scalar = name().then(ctrl('!').or_not().map(|o| o.is_some()));

    let list = name()
        .then_ignore(ctrl('!').or_not())
        .delimited_by(ctrl('['), ctrl(']'))
        .map(|inner| format!("[{inner}]"))
        .then(ctrl('!').or_not().map(|o| o.is_some()));

    list.or(scalar)
}

fn var_defs() -> impl Parser<TokenKind, Vec<VarDef>, Error = Simple<TokenKind>> + Clone {
    select! { TokenKind::Var(v) => v }
        .then_ignore(ctrl(':'))
        .then(type_ref())
        .then(ctrl('=').ignore_then(value()).or_not())
        .map(|((name, (ty, required)), default)| VarDef {
            name,
            ty,
            required,
            default,
        })
        .repeated()
        .at_least(1)
        .delimited_by(ctrl('('), ctrl(')'))
}

fn document() -> impl Parser<TokenKind, Document, Error = Simple<TokenKind>> {
    let op_kind = choice((
        keyword("query").to(OpKind::Query),
        keyword("mutation").to(OpKind::Mutation),
        keyword("subscription").to(OpKind::Subscription),
    ));

    let named_op = op_kind
        .then(name().or_not())
        .then(var_defs().or_not())
        .then(selection_set())
        .map(|(((kind, name), var_defs), selection)| Operation {
            kind,
            name,
            var_defs: var_defs.unwrap_or_default(),
            selection,
        });

    // A bare `{ … }` document is shorthand for an anonymous query.
    let bare_op = selection_set().map(|selection| Operation {
        kind: OpKind::Query,
        name: None,
        var_defs: Vec::new(),
        selection,
    });

    let fragment = keyword("fragment")
        .ignore_then(name())
        .then_ignore(keyword("on"))
        .then(name())
        .then(selection_set())
        .map(|((name, on), selection)| FragmentDef {
            name,
            on,
            selection,
        });

    enum Def {
        Op(Operation),
        Frag(FragmentDef),
    }

    let def = fragment.map(Def::Frag).or(named_op.or(bare_op).map(Def::Op));

    def.repeated().at_least(1).then_ignore(end()).map(|defs| {
        let mut doc = Document::default();
        for def in defs {
            match def {
                Def::Op(op) => doc.operations.push(op),
                Def::Frag(frag) => doc.fragments.push(frag),
            }
        }
        doc
    })
}

fn convert_lexer_errors(source: &str, errs: Vec<chumsky::error::Cheap<char>>) -> Error {
    let msg = errs
        .into_iter()
        .map(|e| {
            let found: String = source
                .chars()
                .skip(e.span().start)
                .take(e.span().end - e.span().start)
                .collect();
            format!("unexpected {found:?} at offset {}", e.span().start)
        })
        .join("; ");
    Error::parse(msg)
}

fn convert_parser_errors(errs: Vec<Simple<TokenKind>>) -> Error {
    let msg = errs
        .into_iter()
        .map(|e| {
            let found = e
                .found()
                .map(|t| t.to_string())
                .unwrap_or_else(|| "end of input".to_string());
            match e.label() {
                Some(label) => format!("expected {label}, found {found}"),
                None => format!("unexpected {found}"),
            }
        })
        .join("; ");
    Error::parse(msg)
}

#[cfg(test)]
mod tests {
    use insta::assert_yaml_snapshot;

    use super::*;

    #[test]
    fn parse_query_with_args() {
        let doc = parse(
            r#"query getUser($id: ID!) {
                user(id: $id) {
                    id
                    posts(limit: 5, order_by: { created_at: desc }) { id title }
                }
            }"#,
        )
        .unwrap();

        assert_yaml_snapshot!(doc, @r###"
        operations:
          - kind: Query
            name: getUser
            var_defs:
              - name: id
                ty: ID
                required: true
                default: ~
            selection:
              - Field:
                  alias: ~
                  name: user
                  args:
                    - - id
                      - Var: id
                  directives: []
                  children:
                    - Field:
                        alias: ~
                        name: id
                        args: []
                        directives: []
                        children: []
                    - Field:
                        alias: ~
                        name: posts
                        args:
                          - - limit
                            - Int: 5
                          - - order_by
                            - Object:
                                - - created_at
                                  - Enum: desc
                        directives: []
                        children:
                          - Field:
                              alias: ~
                              name: id
                              args: []
                              directives: []
                              children: []
                          - Field:
                              alias: ~
                              name: title
                              args: []
                              directives: []
                              children: []
        fragments: []
        "###);
    }

    #[test]
    fn parse_bare_selection_is_query() {
        let doc = parse("{ products { id } }").unwrap();
        assert_eq!(doc.operations[0].kind, OpKind::Query);
        assert_eq!(doc.operations[0].name, None);
    }

    #[test]
    fn parse_alias() {
        let doc = parse("{ people: users { id } }").unwrap();
        let Selection::Field(f) = &doc.operations[0].selection[0] else {
            panic!("expected field");
        };
        assert_eq!(f.alias.as_deref(), Some("people"));
        assert_eq!(f.name, "users");
        assert_eq!(f.output_name(), "people");
    }

    #[test]
    fn parse_fragment_and_inline() {
        let doc = parse(
            r#"
            query { users { ...userFields } }
            fragment userFields on users { id email }
            "#,
        )
        .unwrap();

        let resolved = resolve_fragments(doc, None).unwrap();
        let Selection::Field(users) = &resolved.operations[0].selection[0] else {
            panic!("expected field");
        };
        let names: Vec<_> = users
            .children
            .iter()
            .map(|s| match s {
                Selection::Field(f) => f.name.as_str(),
                _ => "?",
            })
            .collect();
        assert_eq!(names, vec!["id", "email"]);
    }

    #[test]
    fn missing_fragment_is_fatal() {
        let doc = parse("{ users { ...nope } }").unwrap();
        let err = resolve_fragments(doc, None).unwrap_err();
        assert!(err.to_string().contains("fragment not found: nope"));
    }

    #[test]
    fn fetched_fragment_is_spliced() {
        let fetcher: FragmentFetcher = Arc::new(|name| {
            assert_eq!(name, "basics");
            Ok("fragment basics on users { id }".to_string())
        });
        let doc = parse_with_fragments("{ users { ...basics } }", Some(&fetcher)).unwrap();
        let Selection::Field(users) = &doc.operations[0].selection[0] else {
            panic!("expected field");
        };
        assert_eq!(users.children.len(), 1);
    }

    #[test]
    fn operation_classifier_agrees_with_parse() {
        let cases = [
            ("{ users { id } }", OpKind::Query, ""),
            ("query fetchUsers { users { id } }", OpKind::Query, "fetchUsers"),
            ("# lead comment\nmutation addUser { x { id } }", OpKind::Mutation, "addUser"),
            ("subscription watch($c: String) { chats { id } }", OpKind::Subscription, "watch"),
        ];
        for (src, kind, name) in cases {
            assert_eq!(operation(src), (kind, name));
            let doc = parse(src).unwrap();
            assert_eq!(doc.operations[0].kind, kind);
            assert_eq!(doc.operations[0].name.as_deref().unwrap_or(""), name);
        }
    }

    #[test]
    fn parse_error_reports_found_token() {
        let err = parse("query { users { } }").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }
}
