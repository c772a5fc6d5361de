//! End-to-end scenarios through the engine against a scripted pool.

mod common;

use std::sync::Arc;

use common::{base_config, test_info, MockPool, MockRemote};
use gqlc::db::Param;
use gqlc::{Config, Context, Engine, OpKind, ReqConfig};

async fn engine_with(conf: Config, pool: &MockPool) -> Engine {
    Engine::builder(conf, Arc::new(pool.clone()))
        .db_info(test_info())
        .build()
        .await
        .unwrap()
}

#[tokio::test]
async fn plural_query_returns_shaped_document() {
    let pool = MockPool::new();
    pool.push_json(r#"{"users": [{"id": 1, "email": "a@x"}, {"id": 2, "email": "b@x"}]}"#);

    let engine = engine_with(base_config(), &pool).await;
    let res = engine
        .graphql(&Context::default(), "{ users { id email } }", None, None)
        .await;

    assert!(res.errors.is_empty(), "{:?}", res.errors);
    assert_eq!(res.role(), "anon");
    assert_eq!(res.operation(), OpKind::Query);
    assert!(res.sql().starts_with("SELECT json_object_agg('users',"));
    assert!(res.sql().contains(r#""users"."id", "users"."email""#));
    assert!(res.sql().contains("LIMIT ('20') :: integer"));

    assert_eq!(
        serde_json::to_string(&res).unwrap(),
        r#"{"data":{"users": [{"id": 1, "email": "a@x"}, {"id": 2, "email": "b@x"}]}}"#
    );
}

#[tokio::test]
async fn singular_query_binds_id_variable() {
    let pool = MockPool::new();
    pool.push_json(r#"{"user": {"id": 3, "posts": [{"id": 10, "title": "t"}]}}"#);

    let engine = engine_with(base_config(), &pool).await;
    let ctx = Context {
        user_id: Some(serde_json::json!(3)),
        ..Default::default()
    };
    let res = engine
        .graphql(
            &ctx,
            "query getUser($id: ID!) { user(id: $id) { id posts { id title } } }",
            Some(serde_json::json!({ "id": 3 })),
            None,
        )
        .await;

    assert!(res.errors.is_empty(), "{:?}", res.errors);
    assert_eq!(res.role(), "user");
    // One statement, one LATERAL join.
    assert_eq!(res.sql().matches("LEFT OUTER JOIN LATERAL").count(), 1);
    assert_eq!(pool.bound_args(0), vec![Param::Int(3)]);
    assert_eq!(
        serde_json::to_string(&res).unwrap(),
        r#"{"data":{"user": {"id": 3, "posts": [{"id": 10, "title": "t"}]}}}"#
    );
}

#[tokio::test]
async fn unknown_apq_hash_is_reported() {
    let pool = MockPool::new();
    let engine = engine_with(base_config(), &pool).await;

    let res = engine
        .graphql(
            &Context::default(),
            "",
            None,
            Some(ReqConfig {
                apq_key: Some("deadbeef".into()),
                vars: None,
            }),
        )
        .await;

    assert_eq!(
        serde_json::to_string(&res).unwrap(),
        r#"{"data":null,"errors":[{"message":"PersistedQueryNotFound"}]}"#
    );
}

#[tokio::test]
async fn apq_key_registers_query_for_reuse() {
    let pool = MockPool::new();
    pool.push_json(r#"{"users": []}"#);
    pool.push_json(r#"{"users": []}"#);

    let engine = engine_with(base_config(), &pool).await;
    let rc = ReqConfig {
        apq_key: Some("h1".into()),
        vars: None,
    };

    let first = engine
        .graphql(&Context::default(), "query listUsers { users { id } }", None, Some(rc.clone()))
        .await;
    assert!(first.errors.is_empty());

    // Hash-only request now resolves through the cache.
    let second = engine.graphql(&Context::default(), "", None, Some(rc)).await;
    assert!(second.errors.is_empty(), "{:?}", second.errors);
    assert_eq!(second.query_name(), "listUsers");
}

#[tokio::test]
async fn mysql_rejects_mutations() {
    let pool = MockPool::new();
    let conf = Config {
        db_type: Some("mysql".into()),
        ..base_config()
    };
    let engine = engine_with(conf, &pool).await;

    let res = engine
        .graphql(
            &Context::default(),
            r#"mutation { users(insert: { email: "a@x" }) { id } }"#,
            None,
            None,
        )
        .await;

    assert_eq!(res.errors[0].message, "mysql: mutations not supported");
    assert!(pool.statements().is_empty());
}

#[tokio::test]
async fn singular_root_with_no_match_is_no_rows() {
    let pool = MockPool::new();
    pool.push_null();

    let engine = engine_with(base_config(), &pool).await;
    let res = engine
        .graphql(
            &Context::default(),
            "{ user(id: $id) { id } }",
            Some(serde_json::json!({ "id": 99 })),
            None,
        )
        .await;

    assert_eq!(res.errors[0].message, "no rows");
}

#[tokio::test]
async fn anon_role_drops_denied_columns() {
    let pool = MockPool::new();
    pool.push_json(r#"{"users": [{"id": 1}]}"#);

    let conf: Config = serde_yaml::from_str(
        r#"
        disable_allow_list: true
        roles:
          - name: anon
            tables:
              - name: users
                query:
                  columns: [id]
        "#,
    )
    .unwrap();
    let engine = engine_with(conf, &pool).await;

    let res = engine
        .graphql(&Context::default(), "{ users { id email } }", None, None)
        .await;

    assert!(res.errors.is_empty(), "{:?}", res.errors);
    assert!(res.sql().contains(r#""users"."id""#));
    assert!(!res.sql().contains(r#""users"."email""#));
}

#[tokio::test]
async fn abac_probe_runs_before_the_shaped_query() {
    let pool = MockPool::new();
    // First statement resolves the role, second runs the query.
    pool.push_json("admin");
    pool.push_json(r#"{"users": [{"id": 1, "email": "a@x"}]}"#);

    let conf: Config = serde_yaml::from_str(
        r#"
        disable_allow_list: true
        roles_query: "SELECT * FROM users WHERE id = $user_id"
        roles:
          - name: admin
            match: "users.admin = true"
        "#,
    )
    .unwrap();
    let engine = engine_with(conf, &pool).await;

    let ctx = Context {
        user_id: Some(serde_json::json!(1)),
        ..Default::default()
    };
    let res = engine
        .graphql(&ctx, "{ users { id email } }", None, None)
        .await;

    assert!(res.errors.is_empty(), "{:?}", res.errors);
    assert_eq!(res.role(), "admin");

    let stmts = pool.statements();
    assert!(stmts[0].starts_with("SELECT (CASE WHEN EXISTS"));
    assert_eq!(pool.bound_args(0), vec![Param::Int(1)]);
    assert!(stmts[1].starts_with("SELECT json_object_agg"));
}

#[tokio::test]
async fn remote_join_splices_fetched_payload() {
    let pool = MockPool::new();
    pool.push_json(
        r#"{"users": [{"id": 1, "__payments_stripe_id": "cus_1"}]}"#,
    );

    let mut conf = base_config();
    conf.tables.push(gqlc::TableConfig {
        name: "users".into(),
        remotes: vec![gqlc::RemoteConfig {
            name: "payments".into(),
            id_column: "stripe_id".into(),
            url: "http://payments.local/stripe/$id".into(),
            path: vec!["data".into()],
            fields: vec!["amount".into()],
        }],
        ..Default::default()
    });

    let remote = MockRemote {
        body: r#"{"data": {"amount": 100, "secret": "x"}}"#.into(),
        ..Default::default()
    };
    let engine = Engine::builder(conf, Arc::new(pool.clone()))
        .db_info(test_info())
        .remote_client(Arc::new(remote.clone()))
        .build()
        .await
        .unwrap();

    let res = engine
        .graphql(
            &Context::default(),
            "{ users { id payments { amount } } }",
            None,
            None,
        )
        .await;

    assert!(res.errors.is_empty(), "{:?}", res.errors);
    assert_eq!(
        remote.calls.lock().unwrap().as_slice(),
        &["http://payments.local/stripe/cus_1".to_string()]
    );
    let doc: serde_json::Value =
        serde_json::from_str(res.data.as_ref().unwrap().get()).unwrap();
    assert_eq!(doc["users"][0]["payments"]["amount"], 100);
    // The projection dropped undeclared fields and the key column.
    assert!(doc["users"][0]["payments"].get("secret").is_none());
    assert!(doc["users"][0].get("__payments_stripe_id").is_none());
}

#[tokio::test]
async fn remote_join_failure_keeps_the_document() {
    let pool = MockPool::new();
    pool.push_json(r#"{"users": [{"id": 1, "__payments_stripe_id": "cus_1"}]}"#);

    let mut conf = base_config();
    conf.tables.push(gqlc::TableConfig {
        name: "users".into(),
        remotes: vec![gqlc::RemoteConfig {
            name: "payments".into(),
            id_column: "stripe_id".into(),
            url: "http://payments.local/stripe/$id".into(),
            ..Default::default()
        }],
        ..Default::default()
    });

    // No remote client configured: the field fails, the document survives.
    let engine = engine_with(conf, &pool).await;
    let res = engine
        .graphql(
            &Context::default(),
            "{ users { id payments { amount } } }",
            None,
            None,
        )
        .await;

    assert_eq!(res.errors.len(), 1);
    assert!(res.errors[0].message.contains("payments"));
    let doc: serde_json::Value =
        serde_json::from_str(res.data.as_ref().unwrap().get()).unwrap();
    assert_eq!(doc["users"][0]["id"], 1);
}

#[tokio::test]
async fn reload_swaps_in_a_fresh_core() {
    let pool = MockPool::new();
    pool.push_json(r#"{"users": []}"#);
    pool.push_json(r#"{"users": []}"#);

    let engine = engine_with(base_config(), &pool).await;
    let before = engine
        .graphql(&Context::default(), "{ users { id } }", None, None)
        .await;
    assert!(before.errors.is_empty());

    engine.reload().await.unwrap();

    let after = engine
        .graphql(&Context::default(), "{ users { id } }", None, None)
        .await;
    assert!(after.errors.is_empty());
    assert_eq!(before.sql(), after.sql());
}

#[tokio::test]
async fn tracing_extension_when_enabled() {
    let pool = MockPool::new();
    pool.push_json(r#"{"users": []}"#);

    let conf = Config {
        enable_tracing: true,
        ..base_config()
    };
    let engine = engine_with(conf, &pool).await;
    let res = engine
        .graphql(&Context::default(), "{ users { id } }", None, None)
        .await;

    assert!(res.errors.is_empty());
    let rendered = serde_json::to_string(&res).unwrap();
    assert!(rendered.contains(r#""extensions":{"tracing":{"version":1"#));
}

#[tokio::test]
async fn set_session_precedes_the_query() {
    let pool = MockPool::new();
    pool.push_json(r#"{"users": []}"#);

    let conf = Config {
        set_user_id: true,
        ..base_config()
    };
    let engine = engine_with(conf, &pool).await;
    let ctx = Context {
        user_id: Some(serde_json::json!(7)),
        ..Default::default()
    };
    let res = engine
        .graphql(&ctx, "{ users { id } }", None, None)
        .await;

    assert!(res.errors.is_empty());
    let stmts = pool.statements();
    assert_eq!(stmts[0], r#"SET SESSION "user.id" = 7"#);
    assert!(stmts[1].starts_with("SELECT json_object_agg"));
}
