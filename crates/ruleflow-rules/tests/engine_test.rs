//! Engine behaviour tests: matching, branch selection, batches and action dispatch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ruleflow_rules::{
    ActionError, ActionHandler, ActionRegistry, ActionRequest, Branch, ConditionNode,
    EngineConfig, EvaluationContext, Event, RuleEngine,
};
use serde_json::{json, Value};

async fn engine_with(registry: ActionRegistry, dsl: &str) -> RuleEngine {
    let engine = RuleEngine::new(Arc::new(registry), EngineConfig::default());
    engine.load_dsl(dsl).await.expect("Failed to load rules");
    engine
}

async fn run(engine: &RuleEngine, event: &str, entity: &str, input: Value) -> Value {
    engine
        .process_event(&Event::new(event, entity), input, json!({}))
        .await
        .data
}

#[test]
fn test_and_or_fold_left_without_precedence() {
    let record = json!({"a": true, "b": false, "c": true});

    // ((true AND false) OR true)
    let node = ConditionNode::parse("a = true AND b = true OR c = true").unwrap();
    assert!(node.evaluate(&record));

    // ((true OR true) AND false): conventional precedence would give true
    let node = ConditionNode::parse("a = true OR c = true AND b = true").unwrap();
    assert!(!node.evaluate(&record));

    // Parentheses are the only grouping
    let node = ConditionNode::parse("a = true OR (c = true AND b = true)").unwrap();
    assert!(node.evaluate(&record));
}

#[tokio::test]
async fn test_discount_round_trip() {
    let engine = engine_with(
        ActionRegistry::new(),
        r#"
WITH postgres shop DO
IF NEW order WHEN order.total > 500 THEN update order.total = order.total - 50
"#,
    )
    .await;

    let data = run(&engine, "NEW", "order", json!({"order": {"total": 600}})).await;
    assert_eq!(data, json!({"order": {"total": 550}}));

    let data = run(&engine, "NEW", "order", json!({"order": {"total": 400}})).await;
    assert_eq!(data, json!({"order": {"total": 400}}));

    // Other events and entities do not match
    let data = run(&engine, "UPDATE", "order", json!({"order": {"total": 600}})).await;
    assert_eq!(data["order"]["total"], json!(600));
    let data = run(&engine, "NEW", "invoice", json!({"order": {"total": 600}})).await;
    assert_eq!(data["order"]["total"], json!(600));
}

#[tokio::test]
async fn test_first_matching_else_if_wins() {
    let engine = engine_with(
        ActionRegistry::new(),
        r#"
WITH postgres shop DO
IF NEW order WHEN order.total > 1000 THEN
    update order.tier = "platinum"
ELSE IF order.total > 100
    update order.tier = "gold"
ELSE IF order.total > 10
    update order.tier = "silver"
ELSE
    update order.tier = "basic"
"#,
    )
    .await;

    let outcome = engine
        .process_event(&Event::new("NEW", "order"), json!({"order": {"total": 500}}), json!({}))
        .await;
    assert_eq!(outcome.data["order"]["tier"], json!("gold"));
    assert_eq!(outcome.executions.len(), 1);
    assert_eq!(outcome.executions[0].branch, Branch::ElseIf(0));

    let data = run(&engine, "NEW", "order", json!({"order": {"total": 5}})).await;
    assert_eq!(data["order"]["tier"], json!("basic"));
}

#[tokio::test]
async fn test_in_operator() {
    let engine = engine_with(
        ActionRegistry::new(),
        r#"
WITH postgres shop DO
IF NEW order WHEN order.country IN ["US","CA"] THEN update order.domestic = true
"#,
    )
    .await;

    let data = run(&engine, "NEW", "order", json!({"order": {"country": "US"}})).await;
    assert_eq!(data["order"]["domestic"], json!(true));

    let data = run(&engine, "NEW", "order", json!({"order": {"country": "FR"}})).await;
    assert!(data["order"].get("domestic").is_none());
}

#[tokio::test]
async fn test_null_safety() {
    let engine = engine_with(
        ActionRegistry::new(),
        r#"
WITH postgres shop DO
IF NEW customer WHEN customer.vip IS NULL THEN update customer.vip = false
IF NEW customer WHEN customer.age > 18 THEN update customer.adult = true
"#,
    )
    .await;

    let data = run(&engine, "NEW", "customer", json!({"customer": {}})).await;
    assert_eq!(data["customer"]["vip"], json!(false));
    assert!(data["customer"].get("adult").is_none());

    let data = run(&engine, "NEW", "customer", json!({"customer": {"vip": null}})).await;
    assert_eq!(data["customer"]["vip"], json!(false));

    let data = run(&engine, "NEW", "customer", json!({"customer": {"vip": true}})).await;
    assert_eq!(data["customer"]["vip"], json!(true));

    // A missing parent object is also null
    let data = run(&engine, "NEW", "customer", json!({})).await;
    assert_eq!(data["customer"]["vip"], json!(false));
}

struct FailOnFlag {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl ActionHandler for FailOnFlag {
    async fn handle(
        &self,
        ctx: &mut EvaluationContext,
        _request: ActionRequest,
    ) -> Result<Value, ActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if ctx.data["fail"] == json!(true) {
            return Err(ActionError::failed("downstream unavailable"));
        }
        ctx.data["synced"] = json!(true);
        Ok(Value::Null)
    }
}

#[tokio::test]
async fn test_batch_independence() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = ActionRegistry::new();
    registry
        .register("sync", Arc::new(FailOnFlag { calls: calls.clone() }))
        .unwrap();

    let engine = engine_with(
        registry,
        r#"
WITH postgres shop DO
IF NEW order THEN
    sync
    update processed = true
IF NEW order WHEN total > 10 THEN update big = true
"#,
    )
    .await;

    let outcome = engine
        .process_event(
            &Event::new("NEW", "order"),
            json!([{"fail": true, "total": 50}, {"fail": false, "total": 20}]),
            json!({}),
        )
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(
        outcome.data,
        json!([
            {"fail": true, "total": 50, "processed": true, "big": true},
            {"fail": false, "total": 20, "synced": true, "processed": true, "big": true}
        ])
    );
    assert_eq!(outcome.response.status, 200);
    assert_eq!(outcome.executions.len(), 4);
    assert_eq!(outcome.executions[0].record_index, Some(0));
    assert_eq!(outcome.executions[0].actions_failed, 1);
    assert_eq!(outcome.executions[2].record_index, Some(1));
    assert_eq!(outcome.executions[2].actions_failed, 0);
}

#[tokio::test]
async fn test_rejection_stops_only_its_record() {
    let engine = engine_with(
        ActionRegistry::with_builtins(),
        r#"
WITH postgres shop DO
IF NEW order WHEN qty <= 0 THEN reject status: 422, message: "qty must be positive"
IF NEW order THEN update accepted = true
"#,
    )
    .await;

    let outcome = engine
        .process_event(
            &Event::new("NEW", "order"),
            json!([{"qty": 1}, {"qty": 0}, {"qty": 2}]),
            json!({}),
        )
        .await;

    assert_eq!(outcome.response.status, 422);
    assert_eq!(outcome.response.error.as_deref(), Some("reject"));
    assert_eq!(outcome.data[0]["accepted"], json!(true));
    assert!(outcome.data[1].get("accepted").is_none());
    assert_eq!(outcome.data[2]["accepted"], json!(true));
}

#[tokio::test]
async fn test_missing_handler_counts_as_failed() {
    let mut compile_registry = ActionRegistry::new();
    compile_registry
        .register_fn("notify", |_, _| Ok(Value::Null))
        .unwrap();
    let compiler = RuleEngine::new(Arc::new(compile_registry), EngineConfig::default());
    let rules = compiler
        .compile("WITH pg main DO\nIF NEW order THEN\n    notify to: ops\n    update seen = true")
        .unwrap();

    let engine = RuleEngine::new(Arc::new(ActionRegistry::new()), EngineConfig::default());
    assert_eq!(engine.install(rules).await, 1);

    let outcome = engine
        .process_event(&Event::new("NEW", "order"), json!({"id": 7}), json!({}))
        .await;

    assert_eq!(outcome.data, json!({"id": 7, "seen": true}));
    assert_eq!(outcome.response.status, 200);
    assert_eq!(outcome.executions.len(), 1);
    assert_eq!(outcome.executions[0].actions_failed, 1);
    assert_eq!(outcome.executions[0].actions_executed, 1);
}

#[tokio::test]
async fn test_malformed_condition_does_not_break_other_rules() {
    let engine = engine_with(
        ActionRegistry::new(),
        r#"
WITH pg main DO
IF NEW order WHEN order.total >> 5 THEN update a = 1
IF NEW order THEN update b = 2
"#,
    )
    .await;

    let data = run(&engine, "NEW", "order", json!({"order": {"total": 10}})).await;
    assert_eq!(data, json!({"order": {"total": 10}, "b": 2}));
}

#[tokio::test]
async fn test_update_is_idempotent() {
    let engine = engine_with(
        ActionRegistry::new(),
        r#"
WITH postgres shop DO
IF UPDATE user THEN
    update user.key = sha256(lower(user.email))
    update user.label = upper(user.name) + "-" + user.id
"#,
    )
    .await;

    let input = json!({"user": {"email": "Ann@Example.com", "name": "ann", "id": 7}});
    let first = run(&engine, "UPDATE", "user", input.clone()).await;
    let second = run(&engine, "UPDATE", "user", input).await;

    assert_eq!(first, second);
    assert_eq!(first["user"]["label"], json!("ANN-7"));

    // Re-running on the output only rewrites the same values
    let third = run(&engine, "UPDATE", "user", first.clone()).await;
    assert_eq!(third, first);
}

#[tokio::test]
async fn test_actions_see_earlier_writes() {
    let engine = engine_with(
        ActionRegistry::new(),
        r#"
WITH postgres shop DO
IF NEW order THEN
    update order.subtotal = order.price * order.qty
    update order.total = order.subtotal + order.shipping
IF NEW order WHEN order.total >= 100 THEN update order.free_gift = true
"#,
    )
    .await;

    let data = run(
        &engine,
        "NEW",
        "order",
        json!({"order": {"price": 30, "qty": 3, "shipping": 10}}),
    )
    .await;
    assert_eq!(data["order"]["subtotal"], json!(90));
    assert_eq!(data["order"]["total"], json!(100));
    assert_eq!(data["order"]["free_gift"], json!(true));
}

#[tokio::test]
async fn test_namespaced_entities_and_directions() {
    let engine = engine_with(
        ActionRegistry::new(),
        r#"
WITH postgres shop DO
IF GETOUT table:user THEN update masked = true
IF GETIN user THEN update audited = true
"#,
    )
    .await;

    let data = run(&engine, "GETOUT", "user", json!({})).await;
    assert_eq!(data, json!({"masked": true}));

    let data = run(&engine, "GETIN", "user", json!({})).await;
    assert_eq!(data, json!({"audited": true}));

    let data = run(&engine, "GET", "user", json!({})).await;
    assert_eq!(data, json!({"masked": true, "audited": true}));
}

#[tokio::test]
async fn test_path_entities_match_exactly() {
    let engine = engine_with(
        ActionRegistry::new(),
        r#"
WITH postgres shop DO
IF NEW admin/users THEN update wiped = true
IF NEW orders/items THEN update counted = true
"#,
    )
    .await;

    let data = run(&engine, "NEW", "public/users", json!({})).await;
    assert_eq!(data, json!({}));

    let data = run(&engine, "NEW", "cart/items", json!({})).await;
    assert_eq!(data, json!({}));

    let data = run(&engine, "NEW", "admin/users", json!({})).await;
    assert_eq!(data, json!({"wiped": true}));

    let data = run(&engine, "NEW", "table:orders/items", json!({})).await;
    assert_eq!(data, json!({"counted": true}));
}

#[tokio::test]
async fn test_concurrent_events_share_rules() {
    let engine = Arc::new(
        engine_with(
            ActionRegistry::new(),
            "WITH pg main DO\nIF NEW order THEN update order.n = order.n * 2",
        )
        .await,
    );

    let mut handles = Vec::new();
    for n in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .process_event(&Event::new("NEW", "order"), json!({"order": {"n": n}}), json!({}))
                .await
                .data
        }));
    }

    for (n, handle) in handles.into_iter().enumerate() {
        let data = handle.await.unwrap();
        assert_eq!(data["order"]["n"], json!(n * 2));
    }
}
