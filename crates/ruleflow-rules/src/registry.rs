//! Action handler registry.
//!
//! Hosts register named handlers once at startup, then share the registry
//! as `Arc<ActionRegistry>` between the parser (name validation) and the
//! engine (dispatch). `update` and `assign` are executed by the engine
//! itself and cannot be registered.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::EvaluationContext;
use crate::error::{ActionError, Result, RuleError};

/// Names handled by the engine without registration.
pub const RESERVED_ACTIONS: [&str; 2] = ["update", "assign"];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_ACTIONS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

/// What a named action receives.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action_type: String,
    /// `entity:` field, defaulting to the rule's entity.
    pub entity: Option<String>,
    /// Rendered `data:` payload, `null` when absent.
    pub data: Value,
    /// Remaining `key: value` pairs from the action line.
    pub fields: BTreeMap<String, String>,
}

impl ActionRequest {
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }
}

/// A named action implementation.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &mut EvaluationContext,
        request: ActionRequest,
    ) -> std::result::Result<Value, ActionError>;
}

type SyncHandlerFn = dyn Fn(&mut EvaluationContext, ActionRequest) -> std::result::Result<Value, ActionError>
    + Send
    + Sync;

/// Adapter for synchronous closures.
pub struct FnHandler {
    func: Box<SyncHandlerFn>,
}

impl FnHandler {
    pub fn new<F>(func: F) -> Self
    where
        F: Fn(&mut EvaluationContext, ActionRequest) -> std::result::Result<Value, ActionError>
            + Send
            + Sync
            + 'static,
    {
        Self {
            func: Box::new(func),
        }
    }
}

#[async_trait]
impl ActionHandler for FnHandler {
    async fn handle(
        &self,
        ctx: &mut EvaluationContext,
        request: ActionRequest,
    ) -> std::result::Result<Value, ActionError> {
        (self.func)(ctx, request)
    }
}

/// Name to handler map.
#[derive(Default, Clone)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `log` and `reject` handlers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry
            .handlers
            .insert("log".to_string(), Arc::new(LogHandler));
        registry
            .handlers
            .insert("reject".to_string(), Arc::new(RejectHandler));
        registry
    }

    /// Register a handler, replacing any previous one with the same name.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn ActionHandler>,
    ) -> Result<()> {
        let name = name.into();
        if is_reserved(&name) {
            return Err(RuleError::ReservedAction { name });
        }
        if self.handlers.insert(name.clone(), handler).is_some() {
            tracing::warn!(action = %name, "Replaced existing action handler");
        }
        Ok(())
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, func: F) -> Result<()>
    where
        F: Fn(&mut EvaluationContext, ActionRequest) -> std::result::Result<Value, ActionError>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, Arc::new(FnHandler::new(func)))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("handlers", &self.names())
            .finish()
    }
}

/// `log` action: writes the request to the tracing output.
///
/// ```text
/// log level: warn, message: "big order", data: {"total": ${order.total}}
/// ```
pub struct LogHandler;

#[async_trait]
impl ActionHandler for LogHandler {
    async fn handle(
        &self,
        ctx: &mut EvaluationContext,
        request: ActionRequest,
    ) -> std::result::Result<Value, ActionError> {
        let message = request.field("message").unwrap_or("rule action");
        let entity = request.entity.as_deref().unwrap_or(&ctx.event.entity);
        let data = request.data.to_string();
        match request.field("level").map(str::to_ascii_lowercase).as_deref() {
            Some("error") => tracing::error!(entity, data = %data, "{}", message),
            Some("warn") | Some("warning") => tracing::warn!(entity, data = %data, "{}", message),
            Some("debug") => tracing::debug!(entity, data = %data, "{}", message),
            Some("trace") => tracing::trace!(entity, data = %data, "{}", message),
            _ => tracing::info!(entity, data = %data, "{}", message),
        }
        Ok(Value::Null)
    }
}

/// `reject` action: stops processing of the record with a non-200 response.
///
/// ```text
/// reject status: 422, message: "total must be positive"
/// ```
pub struct RejectHandler;

pub const DEFAULT_REJECT_STATUS: u16 = 400;

#[async_trait]
impl ActionHandler for RejectHandler {
    async fn handle(
        &self,
        _ctx: &mut EvaluationContext,
        request: ActionRequest,
    ) -> std::result::Result<Value, ActionError> {
        let status = match request.field("status") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .map_err(|_| ActionError::failed(format!("invalid status '{}'", raw)))?,
            None => DEFAULT_REJECT_STATUS,
        };
        let message = request.field("message").unwrap_or("rejected by rule");
        Err(ActionError::rejected(status, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Event;
    use serde_json::json;

    fn request(action_type: &str, fields: &[(&str, &str)]) -> ActionRequest {
        ActionRequest {
            action_type: action_type.to_string(),
            entity: None,
            data: Value::Null,
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_reserved_names_are_refused() {
        let mut registry = ActionRegistry::new();
        let result = registry.register_fn("Update", |_, _| Ok(Value::Null));
        assert!(matches!(result, Err(RuleError::ReservedAction { .. })));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ActionRegistry::with_builtins();
        registry.register_fn("notify", |_, _| Ok(json!("sent"))).unwrap();
        assert!(registry.contains("notify"));
        assert!(!registry.contains("Notify"));
        assert_eq!(registry.names(), vec!["log", "notify", "reject"]);
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn test_fn_handler_mutates_context() {
        let mut registry = ActionRegistry::new();
        registry
            .register_fn("stamp", |ctx, req| {
                ctx.data["stamped_by"] = json!(req.action_type);
                Ok(Value::Null)
            })
            .unwrap();

        let mut ctx = EvaluationContext::new(json!({}), Event::new("NEW", "order"));
        let handler = registry.get("stamp").unwrap();
        handler.handle(&mut ctx, request("stamp", &[])).await.unwrap();
        assert_eq!(ctx.data["stamped_by"], json!("stamp"));
    }

    #[tokio::test]
    async fn test_reject_handler() {
        let mut ctx = EvaluationContext::new(json!({}), Event::new("NEW", "order"));

        let err = RejectHandler
            .handle(&mut ctx, request("reject", &[("status", "422"), ("message", "no")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Rejected { status: 422, ref message } if message == "no"));

        let err = RejectHandler
            .handle(&mut ctx, request("reject", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Rejected { status: 400, .. }));

        let err = RejectHandler
            .handle(&mut ctx, request("reject", &[("status", "abc")]))
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::Failed(_)));
    }

    #[tokio::test]
    async fn test_log_handler_succeeds() {
        let mut ctx = EvaluationContext::new(json!({}), Event::new("NEW", "order"));
        let result = LogHandler
            .handle(&mut ctx, request("log", &[("level", "warn"), ("message", "hi")]))
            .await
            .unwrap();
        assert_eq!(result, Value::Null);
    }
}
