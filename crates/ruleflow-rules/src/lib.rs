//! Ruleflow Rules Crate
//!
//! This crate compiles the ruleflow DSL and runs the compiled rules against
//! event records.
//!
//! ## Features
//!
//! - **DSL Parser**: `WITH ... DO` bindings and `IF ... WHEN ... THEN / ELSE IF / ELSE` rules
//! - **Conditions**: left-to-right AND/OR folding with parentheses as the only grouping
//! - **Expressions**: a closed arithmetic/string grammar for `update` actions and payloads
//! - **Action Registry**: named async handlers registered by the host
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ruleflow_rules::{ActionRegistry, EngineConfig, Event, RuleEngine};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = RuleEngine::new(Arc::new(ActionRegistry::with_builtins()), EngineConfig::from_env());
//!
//!     let dsl = r#"
//!         WITH postgres main DO
//!         IF NEW order WHEN order.total > 500 THEN
//!             update order.total = order.total - 50
//!     "#;
//!     engine.load_dsl(dsl).await?;
//!
//!     let outcome = engine
//!         .process_event(&Event::new("NEW", "order"), json!({"order": {"total": 600}}), json!({}))
//!         .await;
//!     println!("{}", outcome.data);
//!
//!     Ok(())
//! }
//! ```

pub mod action;
pub mod condition;
pub mod config;
pub mod dsl;
pub mod engine;
pub mod error;
pub mod expression;
pub mod registry;
pub mod scanner;
pub mod template;
pub mod value;

pub use action::{parse_action, ActionSpec};
pub use condition::{Condition, ConditionNode, Connector, GroupItem, Operator};
pub use config::EngineConfig;
pub use dsl::{Branch, DbConfig, Direction, ElseIfBlock, Rule, RuleParser};
pub use engine::{
    EvaluationContext, Event, EventOutcome, Response, RuleEngine, RuleExecutionResult, RuleId,
};
pub use error::{ActionError, Result, RuleError};
pub use expression::Expression;
pub use registry::{
    ActionHandler, ActionRegistry, ActionRequest, FnHandler, LogHandler, RejectHandler,
};
pub use template::PayloadTemplate;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
