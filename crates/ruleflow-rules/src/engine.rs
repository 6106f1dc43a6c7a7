//! Rule engine for matching events and executing actions.
//!
//! The engine holds the compiled rule set and runs it against the records of
//! an event. Records of a batch are processed one after another and every
//! action completes before the next one starts.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::action::ActionSpec;
use crate::config::{strip_namespace, EngineConfig};
use crate::dsl::{normalize_event, Branch, DbConfig, Direction, Rule, RuleParser};
use crate::error::{ActionError, Result};
use crate::registry::{ActionRegistry, ActionRequest};
use crate::value::set_path;

/// Unique identifier for a rule.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleId(pub Uuid);

impl RuleId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_string(s: &str) -> std::result::Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An event as delivered by the calling layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub entity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
}

impl Event {
    /// Create an event. `GETIN`/`GETOUT` become `GET` with a direction.
    pub fn new(event_type: &str, entity: impl Into<String>) -> Self {
        let (event_type, direction) = normalize_event(event_type);
        Self {
            event_type,
            entity: entity.into(),
            direction,
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction);
        self
    }

    /// Whether `rule` reacts to this event. Conditions are not consulted.
    pub fn matches(&self, rule: &Rule) -> bool {
        rule.event_type == self.event_type
            && strip_namespace(&rule.entity) == strip_namespace(&self.entity)
            && match (rule.direction, self.direction) {
                (Some(expected), Some(actual)) => expected == actual,
                _ => true,
            }
    }
}

/// Side-channel response inspected by the caller after processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

pub const STATUS_OK: u16 = 200;

impl Default for Response {
    fn default() -> Self {
        Self {
            status: STATUS_OK,
            message: None,
            error: None,
            data: None,
        }
    }
}

impl Response {
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// A non-200 status stops rule processing for the current record.
    pub fn is_rejected(&self) -> bool {
        self.status != STATUS_OK
    }
}

/// Everything an action handler can see and change while one record is processed.
#[derive(Debug, Clone)]
pub struct EvaluationContext {
    /// The record being processed.
    pub data: Value,
    /// Binding of the rule whose actions are running.
    pub db: Option<DbConfig>,
    pub event: Event,
    /// Caller supplied metadata (user, request id, ...).
    pub metadata: Value,
    pub response: Response,
}

impl EvaluationContext {
    pub fn new(data: Value, event: Event) -> Self {
        Self {
            data,
            db: None,
            event,
            metadata: Value::Object(Map::new()),
            response: Response::default(),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Rule execution result, one per fired branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleExecutionResult {
    pub rule_id: RuleId,
    pub line: usize,
    pub branch: Branch,
    pub actions_executed: usize,
    pub actions_failed: usize,
    /// Position in the input array, `None` for a single record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_index: Option<usize>,
    pub duration_ms: u64,
}

/// Result of [`RuleEngine::process_event`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventOutcome {
    /// The processed record, or array of records.
    pub data: Value,
    /// First rejection of the batch, otherwise status 200.
    pub response: Response,
    pub executions: Vec<RuleExecutionResult>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ActionStats {
    executed: usize,
    failed: usize,
}

/// Rule engine that owns the compiled rule set.
pub struct RuleEngine {
    rules: RwLock<Arc<Vec<Rule>>>,
    registry: Arc<ActionRegistry>,
    config: EngineConfig,
}

impl RuleEngine {
    pub fn new(registry: Arc<ActionRegistry>, config: EngineConfig) -> Self {
        Self {
            rules: RwLock::new(Arc::new(Vec::new())),
            registry,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<ActionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Compile a DSL source without installing it.
    pub fn compile(&self, source: &str) -> Result<Vec<Rule>> {
        RuleParser::new(&self.registry, &self.config).parse(source)
    }

    /// Compile and replace the whole rule set. On error the previous set stays.
    pub async fn load_dsl(&self, source: &str) -> Result<usize> {
        let compiled = self.compile(source)?;
        Ok(self.install(compiled).await)
    }

    /// Replace the whole rule set with already compiled rules.
    pub async fn install(&self, rules: Vec<Rule>) -> usize {
        let count = rules.len();
        *self.rules.write().await = Arc::new(rules);
        tracing::info!(rules = count, "Rule set loaded");
        count
    }

    pub async fn load_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let source = tokio::fs::read_to_string(path).await?;
        tracing::debug!(path = %path.display(), "Read rule file");
        self.load_dsl(&source).await
    }

    /// Snapshot of the current rule set.
    pub async fn rules(&self) -> Arc<Vec<Rule>> {
        self.rules.read().await.clone()
    }

    pub async fn rule_count(&self) -> usize {
        self.rules.read().await.len()
    }

    /// Run the rule set against a record or an array of records.
    pub async fn process_event(&self, event: &Event, input: Value, metadata: Value) -> EventOutcome {
        let rules = self.rules().await;
        let mut executions = Vec::new();

        let (data, response) = match input {
            Value::Array(records) => {
                let mut processed = Vec::with_capacity(records.len());
                let mut first_rejection: Option<Response> = None;
                for (index, record) in records.into_iter().enumerate() {
                    let (record, response) = self
                        .process_record(&rules, event, record, &metadata, Some(index), &mut executions)
                        .await;
                    if response.is_rejected() && first_rejection.is_none() {
                        first_rejection = Some(response);
                    }
                    processed.push(record);
                }
                (Value::Array(processed), first_rejection.unwrap_or_default())
            }
            record => {
                self.process_record(&rules, event, record, &metadata, None, &mut executions)
                    .await
            }
        };

        EventOutcome {
            data,
            response,
            executions,
        }
    }

    async fn process_record(
        &self,
        rules: &[Rule],
        event: &Event,
        record: Value,
        metadata: &Value,
        record_index: Option<usize>,
        executions: &mut Vec<RuleExecutionResult>,
    ) -> (Value, Response) {
        let mut ctx = EvaluationContext::new(record, event.clone()).with_metadata(metadata.clone());

        for rule in rules.iter().filter(|rule| event.matches(rule)) {
            let Some((branch, actions)) = rule.select_branch(&ctx.data) else {
                tracing::debug!(rule_id = %rule.id, line = rule.line, "No branch matched");
                continue;
            };
            tracing::debug!(rule_id = %rule.id, line = rule.line, branch = ?branch, "Rule fired");

            ctx.db = Some(rule.db_config.clone());
            let start = Instant::now();
            let stats = self.run_actions(&mut ctx, rule, actions).await;

            executions.push(RuleExecutionResult {
                rule_id: rule.id.clone(),
                line: rule.line,
                branch,
                actions_executed: stats.executed,
                actions_failed: stats.failed,
                record_index,
                duration_ms: start.elapsed().as_millis() as u64,
            });

            if ctx.response.is_rejected() {
                tracing::info!(
                    rule_id = %rule.id,
                    line = rule.line,
                    status = ctx.response.status,
                    "Record rejected, skipping remaining rules"
                );
                break;
            }
        }

        (ctx.data, ctx.response)
    }

    /// Execute one action list in order. Failures are logged and skipped.
    async fn run_actions(
        &self,
        ctx: &mut EvaluationContext,
        rule: &Rule,
        actions: &[ActionSpec],
    ) -> ActionStats {
        let mut stats = ActionStats::default();

        for action in actions {
            match action {
                ActionSpec::Update {
                    field,
                    expression,
                    source,
                } => {
                    let outcome = expression
                        .evaluate(&ctx.data)
                        .map_err(|e| e.to_string())
                        .and_then(|value| set_path(&mut ctx.data, field, value));
                    match outcome {
                        Ok(()) => {
                            stats.executed += 1;
                            tracing::debug!(rule_id = %rule.id, field = %field, "Updated field");
                        }
                        Err(e) => {
                            stats.failed += 1;
                            tracing::warn!(
                                rule_id = %rule.id,
                                line = rule.line,
                                field = %field,
                                expression = %source,
                                error = %e,
                                "Update skipped"
                            );
                        }
                    }
                }
                ActionSpec::Command {
                    action_type,
                    entity,
                    data,
                    fields,
                } => {
                    let Some(handler) = self.registry.get(action_type) else {
                        stats.failed += 1;
                        tracing::warn!(rule_id = %rule.id, action = %action_type, "No handler registered");
                        continue;
                    };

                    let payload = match data {
                        Some(template) => match template.render(&ctx.data) {
                            Ok(payload) => payload,
                            Err(e) => {
                                stats.failed += 1;
                                tracing::warn!(
                                    rule_id = %rule.id,
                                    action = %action_type,
                                    error = %e,
                                    "Payload rendering failed"
                                );
                                continue;
                            }
                        },
                        None => Value::Null,
                    };

                    let request = ActionRequest {
                        action_type: action_type.clone(),
                        entity: entity.clone().or_else(|| Some(rule.entity.clone())),
                        data: payload.clone(),
                        fields: fields.clone(),
                    };

                    match handler.handle(ctx, request).await {
                        Ok(_) => {
                            stats.executed += 1;
                            tracing::debug!(rule_id = %rule.id, action = %action_type, "Action completed");
                        }
                        Err(ActionError::Rejected { status, message }) => {
                            stats.executed += 1;
                            tracing::info!(
                                rule_id = %rule.id,
                                action = %action_type,
                                status,
                                message = %message,
                                "Action rejected record"
                            );
                            if !ctx.response.is_rejected() {
                                ctx.response = Response {
                                    status,
                                    message: Some(message),
                                    error: Some(action_type.clone()),
                                    data: (!payload.is_null()).then_some(payload),
                                };
                            }
                        }
                        Err(ActionError::Failed(e)) => {
                            stats.failed += 1;
                            tracing::warn!(
                                rule_id = %rule.id,
                                line = rule.line,
                                action = %action_type,
                                entity = %rule.entity,
                                error = %e,
                                "Action failed"
                            );
                        }
                    }
                }
            }
        }

        stats
    }
}
