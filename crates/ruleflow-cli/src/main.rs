//! Command-line interface for the ruleflow rule engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ruleflow_rules::config::parse_entity_list;
use ruleflow_rules::{ActionRegistry, EngineConfig, Event, Rule, RuleEngine};
use serde_json::{json, Value};

/// Environment variable switching log output to JSON.
const LOG_JSON_ENV: &str = "RULEFLOW_LOG_JSON";

/// Ruleflow - compile rule DSL files and run events against them.
#[derive(Parser, Debug)]
#[command(name = "ruleflow")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Fail on unknown entities and unregistered actions.
    #[arg(long, global = true)]
    strict: bool,

    /// Comma separated list of known entities.
    #[arg(long, global = true, value_name = "a,b,c")]
    entities: Option<String>,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Compile a rule file and report what it contains.
    Check {
        /// Path to the rule file.
        #[arg(required = true)]
        file: PathBuf,
        /// Print the compiled rules as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Process one event against a rule file.
    Run {
        /// Path to the rule file.
        #[arg(required = true)]
        file: PathBuf,
        /// Event type (NEW, UPDATE, DELETE, GET, GETIN, GETOUT, ...).
        #[arg(long)]
        event: String,
        /// Entity name.
        #[arg(long)]
        entity: String,
        /// Record (or array of records) as JSON.
        #[arg(long, conflicts_with = "data_file")]
        data: Option<String>,
        /// File containing the record JSON.
        #[arg(long)]
        data_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(args.verbose);

    let config = engine_config(&args);
    match args.command {
        Command::Check { file, json } => check(&file, json, config),
        Command::Run {
            file,
            event,
            entity,
            data,
            data_file,
        } => run(&file, &event, &entity, data, data_file, config).await,
    }
}

fn init_logging(verbose: bool) {
    let json_logging = std::env::var(LOG_JSON_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let level = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("warn,ruleflow={}", level)));

    // stdout carries command output, logs go to stderr
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    }
}

fn engine_config(args: &Args) -> EngineConfig {
    let mut config = EngineConfig::from_env();
    if args.strict {
        config = config.with_strict_entities(true).with_strict_actions(true);
    }
    if let Some(list) = &args.entities {
        config = config.with_known_entities(parse_entity_list(list));
    }
    config
}

fn read_source(file: &Path) -> Result<String> {
    std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))
}

fn check(file: &Path, as_json: bool, config: EngineConfig) -> Result<()> {
    let source = read_source(file)?;
    let engine = RuleEngine::new(Arc::new(ActionRegistry::with_builtins()), config);
    let rules = engine
        .compile(&source)
        .with_context(|| format!("Failed to compile {}", file.display()))?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&rules)?);
        return Ok(());
    }

    println!("{}: {} rule(s)", file.display(), rules.len());
    for rule in &rules {
        println!("  {}", describe(rule));
    }
    Ok(())
}

fn describe(rule: &Rule) -> String {
    let direction = match rule.direction {
        Some(direction) => format!(" ({:?})", direction).to_lowercase(),
        None => String::new(),
    };
    let conditions = if rule.conditions.is_empty() {
        "always".to_string()
    } else {
        rule.conditions.to_string()
    };
    format!(
        "line {}: {}{} {} WHEN {} [{} {}] -> {} action(s), {} else-if, else: {}",
        rule.line,
        rule.event_type,
        direction,
        rule.entity,
        conditions,
        rule.db_config.db_type,
        rule.db_config.db_connection,
        rule.then_actions.len(),
        rule.else_ifs.len(),
        rule.else_actions.len()
    )
}

async fn run(
    file: &Path,
    event: &str,
    entity: &str,
    data: Option<String>,
    data_file: Option<PathBuf>,
    config: EngineConfig,
) -> Result<()> {
    let engine = RuleEngine::new(Arc::new(ActionRegistry::with_builtins()), config);
    engine
        .load_file(file)
        .await
        .with_context(|| format!("Failed to compile {}", file.display()))?;

    let input: Value = match (data, data_file) {
        (Some(text), _) => serde_json::from_str(&text).context("Invalid --data JSON")?,
        (None, Some(path)) => {
            let text = read_source(&path)?;
            serde_json::from_str(&text)
                .with_context(|| format!("Invalid JSON in {}", path.display()))?
        }
        (None, None) => json!({}),
    };

    let outcome = engine
        .process_event(&Event::new(event, entity), input, json!({}))
        .await;
    tracing::debug!(executions = outcome.executions.len(), "Event processed");

    let output = json!({
        "response": outcome.response,
        "data": outcome.data,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
