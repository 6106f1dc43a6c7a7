//! Engine configuration.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Environment variables read by [`EngineConfig::from_env`].
pub mod env_vars {
    /// Enables both strict flags.
    pub const STRICT: &str = "RULEFLOW_STRICT";
    pub const STRICT_ENTITIES: &str = "RULEFLOW_STRICT_ENTITIES";
    pub const STRICT_ACTIONS: &str = "RULEFLOW_STRICT_ACTIONS";
    /// Comma separated list of known entity names.
    pub const ENTITIES: &str = "RULEFLOW_ENTITIES";
}

/// Compile-time behaviour of the rule parser.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Unknown entities abort compilation instead of dropping the rule.
    #[serde(default)]
    pub strict_entities: bool,
    /// Unregistered actions abort compilation instead of being skipped.
    #[serde(default)]
    pub strict_actions: bool,
    /// Entities rules may refer to. `None` accepts every entity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_entities: Option<BTreeSet<String>>,
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strict_entities(mut self, strict: bool) -> Self {
        self.strict_entities = strict;
        self
    }

    pub fn with_strict_actions(mut self, strict: bool) -> Self {
        self.strict_actions = strict;
        self
    }

    pub fn with_known_entities<I, S>(mut self, entities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_entities = Some(entities.into_iter().map(Into::into).collect());
        self
    }

    /// Load from `RULEFLOW_*` environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let flag = |key: &str| lookup(key).and_then(|s| parse_flag(&s));
        let strict = flag(env_vars::STRICT).unwrap_or(false);

        let known_entities = lookup(env_vars::ENTITIES)
            .map(|list| parse_entity_list(&list))
            .filter(|set| !set.is_empty());

        Self {
            strict_entities: flag(env_vars::STRICT_ENTITIES).unwrap_or(strict),
            strict_actions: flag(env_vars::STRICT_ACTIONS).unwrap_or(strict),
            known_entities,
        }
    }

    /// Whether `entity` may be referenced by a rule. A `table:` style
    /// namespace prefix is ignored.
    pub fn is_known_entity(&self, entity: &str) -> bool {
        match &self.known_entities {
            None => true,
            Some(known) => {
                known.contains(entity) || known.contains(strip_namespace(entity))
            }
        }
    }
}

/// Drop an optional leading `namespace:` prefix from an entity name.
/// Path segments separated by `/` are part of the name.
pub fn strip_namespace(entity: &str) -> &str {
    match entity.split_once(':') {
        Some((_, name)) => name,
        None => entity,
    }
}

pub fn parse_entity_list(list: &str) -> BTreeSet<String> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
