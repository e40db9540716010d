use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::logging::LogConfig;
use crate::security::query::signature::SignatureCategory;
use crate::security::query::types::{MitigationAction, Severity};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// HTTP check service configuration
    pub server: ServerConfig,

    /// Detection engine configuration
    pub engine: EngineConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// HTTP check service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub bind_addr: String,

    /// Capacity of the incident/alert channel
    pub sink_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            sink_capacity: 1024,
        }
    }
}

/// Logging configuration as it appears in configuration files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter (trace, debug, info, warn, error or an EnvFilter directive)
    pub level: String,

    /// Emit JSON lines instead of human readable output
    pub json: bool,

    /// Directory for rolling log files; file output is disabled when unset
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            log_dir: None,
        }
    }
}

impl From<&LoggingConfig> for LogConfig {
    fn from(value: &LoggingConfig) -> Self {
        let mut config = LogConfig::default()
            .with_level(&value.level)
            .with_json(value.json);
        if let Some(dir) = &value.log_dir {
            config = config.with_log_dir(dir);
        }
        config
    }
}

/// Detection engine configuration. Every field is hot reloadable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Structural and payload limits
    pub limits: QueryLimits,

    /// Complexity and cost weights
    pub weights: ComplexityWeights,

    /// Threat tracking and blocking policy
    pub threat: ThreatConfig,

    /// Per-rule policies keyed by rule id. Rules carrying a `pattern`
    /// are compiled into additional signatures.
    pub rules: HashMap<String, RuleConfig>,

    /// Permit `__schema` / `__type` style introspection
    pub allow_introspection: bool,

    /// Fingerprints that skip structural limits and signature scanning
    pub whitelist: HashSet<String>,

    /// Fingerprints that are always rejected
    pub blacklist: HashSet<String>,

    /// Overall analysis budget in milliseconds (0 disables the budget)
    pub analysis_timeout_ms: u64,

    /// Maximum characters of payload kept in incident records
    pub payload_excerpt_length: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            limits: QueryLimits::default(),
            weights: ComplexityWeights::default(),
            threat: ThreatConfig::default(),
            rules: HashMap::new(),
            allow_introspection: false,
            whitelist: HashSet::new(),
            blacklist: HashSet::new(),
            analysis_timeout_ms: 50,
            payload_excerpt_length: 200,
        }
    }
}

/// Structural and payload limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryLimits {
    pub max_query_depth: usize,
    pub max_complexity: u64,
    pub max_cost: f64,
    /// Recursion guard for variable payloads
    pub max_variable_depth: usize,
}

impl Default for QueryLimits {
    fn default() -> Self {
        Self {
            max_query_depth: 10,
            max_complexity: 1000,
            max_cost: 5000.0,
            max_variable_depth: 10,
        }
    }
}

/// Complexity and cost weights
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplexityWeights {
    pub scalar_weight: u64,
    pub object_weight: u64,
    pub list_weight: u64,
    pub connection_weight: u64,
    pub depth_multiplier: f64,
    pub argument_multiplier: f64,
    pub base_cost: f64,
}

impl Default for ComplexityWeights {
    fn default() -> Self {
        Self {
            scalar_weight: 1,
            object_weight: 2,
            list_weight: 10,
            connection_weight: 5,
            depth_multiplier: 1.5,
            argument_multiplier: 1.2,
            base_cost: 1.0,
        }
    }
}

/// Threat tracking and blocking policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreatConfig {
    /// Incidents per hour that trigger escalation
    pub auto_block_threshold: usize,

    /// First-tier block duration
    pub block_duration_seconds: u64,

    /// Further tiers; past the last tier the source enters persistent review
    pub escalation_ladder_seconds: Vec<u64>,

    /// Background sweep interval
    pub sweep_interval_seconds: u64,
}

impl Default for ThreatConfig {
    fn default() -> Self {
        Self {
            auto_block_threshold: 5,
            block_duration_seconds: 60,
            escalation_ladder_seconds: vec![120],
            sweep_interval_seconds: 30,
        }
    }
}

impl ThreatConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds.max(1))
    }
}

/// Per-rule policy. Unset fields fall back to severity-derived defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    /// Optional custom signature pattern
    pub pattern: Option<String>,
    pub category: Option<SignatureCategory>,
    pub severity: Option<Severity>,
    pub description: Option<String>,
    pub action: Option<MitigationAction>,
    /// Triggers within the window before the rule acts
    pub threshold: Option<u32>,
    pub time_window_minutes: Option<u64>,
}

/// Resolved policy for a single rule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RulePolicy {
    pub action: MitigationAction,
    pub threshold: u32,
    pub window: Duration,
}

const DEFAULT_RULE_WINDOW_MINUTES: u64 = 5;

impl RulePolicy {
    /// Default policy derived from severity
    pub fn for_severity(severity: Severity) -> Self {
        let (action, threshold) = match severity {
            Severity::Critical => (MitigationAction::Block, 1),
            Severity::High => (MitigationAction::Alert, 1),
            Severity::Medium => (MitigationAction::Log, 3),
            Severity::Low => (MitigationAction::Log, 5),
        };

        Self {
            action,
            threshold,
            window: Duration::from_secs(DEFAULT_RULE_WINDOW_MINUTES * 60),
        }
    }
}

impl EngineConfig {
    /// Resolve the policy of `rule_id`, falling back to `severity` defaults
    pub fn rule_policy(&self, rule_id: &str, severity: Severity) -> RulePolicy {
        let severity = self
            .rules
            .get(rule_id)
            .and_then(|r| r.severity)
            .unwrap_or(severity);
        let default = RulePolicy::for_severity(severity);

        match self.rules.get(rule_id) {
            Some(rule) => RulePolicy {
                action: rule.action.unwrap_or(default.action),
                threshold: rule.threshold.unwrap_or(default.threshold).max(1),
                window: rule
                    .time_window_minutes
                    .map(|m| Duration::from_secs(m * 60))
                    .unwrap_or(default.window),
            },
            None => default,
        }
    }

    /// Overall analysis budget
    pub fn analysis_timeout(&self) -> Option<Duration> {
        (self.analysis_timeout_ms > 0).then(|| Duration::from_millis(self.analysis_timeout_ms))
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.limits.max_query_depth == 0 {
            return Err(Error::InvalidConfiguration(
                "limits.max_query_depth must be greater than 0".to_string(),
            ));
        }
        if self.limits.max_variable_depth == 0 {
            return Err(Error::InvalidConfiguration(
                "limits.max_variable_depth must be greater than 0".to_string(),
            ));
        }
        if self.weights.depth_multiplier < 1.0 || self.weights.argument_multiplier < 1.0 {
            return Err(Error::InvalidConfiguration(
                "weights multipliers must be at least 1.0".to_string(),
            ));
        }
        if self.threat.auto_block_threshold == 0 {
            return Err(Error::InvalidConfiguration(
                "threat.auto_block_threshold must be greater than 0".to_string(),
            ));
        }
        if self.threat.block_duration_seconds == 0 {
            return Err(Error::InvalidConfiguration(
                "threat.block_duration_seconds must be greater than 0".to_string(),
            ));
        }
        let mut previous = self.threat.block_duration_seconds;
        for &tier in &self.threat.escalation_ladder_seconds {
            if tier <= previous {
                return Err(Error::InvalidConfiguration(format!(
                    "threat.escalation_ladder_seconds must be strictly increasing ({} after {})",
                    tier, previous
                )));
            }
            previous = tier;
        }
        for (id, rule) in &self.rules {
            if rule.threshold == Some(0) {
                return Err(Error::InvalidConfiguration(format!(
                    "rules.{}.threshold must be greater than 0",
                    id
                )));
            }
        }
        Ok(())
    }
}
