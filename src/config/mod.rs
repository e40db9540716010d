pub mod dynamic;
pub mod loader;
pub mod types;

pub use dynamic::DynamicConfigManager;
pub use loader::ConfigLoader;
pub use types::{
    AppConfig, ComplexityWeights, EngineConfig, LoggingConfig, QueryLimits, RuleConfig,
    RulePolicy, ServerConfig, ThreatConfig,
};
