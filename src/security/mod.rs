pub mod query;

pub use query::{QuerySecurityAnalyzer, ThreatTracker};
