//! Query Threat Detection & Mitigation
//!
//! GraphQL形式のクエリと変数に対するインジェクション検知・構造スコアリングと、
//! 送信元単位の段階的な緩和（ログ・アラート・ブロック）を提供します。

pub mod analyzer;
pub mod clock;
pub mod mitigation;
pub mod parser;
pub mod pattern;
pub mod signature;
pub mod sink;
pub mod structural;
pub mod tracker;
pub mod types;

pub use analyzer::{fingerprint, EngineSnapshot, QuerySecurityAnalyzer};
pub use clock::{Clock, ManualClock, SystemClock};
pub use mitigation::{MitigationController, MitigationOutcome, Trigger};
pub use parser::parse_document;
pub use pattern::{PatternMatcher, VariableScan};
pub use signature::{Signature, SignatureCategory, SignatureSet};
pub use sink::{
    AlertRecord, ChannelSink, IncidentSink, MemoryBackend, MemorySink, ResponseAction,
    SecurityIncident, SinkBackend, TracingBackend,
};
pub use structural::{StructuralAnalyzer, StructuralReport};
pub use tracker::{BlockOutcome, SweepReport, ThreatRecord, ThreatState, ThreatTracker, TrackerSettings};
pub use types::{
    AnalysisFailure, AnalysisResult, Deadline, Decision, MitigationAction, ParseError,
    QueryDocument, QueryRequest, RequestContext, SecurityIssue, Severity,
};
