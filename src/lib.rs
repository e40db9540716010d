//! # query-guard
//!
//! Query threat detection and mitigation engine for GraphQL-style requests.
//!
//! The engine scores the structure of incoming query documents, matches
//! injection signatures against literals and variable payloads, and drives
//! a per-source response (log, alert, block) with escalating blocks for
//! repeat offenders.

pub mod config;
pub mod error;
pub mod logging;
pub mod security;
pub mod service;

pub use error::{Error, Result};
pub use security::query::{
    AnalysisResult, Decision, MitigationAction, QuerySecurityAnalyzer, RequestContext,
};
