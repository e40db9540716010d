//! Query Security Analyzer
//!
//! 構造解析・パターン照合・緩和判定を1回の解析にまとめるエントリポイントです。
//! 内部失敗（エラー・パニック・締め切り超過）はすべてフェイルクローズで拒否します。
//!
//! ```text
//! fingerprint -> blocked fast path -> parse -> structural -> patterns
//!             -> whitelist / blacklist -> mitigation -> recommendations
//! ```

use std::any::Any;
use std::borrow::Cow;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::clock::{Clock, SystemClock};
use super::mitigation::{MitigationController, Trigger};
use super::parser::parse_document;
use super::pattern::PatternMatcher;
use super::signature::{Signature, SignatureCategory, SignatureSet};
use super::sink::IncidentSink;
use super::structural::{StructuralAnalyzer, StructuralReport};
use super::tracker::{ThreatTracker, TrackerSettings};
use super::types::{
    AnalysisFailure, AnalysisResult, Deadline, Decision, LimitExceededIssue, ParseError,
    QueryDocument, QueryRequest, RequestContext, SecurityIssue, Severity, SignatureMatchIssue,
};
use crate::config::{DynamicConfigManager, EngineConfig};
use crate::error::Result;

/// 推奨事項を出すしきい値（上限に対する割合）
const RECOMMENDATION_RATIO: f64 = 0.8;

/// 設定から組み立てた不変のエンジン状態
#[derive(Debug)]
pub struct EngineSnapshot {
    pub config: EngineConfig,
    pub structural: StructuralAnalyzer,
    pub matcher: PatternMatcher,
}

impl EngineSnapshot {
    /// 設定を検証し、シグネチャをコンパイルする
    pub fn build(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let signatures = Arc::new(SignatureSet::load(&config.rules)?);

        Ok(Self {
            structural: StructuralAnalyzer::new(config.weights.clone()),
            matcher: PatternMatcher::new(signatures, config.limits.max_variable_depth),
            config,
        })
    }
}

/// 構造解析とパターン照合の結果
#[derive(Debug, Default)]
struct Inspection {
    report: Option<StructuralReport>,
    issues: Vec<SecurityIssue>,
}

/// クエリセキュリティアナライザー
pub struct QuerySecurityAnalyzer {
    snapshot: RwLock<Arc<EngineSnapshot>>,
    mitigation: MitigationController,
}

impl std::fmt::Debug for QuerySecurityAnalyzer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerySecurityAnalyzer")
            .field("mitigation", &self.mitigation)
            .finish_non_exhaustive()
    }
}

impl QuerySecurityAnalyzer {
    /// システム時刻で作成
    pub fn new(config: EngineConfig, sink: Arc<dyn IncidentSink>) -> Result<Self> {
        Self::with_clock(config, sink, Arc::new(SystemClock))
    }

    /// 時刻ソースを指定して作成
    pub fn with_clock(
        config: EngineConfig,
        sink: Arc<dyn IncidentSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let settings = TrackerSettings::from(&config.threat);
        let snapshot = EngineSnapshot::build(config)?;
        let tracker = Arc::new(ThreatTracker::new(settings, clock));

        info!(
            "Query security analyzer initialized with {} signatures",
            snapshot.matcher.signatures().len()
        );

        Ok(Self {
            snapshot: RwLock::new(Arc::new(snapshot)),
            mitigation: MitigationController::new(tracker, sink),
        })
    }

    pub fn tracker(&self) -> &Arc<ThreatTracker> {
        self.mitigation.tracker()
    }

    /// 現在の設定スナップショット
    pub fn snapshot(&self) -> Arc<EngineSnapshot> {
        match self.snapshot.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// 新しい設定に差し替える。失敗時は現在の設定を維持する
    pub fn reload(&self, config: EngineConfig) -> Result<()> {
        let settings = TrackerSettings::from(&config.threat);
        let snapshot = Arc::new(EngineSnapshot::build(config)?);

        {
            let mut current = match self.snapshot.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *current = snapshot;
        }
        self.tracker().update_settings(settings);

        info!("Query security configuration reloaded");
        Ok(())
    }

    /// 設定マネージャーの変更を監視して `reload` する
    pub fn watch_config(
        self: Arc<Self>,
        manager: Arc<DynamicConfigManager>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let mut changes = manager.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }

                let version = *changes.borrow_and_update();
                let config = manager.get_config();
                match self.reload(config.engine.clone()) {
                    Ok(()) => info!("Applied configuration version {}", version),
                    Err(e) => error!(
                        "Rejected configuration version {}: {}; keeping previous configuration",
                        version, e
                    ),
                }
            }
            debug!("Configuration watcher stopped");
        })
    }

    /// 生テキストを解析してから検査。解析もフェイルクローズの対象に含む
    pub fn analyze_text(
        &self,
        raw_query: &str,
        variables: Option<Value>,
        ctx: &RequestContext,
    ) -> AnalysisResult {
        self.run(raw_query, variables.as_ref(), ctx, || {
            Cow::Owned(parse_document(raw_query))
        })
    }

    /// 解析済みリクエストを検査して判定を返す
    pub fn analyze(&self, request: &QueryRequest, ctx: &RequestContext) -> AnalysisResult {
        self.run(
            &request.raw_query,
            request.variables.as_ref(),
            ctx,
            || Cow::Borrowed(&request.document),
        )
    }

    fn run<'d, P>(
        &self,
        raw_query: &str,
        variables: Option<&Value>,
        ctx: &RequestContext,
        document: P,
    ) -> AnalysisResult
    where
        P: FnOnce() -> Cow<'d, std::result::Result<QueryDocument, ParseError>>,
    {
        let started = Instant::now();
        let snapshot = self.snapshot();
        let config = &snapshot.config;
        let fingerprint = fingerprint(raw_query, variables);

        // ブロック中の送信元は解析しない
        if let Some(issue) = self.mitigation.check_blocked(&ctx.source_identity) {
            info!(
                "Rejected request {} from blocked source {}",
                ctx.request_id, ctx.source_identity
            );
            return finish(
                Inspection {
                    report: None,
                    issues: vec![issue],
                },
                fingerprint,
                Decision::reject(ctx.request_id),
                Vec::new(),
                started,
            );
        }

        let deadline = match config.analysis_timeout() {
            Some(budget) => ctx.deadline.earliest(Deadline::after(budget)),
            None => ctx.deadline,
        };

        let inspected = catch_unwind(AssertUnwindSafe(
            || -> std::result::Result<Inspection, AnalysisFailure> {
                let document = document();
                deadline.check("parsing")?;
                inspect(
                    &snapshot,
                    raw_query,
                    &document,
                    variables,
                    &fingerprint,
                    &deadline,
                )
            },
        ));

        let inspection = match inspected {
            Ok(Ok(inspection)) => inspection,
            Ok(Err(failure)) => {
                return self.fail_closed(failure, fingerprint, ctx, started);
            }
            Err(panic) => {
                let failure = AnalysisFailure::Internal(panic_message(panic.as_ref()));
                return self.fail_closed(failure, fingerprint, ctx, started);
            }
        };

        // 不正なドキュメントは緩和判定を経ずに拒否する
        if inspection.issues.iter().any(is_malformed) {
            info!(
                "Rejected malformed document in request {} from {}",
                ctx.request_id, ctx.source_identity
            );
            return finish(
                inspection,
                fingerprint,
                Decision::reject(ctx.request_id),
                Vec::new(),
                started,
            );
        }

        let triggers = Trigger::from_issues(&inspection.issues);
        let payload = match variables {
            Some(variables) => format!("{} {}", raw_query, variables),
            None => raw_query.to_string(),
        };
        let outcome = self.mitigation.evaluate(config, &triggers, ctx, &payload);

        let mut inspection = inspection;
        if let Some(issue) = outcome.source_blocked.clone() {
            inspection.issues.push(issue);
        }

        let decision = if outcome.rejected {
            Decision::reject(ctx.request_id)
        } else {
            Decision::allow(outcome.action, ctx.request_id)
        };
        let warnings = inspection
            .report
            .as_ref()
            .map(|report| recommendations(report, config))
            .unwrap_or_default();

        let result = finish(inspection, fingerprint, decision, warnings, started);
        if result.issues.is_empty() {
            debug!(
                "Request {} passed analysis in {:.3}ms",
                ctx.request_id, result.elapsed_millis
            );
        } else {
            info!(
                "Request {} from {}: {} issues, action {}",
                ctx.request_id,
                ctx.source_identity,
                result.issues.len(),
                result.decision.action
            );
        }
        result
    }

    fn fail_closed(
        &self,
        failure: AnalysisFailure,
        fingerprint: String,
        ctx: &RequestContext,
        started: Instant,
    ) -> AnalysisResult {
        let issue = match &failure {
            AnalysisFailure::DeadlineExceeded(phase) => SecurityIssue::AnalysisTimeout {
                phase: phase.to_string(),
            },
            AnalysisFailure::Internal(message) => SecurityIssue::AnalysisError {
                message: message.clone(),
            },
        };
        error!(
            "Analysis of request {} from {} failed closed: {}",
            ctx.request_id, ctx.source_identity, failure
        );

        finish(
            Inspection {
                report: None,
                issues: vec![issue],
            },
            fingerprint,
            Decision::reject(ctx.request_id),
            Vec::new(),
            started,
        )
    }
}

/// 空白を正規化したクエリと、キー順を揃えた変数の SHA-256
///
/// `serde_json::Map` は既定でキー順に並ぶため、直列化結果がそのまま正規形になる。
pub fn fingerprint(raw_query: &str, variables: Option<&Value>) -> String {
    let normalized = raw_query.split_whitespace().collect::<Vec<_>>().join(" ");

    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    if let Some(variables) = variables {
        // `Value` の直列化は失敗しない
        let canonical = serde_json::to_vec(variables).unwrap_or_default();
        hasher.update([0u8]);
        hasher.update(&canonical);
    }
    format!("{:x}", hasher.finalize())
}

/// 構文エラーまたはオペレーションなし
fn is_malformed(issue: &SecurityIssue) -> bool {
    matches!(
        issue,
        SecurityIssue::SyntaxError { .. } | SecurityIssue::NoOperations
    )
}

fn inspect(
    snapshot: &EngineSnapshot,
    raw_query: &str,
    document: &std::result::Result<QueryDocument, ParseError>,
    variables: Option<&Value>,
    fingerprint: &str,
    deadline: &Deadline,
) -> std::result::Result<Inspection, AnalysisFailure> {
    let config = &snapshot.config;
    let mut inspection = Inspection::default();

    let document = match document {
        Ok(document) => document,
        Err(e) => {
            inspection.issues.push(SecurityIssue::SyntaxError {
                message: e.to_string(),
            });
            return Ok(inspection);
        }
    };

    if config.blacklist.contains(fingerprint) {
        inspection.issues.push(SecurityIssue::BlacklistedQuery {
            fingerprint: fingerprint.to_string(),
        });
    }
    let whitelisted = config.whitelist.contains(fingerprint);

    let report = snapshot.structural.analyze(document, deadline)?;

    match report.operation_count {
        0 => inspection.issues.push(SecurityIssue::NoOperations),
        1 => {}
        count => inspection
            .issues
            .push(SecurityIssue::MultipleOperations { count }),
    }

    if !whitelisted {
        check_limits(&report, config, &mut inspection.issues);

        deadline.check("pattern matching")?;
        scan_patterns(
            snapshot,
            raw_query,
            document,
            variables,
            deadline,
            &mut inspection.issues,
        )?;
    }

    inspection.report = Some(report);
    Ok(inspection)
}

fn check_limits(report: &StructuralReport, config: &EngineConfig, issues: &mut Vec<SecurityIssue>) {
    let limits = &config.limits;

    if report.depth > limits.max_query_depth {
        issues.push(SecurityIssue::ExcessiveDepth(LimitExceededIssue {
            actual: report.depth,
            limit: limits.max_query_depth,
        }));
    }
    if report.complexity > limits.max_complexity {
        issues.push(SecurityIssue::ExcessiveComplexity(LimitExceededIssue {
            actual: report.complexity,
            limit: limits.max_complexity,
        }));
    }
    if report.cost > limits.max_cost {
        issues.push(SecurityIssue::ExcessiveCost(LimitExceededIssue {
            actual: report.cost,
            limit: limits.max_cost,
        }));
    }
    if report.is_introspective {
        issues.push(SecurityIssue::Introspection {
            allowed: config.allow_introspection,
        });
    }
}

fn scan_patterns(
    snapshot: &EngineSnapshot,
    raw_query: &str,
    document: &QueryDocument,
    variables: Option<&Value>,
    deadline: &Deadline,
    issues: &mut Vec<SecurityIssue>,
) -> std::result::Result<(), AnalysisFailure> {
    let config = &snapshot.config;
    let matcher = &snapshot.matcher;
    let is_payload = |s: &Signature| s.category != SignatureCategory::Structural;

    // 構造系シグネチャはクエリ全体に、その他は文字列値と変数に適用する
    if !config.allow_introspection {
        for signature in matcher.signatures().by_category(SignatureCategory::Structural) {
            if signature.is_match(raw_query) {
                issues.push(signature_issue(signature, "query"));
            }
        }
    }

    for (signature, location) in matcher.scan_literals(&document.literals) {
        if is_payload(signature) {
            issues.push(signature_issue(signature, &location));
        }
    }

    if let Some(variables) = variables {
        deadline.check("variable scanning")?;
        let scan = matcher.scan_variables_until(variables, "variables", deadline)?;
        for (signature, path) in scan.matches {
            if is_payload(signature) {
                issues.push(signature_issue(signature, &path));
            }
        }
        if let Some(path) = scan.too_deep {
            warn!("Variables nested deeper than {} at {}", config.limits.max_variable_depth, path);
            issues.push(SecurityIssue::VariablesTooDeep {
                path,
                limit: config.limits.max_variable_depth,
            });
        }
    }

    Ok(())
}

fn signature_issue(signature: &Signature, location: &str) -> SecurityIssue {
    SecurityIssue::SignatureMatch(SignatureMatchIssue {
        rule_id: signature.id.clone(),
        category: signature.category,
        severity: signature.severity,
        description: signature.description.clone(),
        location: location.to_string(),
    })
}

fn recommendations(report: &StructuralReport, config: &EngineConfig) -> Vec<String> {
    let limits = &config.limits;
    let mut warnings = Vec::new();

    if report.depth as f64 > limits.max_query_depth as f64 * RECOMMENDATION_RATIO {
        warnings.push(format!(
            "Query depth {} is close to the limit of {}; reduce nesting or split the query",
            report.depth, limits.max_query_depth
        ));
    }
    if report.complexity as f64 > limits.max_complexity as f64 * RECOMMENDATION_RATIO {
        warnings.push(format!(
            "Query complexity {} is close to the limit of {}; request fewer fields or use pagination",
            report.complexity, limits.max_complexity
        ));
    }
    if report.cost > limits.max_cost * RECOMMENDATION_RATIO {
        warnings.push(format!(
            "Estimated cost {:.1} is close to the limit of {:.1}; reduce arguments on deeply nested fields",
            report.cost, limits.max_cost
        ));
    }

    warnings
}

fn finish(
    inspection: Inspection,
    fingerprint: String,
    decision: Decision,
    performance_warnings: Vec<String>,
    started: Instant,
) -> AnalysisResult {
    let syntax_error = inspection
        .issues
        .iter()
        .any(|i| matches!(i, SecurityIssue::SyntaxError { .. }));
    let severe = inspection
        .issues
        .iter()
        .any(|i| i.severity() >= Severity::High);
    let (depth, complexity, cost) = inspection
        .report
        .as_ref()
        .map(|r| (r.depth, r.complexity, r.cost))
        .unwrap_or((0, 0, 0.0));

    AnalysisResult {
        is_valid: !syntax_error && !severe && !decision.rejected,
        complexity_score: complexity,
        depth_score: depth,
        cost_estimate: cost,
        issues: inspection.issues,
        performance_warnings,
        fingerprint,
        elapsed_millis: started.elapsed().as_secs_f64() * 1000.0,
        decision,
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "analysis panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::query::clock::ManualClock;
    use crate::security::query::sink::MemorySink;
    use crate::security::query::types::MitigationAction;
    use serde_json::json;

    fn analyzer() -> (QuerySecurityAnalyzer, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let analyzer = QuerySecurityAnalyzer::with_clock(
            EngineConfig::default(),
            sink.clone(),
            Arc::new(ManualClock::default()),
        )
        .unwrap();
        (analyzer, sink)
    }

    #[test]
    fn test_fingerprint_normalizes_whitespace_and_key_order() {
        let a = fingerprint("{ user { id } }", Some(&json!({"a": 1, "b": 2})));
        let b = fingerprint("{\n  user {\n    id\n  }\n}", Some(&json!({"b": 2, "a": 1})));
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, fingerprint("{ user { id } }", None));
    }

    #[test]
    fn test_benign_query_is_valid() {
        let (analyzer, sink) = analyzer();
        let ctx = RequestContext::new("10.0.0.1");

        let result = analyzer.analyze_text(
            "query GetUser($id: ID!) { user(id: $id) { id name email } }",
            Some(json!({"id": "42"})),
            &ctx,
        );

        assert!(result.is_valid, "{:?}", result.issues);
        assert!(result.issues.is_empty());
        assert_eq!(result.depth_score, 2);
        assert_eq!(result.decision.action, MitigationAction::Log);
        assert!(!result.decision.rejected);
        assert!(sink.incidents().is_empty());
    }

    #[test]
    fn test_syntax_error_short_circuits() {
        let (analyzer, sink) = analyzer();
        let result = analyzer.analyze_text("{ user { id ", None, &RequestContext::new("10.0.0.1"));
        assert!(!result.is_valid);
        assert!(result.has_issue("syntax_error"));
        assert_eq!(result.depth_score, 0);
        assert!(result.decision.rejected);
        assert_eq!(result.decision.action, MitigationAction::Block);
        assert!(analyzer.tracker().is_empty());
        assert!(sink.incidents().is_empty());
    }

    #[test]
    fn test_document_without_operations_is_rejected() {
        let (analyzer, _sink) = analyzer();
        let request = QueryRequest {
            raw_query: String::new(),
            document: Ok(QueryDocument::default()),
            variables: None,
        };

        let result = analyzer.analyze(&request, &RequestContext::new("10.0.0.1"));
        assert!(result.has_issue("no_operations"));
        assert!(!result.is_valid);
        assert!(result.decision.rejected);
    }

    #[test]
    fn test_comment_does_not_hide_injected_literal() {
        let (analyzer, _sink) = analyzer();
        let query = "# don't cache\n{ user(name: \"x' OR 1=1--\") { id } }";

        let result = analyzer.analyze_text(query, None, &RequestContext::new("10.0.0.1"));
        assert!(!result.is_valid);
        assert!(result.matched_rule("boolean_blind"));
        assert!(result.issues.iter().any(|issue| matches!(
            issue,
            SecurityIssue::SignatureMatch(m) if m.location == "literal[0]"
        )));
    }

    #[test]
    fn test_internal_failure_fails_closed() {
        let (analyzer, sink) = analyzer();
        let ctx = RequestContext::new("10.0.0.1");

        let result = analyzer.run(
            "{ me { id } }",
            None,
            &ctx,
            || -> Cow<'static, std::result::Result<QueryDocument, ParseError>> {
                panic!("parser state corrupted")
            },
        );

        assert!(!result.is_valid);
        assert!(result.decision.rejected);
        assert_eq!(result.max_severity(), Some(Severity::Critical));
        assert!(result.issues.iter().any(|issue| matches!(
            issue,
            SecurityIssue::AnalysisError { message } if message == "parser state corrupted"
        )));
        assert!(analyzer.tracker().is_empty());
        assert!(sink.incidents().is_empty());

        // 失敗は送信元の状態に影響しない
        let next = analyzer.analyze_text("{ me { id } }", None, &ctx);
        assert!(next.is_valid);
    }

    #[test]
    fn test_introspection_rejected_unless_allowed() {
        let (analyzer, _sink) = analyzer();
        let query = "{ __schema { types { name } } }";

        let result = analyzer.analyze_text(query, None, &RequestContext::new("10.0.0.1"));
        assert!(!result.is_valid);
        assert!(result.has_issue("introspection"));
        assert!(result.matched_rule("introspection_lookup"));

        let mut config = EngineConfig::default();
        config.allow_introspection = true;
        analyzer.reload(config).unwrap();

        let result = analyzer.analyze_text(query, None, &RequestContext::new("10.0.0.2"));
        assert!(result.is_valid, "{:?}", result.issues);
        assert!(!result.matched_rule("introspection_lookup"));
    }

    #[test]
    fn test_whitelisted_fingerprint_skips_limits() {
        let (analyzer, _sink) = analyzer();
        let query = "{ a { b { c { d { e { f { g { h { i { j { k } } } } } } } } } } }";

        let mut config = EngineConfig::default();
        config.whitelist.insert(fingerprint(query, None));
        analyzer.reload(config).unwrap();

        let result = analyzer.analyze_text(query, None, &RequestContext::new("10.0.0.1"));
        assert!(result.is_valid);
        assert_eq!(result.depth_score, 11);
    }

    #[test]
    fn test_blacklisted_fingerprint_is_blocked() {
        let (analyzer, _sink) = analyzer();
        let query = "{ expensiveReport { rows } }";

        let mut config = EngineConfig::default();
        config.blacklist.insert(fingerprint(query, None));
        analyzer.reload(config).unwrap();

        let result = analyzer.analyze_text(query, None, &RequestContext::new("10.0.0.1"));
        assert!(!result.is_valid);
        assert!(result.has_issue("blacklisted_query"));
        assert!(result.decision.rejected);
    }

    #[test]
    fn test_invalid_reload_keeps_previous_configuration() {
        let (analyzer, _sink) = analyzer();
        let mut config = EngineConfig::default();
        config.limits.max_query_depth = 3;
        analyzer.reload(config).unwrap();

        let mut broken = EngineConfig::default();
        broken.rules.insert(
            "broken".to_string(),
            crate::config::RuleConfig {
                pattern: Some("(".to_string()),
                ..Default::default()
            },
        );
        assert!(analyzer.reload(broken).is_err());
        assert_eq!(analyzer.snapshot().config.limits.max_query_depth, 3);
    }

    #[test]
    fn test_expired_deadline_fails_closed() {
        let (analyzer, sink) = analyzer();
        let fields: String = (0..200).map(|i| format!("f{} ", i)).collect();
        let query = format!("{{ {} }}", fields);
        let ctx = RequestContext::new("10.0.0.1").with_deadline(Deadline::at(Instant::now()));

        let result = analyzer.analyze_text(&query, None, &ctx);
        assert!(!result.is_valid);
        assert!(result.has_issue("analysis_timeout"));
        assert!(result.decision.rejected);
        assert!(sink.incidents().is_empty());
    }

    #[test]
    fn test_recommendations_near_limits() {
        let (analyzer, _sink) = analyzer();
        let query = "{ a { b { c { d { e { f { g { h { i } } } } } } } } }";

        let result = analyzer.analyze_text(query, None, &RequestContext::new("10.0.0.1"));
        assert!(result.is_valid);
        assert_eq!(result.depth_score, 9);
        assert!(result
            .performance_warnings
            .iter()
            .any(|w| w.contains("reduce nesting")));
    }

    #[test]
    fn test_panic_message() {
        let panic = catch_unwind(|| panic!("boom")).unwrap_err();
        assert_eq!(panic_message(panic.as_ref()), "boom");
    }
}
