//! Mitigation Controller
//!
//! 発火したルールをトラッカーで評価し、`BLOCK > ALERT > LOG` の順で最も強い
//! アクションを決定します。ブロック状態の更新とインシデント・アラートの出力も行います。

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::sink::{excerpt, AlertRecord, IncidentSink, ResponseAction, SecurityIncident};
use super::tracker::{BlockOutcome, ThreatTracker};
use super::types::{MitigationAction, RequestContext, SecurityIssue, Severity};
use crate::config::EngineConfig;

/// 評価対象のルール発火
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub rule_id: String,
    pub severity: Severity,
    pub description: String,
}

impl Trigger {
    /// 問題一覧からルールID単位の発火を作る（同一IDは最高深刻度を残す）
    pub fn from_issues(issues: &[SecurityIssue]) -> Vec<Trigger> {
        let mut triggers: BTreeMap<String, Trigger> = BTreeMap::new();

        for issue in issues {
            let Some(rule_id) = issue.rule_id() else {
                continue;
            };
            let severity = issue.severity();
            triggers
                .entry(rule_id.to_string())
                .and_modify(|t| t.severity = t.severity.max(severity))
                .or_insert_with(|| Trigger {
                    rule_id: rule_id.to_string(),
                    severity,
                    description: issue.describe(),
                });
        }

        triggers.into_values().collect()
    }
}

/// 緩和判定の結果
#[derive(Debug, Clone, PartialEq)]
pub struct MitigationOutcome {
    pub action: MitigationAction,
    pub rejected: bool,
    /// しきい値に達したルール
    pub active_rules: Vec<String>,
    pub incident_id: Option<Uuid>,
    pub response_actions: Vec<ResponseAction>,
    pub blocked_until: Option<DateTime<Utc>>,
    pub persistent_review: bool,
    /// 送信元が既にブロックされていた場合の問題
    pub source_blocked: Option<SecurityIssue>,
}

impl MitigationOutcome {
    fn allow(action: MitigationAction) -> Self {
        Self {
            action,
            rejected: false,
            active_rules: Vec::new(),
            incident_id: None,
            response_actions: Vec::new(),
            blocked_until: None,
            persistent_review: false,
            source_blocked: None,
        }
    }
}

/// 緩和コントローラー
pub struct MitigationController {
    tracker: Arc<ThreatTracker>,
    sink: Arc<dyn IncidentSink>,
}

impl std::fmt::Debug for MitigationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MitigationController")
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

impl MitigationController {
    pub fn new(tracker: Arc<ThreatTracker>, sink: Arc<dyn IncidentSink>) -> Self {
        Self { tracker, sink }
    }

    pub fn tracker(&self) -> &Arc<ThreatTracker> {
        &self.tracker
    }

    /// 送信元がブロック中なら `SourceBlocked` を返す
    pub fn check_blocked(&self, identity: &str) -> Option<SecurityIssue> {
        if !self.tracker.is_blocked(identity) {
            return None;
        }
        Some(SecurityIssue::SourceBlocked {
            blocked_until: self.tracker.blocked_until(identity),
        })
    }

    /// ルール発火を評価してアクションを決定
    pub fn evaluate(
        &self,
        config: &EngineConfig,
        triggers: &[Trigger],
        ctx: &RequestContext,
        payload: &str,
    ) -> MitigationOutcome {
        let identity = ctx.source_identity.as_str();

        if let Some(issue) = self.check_blocked(identity) {
            info!(
                "Rejecting request {} from blocked source {}",
                ctx.request_id, identity
            );
            return MitigationOutcome {
                rejected: true,
                source_blocked: Some(issue),
                ..MitigationOutcome::allow(MitigationAction::Block)
            };
        }

        if triggers.is_empty() {
            return MitigationOutcome::allow(MitigationAction::Log);
        }

        let mut active: Vec<(&Trigger, MitigationAction)> = Vec::new();
        for trigger in triggers {
            let policy = config.rule_policy(&trigger.rule_id, trigger.severity);
            let count = self
                .tracker
                .record_trigger(&trigger.rule_id, identity, policy.window);

            if count >= policy.threshold as usize {
                active.push((trigger, policy.action));
            } else {
                debug!(
                    "Rule {} triggered by {} ({}/{} within window)",
                    trigger.rule_id, identity, count, policy.threshold
                );
            }
        }

        let Some(action) = active.iter().map(|(_, action)| *action).max() else {
            return MitigationOutcome::allow(MitigationAction::Log);
        };

        let active_rules: Vec<String> = active.iter().map(|(t, _)| t.rule_id.clone()).collect();
        let severity = active
            .iter()
            .map(|(t, _)| t.severity)
            .max()
            .unwrap_or_default();

        if action == MitigationAction::Log {
            info!(
                request_id = %ctx.request_id,
                source = identity,
                rules = ?active_rules,
                "Logged query security event"
            );
            return MitigationOutcome {
                active_rules,
                response_actions: vec![ResponseAction::Logged],
                ..MitigationOutcome::allow(MitigationAction::Log)
            };
        }

        let hourly = self.tracker.record_incident(identity);
        let escalate = hourly >= config.threat.auto_block_threshold;

        let mut outcome = MitigationOutcome {
            active_rules,
            ..MitigationOutcome::allow(action)
        };

        match (action, escalate) {
            (MitigationAction::Block, false) => {
                let until = self.tracker.block_initial(identity);
                outcome.rejected = true;
                outcome.blocked_until = Some(until);
                outcome.response_actions = vec![
                    ResponseAction::RequestBlocked,
                    ResponseAction::SourceBlocked,
                ];
            }
            (_, true) => {
                outcome.action = MitigationAction::Block;
                outcome.rejected = true;
                outcome.response_actions.push(ResponseAction::RequestBlocked);
                if action != MitigationAction::Block {
                    outcome.response_actions.push(ResponseAction::AutoBlock);
                }
                match self.tracker.block_escalated(identity) {
                    BlockOutcome::Timed { until, .. } => {
                        outcome.blocked_until = Some(until);
                        outcome.response_actions.push(ResponseAction::EscalatedBlock);
                    }
                    BlockOutcome::PersistentReview => {
                        outcome.persistent_review = true;
                        outcome
                            .response_actions
                            .push(ResponseAction::PersistentReview);
                    }
                }
                warn!(
                    "Source {} reached {} incidents within an hour; escalating block",
                    identity, hourly
                );
            }
            _ => {
                outcome.response_actions = vec![ResponseAction::AlertSent];
            }
        }

        let incident = SecurityIncident {
            incident_id: Uuid::new_v4(),
            correlation_id: ctx.request_id,
            timestamp: self.tracker.now(),
            source_identity: identity.to_string(),
            user_id: ctx.user_id.clone(),
            severity,
            attack_vector: outcome.active_rules.clone(),
            payload_excerpt: excerpt(payload, config.payload_excerpt_length),
            blocked: outcome.rejected,
            response_actions: outcome.response_actions.clone(),
        };
        outcome.incident_id = Some(incident.incident_id);

        let alert_needed = action == MitigationAction::Alert;
        if alert_needed {
            let description = active
                .iter()
                .map(|(t, _)| t.description.as_str())
                .collect::<Vec<_>>()
                .join("; ");
            self.sink.record_alert(AlertRecord {
                alert_id: Uuid::new_v4(),
                incident_id: incident.incident_id,
                timestamp: incident.timestamp,
                level: severity,
                source_identity: identity.to_string(),
                title: format!("Query threat detected: {}", outcome.active_rules.join(", ")),
                description,
            });
        }

        warn!(
            "Security incident {} from {}: {} ({:?})",
            incident.incident_id, identity, outcome.action, outcome.active_rules
        );
        self.sink.record_incident(incident);

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuleConfig;
    use crate::security::query::clock::{Clock, ManualClock};
    use crate::security::query::sink::MemorySink;
    use crate::security::query::tracker::{ThreatState, TrackerSettings};

    fn controller() -> (MitigationController, Arc<MemorySink>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let tracker = Arc::new(ThreatTracker::new(TrackerSettings::default(), clock.clone()));
        let sink = Arc::new(MemorySink::new());
        (MitigationController::new(tracker, sink.clone()), sink, clock)
    }

    fn trigger(rule_id: &str, severity: Severity) -> Trigger {
        Trigger {
            rule_id: rule_id.to_string(),
            severity,
            description: format!("{} matched", rule_id),
        }
    }

    #[test]
    fn test_no_triggers_creates_no_state() {
        let (controller, sink, _clock) = controller();
        let ctx = RequestContext::new("10.0.0.1");

        let outcome = controller.evaluate(&EngineConfig::default(), &[], &ctx, "{ me { id } }");
        assert_eq!(outcome.action, MitigationAction::Log);
        assert!(!outcome.rejected);
        assert_eq!(controller.tracker().state("10.0.0.1"), ThreatState::Clean);
        assert!(sink.incidents().is_empty());
    }

    #[test]
    fn test_critical_rule_blocks_immediately() {
        let (controller, sink, _clock) = controller();
        let ctx = RequestContext::new("10.0.0.1");

        let outcome = controller.evaluate(
            &EngineConfig::default(),
            &[trigger("stacked_queries", Severity::Critical)],
            &ctx,
            "1; DROP TABLE users--",
        );

        assert_eq!(outcome.action, MitigationAction::Block);
        assert!(outcome.rejected);
        assert!(outcome.blocked_until.is_some());
        assert!(controller.tracker().is_blocked("10.0.0.1"));

        let incidents = sink.incidents();
        assert_eq!(incidents.len(), 1);
        assert!(incidents[0].blocked);
        assert_eq!(incidents[0].attack_vector, vec!["stacked_queries".to_string()]);
    }

    #[test]
    fn test_blocked_source_is_rejected_without_rule_evaluation() {
        let (controller, sink, _clock) = controller();
        let ctx = RequestContext::new("10.0.0.1");
        controller.tracker().block_initial("10.0.0.1");

        let outcome = controller.evaluate(
            &EngineConfig::default(),
            &[trigger("union_select", Severity::High)],
            &ctx,
            "",
        );
        assert!(outcome.rejected);
        assert!(matches!(
            outcome.source_blocked,
            Some(SecurityIssue::SourceBlocked { .. })
        ));
        assert!(sink.incidents().is_empty());
    }

    #[test]
    fn test_threshold_requires_repetition() {
        let (controller, sink, _clock) = controller();
        let mut config = EngineConfig::default();
        config.rules.insert(
            "union_select".to_string(),
            RuleConfig {
                action: Some(MitigationAction::Block),
                threshold: Some(3),
                ..Default::default()
            },
        );
        let ctx = RequestContext::new("10.0.0.1");
        let triggers = [trigger("union_select", Severity::High)];

        for _ in 0..2 {
            let outcome = controller.evaluate(&config, &triggers, &ctx, "");
            assert!(!outcome.rejected);
            assert!(outcome.active_rules.is_empty());
        }
        let outcome = controller.evaluate(&config, &triggers, &ctx, "");
        assert!(outcome.rejected);
        assert_eq!(sink.incidents().len(), 1);
    }

    #[test]
    fn test_max_action_wins() {
        let (controller, sink, _clock) = controller();
        let ctx = RequestContext::new("10.0.0.1");

        let outcome = controller.evaluate(
            &EngineConfig::default(),
            &[
                trigger("union_select", Severity::High),
                trigger("stacked_queries", Severity::Critical),
            ],
            &ctx,
            "",
        );
        assert_eq!(outcome.action, MitigationAction::Block);
        assert_eq!(outcome.active_rules.len(), 2);
        assert_eq!(sink.incidents()[0].severity, Severity::Critical);
    }

    #[test]
    fn test_alert_emits_incident_and_alert() {
        let (controller, sink, _clock) = controller();
        let ctx = RequestContext::new("10.0.0.1").with_user("alice");

        let outcome = controller.evaluate(
            &EngineConfig::default(),
            &[trigger("union_select", Severity::High)],
            &ctx,
            "1 UNION SELECT password FROM users",
        );
        assert_eq!(outcome.action, MitigationAction::Alert);
        assert!(!outcome.rejected);

        let incidents = sink.incidents();
        assert_eq!(incidents.len(), 1);
        assert!(!incidents[0].blocked);
        assert_eq!(incidents[0].user_id.as_deref(), Some("alice"));
        assert_eq!(sink.alerts().len(), 1);
        assert_eq!(sink.alerts()[0].incident_id, incidents[0].incident_id);
    }

    #[test]
    fn test_incident_timestamp_uses_tracker_clock() {
        let (controller, sink, clock) = controller();
        clock.set(Utc::now() - chrono::Duration::days(30));
        clock.advance(chrono::Duration::seconds(5));

        controller.evaluate(
            &EngineConfig::default(),
            &[trigger("union_select", Severity::High)],
            &RequestContext::new("10.0.0.1"),
            "",
        );

        assert_eq!(sink.incidents()[0].timestamp, clock.now());
        assert_eq!(sink.alerts()[0].timestamp, clock.now());
    }

    #[test]
    fn test_log_action_emits_no_incident() {
        let (controller, sink, _clock) = controller();
        let mut config = EngineConfig::default();
        config.rules.insert(
            "comment_injection".to_string(),
            RuleConfig {
                threshold: Some(1),
                ..Default::default()
            },
        );
        let ctx = RequestContext::new("10.0.0.1");

        let outcome = controller.evaluate(
            &config,
            &[trigger("comment_injection", Severity::Medium)],
            &ctx,
            "",
        );
        assert_eq!(outcome.action, MitigationAction::Log);
        assert_eq!(outcome.active_rules, vec!["comment_injection".to_string()]);
        assert!(sink.incidents().is_empty());
    }

    #[test]
    fn test_repeat_alerts_are_promoted_to_block() {
        let (controller, sink, _clock) = controller();
        let ctx = RequestContext::new("10.0.0.1");
        let triggers = [trigger("union_select", Severity::High)];

        for _ in 0..4 {
            let outcome = controller.evaluate(&EngineConfig::default(), &triggers, &ctx, "");
            assert_eq!(outcome.action, MitigationAction::Alert);
        }
        let outcome = controller.evaluate(&EngineConfig::default(), &triggers, &ctx, "");
        assert_eq!(outcome.action, MitigationAction::Block);
        assert!(outcome.response_actions.contains(&ResponseAction::AutoBlock));
        assert!(controller.tracker().is_blocked("10.0.0.1"));
        assert_eq!(sink.incidents().len(), 5);
    }

    #[test]
    fn test_escalated_block_is_longer_than_initial() {
        let (controller, _sink, clock) = controller();
        let config = EngineConfig::default();
        let ctx = RequestContext::new("10.0.0.1");
        let triggers = [trigger("stacked_queries", Severity::Critical)];
        let initial = chrono::Duration::seconds(config.threat.block_duration_seconds as i64);

        for _ in 0..4 {
            let outcome = controller.evaluate(&config, &triggers, &ctx, "");
            let until = outcome.blocked_until.unwrap();
            assert_eq!(until - clock.now(), initial);
            clock.advance(initial + chrono::Duration::seconds(1));
        }

        let outcome = controller.evaluate(&config, &triggers, &ctx, "");
        assert!(outcome.response_actions.contains(&ResponseAction::EscalatedBlock));
        let until = outcome.blocked_until.unwrap();
        assert!(until - clock.now() > initial);
    }

    #[test]
    fn test_trigger_from_issues_deduplicates() {
        use crate::security::query::signature::SignatureCategory;
        use crate::security::query::types::SignatureMatchIssue;

        let issue = |location: &str| {
            SecurityIssue::SignatureMatch(SignatureMatchIssue {
                rule_id: "union_select".to_string(),
                category: SignatureCategory::Sql,
                severity: Severity::High,
                description: "union".to_string(),
                location: location.to_string(),
            })
        };
        let issues = vec![
            issue("literal[0]"),
            issue("variables.id"),
            SecurityIssue::SyntaxError {
                message: "x".to_string(),
            },
        ];

        let triggers = Trigger::from_issues(&issues);
        assert_eq!(triggers.len(), 1);
        assert_eq!(triggers[0].rule_id, "union_select");
    }
}
