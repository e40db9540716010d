//! Threat State Tracker
//!
//! 送信元ごとのルール発火履歴・インシデント履歴・ブロック状態を保持します。
//! `DashMap` のシャード単位ロックで、同一キーへの更新はアトミックに行われます。

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::clock::Clock;
use crate::config::ThreatConfig;

/// インシデント履歴の保持期間
const INCIDENT_WINDOW_SECS: i64 = 3600;

/// スイープ失敗時の待機時間
const SWEEP_BACKOFF: Duration = Duration::from_secs(1);

/// ブロック期間とエスカレーション段階
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerSettings {
    /// 初回ブロック期間（段階0）
    pub block_duration: Duration,
    /// 以降の段階。最後の段階を超えると恒久レビュー
    pub escalation_ladder: Vec<Duration>,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self::from(&ThreatConfig::default())
    }
}

impl From<&ThreatConfig> for TrackerSettings {
    fn from(config: &ThreatConfig) -> Self {
        Self {
            block_duration: Duration::from_secs(config.block_duration_seconds),
            escalation_ladder: config
                .escalation_ladder_seconds
                .iter()
                .map(|&s| Duration::from_secs(s))
                .collect(),
        }
    }
}

impl TrackerSettings {
    /// 段階 `level` のブロック期間
    fn tier(&self, level: usize) -> Option<Duration> {
        match level {
            0 => Some(self.block_duration),
            n => self.escalation_ladder.get(n - 1).copied(),
        }
    }
}

/// 送信元の状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThreatState {
    /// 記録なし
    Clean,
    /// 発火履歴またはインシデント履歴あり
    Watched,
    /// ブロック中
    Blocked,
}

/// エスカレーション付きブロックの結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// 期限付きブロック
    Timed {
        until: DateTime<Utc>,
        level: usize,
    },
    /// 管理者が解除するまでブロック
    PersistentReview,
}

/// ルール単位のスライディングウィンドウ
#[derive(Debug, Clone)]
pub struct RuleWindow {
    pub window: chrono::Duration,
    pub hits: VecDeque<DateTime<Utc>>,
}

impl RuleWindow {
    fn prune(&mut self, now: DateTime<Utc>) {
        while self.hits.front().is_some_and(|&t| now - t >= self.window) {
            self.hits.pop_front();
        }
    }
}

/// 送信元ごとの脅威記録
#[derive(Debug, Clone, Default)]
pub struct ThreatRecord {
    pub blocked_until: Option<DateTime<Utc>>,
    pub persistent_review: bool,
    pub escalation_level: usize,
    pub incidents: VecDeque<DateTime<Utc>>,
    pub rule_windows: HashMap<String, RuleWindow>,
}

impl ThreatRecord {
    fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        self.persistent_review || self.blocked_until.is_some_and(|until| until > now)
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let incident_window = chrono::Duration::seconds(INCIDENT_WINDOW_SECS);
        while self
            .incidents
            .front()
            .is_some_and(|&t| now - t >= incident_window)
        {
            self.incidents.pop_front();
        }

        for window in self.rule_windows.values_mut() {
            window.prune(now);
        }
        self.rule_windows.retain(|_, w| !w.hits.is_empty());
    }

    fn is_empty(&self) -> bool {
        self.blocked_until.is_none()
            && !self.persistent_review
            && self.incidents.is_empty()
            && self.rule_windows.is_empty()
    }
}

/// スイープ結果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// 削除した記録数
    pub removed: usize,
    /// 期限切れで解除したブロック数
    pub expired_blocks: usize,
    /// 残っている記録数
    pub remaining: usize,
}

/// 脅威状態トラッカー
pub struct ThreatTracker {
    records: DashMap<String, ThreatRecord>,
    settings: RwLock<TrackerSettings>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ThreatTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreatTracker")
            .field("records", &self.records.len())
            .field("settings", &self.settings())
            .finish()
    }
}

impl ThreatTracker {
    pub fn new(settings: TrackerSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            settings: RwLock::new(settings),
            clock,
        }
    }

    /// 注入された時刻ソースの現在時刻
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn settings(&self) -> TrackerSettings {
        match self.settings.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// ブロック期間の設定を差し替える（既存のブロックには影響しない）
    pub fn update_settings(&self, settings: TrackerSettings) {
        let mut guard = match self.settings.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = settings;
    }

    /// ルール発火を記録し、ウィンドウ内の発火回数を返す
    pub fn record_trigger(&self, rule_id: &str, identity: &str, window: Duration) -> usize {
        let now = self.clock.now();
        let window = to_chrono(window);

        let mut record = self.records.entry(identity.to_string()).or_default();
        let rule_window = record
            .rule_windows
            .entry(rule_id.to_string())
            .or_insert_with(|| RuleWindow {
                window,
                hits: VecDeque::new(),
            });
        rule_window.window = window;
        rule_window.prune(now);
        rule_window.hits.push_back(now);
        rule_window.hits.len()
    }

    pub fn is_blocked(&self, identity: &str) -> bool {
        let now = self.clock.now();
        self.records
            .get(identity)
            .is_some_and(|record| record.is_blocked(now))
    }

    /// 有効な期限付きブロックの期限。恒久レビュー中は `None`
    pub fn blocked_until(&self, identity: &str) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        self.records.get(identity).and_then(|record| {
            if record.persistent_review {
                None
            } else {
                record.blocked_until.filter(|&until| until > now)
            }
        })
    }

    /// 期間を指定してブロック。既存のより長いブロックは短縮しない
    pub fn block(&self, identity: &str, duration: Duration) -> DateTime<Utc> {
        let now = self.clock.now();
        let until = add_saturating(now, duration);

        let mut record = self.records.entry(identity.to_string()).or_default();
        let effective = match record.blocked_until {
            Some(existing) if existing > until => existing,
            _ => until,
        };
        record.blocked_until = Some(effective);

        info!("Blocked source {} until {}", identity, effective);
        effective
    }

    /// エスカレーション段階を1つ進めてブロック
    pub fn block_escalated(&self, identity: &str) -> BlockOutcome {
        let now = self.clock.now();
        let settings = self.settings();

        let mut record = self.records.entry(identity.to_string()).or_default();
        record.escalation_level += 1;
        let level = record.escalation_level;

        match settings.tier(level) {
            Some(duration) => {
                let until = add_saturating(now, duration);
                let effective = match record.blocked_until {
                    Some(existing) if existing > until => existing,
                    _ => until,
                };
                record.blocked_until = Some(effective);
                warn!(
                    "Escalated block for source {} to level {} until {}",
                    identity, level, effective
                );
                BlockOutcome::Timed {
                    until: effective,
                    level,
                }
            }
            None => {
                record.persistent_review = true;
                warn!(
                    "Source {} exceeded escalation ladder; blocked pending review",
                    identity
                );
                BlockOutcome::PersistentReview
            }
        }
    }

    /// 初回ブロック期間で `block`
    pub fn block_initial(&self, identity: &str) -> DateTime<Utc> {
        self.block(identity, self.settings().block_duration)
    }

    /// インシデントを記録し、直近1時間の件数を返す
    pub fn record_incident(&self, identity: &str) -> usize {
        let now = self.clock.now();
        let mut record = self.records.entry(identity.to_string()).or_default();
        record.prune(now);
        record.incidents.push_back(now);
        record.incidents.len()
    }

    pub fn incidents_in_last_hour(&self, identity: &str) -> usize {
        let now = self.clock.now();
        let window = chrono::Duration::seconds(INCIDENT_WINDOW_SECS);
        self.records
            .get(identity)
            .map(|record| {
                record
                    .incidents
                    .iter()
                    .filter(|&&t| now - t < window)
                    .count()
            })
            .unwrap_or(0)
    }

    /// ブロックと恒久レビューを解除
    pub fn unblock(&self, identity: &str) -> bool {
        match self.records.get_mut(identity) {
            Some(mut record) => {
                let was_blocked = record.is_blocked(self.clock.now());
                record.blocked_until = None;
                record.persistent_review = false;
                record.escalation_level = 0;
                info!("Unblocked source {}", identity);
                was_blocked
            }
            None => false,
        }
    }

    pub fn state(&self, identity: &str) -> ThreatState {
        let now = self.clock.now();
        let Some(record) = self.records.get(identity) else {
            return ThreatState::Clean;
        };

        if record.is_blocked(now) {
            return ThreatState::Blocked;
        }

        let mut live = record.clone();
        live.blocked_until = None;
        live.prune(now);
        if live.is_empty() {
            ThreatState::Clean
        } else {
            ThreatState::Watched
        }
    }

    /// 記録のスナップショット
    pub fn record(&self, identity: &str) -> Option<ThreatRecord> {
        self.records.get(identity).map(|r| r.clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// 期限切れのウィンドウ・ブロックを削除し、空になった記録を取り除く
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        self.records.retain(|_, record| {
            record.prune(now);
            if record.blocked_until.is_some_and(|until| until <= now) {
                record.blocked_until = None;
                report.expired_blocks += 1;
            }
            if record.is_empty() {
                report.removed += 1;
                false
            } else {
                true
            }
        });

        report.remaining = self.records.len();
        report
    }

    /// 定期スイープタスクを起動
    pub fn spawn_sweeper(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!("Threat tracker sweeper started (interval: {:?})", interval);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                match catch_unwind(AssertUnwindSafe(|| self.sweep())) {
                    Ok(report) => {
                        if report.removed > 0 || report.expired_blocks > 0 {
                            debug!(
                                "Sweep removed {} records, expired {} blocks, {} remaining",
                                report.removed, report.expired_blocks, report.remaining
                            );
                        }
                    }
                    Err(_) => {
                        error!("Threat tracker sweep panicked; retrying after backoff");
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(SWEEP_BACKOFF) => {}
                        }
                    }
                }
            }

            info!("Threat tracker sweeper stopped");
        })
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

fn add_saturating(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    now.checked_add_signed(to_chrono(duration))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::query::clock::ManualClock;

    fn tracker() -> (ThreatTracker, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let tracker = ThreatTracker::new(TrackerSettings::default(), clock.clone());
        (tracker, clock)
    }

    #[test]
    fn test_record_trigger_counts_within_window() {
        let (tracker, clock) = tracker();
        let window = Duration::from_secs(300);

        assert_eq!(tracker.record_trigger("union_select", "10.0.0.1", window), 1);
        assert_eq!(tracker.record_trigger("union_select", "10.0.0.1", window), 2);
        assert_eq!(tracker.record_trigger("boolean_blind", "10.0.0.1", window), 1);
        assert_eq!(tracker.record_trigger("union_select", "10.0.0.2", window), 1);

        clock.advance(chrono::Duration::seconds(301));
        assert_eq!(tracker.record_trigger("union_select", "10.0.0.1", window), 1);
    }

    #[test]
    fn test_block_is_monotonic() {
        let (tracker, _clock) = tracker();
        let long = tracker.block("10.0.0.1", Duration::from_secs(600));
        let short = tracker.block("10.0.0.1", Duration::from_secs(60));
        assert_eq!(long, short);
        assert!(tracker.is_blocked("10.0.0.1"));
        assert_eq!(tracker.state("10.0.0.1"), ThreatState::Blocked);
    }

    #[test]
    fn test_block_expires() {
        let (tracker, clock) = tracker();
        tracker.block("10.0.0.1", Duration::from_secs(60));
        clock.advance(chrono::Duration::seconds(61));
        assert!(!tracker.is_blocked("10.0.0.1"));
        assert_eq!(tracker.blocked_until("10.0.0.1"), None);
    }

    #[test]
    fn test_escalation_ladder_then_persistent_review() {
        let (tracker, clock) = tracker();

        let first = tracker.block_initial("10.0.0.1");
        let initial = first - clock.now();

        match tracker.block_escalated("10.0.0.1") {
            BlockOutcome::Timed { until, level } => {
                assert_eq!(level, 1);
                assert!(until - clock.now() > initial);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        assert_eq!(
            tracker.block_escalated("10.0.0.1"),
            BlockOutcome::PersistentReview
        );

        // 恒久レビューは時間経過で解除されない
        clock.advance(chrono::Duration::days(2));
        assert!(tracker.is_blocked("10.0.0.1"));

        assert!(tracker.unblock("10.0.0.1"));
        assert!(!tracker.is_blocked("10.0.0.1"));
    }

    #[test]
    fn test_incident_window() {
        let (tracker, clock) = tracker();
        assert_eq!(tracker.record_incident("10.0.0.1"), 1);
        assert_eq!(tracker.record_incident("10.0.0.1"), 2);
        assert_eq!(tracker.incidents_in_last_hour("10.0.0.1"), 2);

        clock.advance(chrono::Duration::minutes(61));
        assert_eq!(tracker.incidents_in_last_hour("10.0.0.1"), 0);
        assert_eq!(tracker.record_incident("10.0.0.1"), 1);
    }

    #[test]
    fn test_state_transitions() {
        let (tracker, clock) = tracker();
        assert_eq!(tracker.state("10.0.0.1"), ThreatState::Clean);

        tracker.record_trigger("comment_injection", "10.0.0.1", Duration::from_secs(300));
        assert_eq!(tracker.state("10.0.0.1"), ThreatState::Watched);

        clock.advance(chrono::Duration::minutes(6));
        assert_eq!(tracker.state("10.0.0.1"), ThreatState::Clean);
    }

    #[test]
    fn test_sweep_removes_expired_records() {
        let (tracker, clock) = tracker();
        tracker.record_trigger("union_select", "a", Duration::from_secs(300));
        tracker.block("b", Duration::from_secs(60));
        tracker.block("c", Duration::from_secs(3600));

        clock.advance(chrono::Duration::minutes(10));
        let report = tracker.sweep();

        assert_eq!(report.removed, 2);
        assert_eq!(report.expired_blocks, 1);
        assert_eq!(report.remaining, 1);
        assert!(tracker.record("a").is_none());
        assert!(tracker.is_blocked("c"));
    }

    #[test]
    fn test_concurrent_triggers_are_not_lost() {
        let (tracker, _clock) = tracker();
        let tracker = Arc::new(tracker);
        let window = Duration::from_secs(300);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        tracker.record_trigger("union_select", "10.0.0.1", window);
                        tracker.sweep();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(
            tracker.record_trigger("union_select", "10.0.0.1", window),
            801
        );
    }

    #[tokio::test]
    async fn test_sweeper_task_stops_on_cancel() {
        let (tracker, _clock) = tracker();
        let tracker = Arc::new(tracker);
        let token = CancellationToken::new();

        let handle = tracker
            .clone()
            .spawn_sweeper(Duration::from_millis(10), token.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();

        handle.await.unwrap();
    }
}
