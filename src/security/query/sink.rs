//! Incident / Alert Sink
//!
//! インシデントとアラートの追記専用出力先です。`analyze` を止めないよう、
//! `ChannelSink` は有界チャネルに `try_send` し、バックグラウンドタスクが
//! バックエンドへ書き出します。書き込み失敗は呼び出し側に返さずログに残します。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::types::Severity;
use crate::error::Result;

/// インシデントに対して実行した対応
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    /// 記録のみ
    Logged,
    /// アラート送信
    AlertSent,
    /// リクエスト拒否
    RequestBlocked,
    /// 送信元を期限付きでブロック
    SourceBlocked,
    /// エスカレーションしたブロック
    EscalatedBlock,
    /// 恒久レビュー
    PersistentReview,
    /// インシデント件数による自動ブロック
    AutoBlock,
}

/// セキュリティインシデント（不変）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityIncident {
    pub incident_id: Uuid,
    /// リクエストの相関ID
    pub correlation_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source_identity: String,
    pub user_id: Option<String>,
    pub severity: Severity,
    /// 発火したルールID
    pub attack_vector: Vec<String>,
    /// 切り詰めたペイロード
    pub payload_excerpt: String,
    pub blocked: bool,
    pub response_actions: Vec<ResponseAction>,
}

/// アラート記録
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub alert_id: Uuid,
    pub incident_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub level: Severity,
    pub source_identity: String,
    pub title: String,
    pub description: String,
}

/// インシデント出力先
///
/// 呼び出し側には失敗を返さない。実装は自身の失敗をログに残すこと。
pub trait IncidentSink: Send + Sync {
    fn record_incident(&self, incident: SecurityIncident);
    fn record_alert(&self, alert: AlertRecord);
}

/// `ChannelSink` の書き出し先
#[async_trait]
pub trait SinkBackend: Send + Sync + 'static {
    async fn write_incident(&self, incident: &SecurityIncident) -> Result<()>;
    async fn write_alert(&self, alert: &AlertRecord) -> Result<()>;
}

#[derive(Debug)]
enum SinkRecord {
    Incident(SecurityIncident),
    Alert(AlertRecord),
}

/// 有界チャネル経由の非ブロッキング出力先
#[derive(Debug)]
pub struct ChannelSink {
    sender: mpsc::Sender<SinkRecord>,
    dropped: AtomicU64,
}

impl ChannelSink {
    /// 出力先とドレインタスクを起動
    ///
    /// `shutdown` がキャンセルされると、残りのレコードを書き出してから終了する。
    pub fn spawn<B: SinkBackend>(
        backend: B,
        capacity: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel(capacity.max(1));

        let handle = tokio::spawn(async move {
            loop {
                let record = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    record = receiver.recv() => match record {
                        Some(record) => record,
                        None => break,
                    },
                };
                write_record(&backend, record).await;
            }

            // 残りを書き出す
            receiver.close();
            while let Some(record) = receiver.recv().await {
                write_record(&backend, record).await;
            }
            debug!("Incident sink drained");
        });

        (
            Self {
                sender,
                dropped: AtomicU64::new(0),
            },
            handle,
        )
    }

    /// チャネル満杯で破棄したレコード数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn send(&self, record: SinkRecord) {
        match self.sender.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Incident sink channel full; dropping {}", record_label(&record));
            }
            Err(TrySendError::Closed(record)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                error!("Incident sink closed; dropping {}", record_label(&record));
            }
        }
    }
}

impl IncidentSink for ChannelSink {
    fn record_incident(&self, incident: SecurityIncident) {
        self.send(SinkRecord::Incident(incident));
    }

    fn record_alert(&self, alert: AlertRecord) {
        self.send(SinkRecord::Alert(alert));
    }
}

fn record_label(record: &SinkRecord) -> String {
    match record {
        SinkRecord::Incident(i) => format!("incident {}", i.incident_id),
        SinkRecord::Alert(a) => format!("alert {}", a.alert_id),
    }
}

async fn write_record<B: SinkBackend>(backend: &B, record: SinkRecord) {
    let result = match &record {
        SinkRecord::Incident(incident) => backend.write_incident(incident).await,
        SinkRecord::Alert(alert) => backend.write_alert(alert).await,
    };
    if let Err(e) = result {
        error!("Failed to write {}: {}", record_label(&record), e);
    }
}

/// tracing イベントとして出力
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingBackend;

#[async_trait]
impl SinkBackend for TracingBackend {
    async fn write_incident(&self, incident: &SecurityIncident) -> Result<()> {
        let payload = serde_json::to_string(incident)?;
        warn!(
            target: "query_guard::incident",
            incident_id = %incident.incident_id,
            source = %incident.source_identity,
            severity = %incident.severity,
            blocked = incident.blocked,
            "{}",
            payload
        );
        Ok(())
    }

    async fn write_alert(&self, alert: &AlertRecord) -> Result<()> {
        let payload = serde_json::to_string(alert)?;
        info!(
            target: "query_guard::alert",
            alert_id = %alert.alert_id,
            level = %alert.level,
            "{}",
            payload
        );
        Ok(())
    }
}

/// メモリ上に保持するバックエンド
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    incidents: Arc<tokio::sync::RwLock<Vec<SecurityIncident>>>,
    alerts: Arc<tokio::sync::RwLock<Vec<AlertRecord>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn incidents(&self) -> Vec<SecurityIncident> {
        self.incidents.read().await.clone()
    }

    pub async fn alerts(&self) -> Vec<AlertRecord> {
        self.alerts.read().await.clone()
    }
}

#[async_trait]
impl SinkBackend for MemoryBackend {
    async fn write_incident(&self, incident: &SecurityIncident) -> Result<()> {
        self.incidents.write().await.push(incident.clone());
        Ok(())
    }

    async fn write_alert(&self, alert: &AlertRecord) -> Result<()> {
        self.alerts.write().await.push(alert.clone());
        Ok(())
    }
}

/// 同期的にメモリへ記録する出力先（組み込み・テスト用）
#[derive(Debug, Default)]
pub struct MemorySink {
    incidents: Mutex<Vec<SecurityIncident>>,
    alerts: Mutex<Vec<AlertRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incidents(&self) -> Vec<SecurityIncident> {
        match self.incidents.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn alerts(&self) -> Vec<AlertRecord> {
        match self.alerts.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl IncidentSink for MemorySink {
    fn record_incident(&self, incident: SecurityIncident) {
        match self.incidents.lock() {
            Ok(mut guard) => guard.push(incident),
            Err(poisoned) => poisoned.into_inner().push(incident),
        }
    }

    fn record_alert(&self, alert: AlertRecord) {
        match self.alerts.lock() {
            Ok(mut guard) => guard.push(alert),
            Err(poisoned) => poisoned.into_inner().push(alert),
        }
    }
}

/// ペイロードを最大 `max_chars` 文字に切り詰める
pub fn excerpt(payload: &str, max_chars: usize) -> String {
    match payload.char_indices().nth(max_chars) {
        Some((end, _)) => format!("{}...", &payload[..end]),
        None => payload.to_string(),
    }
}
