//! HTTP Check Service
//!
//! `POST /v1/check` でクエリを検査し、判定だけを返します。拒否時は内部詳細を含めず、
//! 汎用メッセージと相関IDのみを返します。

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::security::query::{MitigationAction, QuerySecurityAnalyzer, RequestContext};

/// 送信元が指定されない場合の識別子
const UNKNOWN_SOURCE: &str = "unknown";

/// 検査リクエスト
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    pub query: String,
    #[serde(default)]
    pub variables: Option<Value>,
    #[serde(default)]
    pub source_identity: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// 検査レスポンス
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResponse {
    pub allowed: bool,
    pub action: MitigationAction,
    pub correlation_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// ルーターを作成
pub fn router(analyzer: Arc<QuerySecurityAnalyzer>) -> Router {
    Router::new()
        .route("/v1/check", post(handle_check))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(analyzer)
}

/// `shutdown` がキャンセルされるまで待ち受ける
pub async fn serve(
    listener: TcpListener,
    analyzer: Arc<QuerySecurityAnalyzer>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    info!("Query check service listening on {}", listener.local_addr()?);

    axum::serve(listener, router(analyzer))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("Query check service stopped");
    Ok(())
}

async fn handle_check(
    State(analyzer): State<Arc<QuerySecurityAnalyzer>>,
    headers: HeaderMap,
    Json(request): Json<CheckRequest>,
) -> (StatusCode, Json<CheckResponse>) {
    let source = request
        .source_identity
        .clone()
        .or_else(|| forwarded_for(&headers))
        .unwrap_or_else(|| UNKNOWN_SOURCE.to_string());

    let mut ctx = RequestContext::new(source);
    if let Some(user_id) = &request.user_id {
        ctx = ctx.with_user(user_id.clone());
    }

    let result = analyzer.analyze_text(&request.query, request.variables, &ctx);
    let decision = result.decision;

    let status = if decision.rejected {
        StatusCode::FORBIDDEN
    } else {
        StatusCode::OK
    };

    (
        status,
        Json(CheckResponse {
            allowed: !decision.rejected,
            action: decision.action,
            correlation_id: decision.correlation_id,
            message: decision.message,
        }),
    )
}

async fn handle_health(State(analyzer): State<Arc<QuerySecurityAnalyzer>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "tracked_sources": analyzer.tracker().len(),
    }))
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
