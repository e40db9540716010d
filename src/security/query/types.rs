//! Query Security Types
//!
//! クエリ脅威検知エンジンの型定義

use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 深刻度
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// 低
    #[default]
    Low,
    /// 中
    Medium,
    /// 高
    High,
    /// 緊急
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// 緩和アクション（`Block > Alert > Log` の順で優先）
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum MitigationAction {
    /// ログのみ（リクエストは許可）
    #[default]
    Log,
    /// アラート送信（リクエストは許可）
    Alert,
    /// ブロック
    Block,
}

impl fmt::Display for MitigationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MitigationAction::Log => write!(f, "LOG"),
            MitigationAction::Alert => write!(f, "ALERT"),
            MitigationAction::Block => write!(f, "BLOCK"),
        }
    }
}

/// オペレーション種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

/// 解析済みクエリドキュメント
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryDocument {
    /// ルートオペレーション
    pub operations: Vec<Operation>,
    /// 引数・ディレクティブ・変数の既定値に含まれる文字列値（エスケープ解除済み）
    pub literals: Vec<String>,
}

/// オペレーション（query / mutation）
#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub kind: OperationKind,
    pub name: Option<String>,
    pub selection_set: SelectionSet,
}

/// 選択セット。順序は表示用のみで、スコアには影響しない
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SelectionSet {
    pub fields: Vec<Field>,
}

/// フィールド
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub name: String,
    pub alias: Option<String>,
    pub arguments: Vec<Argument>,
    /// フラグメントの型条件から判明した親型名
    pub parent_type: Option<String>,
    pub selection_set: Option<SelectionSet>,
}

impl Field {
    /// 引数なし・子なしのフィールドを作成
    pub fn leaf(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            alias: None,
            arguments: Vec::new(),
            parent_type: None,
            selection_set: None,
        }
    }

    /// 子フィールドを持つフィールドを作成
    pub fn object(name: impl Into<String>, children: Vec<Field>) -> Self {
        Self {
            selection_set: Some(SelectionSet { fields: children }),
            ..Self::leaf(name)
        }
    }

    /// 引数を追加
    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.arguments.push(Argument {
            name: name.into(),
            value: value.into(),
        });
        self
    }

    /// 親型名を設定
    pub fn with_parent_type(mut self, parent_type: impl Into<String>) -> Self {
        self.parent_type = Some(parent_type.into());
        self
    }
}

/// フィールド引数。値は GraphQL リテラル表記
#[derive(Debug, Clone, PartialEq)]
pub struct Argument {
    pub name: String,
    pub value: String,
}

impl QueryDocument {
    /// 単一 query オペレーションのドキュメントを作成
    pub fn single_query(fields: Vec<Field>) -> Self {
        Self {
            operations: vec![Operation {
                kind: OperationKind::Query,
                name: None,
                selection_set: SelectionSet { fields },
            }],
            literals: Vec::new(),
        }
    }
}

/// ドキュメント解析エラー
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    /// 構文エラー
    #[error("syntax error: {0}")]
    Syntax(String),

    /// 未定義のフラグメント参照
    #[error("unknown fragment: {0}")]
    UnknownFragment(String),

    /// フラグメントの循環参照
    #[error("fragment cycle detected through: {0}")]
    FragmentCycle(String),

    /// 入れ子が深すぎる
    #[error("document nesting exceeds {0} levels")]
    TooDeep(usize),

    /// フラグメント展開後のフィールド数が多すぎる
    #[error("document expands to more than {0} fields")]
    TooLarge(usize),
}

/// 解析中の内部失敗。常にフェイルクローズで扱う
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AnalysisFailure {
    /// 締め切り超過
    #[error("analysis deadline exceeded during {0}")]
    DeadlineExceeded(&'static str),

    /// 内部エラー
    #[error("internal analysis failure: {0}")]
    Internal(String),
}

/// 解析の締め切り
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    /// 締め切りなし
    pub fn none() -> Self {
        Self { at: None }
    }

    /// 現在から `budget` 後の締め切り
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(budget),
        }
    }

    /// 指定時刻の締め切り
    pub fn at(instant: Instant) -> Self {
        Self { at: Some(instant) }
    }

    pub fn is_expired(&self) -> bool {
        self.at.is_some_and(|at| Instant::now() >= at)
    }

    /// 期限切れなら `DeadlineExceeded` を返す
    pub fn check(&self, phase: &'static str) -> Result<(), AnalysisFailure> {
        if self.is_expired() {
            Err(AnalysisFailure::DeadlineExceeded(phase))
        } else {
            Ok(())
        }
    }

    /// 2つの締め切りのうち早い方
    pub fn earliest(self, other: Deadline) -> Deadline {
        match (self.at, other.at) {
            (Some(a), Some(b)) => Deadline::at(a.min(b)),
            (Some(a), None) => Deadline::at(a),
            (None, Some(b)) => Deadline::at(b),
            (None, None) => Deadline::none(),
        }
    }
}

impl Default for Deadline {
    fn default() -> Self {
        Self::none()
    }
}

/// リクエスト単位のコンテキスト。呼び出し側が明示的に渡す
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// 送信元識別子（通常はIPアドレス）
    pub source_identity: String,
    /// 認証済みユーザーID（インシデント記録用のみ）
    pub user_id: Option<String>,
    /// 呼び出し側の締め切り
    pub deadline: Deadline,
    /// 相関ID
    pub request_id: Uuid,
}

impl RequestContext {
    pub fn new(source_identity: impl Into<String>) -> Self {
        Self {
            source_identity: source_identity.into(),
            user_id: None,
            deadline: Deadline::none(),
            request_id: Uuid::new_v4(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = deadline;
        self
    }
}

/// 解析対象のリクエスト
#[derive(Debug, Clone)]
pub struct QueryRequest {
    /// 生のクエリ文字列（リテラル抽出とフィンガープリント用）
    pub raw_query: String,
    /// 解析済みドキュメント、または構文エラー
    pub document: Result<QueryDocument, ParseError>,
    /// 変数ペイロード
    pub variables: Option<serde_json::Value>,
}

/// シグネチャ一致の詳細
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureMatchIssue {
    pub rule_id: String,
    pub category: super::signature::SignatureCategory,
    pub severity: Severity,
    pub description: String,
    /// 一致箇所（`query`, `literal`, `variables.id` など）
    pub location: String,
}

/// 上限超過の詳細
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitExceededIssue<T> {
    pub actual: T,
    pub limit: T,
}

/// セキュリティ問題。種類ごとに専用のペイロードを持つ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SecurityIssue {
    SyntaxError { message: String },
    NoOperations,
    MultipleOperations { count: usize },
    ExcessiveDepth(LimitExceededIssue<usize>),
    ExcessiveComplexity(LimitExceededIssue<u64>),
    ExcessiveCost(LimitExceededIssue<f64>),
    Introspection { allowed: bool },
    SignatureMatch(SignatureMatchIssue),
    VariablesTooDeep { path: String, limit: usize },
    BlacklistedQuery { fingerprint: String },
    SourceBlocked { blocked_until: Option<DateTime<Utc>> },
    AnalysisError { message: String },
    AnalysisTimeout { phase: String },
}

impl SecurityIssue {
    /// 安定した種別名
    pub fn kind(&self) -> &'static str {
        match self {
            SecurityIssue::SyntaxError { .. } => "syntax_error",
            SecurityIssue::NoOperations => "no_operations",
            SecurityIssue::MultipleOperations { .. } => "multiple_operations",
            SecurityIssue::ExcessiveDepth(_) => "excessive_depth",
            SecurityIssue::ExcessiveComplexity(_) => "excessive_complexity",
            SecurityIssue::ExcessiveCost(_) => "excessive_cost",
            SecurityIssue::Introspection { .. } => "introspection",
            SecurityIssue::SignatureMatch(_) => "signature_match",
            SecurityIssue::VariablesTooDeep { .. } => "variables_too_deep",
            SecurityIssue::BlacklistedQuery { .. } => "blacklisted_query",
            SecurityIssue::SourceBlocked { .. } => "source_blocked",
            SecurityIssue::AnalysisError { .. } => "analysis_error",
            SecurityIssue::AnalysisTimeout { .. } => "analysis_timeout",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            SecurityIssue::SyntaxError { .. } => Severity::High,
            SecurityIssue::NoOperations => Severity::High,
            SecurityIssue::MultipleOperations { .. } => Severity::Medium,
            SecurityIssue::ExcessiveDepth(_)
            | SecurityIssue::ExcessiveComplexity(_)
            | SecurityIssue::ExcessiveCost(_) => Severity::High,
            SecurityIssue::Introspection { allowed: true } => Severity::Low,
            SecurityIssue::Introspection { allowed: false } => Severity::High,
            SecurityIssue::SignatureMatch(m) => m.severity,
            SecurityIssue::VariablesTooDeep { .. } => Severity::High,
            SecurityIssue::BlacklistedQuery { .. } => Severity::Critical,
            SecurityIssue::SourceBlocked { .. } => Severity::High,
            SecurityIssue::AnalysisError { .. } | SecurityIssue::AnalysisTimeout { .. } => {
                Severity::Critical
            }
        }
    }

    /// 脅威トラッカーに記録するルールID。記録対象外なら `None`
    pub fn rule_id(&self) -> Option<&str> {
        match self {
            SecurityIssue::SignatureMatch(m) => Some(&m.rule_id),
            SecurityIssue::SyntaxError { .. }
            | SecurityIssue::SourceBlocked { .. }
            | SecurityIssue::AnalysisError { .. }
            | SecurityIssue::AnalysisTimeout { .. } => None,
            SecurityIssue::Introspection { allowed: true } => None,
            other => Some(other.kind()),
        }
    }

    /// 人間向けの説明（サーバーログ用）
    pub fn describe(&self) -> String {
        match self {
            SecurityIssue::SyntaxError { message } => format!("syntax error: {}", message),
            SecurityIssue::NoOperations => "document contains no operations".to_string(),
            SecurityIssue::MultipleOperations { count } => {
                format!("document contains {} operations", count)
            }
            SecurityIssue::ExcessiveDepth(l) => {
                format!("query depth {} exceeds limit {}", l.actual, l.limit)
            }
            SecurityIssue::ExcessiveComplexity(l) => {
                format!("query complexity {} exceeds limit {}", l.actual, l.limit)
            }
            SecurityIssue::ExcessiveCost(l) => {
                format!("query cost {:.2} exceeds limit {:.2}", l.actual, l.limit)
            }
            SecurityIssue::Introspection { allowed } => {
                format!("introspection query (allowed: {})", allowed)
            }
            SecurityIssue::SignatureMatch(m) => format!(
                "{} [{}] at {}: {}",
                m.rule_id, m.severity, m.location, m.description
            ),
            SecurityIssue::VariablesTooDeep { path, limit } => {
                format!("variables nested deeper than {} at {}", limit, path)
            }
            SecurityIssue::BlacklistedQuery { fingerprint } => {
                format!("blacklisted query fingerprint {}", fingerprint)
            }
            SecurityIssue::SourceBlocked { blocked_until } => match blocked_until {
                Some(until) => format!("source blocked until {}", until),
                None => "source blocked pending review".to_string(),
            },
            SecurityIssue::AnalysisError { message } => format!("analysis error: {}", message),
            SecurityIssue::AnalysisTimeout { phase } => {
                format!("analysis timed out during {}", phase)
            }
        }
    }
}

/// 呼び出し側に返す判定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub action: MitigationAction,
    /// 拒否されたか
    pub rejected: bool,
    pub correlation_id: Uuid,
    /// 拒否時の汎用メッセージ。内部詳細は含めない
    pub message: Option<String>,
}

/// 拒否時に返す汎用メッセージ
pub const BLOCKED_MESSAGE: &str = "request blocked for security reasons";

impl Decision {
    pub fn allow(action: MitigationAction, correlation_id: Uuid) -> Self {
        Self {
            action,
            rejected: false,
            correlation_id,
            message: None,
        }
    }

    pub fn reject(correlation_id: Uuid) -> Self {
        Self {
            action: MitigationAction::Block,
            rejected: true,
            correlation_id,
            message: Some(BLOCKED_MESSAGE.to_string()),
        }
    }
}

/// 解析結果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub is_valid: bool,
    pub complexity_score: u64,
    pub depth_score: usize,
    pub cost_estimate: f64,
    pub issues: Vec<SecurityIssue>,
    pub performance_warnings: Vec<String>,
    pub fingerprint: String,
    pub elapsed_millis: f64,
    pub decision: Decision,
}

impl AnalysisResult {
    /// 指定種別の問題が含まれるか
    pub fn has_issue(&self, kind: &str) -> bool {
        self.issues.iter().any(|i| i.kind() == kind)
    }

    /// 指定ルールIDのシグネチャ一致が含まれるか
    pub fn matched_rule(&self, rule_id: &str) -> bool {
        self.issues.iter().any(|i| match i {
            SecurityIssue::SignatureMatch(m) => m.rule_id == rule_id,
            _ => false,
        })
    }

    /// 最高深刻度
    pub fn max_severity(&self) -> Option<Severity> {
        self.issues.iter().map(SecurityIssue::severity).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_precedence() {
        assert!(MitigationAction::Block > MitigationAction::Alert);
        assert!(MitigationAction::Alert > MitigationAction::Log);
        let actions = [
            MitigationAction::Log,
            MitigationAction::Block,
            MitigationAction::Alert,
        ];
        assert_eq!(actions.iter().max(), Some(&MitigationAction::Block));
    }

    #[test]
    fn test_issue_kinds_and_rule_ids() {
        let issue = SecurityIssue::ExcessiveDepth(LimitExceededIssue {
            actual: 11,
            limit: 10,
        });
        assert_eq!(issue.kind(), "excessive_depth");
        assert_eq!(issue.rule_id(), Some("excessive_depth"));
        assert_eq!(issue.severity(), Severity::High);

        let syntax = SecurityIssue::SyntaxError {
            message: "unexpected }".to_string(),
        };
        assert_eq!(syntax.rule_id(), None);

        let allowed = SecurityIssue::Introspection { allowed: true };
        assert_eq!(allowed.rule_id(), None);
        assert_eq!(allowed.severity(), Severity::Low);
    }

    #[test]
    fn test_issue_serialization_is_tagged() {
        let issue = SecurityIssue::VariablesTooDeep {
            path: "variables.a".to_string(),
            limit: 10,
        };
        let json = serde_json::to_value(&issue).unwrap();
        assert_eq!(json["kind"], "variables_too_deep");
        assert_eq!(json["limit"], 10);
    }

    #[test]
    fn test_deadline() {
        assert!(!Deadline::none().is_expired());
        let past = Deadline::at(Instant::now() - Duration::from_millis(1));
        assert!(past.is_expired());
        assert!(past.check("structural").is_err());
        let merged = Deadline::none().earliest(past);
        assert!(merged.is_expired());
    }
}
