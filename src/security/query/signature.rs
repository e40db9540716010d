//! Signature Store
//!
//! 既知のインジェクション攻撃パターン（SQL / NoSQL / コマンド / 構造）を
//! カテゴリ別に保持します。ロード後は不変です。

use std::collections::HashMap;
use std::fmt;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::types::Severity;
use crate::config::RuleConfig;
use crate::error::{Error, Result};

/// シグネチャカテゴリ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SignatureCategory {
    /// SQLインジェクション
    #[default]
    Sql,
    /// NoSQLインジェクション
    NoSql,
    /// コマンドインジェクション
    Command,
    /// 構造的な攻撃（イントロスペクション探索など）
    Structural,
}

impl fmt::Display for SignatureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureCategory::Sql => write!(f, "sql"),
            SignatureCategory::NoSql => write!(f, "nosql"),
            SignatureCategory::Command => write!(f, "command"),
            SignatureCategory::Structural => write!(f, "structural"),
        }
    }
}

/// 攻撃シグネチャ
#[derive(Debug, Clone)]
pub struct Signature {
    /// シグネチャID（ルールIDを兼ねる）
    pub id: String,
    pub category: SignatureCategory,
    /// コンパイル済み正規表現（大文字小文字を区別しない）
    pub pattern: Regex,
    pub severity: Severity,
    pub description: String,
}

impl Signature {
    /// パターンをコンパイルしてシグネチャを作成
    pub fn new(
        id: &str,
        category: SignatureCategory,
        pattern: &str,
        severity: Severity,
        description: &str,
    ) -> Result<Self> {
        let compiled = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .multi_line(true)
            .build()
            .map_err(|e| Error::InvalidPattern {
                id: id.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            id: id.to_string(),
            category,
            pattern: compiled,
            severity,
            description: description.to_string(),
        })
    }

    pub fn is_match(&self, text: &str) -> bool {
        self.pattern.is_match(text)
    }
}

/// ロード済みシグネチャ集合
#[derive(Debug, Clone)]
pub struct SignatureSet {
    signatures: Vec<Signature>,
    /// カテゴリ別インデックス
    index: HashMap<SignatureCategory, Vec<usize>>,
}

impl SignatureSet {
    /// 組み込みシグネチャと、`pattern` を持つカスタムルールをロード
    ///
    /// 1つでもコンパイルに失敗した場合はエラーを返す（部分ロードはしない）。
    pub fn load(custom_rules: &HashMap<String, RuleConfig>) -> Result<Self> {
        let mut signatures = Self::builtin()?;

        let mut custom_ids: Vec<&String> = custom_rules
            .iter()
            .filter(|(_, rule)| rule.pattern.is_some())
            .map(|(id, _)| id)
            .collect();
        custom_ids.sort();

        for id in custom_ids {
            let rule = &custom_rules[id];
            let Some(pattern) = rule.pattern.as_deref() else {
                continue;
            };
            let signature = Signature::new(
                id,
                rule.category.unwrap_or_default(),
                pattern,
                rule.severity.unwrap_or(Severity::Medium),
                rule.description.as_deref().unwrap_or("custom rule"),
            )?;

            // 同じIDの組み込みシグネチャは置き換える
            signatures.retain(|s| s.id != signature.id);
            signatures.push(signature);
        }

        let index = Self::build_index(&signatures);
        debug!("Loaded {} query signatures", signatures.len());

        Ok(Self { signatures, index })
    }

    /// 組み込みシグネチャのみをロード
    pub fn load_builtin() -> Result<Self> {
        Self::load(&HashMap::new())
    }

    fn builtin() -> Result<Vec<Signature>> {
        use SignatureCategory::*;

        Ok(vec![
            // SQL Injection
            Signature::new(
                "union_select",
                Sql,
                r"\bunion\s+(all\s+)?select\b",
                Severity::High,
                "Union-based SQL injection attempt",
            )?,
            Signature::new(
                "stacked_queries",
                Sql,
                r";\s*(select|insert|update|delete|drop|create|alter|truncate|exec)\b",
                Severity::Critical,
                "Stacked query injection attempt",
            )?,
            Signature::new(
                "boolean_blind",
                Sql,
                r#"('|")\s*(or|and)\s*('|"|\d)|\b(or|and)\s+\d+\s*=\s*\d+|\b(or|and)\s+'[^']*'\s*=\s*'"#,
                Severity::High,
                "Boolean-based blind SQL injection",
            )?,
            Signature::new(
                "time_blind",
                Sql,
                r"\b(sleep|benchmark|pg_sleep)\s*\(|\bwaitfor\s+delay\b",
                Severity::High,
                "Time-based blind SQL injection",
            )?,
            Signature::new(
                "comment_injection",
                Sql,
                r"--\s*$|\s#\s*$|/\*.*?\*/",
                Severity::Medium,
                "SQL comment sequence used to truncate a statement",
            )?,
            Signature::new(
                "schema_discovery",
                Sql,
                r"\b(information_schema|pg_catalog|sqlite_master|sysobjects|mysql\.user)\b|@@version",
                Severity::High,
                "Database schema discovery attempt",
            )?,
            Signature::new(
                "function_injection",
                Sql,
                r"\b(char|concat|ascii|substring|extractvalue|updatexml)\s*\(\s*[^)]*\)",
                Severity::Medium,
                "SQL function call used for obfuscation or extraction",
            )?,
            Signature::new(
                "file_access",
                Sql,
                r"\bload_file\s*\(|\binto\s+(out|dump)file\b|\b(xp_cmdshell|xp_regread|sp_executesql|sp_oacreate|sp_makewebtask)\b",
                Severity::Critical,
                "SQL file access or stored procedure execution",
            )?,
            // NoSQL Injection
            Signature::new(
                "nosql_operator",
                NoSql,
                r#"["']?\$(where|ne|gt|gte|lt|lte|regex|in|nin|or|and|not|exists|expr)["']?\s*(:|$)"#,
                Severity::High,
                "NoSQL query operator in user-controlled data",
            )?,
            Signature::new(
                "nosql_js_injection",
                NoSql,
                r"\bthis\.\w+\s*(==|!=|>|<)|\bfunction\s*\(\s*\)\s*\{|\bdb\.\w+\.(find|drop|remove)\s*\(",
                Severity::Critical,
                "Server-side JavaScript injection in NoSQL payload",
            )?,
            // Command Injection
            Signature::new(
                "shell_metacharacters",
                Command,
                r"(;|&&|\|\|?)\s*(ls|cat|rm|id|whoami|uname|ping|sh|bash)\b|`[^`]+`|\$\([^)]+\)",
                Severity::Critical,
                "Shell metacharacters chaining a command",
            )?,
            Signature::new(
                "command_binaries",
                Command,
                r"/(bin|usr/bin)/(sh|bash|zsh|nc|python\d?|perl)\b|\b(wget|curl|netcat|nc)\s+(-\w+\s+)*(https?://|\d{1,3}\.)",
                Severity::High,
                "Reference to a shell or network binary",
            )?,
            // Structural
            Signature::new(
                "introspection_lookup",
                Structural,
                r"\b__(schema|type)\b",
                Severity::Medium,
                "Schema introspection lookup",
            )?,
        ])
    }

    fn build_index(signatures: &[Signature]) -> HashMap<SignatureCategory, Vec<usize>> {
        let mut index: HashMap<SignatureCategory, Vec<usize>> = HashMap::new();

        for (i, signature) in signatures.iter().enumerate() {
            index.entry(signature.category).or_default().push(i);
        }

        index
    }

    /// カテゴリ別シグネチャ
    pub fn by_category(&self, category: SignatureCategory) -> Vec<&Signature> {
        self.index
            .get(&category)
            .map(|ids| ids.iter().map(|&i| &self.signatures[i]).collect())
            .unwrap_or_default()
    }

    pub fn get(&self, id: &str) -> Option<&Signature> {
        self.signatures.iter().find(|s| s.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Signature> {
        self.signatures.iter()
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}
