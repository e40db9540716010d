//! Pattern Matcher
//!
//! シグネチャ集合を、構文木から集めた文字列値と変数ペイロードに適用します。
//! 変数は再帰的に走査し、オブジェクトのキーも検査対象です（NoSQL演算子対策）。
//! パーセント・16進エスケープのデコードは行いません。

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use super::signature::{Signature, SignatureSet};
use super::types::{AnalysisFailure, Deadline};

/// 変数走査で締め切りを確認する間隔（ノード数）
const DEADLINE_CHECK_INTERVAL: usize = 256;

/// 変数ペイロードの走査結果
#[derive(Debug, Default)]
pub struct VariableScan<'a> {
    /// 一致したシグネチャと一致箇所のパス
    pub matches: Vec<(&'a Signature, String)>,
    /// ネスト上限を超えた最初のパス
    pub too_deep: Option<String>,
}

/// パターンマッチャー
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    signatures: Arc<SignatureSet>,
    max_variable_depth: usize,
}

impl PatternMatcher {
    pub fn new(signatures: Arc<SignatureSet>, max_variable_depth: usize) -> Self {
        Self {
            signatures,
            max_variable_depth,
        }
    }

    pub fn signatures(&self) -> &SignatureSet {
        &self.signatures
    }

    /// テキストに一致する全シグネチャ
    pub fn scan_text(&self, text: &str) -> Vec<&Signature> {
        self.signatures.iter().filter(|s| s.is_match(text)).collect()
    }

    /// 各文字列値を個別に検査する。位置は `literal[i]`
    pub fn scan_literals(&self, literals: &[String]) -> Vec<(&Signature, String)> {
        let mut matches = Vec::new();
        let mut seen = HashSet::new();

        for (i, literal) in literals.iter().enumerate() {
            let location = format!("literal[{}]", i);
            for signature in self.scan_text(literal) {
                if seen.insert((signature.id.as_str(), location.clone())) {
                    matches.push((signature, location.clone()));
                }
            }
        }

        matches
    }

    /// 変数ペイロードを再帰的に検査
    pub fn scan_variables(&self, value: &Value, path: &str) -> VariableScan<'_> {
        // 締め切りなしでは失敗しない
        self.scan_variables_until(value, path, &Deadline::none())
            .unwrap_or_default()
    }

    /// 締め切り付きで変数ペイロードを検査
    pub fn scan_variables_until(
        &self,
        value: &Value,
        path: &str,
        deadline: &Deadline,
    ) -> std::result::Result<VariableScan<'_>, AnalysisFailure> {
        let mut scan = VariableScan::default();
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut visited = 0usize;

        // (値, パス, コンテナのネスト段数)
        let mut stack: Vec<(&Value, String, usize)> = vec![(value, path.to_string(), 0)];

        while let Some((value, path, level)) = stack.pop() {
            visited += 1;
            if visited % DEADLINE_CHECK_INTERVAL == 0 {
                deadline.check("variable scanning")?;
            }

            match value {
                Value::Object(map) => {
                    if level + 1 > self.max_variable_depth {
                        scan.too_deep.get_or_insert(path);
                        continue;
                    }
                    for (key, child) in map.iter().rev() {
                        let child_path = format!("{}.{}", path, key);
                        self.record(key, &child_path, &mut scan, &mut seen);
                        stack.push((child, child_path, level + 1));
                    }
                }
                Value::Array(items) => {
                    if level + 1 > self.max_variable_depth {
                        scan.too_deep.get_or_insert(path);
                        continue;
                    }
                    for (i, child) in items.iter().enumerate().rev() {
                        stack.push((child, format!("{}[{}]", path, i), level + 1));
                    }
                }
                Value::String(text) => self.record(text, &path, &mut scan, &mut seen),
                Value::Null | Value::Bool(_) | Value::Number(_) => {}
            }
        }

        Ok(scan)
    }

    fn record<'a>(
        &'a self,
        text: &str,
        path: &str,
        scan: &mut VariableScan<'a>,
        seen: &mut HashSet<(String, String)>,
    ) {
        for signature in self.scan_text(text) {
            if seen.insert((signature.id.clone(), path.to_string())) {
                scan.matches.push((signature, path.to_string()));
            }
        }
    }
}
