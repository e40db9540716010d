//! Structural Analyzer
//!
//! クエリドキュメントを一度だけ深さ優先で走査し、深さ・複雑度・推定コストと
//! イントロスペクションの有無を計算します。副作用はありません。

use serde::{Deserialize, Serialize};

use super::types::{AnalysisFailure, Deadline, Field, QueryDocument, SelectionSet};
use crate::config::ComplexityWeights;

/// 予約済みの二重アンダースコア接頭辞
const RESERVED_PREFIX: &str = "__";

/// 型名メタフィールド。スキーマ探索ではないので除外する
const TYPENAME_FIELD: &str = "__typename";

/// 締め切りを確認する間隔（フィールド数）
const DEADLINE_CHECK_INTERVAL: usize = 64;

/// 構造解析結果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralReport {
    /// 最大ネスト深さ（選択セット単位）
    pub depth: usize,
    /// 重み付き複雑度
    pub complexity: u64,
    /// 推定実行コスト
    pub cost: f64,
    pub is_introspective: bool,
    pub operation_count: usize,
    pub field_count: usize,
}

/// 構造解析器
#[derive(Debug, Clone)]
pub struct StructuralAnalyzer {
    weights: ComplexityWeights,
}

impl StructuralAnalyzer {
    pub fn new(weights: ComplexityWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> &ComplexityWeights {
        &self.weights
    }

    /// ドキュメントを解析
    pub fn analyze(
        &self,
        document: &QueryDocument,
        deadline: &Deadline,
    ) -> Result<StructuralReport, AnalysisFailure> {
        let mut report = StructuralReport {
            depth: 0,
            complexity: 0,
            cost: 0.0,
            is_introspective: false,
            operation_count: document.operations.len(),
            field_count: 0,
        };

        // 明示的なスタックで走査し、再帰の深さに依存しない
        let mut stack: Vec<(&Field, usize)> = Vec::new();

        for operation in &document.operations {
            self.enter_selection_set(&operation.selection_set, 1, &mut report, &mut stack);

            while let Some((field, depth)) = stack.pop() {
                report.field_count += 1;
                if report.field_count % DEADLINE_CHECK_INTERVAL == 0 {
                    deadline.check("structural analysis")?;
                }

                self.visit_field(field, depth, &mut report);

                if let Some(children) = &field.selection_set {
                    self.enter_selection_set(children, depth + 1, &mut report, &mut stack);
                }
            }
        }

        Ok(report)
    }

    fn enter_selection_set<'a>(
        &self,
        selection_set: &'a SelectionSet,
        depth: usize,
        report: &mut StructuralReport,
        stack: &mut Vec<(&'a Field, usize)>,
    ) {
        report.depth = report.depth.max(depth);
        stack.extend(selection_set.fields.iter().rev().map(|f| (f, depth)));
    }

    fn visit_field(&self, field: &Field, depth: usize, report: &mut StructuralReport) {
        let argument_count = field.arguments.len() as u64;
        let w = &self.weights;

        let mut complexity = w.scalar_weight;
        if argument_count > 0 {
            complexity = complexity.saturating_add(w.object_weight.saturating_mul(argument_count));
        }
        if field.selection_set.is_some() {
            if is_connection_field(&field.name) {
                complexity = complexity.saturating_add(w.connection_weight);
            } else if is_list_field(&field.name) {
                complexity = complexity.saturating_add(w.list_weight);
            }
        }
        report.complexity = report.complexity.saturating_add(complexity);

        report.cost += w.base_cost
            * w.depth_multiplier.powi(depth as i32)
            * w.argument_multiplier.powi(argument_count as i32);

        if is_introspection_field(field) {
            report.is_introspective = true;
        }
    }
}

fn is_introspection_field(field: &Field) -> bool {
    (field.name.starts_with(RESERVED_PREFIX) && field.name != TYPENAME_FIELD)
        || field
            .parent_type
            .as_deref()
            .is_some_and(|t| t.starts_with(RESERVED_PREFIX))
}

fn is_connection_field(name: &str) -> bool {
    name == "edges" || name == "nodes" || name.ends_with("Connection")
}

fn is_list_field(name: &str) -> bool {
    name.ends_with("List") || (name.len() > 1 && name.ends_with('s') && !name.ends_with("ss"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn weights() -> ComplexityWeights {
        ComplexityWeights::default()
    }

    /// `levels` 段の選択セットを持つドキュメント
    fn nested_document(levels: usize) -> QueryDocument {
        if levels == 0 {
            return QueryDocument::default();
        }
        let mut field = Field::leaf("leaf");
        for i in 1..levels {
            field = Field::object(format!("level{}", i), vec![field]);
        }
        QueryDocument::single_query(vec![field])
    }

    #[test]
    fn test_depth_equals_nesting_levels() {
        let analyzer = StructuralAnalyzer::new(weights());
        for levels in [0, 1, 10, 11] {
            let report = analyzer
                .analyze(&nested_document(levels), &Deadline::none())
                .unwrap();
            assert_eq!(report.depth, levels, "levels = {}", levels);
        }
    }

    #[test]
    fn test_complexity_counts_fields_and_arguments() {
        let analyzer = StructuralAnalyzer::new(weights());
        let document = QueryDocument::single_query(vec![Field::object(
            "user",
            vec![Field::leaf("id"), Field::leaf("name")],
        )
        .with_argument("id", "1")
        .with_argument("locale", "\"ja\"")]);

        let report = analyzer.analyze(&document, &Deadline::none()).unwrap();
        // user: 1 + 2*2, id: 1, name: 1
        assert_eq!(report.complexity, 7);
        assert_eq!(report.field_count, 3);
    }

    #[test]
    fn test_list_and_connection_weights() {
        let analyzer = StructuralAnalyzer::new(weights());
        let document = QueryDocument::single_query(vec![Field::object(
            "usersConnection",
            vec![Field::object("edges", vec![Field::leaf("cursor")])],
        )]);

        let report = analyzer.analyze(&document, &Deadline::none()).unwrap();
        // usersConnection: 1 + 5, edges: 1 + 5, cursor: 1
        assert_eq!(report.complexity, 13);

        let document =
            QueryDocument::single_query(vec![Field::object("posts", vec![Field::leaf("id")])]);
        let report = analyzer.analyze(&document, &Deadline::none()).unwrap();
        assert_eq!(report.complexity, 12);
    }

    #[test]
    fn test_cost_is_exponential_in_depth_and_arguments() {
        let analyzer = StructuralAnalyzer::new(weights());
        let shallow = QueryDocument::single_query(vec![Field::leaf("a")]);
        let report = analyzer.analyze(&shallow, &Deadline::none()).unwrap();
        assert!((report.cost - 1.5).abs() < 1e-9);

        let with_args =
            QueryDocument::single_query(vec![Field::leaf("a").with_argument("first", "10")]);
        let report = analyzer.analyze(&with_args, &Deadline::none()).unwrap();
        assert!((report.cost - 1.5 * 1.2).abs() < 1e-9);

        let deep = analyzer
            .analyze(&nested_document(8), &Deadline::none())
            .unwrap();
        let shallow_total = analyzer
            .analyze(&nested_document(2), &Deadline::none())
            .unwrap();
        assert!(deep.cost > shallow_total.cost * 10.0);
    }

    #[test]
    fn test_sibling_order_does_not_change_scores() {
        let analyzer = StructuralAnalyzer::new(weights());
        let a = QueryDocument::single_query(vec![
            Field::object("posts", vec![Field::leaf("id")]),
            Field::leaf("me").with_argument("x", "1"),
        ]);
        let b = QueryDocument::single_query(vec![
            Field::leaf("me").with_argument("x", "1"),
            Field::object("posts", vec![Field::leaf("id")]),
        ]);

        let ra = analyzer.analyze(&a, &Deadline::none()).unwrap();
        let rb = analyzer.analyze(&b, &Deadline::none()).unwrap();
        assert_eq!(ra.depth, rb.depth);
        assert_eq!(ra.complexity, rb.complexity);
        assert!((ra.cost - rb.cost).abs() < 1e-9);
    }

    #[test]
    fn test_introspection_detection() {
        let analyzer = StructuralAnalyzer::new(weights());

        let schema = QueryDocument::single_query(vec![Field::object(
            "__schema",
            vec![Field::object("types", vec![Field::leaf("name")])],
        )]);
        assert!(
            analyzer
                .analyze(&schema, &Deadline::none())
                .unwrap()
                .is_introspective
        );

        let parent = QueryDocument::single_query(vec![Field::leaf("fields").with_parent_type("__Type")]);
        assert!(
            analyzer
                .analyze(&parent, &Deadline::none())
                .unwrap()
                .is_introspective
        );

        let typename = QueryDocument::single_query(vec![Field::object(
            "user",
            vec![Field::leaf("__typename"), Field::leaf("id")],
        )]);
        assert!(
            !analyzer
                .analyze(&typename, &Deadline::none())
                .unwrap()
                .is_introspective
        );
    }

    #[test]
    fn test_expired_deadline_fails() {
        let analyzer = StructuralAnalyzer::new(weights());
        let fields: Vec<Field> = (0..200).map(|i| Field::leaf(format!("f{}", i))).collect();
        let document = QueryDocument::single_query(fields);
        let expired = Deadline::at(std::time::Instant::now());

        let result = analyzer.analyze(&document, &expired);
        assert!(matches!(result, Err(AnalysisFailure::DeadlineExceeded(_))));
    }
}
