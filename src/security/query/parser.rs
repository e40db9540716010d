//! Document Parser
//!
//! GraphQL テキストをエンジン内部の `QueryDocument` に変換します。
//! 名前付き・インラインフラグメントは展開し、循環参照は構文エラーとして拒否します。
//! 文字列値は構文木から収集するため、コメントやブロック文字列の影響を受けません。

use std::collections::HashMap;

use async_graphql_parser::types::{
    Directive, DocumentOperations, FragmentDefinition, OperationDefinition, OperationType,
    Selection, SelectionSet as GqlSelectionSet,
};
use async_graphql_parser::{parse_query, Positioned};
use async_graphql_value::Value;
use tracing::debug;

use super::types::{
    Argument, Field, Operation, OperationKind, ParseError, QueryDocument, SelectionSet,
};

/// 許容する最大ネスト（フラグメント展開を含む）
pub const MAX_DOCUMENT_NESTING: usize = 128;

/// 展開後の最大フィールド数
pub const MAX_EXPANDED_FIELDS: usize = 10_000;

/// GraphQL テキストを解析
pub fn parse_document(text: &str) -> Result<QueryDocument, ParseError> {
    let document = parse_query(text).map_err(|e| ParseError::Syntax(e.to_string()))?;

    let fragments: HashMap<String, &FragmentDefinition> = document
        .fragments
        .iter()
        .map(|(name, fragment)| (name.to_string(), &fragment.node))
        .collect();

    let mut definitions: Vec<(Option<String>, &OperationDefinition)> = match &document.operations
    {
        DocumentOperations::Single(operation) => vec![(None, &operation.node)],
        DocumentOperations::Multiple(operations) => operations
            .iter()
            .map(|(name, operation)| (Some(name.to_string()), &operation.node))
            .collect(),
    };
    // 名前順で安定させる
    definitions.sort_by(|a, b| a.0.cmp(&b.0));

    let literals = collect_literals(&definitions, &fragments);

    let mut expander = Expander {
        fragments,
        visiting: Vec::new(),
        expanded_fields: 0,
    };

    let mut operations = Vec::with_capacity(definitions.len());
    for (name, definition) in definitions {
        let fields = expander.expand(&definition.selection_set.node, None, 1)?;
        operations.push(Operation {
            kind: match definition.ty {
                OperationType::Query => OperationKind::Query,
                OperationType::Mutation => OperationKind::Mutation,
                OperationType::Subscription => OperationKind::Subscription,
            },
            name,
            selection_set: SelectionSet { fields },
        });
    }

    debug!(
        "Parsed document with {} operations and {} fields",
        operations.len(),
        expander.expanded_fields
    );

    Ok(QueryDocument {
        operations,
        literals,
    })
}

/// オペレーションと全フラグメント定義から文字列値を文書順に集める
///
/// フラグメントは展開せず定義ごとに1回だけ走査する（未使用の定義も含む）。
fn collect_literals(
    definitions: &[(Option<String>, &OperationDefinition)],
    fragments: &HashMap<String, &FragmentDefinition>,
) -> Vec<String> {
    let mut literals = Vec::new();

    for (_, definition) in definitions {
        for variable in &definition.variable_definitions {
            if let Some(default) = &variable.node.default_value {
                collect_value(&default.node.clone().into_value(), &mut literals);
            }
            collect_directives(&variable.node.directives, &mut literals);
        }
        collect_directives(&definition.directives, &mut literals);
        collect_selection_set(&definition.selection_set.node, &mut literals);
    }

    let mut names: Vec<&String> = fragments.keys().collect();
    names.sort();
    for name in names {
        if let Some(fragment) = fragments.get(name) {
            collect_directives(&fragment.directives, &mut literals);
            collect_selection_set(&fragment.selection_set.node, &mut literals);
        }
    }

    literals
}

fn collect_selection_set(selection_set: &GqlSelectionSet, literals: &mut Vec<String>) {
    for selection in &selection_set.items {
        match &selection.node {
            Selection::Field(field) => {
                for (_, value) in &field.node.arguments {
                    collect_value(&value.node, literals);
                }
                collect_directives(&field.node.directives, literals);
                collect_selection_set(&field.node.selection_set.node, literals);
            }
            Selection::FragmentSpread(spread) => {
                collect_directives(&spread.node.directives, literals);
            }
            Selection::InlineFragment(inline) => {
                collect_directives(&inline.node.directives, literals);
                collect_selection_set(&inline.node.selection_set.node, literals);
            }
        }
    }
}

fn collect_directives(directives: &[Positioned<Directive>], literals: &mut Vec<String>) {
    for directive in directives {
        for (_, value) in &directive.node.arguments {
            collect_value(&value.node, literals);
        }
    }
}

fn collect_value(value: &Value, literals: &mut Vec<String>) {
    match value {
        Value::String(text) if !text.is_empty() => literals.push(text.clone()),
        Value::List(items) => {
            for item in items {
                collect_value(item, literals);
            }
        }
        Value::Object(fields) => {
            for item in fields.values() {
                collect_value(item, literals);
            }
        }
        _ => {}
    }
}

struct Expander<'a> {
    fragments: HashMap<String, &'a FragmentDefinition>,
    /// 展開中のフラグメント名（循環検出用）
    visiting: Vec<String>,
    expanded_fields: usize,
}

impl<'a> Expander<'a> {
    fn expand(
        &mut self,
        selection_set: &'a GqlSelectionSet,
        parent_type: Option<&str>,
        depth: usize,
    ) -> Result<Vec<Field>, ParseError> {
        if depth > MAX_DOCUMENT_NESTING {
            return Err(ParseError::TooDeep(MAX_DOCUMENT_NESTING));
        }

        let mut fields = Vec::new();

        for selection in &selection_set.items {
            match &selection.node {
                Selection::Field(field) => {
                    let field = &field.node;
                    self.expanded_fields += 1;
                    if self.expanded_fields > MAX_EXPANDED_FIELDS {
                        return Err(ParseError::TooLarge(MAX_EXPANDED_FIELDS));
                    }

                    let children = if field.selection_set.node.items.is_empty() {
                        None
                    } else {
                        Some(SelectionSet {
                            fields: self.expand(&field.selection_set.node, None, depth + 1)?,
                        })
                    };

                    fields.push(Field {
                        name: field.name.node.to_string(),
                        alias: field.alias.as_ref().map(|a| a.node.to_string()),
                        arguments: field
                            .arguments
                            .iter()
                            .map(|(name, value)| Argument {
                                name: name.node.to_string(),
                                value: value.node.to_string(),
                            })
                            .collect(),
                        parent_type: parent_type.map(str::to_string),
                        selection_set: children,
                    });
                }
                Selection::FragmentSpread(spread) => {
                    let name = spread.node.fragment_name.node.to_string();
                    if self.visiting.contains(&name) {
                        let mut path = self.visiting.clone();
                        path.push(name);
                        return Err(ParseError::FragmentCycle(path.join(" -> ")));
                    }
                    let fragment = *self
                        .fragments
                        .get(&name)
                        .ok_or_else(|| ParseError::UnknownFragment(name.clone()))?;

                    self.visiting.push(name);
                    let type_name = fragment.type_condition.node.on.node.to_string();
                    let expanded =
                        self.expand(&fragment.selection_set.node, Some(type_name.as_str()), depth);
                    self.visiting.pop();
                    fields.extend(expanded?);
                }
                Selection::InlineFragment(inline) => {
                    let inline = &inline.node;
                    let type_name = inline
                        .type_condition
                        .as_ref()
                        .map(|c| c.node.on.node.to_string());
                    let parent = type_name.as_deref().or(parent_type);
                    fields.extend(self.expand(&inline.selection_set.node, parent, depth)?);
                }
            }
        }

        Ok(fields)
    }
}
