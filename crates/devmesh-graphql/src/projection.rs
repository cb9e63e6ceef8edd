//! Selection-set projection of resolver output.
//!
//! Subgraph resolvers return complete JSON objects; projection trims
//! them down to the client's selection set, applying aliases, inline
//! fragments (matched against `__typename`), and fragment spreads.
//! Unknown selected fields project to `null` rather than erroring, so
//! a subgraph can evolve its schema between gateway recompositions.

use std::collections::HashMap;

use graphql_parser::query::{Field, FragmentDefinition, Selection, SelectionSet, TypeCondition};
use serde_json::{Map, Value};

use crate::ops::response_key;

/// Fragment definitions by name, as collected during operation parsing.
pub type Fragments<'a> = HashMap<String, &'a FragmentDefinition<'a, String>>;

/// Project `value` through `selection_set`.
///
/// Objects are filtered to selected fields; arrays project each
/// element; scalars pass through untouched when the selection set is
/// empty (a leaf field).
#[must_use]
pub fn project<'a>(value: &Value, selection_set: &'a SelectionSet<'a, String>, fragments: &Fragments<'a>) -> Value {
    if selection_set.items.is_empty() {
        return value.clone();
    }

    match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| project(item, selection_set, fragments))
                .collect(),
        ),
        Value::Object(obj) => {
            let mut out = Map::new();
            apply_selections(obj, selection_set, fragments, &mut out, 0);
            Value::Object(out)
        }
        // Leaf value under a non-empty selection set: nothing to project into.
        Value::Null => Value::Null,
        other => other.clone(),
    }
}

fn apply_selections<'a>(
    obj: &Map<String, Value>,
    selection_set: &'a SelectionSet<'a, String>,
    fragments: &Fragments<'a>,
    out: &mut Map<String, Value>,
    guard: usize,
) {
    if guard > 32 {
        return;
    }
    for sel in &selection_set.items {
        match sel {
            Selection::Field(field) => {
                project_field(obj, field, fragments, out);
            }
            Selection::InlineFragment(inline) => {
                if type_condition_matches(obj, inline.type_condition.as_ref()) {
                    apply_selections(obj, &inline.selection_set, fragments, out, guard + 1);
                }
            }
            Selection::FragmentSpread(spread) => {
                if let Some(frag) = fragments.get(&spread.fragment_name) {
                    let condition = Some(&frag.type_condition);
                    if type_condition_matches(obj, condition) {
                        apply_selections(obj, &frag.selection_set, fragments, out, guard + 1);
                    }
                }
            }
        }
    }
}

fn project_field<'a>(
    obj: &Map<String, Value>,
    field: &'a Field<'a, String>,
    fragments: &Fragments<'a>,
    out: &mut Map<String, Value>,
) {
    let key = response_key(field).to_string();
    if field.name == "__typename" {
        let typename = obj.get("__typename").cloned().unwrap_or(Value::Null);
        out.insert(key, typename);
        return;
    }
    let projected = obj
        .get(&field.name)
        .map_or(Value::Null, |v| project(v, &field.selection_set, fragments));
    out.insert(key, projected);
}

fn type_condition_matches(
    obj: &Map<String, Value>,
    condition: Option<&TypeCondition<'_, String>>,
) -> bool {
    match condition {
        None => true,
        Some(TypeCondition::On(type_name)) => obj
            .get("__typename")
            .and_then(Value::as_str)
            .is_none_or(|actual| actual == type_name),
    }
}

/// An owned mirror of a selection set, with fragment spreads inlined.
///
/// Streaming paths outlive the operation text the AST borrows from;
/// they convert the selection once and project every frame against the
/// owned form.
#[derive(Debug, Clone, PartialEq)]
pub enum OwnedSelection {
    /// A field selection.
    Field {
        /// Field name in the schema.
        name: String,
        /// Response key override.
        alias: Option<String>,
        /// Coerced arguments (populated by
        /// [`to_owned_with_variables`]; ignored by projection).
        arguments: Vec<(String, Value)>,
        /// Sub-selections; empty for leaf fields.
        selections: Vec<OwnedSelection>,
    },
    /// An inline fragment (or inlined named fragment).
    Fragment {
        /// `... on TypeName` condition, if any.
        type_condition: Option<String>,
        /// The fragment's selections.
        selections: Vec<OwnedSelection>,
    },
}

impl OwnedSelection {
    /// Response key of a field selection.
    #[must_use]
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Field { name, alias, .. } => Some(alias.as_deref().unwrap_or(name)),
            Self::Fragment { .. } => None,
        }
    }
}

/// Convert a borrowed selection set into its owned mirror, dropping
/// argument values.
#[must_use]
pub fn to_owned(set: &SelectionSet<'_, String>, fragments: &Fragments<'_>) -> Vec<OwnedSelection> {
    owned_selections(set, fragments, None, 0)
}

/// Convert a borrowed selection set into its owned mirror, coercing
/// each field's arguments against `variables` so the result can be
/// reprinted as an executable selection.
#[must_use]
pub fn to_owned_with_variables(
    set: &SelectionSet<'_, String>,
    fragments: &Fragments<'_>,
    variables: &Map<String, Value>,
) -> Vec<OwnedSelection> {
    owned_selections(set, fragments, Some(variables), 0)
}

fn owned_selections(
    set: &SelectionSet<'_, String>,
    fragments: &Fragments<'_>,
    variables: Option<&Map<String, Value>>,
    guard: usize,
) -> Vec<OwnedSelection> {
    if guard > 32 {
        return Vec::new();
    }
    let mut out = Vec::new();
    for sel in &set.items {
        match sel {
            Selection::Field(f) => out.push(OwnedSelection::Field {
                name:       f.name.clone(),
                alias:      f.alias.clone(),
                arguments:  match variables {
                    Some(vars) => f
                        .arguments
                        .iter()
                        .map(|(name, value)| {
                            (name.clone(), crate::ops::coerce_value(value, vars))
                        })
                        .collect(),
                    None => Vec::new(),
                },
                selections: owned_selections(&f.selection_set, fragments, variables, guard + 1),
            }),
            Selection::InlineFragment(inline) => out.push(OwnedSelection::Fragment {
                type_condition: inline
                    .type_condition
                    .as_ref()
                    .map(|TypeCondition::On(name)| name.clone()),
                selections:     owned_selections(
                    &inline.selection_set,
                    fragments,
                    variables,
                    guard + 1,
                ),
            }),
            Selection::FragmentSpread(spread) => {
                if let Some(frag) = fragments.get(&spread.fragment_name) {
                    let TypeCondition::On(name) = &frag.type_condition;
                    out.push(OwnedSelection::Fragment {
                        type_condition: Some(name.clone()),
                        selections:     owned_selections(
                            &frag.selection_set,
                            fragments,
                            variables,
                            guard + 1,
                        ),
                    });
                }
            }
        }
    }
    out
}

/// Print owned selections as executable GraphQL selection-set text
/// (inside braces). JSON argument values render as GraphQL literals.
#[must_use]
pub fn print_selections(selections: &[OwnedSelection]) -> String {
    let mut out = String::new();
    print_into(selections, &mut out);
    out
}

fn print_into(selections: &[OwnedSelection], out: &mut String) {
    for (idx, sel) in selections.iter().enumerate() {
        if idx > 0 {
            out.push(' ');
        }
        match sel {
            OwnedSelection::Field {
                name,
                alias,
                arguments,
                selections,
            } => {
                if let Some(alias) = alias {
                    out.push_str(alias);
                    out.push_str(": ");
                }
                out.push_str(name);
                if !arguments.is_empty() {
                    out.push('(');
                    for (i, (arg_name, value)) in arguments.iter().enumerate() {
                        if i > 0 {
                            out.push_str(", ");
                        }
                        out.push_str(arg_name);
                        out.push_str(": ");
                        print_literal(value, out);
                    }
                    out.push(')');
                }
                if !selections.is_empty() {
                    out.push_str(" { ");
                    print_into(selections, out);
                    out.push_str(" }");
                }
            }
            OwnedSelection::Fragment {
                type_condition,
                selections,
            } => {
                out.push_str("...");
                if let Some(on) = type_condition {
                    out.push_str(" on ");
                    out.push_str(on);
                }
                out.push_str(" { ");
                print_into(selections, out);
                out.push_str(" }");
            }
        }
    }
}

fn print_literal(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            out.push('"');
            for ch in s.chars() {
                match ch {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    '\t' => out.push_str("\\t"),
                    other => out.push(other),
                }
            }
            out.push('"');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                print_literal(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(key);
                out.push_str(": ");
                print_literal(item, out);
            }
            out.push('}');
        }
    }
}

/// Project `value` through owned selections. Same semantics as
/// [`project`].
#[must_use]
pub fn project_owned(value: &Value, selections: &[OwnedSelection]) -> Value {
    if selections.is_empty() {
        return value.clone();
    }
    match value {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| project_owned(item, selections))
                .collect(),
        ),
        Value::Object(obj) => {
            let mut out = Map::new();
            apply_owned(obj, selections, &mut out, 0);
            Value::Object(out)
        }
        Value::Null => Value::Null,
        other => other.clone(),
    }
}

fn apply_owned(
    obj: &Map<String, Value>,
    selections: &[OwnedSelection],
    out: &mut Map<String, Value>,
    guard: usize,
) {
    if guard > 32 {
        return;
    }
    for sel in selections {
        match sel {
            OwnedSelection::Field {
                name,
                alias,
                selections,
                ..
            } => {
                let key = alias.clone().unwrap_or_else(|| name.clone());
                if name == "__typename" {
                    out.insert(key, obj.get("__typename").cloned().unwrap_or(Value::Null));
                    continue;
                }
                let projected = obj
                    .get(name)
                    .map_or(Value::Null, |v| project_owned(v, selections));
                out.insert(key, projected);
            }
            OwnedSelection::Fragment {
                type_condition,
                selections,
            } => {
                let matches = match type_condition {
                    None => true,
                    Some(wanted) => obj
                        .get("__typename")
                        .and_then(Value::as_str)
                        .is_none_or(|actual| actual == wanted),
                };
                if matches {
                    apply_owned(obj, selections, out, guard + 1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{find_operation, parse, top_level_fields};
    use serde_json::json;

    fn project_with(query: &str, value: Value) -> Value {
        let doc = parse(query).unwrap();
        let op = find_operation(&doc, None).unwrap();
        let field = top_level_fields(&op)[0];
        project(&value, &field.selection_set, &op.fragments)
    }

    #[test]
    fn test_projects_selected_fields_only() {
        let out = project_with(
            "{ repo { path branch } }",
            json!({"path": "/ws/a", "branch": "main", "isDirty": true}),
        );
        assert_eq!(out, json!({"path": "/ws/a", "branch": "main"}));
    }

    #[test]
    fn test_projects_arrays_elementwise() {
        let out = project_with(
            "{ repos { path } }",
            json!([{"path": "/a", "x": 1}, {"path": "/b", "x": 2}]),
        );
        assert_eq!(out, json!([{"path": "/a"}, {"path": "/b"}]));
    }

    #[test]
    fn test_alias_applied() {
        let out = project_with("{ repo { where: path } }", json!({"path": "/a"}));
        assert_eq!(out, json!({"where": "/a"}));
    }

    #[test]
    fn test_typename_synthesized_from_value() {
        let out = project_with(
            "{ repo { __typename path } }",
            json!({"__typename": "Repository", "path": "/a"}),
        );
        assert_eq!(out["__typename"], json!("Repository"));
    }

    #[test]
    fn test_unknown_field_projects_null() {
        let out = project_with("{ repo { path missing } }", json!({"path": "/a"}));
        assert_eq!(out, json!({"path": "/a", "missing": null}));
    }

    #[test]
    fn test_inline_fragment_type_condition() {
        let doc = parse(
            "{ _entities { ... on Repository { path } ... on AgentSession { id } } }",
        )
        .unwrap();
        let op = find_operation(&doc, None).unwrap();
        let field = top_level_fields(&op)[0];
        let entity = json!({"__typename": "Repository", "path": "/a", "id": "nope"});
        let out = project(&entity, &field.selection_set, &op.fragments);
        assert_eq!(out, json!({"path": "/a"}));
    }

    #[test]
    fn test_fragment_spread() {
        let doc = parse(
            "{ repo { ...RepoBits } } fragment RepoBits on Repository { path branch }",
        )
        .unwrap();
        let op = find_operation(&doc, None).unwrap();
        let field = top_level_fields(&op)[0];
        let out = project(
            &json!({"__typename": "Repository", "path": "/a", "branch": "main", "extra": 1}),
            &field.selection_set,
            &op.fragments,
        );
        assert_eq!(out, json!({"path": "/a", "branch": "main"}));
    }

    #[test]
    fn test_null_passes_through() {
        let out = project_with("{ repo { path } }", Value::Null);
        assert_eq!(out, Value::Null);
    }

    #[test]
    fn test_owned_projection_matches_borrowed() {
        let doc = parse("{ out { ... on CommandOutput { content isFinal } } }").unwrap();
        let op = find_operation(&doc, None).unwrap();
        let field = top_level_fields(&op)[0];
        let value = json!({
            "__typename": "CommandOutput",
            "content": "hello",
            "isFinal": false,
            "tokens": 12
        });

        let borrowed = project(&value, &field.selection_set, &op.fragments);
        let owned = to_owned(&field.selection_set, &op.fragments);
        let via_owned = project_owned(&value, &owned);
        assert_eq!(borrowed, via_owned);
        assert_eq!(via_owned, json!({"content": "hello", "isFinal": false}));
    }

    #[test]
    fn test_print_selections_with_arguments() {
        let doc = parse(
            r#"query($n: Int) { runs: recentRuns(limit: $n, repo: "a b") { id } __typename }"#,
        )
        .unwrap();
        let op = find_operation(&doc, None).unwrap();
        let mut vars = serde_json::Map::new();
        vars.insert("n".to_string(), json!(5));
        let owned = to_owned_with_variables(op.selection_set, &op.fragments, &vars);

        let printed = print_selections(&owned);
        assert_eq!(
            printed,
            r#"runs: recentRuns(limit: 5, repo: "a b") { id } __typename"#
        );

        // Reprinting parses back.
        let reparsed = parse(&format!("{{ {printed} }}"));
        assert!(reparsed.is_ok());
    }

    #[test]
    fn test_owned_projection_inlines_named_fragments() {
        let doc = parse("{ out { ...Bits } } fragment Bits on Frame { content }").unwrap();
        let op = find_operation(&doc, None).unwrap();
        let field = top_level_fields(&op)[0];
        let owned = to_owned(&field.selection_set, &op.fragments);
        let value = json!({"__typename": "Frame", "content": "x", "extra": true});
        assert_eq!(project_owned(&value, &owned), json!({"content": "x"}));
    }
}
