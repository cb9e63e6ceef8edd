//! Operation parsing and analysis over the `graphql-parser` AST.
//!
//! The gateway and the subgraphs both work on the raw AST: the gateway
//! to enforce limits and split the operation per owning subgraph, the
//! subgraphs to dispatch top-level fields to resolvers. The AST borrows
//! from the operation text, so callers parse, analyze, and print within
//! one scope rather than storing documents.

use std::collections::{BTreeMap, HashMap, HashSet};

use devmesh_error::{DevmeshError, Result};
use graphql_parser::query::{
    Definition, Document, Field, FragmentDefinition, OperationDefinition, Selection, SelectionSet,
    Value as AstValue,
};
use serde_json::{Map, Number, Value};

/// AST document alias with owned string values.
pub type Doc<'a> = Document<'a, String>;

/// The three GraphQL operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Read-only operation; cacheable.
    Query,
    /// State-changing operation; invalidates caches.
    Mutation,
    /// Streaming operation; never cached.
    Subscription,
}

/// A selected operation within a parsed document, together with the
/// document's fragment definitions.
pub struct ParsedOperation<'a> {
    /// Operation kind.
    pub kind: OperationKind,
    /// Operation name, if declared.
    pub name: Option<String>,
    /// Variable declarations, printed back onto per-subgraph documents.
    pub variable_definitions: Vec<graphql_parser::query::VariableDefinition<'a, String>>,
    /// Top-level selection set.
    pub selection_set: &'a SelectionSet<'a, String>,
    /// Fragment definitions by name.
    pub fragments: HashMap<String, &'a FragmentDefinition<'a, String>>,
}

/// Parse an operation document.
///
/// # Errors
///
/// Returns [`DevmeshError::Parse`] with the parser's location detail on
/// syntax errors.
pub fn parse(query: &str) -> Result<Doc<'_>> {
    graphql_parser::parse_query::<String>(query)
        .map_err(|e| DevmeshError::parse(e.to_string()))
}

/// Select the operation to execute, honoring `operationName`.
///
/// # Errors
///
/// Returns [`DevmeshError::BadUserInput`] when the document has no
/// operations, when `operation_name` matches nothing, or when multiple
/// anonymous operations are present.
pub fn find_operation<'a>(
    doc: &'a Doc<'a>,
    operation_name: Option<&str>,
) -> Result<ParsedOperation<'a>> {
    let mut fragments = HashMap::new();
    let mut operations = Vec::new();

    for def in &doc.definitions {
        match def {
            Definition::Operation(op) => operations.push(op),
            Definition::Fragment(frag) => {
                fragments.insert(frag.name.clone(), frag);
            }
        }
    }

    let op: &'a OperationDefinition<'a, String> = match operation_name {
        Some(wanted) => operations
            .iter()
            .copied()
            .find(|op| declared_name(op).is_some_and(|n| n == wanted))
            .ok_or_else(|| {
                DevmeshError::bad_user_input(format!("Unknown operation '{wanted}'"))
            })?,
        None => match operations.len() {
            0 => return Err(DevmeshError::bad_user_input("Document contains no operations")),
            1 => operations[0],
            _ => {
                return Err(DevmeshError::bad_user_input(
                    "operationName is required when the document contains multiple operations",
                ))
            }
        },
    };

    let (kind, name, variable_definitions, selection_set) = match op {
        OperationDefinition::SelectionSet(set) => (OperationKind::Query, None, Vec::new(), set),
        OperationDefinition::Query(q) => (
            OperationKind::Query,
            q.name.clone(),
            q.variable_definitions.clone(),
            &q.selection_set,
        ),
        OperationDefinition::Mutation(m) => (
            OperationKind::Mutation,
            m.name.clone(),
            m.variable_definitions.clone(),
            &m.selection_set,
        ),
        OperationDefinition::Subscription(s) => (
            OperationKind::Subscription,
            s.name.clone(),
            s.variable_definitions.clone(),
            &s.selection_set,
        ),
    };

    Ok(ParsedOperation {
        kind,
        name,
        variable_definitions,
        selection_set,
        fragments,
    })
}

fn declared_name<'a>(op: &'a OperationDefinition<'a, String>) -> Option<&'a str> {
    match op {
        OperationDefinition::SelectionSet(_) => None,
        OperationDefinition::Query(q) => q.name.as_deref(),
        OperationDefinition::Mutation(m) => m.name.as_deref(),
        OperationDefinition::Subscription(s) => s.name.as_deref(),
    }
}

/// Top-level fields of an operation, in client order.
#[must_use]
pub fn top_level_fields<'a>(op: &ParsedOperation<'a>) -> Vec<&'a Field<'a, String>> {
    let mut fields = Vec::new();
    collect_fields(op.selection_set, &op.fragments, &mut fields, 0);
    fields
}

fn collect_fields<'a>(
    set: &'a SelectionSet<'a, String>,
    fragments: &HashMap<String, &'a FragmentDefinition<'a, String>>,
    out: &mut Vec<&'a Field<'a, String>>,
    guard: usize,
) {
    if guard > 32 {
        return;
    }
    for sel in &set.items {
        match sel {
            Selection::Field(f) => out.push(f),
            Selection::FragmentSpread(spread) => {
                if let Some(frag) = fragments.get(&spread.fragment_name) {
                    collect_fields(&frag.selection_set, fragments, out, guard + 1);
                }
            }
            Selection::InlineFragment(inline) => {
                collect_fields(&inline.selection_set, fragments, out, guard + 1);
            }
        }
    }
}

/// Maximum nesting depth of the operation, counting fields only.
///
/// A flat `{ health }` has depth 1. Fragment spreads contribute the
/// depth of their selection at the spread point.
#[must_use]
pub fn max_depth(op: &ParsedOperation<'_>) -> usize {
    depth_of(op.selection_set, &op.fragments, 0)
}

fn depth_of(
    set: &SelectionSet<'_, String>,
    fragments: &HashMap<String, &FragmentDefinition<'_, String>>,
    guard: usize,
) -> usize {
    if guard > 64 {
        return usize::MAX / 2;
    }
    let mut deepest = 0;
    for sel in &set.items {
        let d = match sel {
            Selection::Field(f) => 1 + depth_of(&f.selection_set, fragments, guard + 1),
            Selection::FragmentSpread(spread) => fragments
                .get(&spread.fragment_name)
                .map_or(0, |frag| depth_of(&frag.selection_set, fragments, guard + 1)),
            Selection::InlineFragment(inline) => {
                depth_of(&inline.selection_set, fragments, guard + 1)
            }
        };
        deepest = deepest.max(d);
    }
    deepest
}

/// Number of aliased fields anywhere in the operation.
#[must_use]
pub fn count_aliases(op: &ParsedOperation<'_>) -> usize {
    alias_count(op.selection_set, &op.fragments, 0)
}

fn alias_count(
    set: &SelectionSet<'_, String>,
    fragments: &HashMap<String, &FragmentDefinition<'_, String>>,
    guard: usize,
) -> usize {
    if guard > 64 {
        return 0;
    }
    let mut count = 0;
    for sel in &set.items {
        match sel {
            Selection::Field(f) => {
                if f.alias.is_some() {
                    count += 1;
                }
                count += alias_count(&f.selection_set, fragments, guard + 1);
            }
            Selection::FragmentSpread(spread) => {
                if let Some(frag) = fragments.get(&spread.fragment_name) {
                    count += alias_count(&frag.selection_set, fragments, guard + 1);
                }
            }
            Selection::InlineFragment(inline) => {
                count += alias_count(&inline.selection_set, fragments, guard + 1);
            }
        }
    }
    count
}

/// Variable names referenced anywhere under a selection set.
#[must_use]
pub fn used_variables(
    set: &SelectionSet<'_, String>,
    fragments: &HashMap<String, &FragmentDefinition<'_, String>>,
) -> HashSet<String> {
    let mut used = HashSet::new();
    collect_variables(set, fragments, &mut used, 0);
    used
}

fn collect_variables(
    set: &SelectionSet<'_, String>,
    fragments: &HashMap<String, &FragmentDefinition<'_, String>>,
    used: &mut HashSet<String>,
    guard: usize,
) {
    if guard > 64 {
        return;
    }
    for sel in &set.items {
        match sel {
            Selection::Field(f) => {
                for (_, value) in &f.arguments {
                    value_variables(value, used);
                }
                collect_variables(&f.selection_set, fragments, used, guard + 1);
            }
            Selection::FragmentSpread(spread) => {
                if let Some(frag) = fragments.get(&spread.fragment_name) {
                    collect_variables(&frag.selection_set, fragments, used, guard + 1);
                }
            }
            Selection::InlineFragment(inline) => {
                collect_variables(&inline.selection_set, fragments, used, guard + 1);
            }
        }
    }
}

fn value_variables(value: &AstValue<'_, String>, used: &mut HashSet<String>) {
    match value {
        AstValue::Variable(name) => {
            used.insert(name.clone());
        }
        AstValue::List(items) => {
            for item in items {
                value_variables(item, used);
            }
        }
        AstValue::Object(map) => {
            for item in map.values() {
                value_variables(item, used);
            }
        }
        _ => {}
    }
}

/// Coerce an AST argument value into JSON, substituting variables.
#[must_use]
pub fn coerce_value(value: &AstValue<'_, String>, variables: &Map<String, Value>) -> Value {
    match value {
        AstValue::Variable(name) => variables.get(name).cloned().unwrap_or(Value::Null),
        AstValue::Int(n) => n.as_i64().map_or(Value::Null, Value::from),
        AstValue::Float(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
        AstValue::String(s) => Value::String(s.clone()),
        AstValue::Boolean(b) => Value::Bool(*b),
        AstValue::Null => Value::Null,
        AstValue::Enum(name) => Value::String(name.clone()),
        AstValue::List(items) => Value::Array(
            items
                .iter()
                .map(|item| coerce_value(item, variables))
                .collect(),
        ),
        AstValue::Object(map) => {
            let coerced: Map<String, Value> = map
                .iter()
                .map(|(k, v)| (k.clone(), coerce_value(v, variables)))
                .collect();
            Value::Object(coerced)
        }
    }
}

/// All arguments of a field coerced into a JSON object.
#[must_use]
pub fn argument_object(
    field: &Field<'_, String>,
    variables: &Map<String, Value>,
) -> Map<String, Value> {
    field
        .arguments
        .iter()
        .map(|(name, value)| (name.clone(), coerce_value(value, variables)))
        .collect()
}

/// The key the field's result appears under in the response.
#[must_use]
pub fn response_key<'a>(field: &'a Field<'a, String>) -> &'a str {
    field.alias.as_deref().unwrap_or(&field.name)
}

/// Canonical text of an operation: parse and reprint, which normalizes
/// whitespace and comments. Used for cache fingerprints.
///
/// # Errors
///
/// Returns a parse error for invalid operation text.
pub fn canonical_text(query: &str) -> Result<String> {
    let doc = parse(query)?;
    Ok(doc.to_string())
}

/// Canonical JSON text of a variable map (keys sorted). Used for cache
/// fingerprints so `{a,b}` and `{b,a}` hash identically.
#[must_use]
pub fn canonical_variables(variables: Option<&Value>) -> String {
    fn sort(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let sorted: BTreeMap<_, _> = map.iter().map(|(k, v)| (k.clone(), sort(v))).collect();
                serde_json::to_value(sorted).unwrap_or(Value::Null)
            }
            Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
            other => other.clone(),
        }
    }
    match variables {
        Some(v) => sort(v).to_string(),
        None => "null".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_rejects_bad_syntax() {
        let err = parse("query {{").unwrap_err();
        assert_eq!(err.error_code(), "GRAPHQL_PARSE_FAILED");
    }

    #[test]
    fn test_find_operation_by_name() {
        let doc = parse("query A { a } query B { b }").unwrap();
        let op = find_operation(&doc, Some("B")).unwrap();
        assert_eq!(op.name.as_deref(), Some("B"));
        assert_eq!(op.kind, OperationKind::Query);
    }

    #[test]
    fn test_ambiguous_operations_rejected() {
        let doc = parse("query { a } query { b }").unwrap();
        assert!(find_operation(&doc, None).is_err());
    }

    #[test]
    fn test_top_level_fields_through_fragments() {
        let doc = parse(
            "query { repoAgentHealth { healthy } ...Rest } fragment Rest on Query { claudeHealth { healthy } }",
        )
        .unwrap();
        let op = find_operation(&doc, None).unwrap();
        let fields = top_level_fields(&op);
        let names: Vec<_> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["repoAgentHealth", "claudeHealth"]);
    }

    #[test]
    fn test_max_depth() {
        let doc = parse("{ a { b { c } } d }").unwrap();
        let op = find_operation(&doc, None).unwrap();
        assert_eq!(max_depth(&op), 3);
    }

    #[test]
    fn test_alias_count() {
        let doc = parse("{ one: a two: a { three: b } c }").unwrap();
        let op = find_operation(&doc, None).unwrap();
        assert_eq!(count_aliases(&op), 3);
    }

    #[test]
    fn test_used_variables() {
        let doc =
            parse("query($id: ID!, $unused: Int) { agentSession(id: $id) { id } }").unwrap();
        let op = find_operation(&doc, None).unwrap();
        let used = used_variables(op.selection_set, &op.fragments);
        assert!(used.contains("id"));
        assert!(!used.contains("unused"));
    }

    #[test]
    fn test_coerce_arguments() {
        let doc = parse(
            r#"query($msg: String!) { hierarchicalCommit(message: $msg, stageAll: true, limit: 10) { success } }"#,
        )
        .unwrap();
        let op = find_operation(&doc, None).unwrap();
        let field = top_level_fields(&op)[0];
        let mut vars = Map::new();
        vars.insert("msg".to_string(), json!("chore: sync"));
        let args = argument_object(field, &vars);
        assert_eq!(args["message"], json!("chore: sync"));
        assert_eq!(args["stageAll"], json!(true));
        assert_eq!(args["limit"], json!(10));
    }

    #[test]
    fn test_canonical_text_normalizes_whitespace() {
        let a = canonical_text("{ health   {  healthy } }").unwrap();
        let b = canonical_text("{\n  health {\n    healthy\n  }\n}").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_canonical_variables_sorts_keys() {
        let a = canonical_variables(Some(&json!({"b": 1, "a": {"d": 2, "c": 3}})));
        let b = canonical_variables(Some(&json!({"a": {"c": 3, "d": 2}, "b": 1})));
        assert_eq!(a, b);
        assert_eq!(canonical_variables(None), "null");
    }

    #[test]
    fn test_response_key_prefers_alias() {
        let doc = parse("{ renamed: health }").unwrap();
        let op = find_operation(&doc, None).unwrap();
        let field = top_level_fields(&op)[0];
        assert_eq!(response_key(field), "renamed");
    }
}
