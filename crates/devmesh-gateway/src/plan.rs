//! Request planning: split a client operation into per-subgraph calls.
//!
//! Top-level selections group by owning subgraph, preserving client
//! order within each group. Each group becomes one upstream operation
//! document carrying exactly the variable definitions it uses and the
//! fragments it references. Selections on entity types are augmented
//! with `__typename` and the entity's key fields so the entity router
//! can resolve extension fields afterwards.

use std::collections::HashSet;

use devmesh_error::{DevmeshError, Result};
use devmesh_graphql::ops::{response_key, used_variables, ParsedOperation};
use devmesh_graphql::projection::Fragments;
use devmesh_graphql::OperationKind;
use graphql_parser::query::{
    Definition, Document, Field, FragmentDefinition, Mutation, OperationDefinition, Query,
    Selection, SelectionSet, Subscription,
};
use graphql_parser::Pos;
use serde_json::{Map, Value};

use crate::supergraph::Supergraph;

/// One upstream call.
#[derive(Debug, Clone)]
pub struct SubgraphCall {
    /// Target subgraph name.
    pub subgraph: String,
    /// Printed operation document.
    pub operation: String,
    /// Variables the operation uses.
    pub variables: Map<String, Value>,
    /// Response keys this call produces, in client order.
    pub response_keys: Vec<String>,
}

/// A planned request.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    /// Operation kind.
    pub kind: OperationKind,
    /// Upstream calls in first-appearance order.
    pub calls: Vec<SubgraphCall>,
    /// Response keys in client selection order.
    pub client_order: Vec<String>,
}

/// Plan an operation against the supergraph.
///
/// # Errors
///
/// `BAD_USER_INPUT` when a top-level field has no owner in the
/// supergraph.
pub fn plan(
    supergraph: &Supergraph,
    op: &ParsedOperation<'_>,
    variables: &Map<String, Value>,
) -> Result<QueryPlan> {
    let fields = devmesh_graphql::ops::top_level_fields(op);

    let mut groups: Vec<(String, Vec<&Field<'_, String>>)> = Vec::new();
    let mut client_order = Vec::with_capacity(fields.len());

    for field in fields {
        client_order.push(response_key(field).to_string());
        let owner = supergraph
            .owner_of(op.kind, &field.name)
            .ok_or_else(|| {
                DevmeshError::bad_user_input(format!(
                    "Cannot query field '{}' on type '{}'",
                    field.name,
                    root_type_name(op.kind)
                ))
            })?
            .to_string();

        match groups.iter_mut().find(|(subgraph, _)| *subgraph == owner) {
            Some((_, group)) => group.push(field),
            None => groups.push((owner, vec![field])),
        }
    }

    let calls = groups
        .into_iter()
        .map(|(subgraph, group)| build_call(supergraph, op, variables, subgraph, &group))
        .collect::<Result<Vec<_>>>()?;

    Ok(QueryPlan {
        kind: op.kind,
        calls,
        client_order,
    })
}

fn root_type_name(kind: OperationKind) -> &'static str {
    match kind {
        OperationKind::Query => "Query",
        OperationKind::Mutation => "Mutation",
        OperationKind::Subscription => "Subscription",
    }
}

fn build_call<'a>(
    supergraph: &Supergraph,
    op: &ParsedOperation<'_>,
    variables: &Map<String, Value>,
    subgraph: String,
    group: &[&'a Field<'a, String>],
) -> Result<SubgraphCall> {
    let pos = Pos { line: 0, column: 0 };

    // Clone and augment each selected field with entity keys.
    let mut items: Vec<Selection<'static, String>> = Vec::with_capacity(group.len());
    let mut response_keys = Vec::with_capacity(group.len());
    for field in group {
        response_keys.push(response_key(field).to_string());
        let mut cloned = deep_clone_field(field);
        let return_type = supergraph
            .field_return_type(root_type_name(op.kind), &field.name)
            .map(ToString::to_string);
        if let Some(return_type) = return_type {
            augment_for_entities(supergraph, &mut cloned.selection_set, &return_type);
        }
        items.push(Selection::Field(cloned));
    }

    let selection_set = SelectionSet {
        span: (pos, pos),
        items,
    };

    // Variables actually used under this group's selections.
    let mut used = HashSet::new();
    for field in group {
        let single = SelectionSet {
            span:  (field.position, field.position),
            items: vec![Selection::Field((*field).clone())],
        };
        used.extend(used_variables(&single, &op.fragments));
    }
    // Fragment bodies may also reference variables.
    let needed_fragments = collect_fragments(group, &op.fragments);
    for name in &needed_fragments {
        if let Some(frag) = op.fragments.get(name) {
            used.extend(used_variables(&frag.selection_set, &op.fragments));
        }
    }

    let variable_definitions: Vec<_> = op
        .variable_definitions
        .iter()
        .filter(|def| used.contains(&def.name))
        .map(deep_clone_variable_definition)
        .collect();

    let call_variables: Map<String, Value> = variables
        .iter()
        .filter(|(name, _)| used.contains(*name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    let operation = match op.kind {
        OperationKind::Query => OperationDefinition::Query(Query {
            position: pos,
            name: op.name.clone(),
            variable_definitions,
            directives: Vec::new(),
            selection_set,
        }),
        OperationKind::Mutation => OperationDefinition::Mutation(Mutation {
            position: pos,
            name: op.name.clone(),
            variable_definitions,
            directives: Vec::new(),
            selection_set,
        }),
        OperationKind::Subscription => OperationDefinition::Subscription(Subscription {
            position: pos,
            name: op.name.clone(),
            variable_definitions,
            directives: Vec::new(),
            selection_set,
        }),
    };

    let mut definitions = vec![Definition::Operation(operation)];
    for name in needed_fragments {
        if let Some(frag) = op.fragments.get(&name) {
            definitions.push(Definition::Fragment(deep_clone_fragment(frag)));
        }
    }

    let document = Document { definitions };

    Ok(SubgraphCall {
        subgraph,
        operation: document.to_string(),
        variables: call_variables,
        response_keys,
    })
}

/// Inject `__typename` and key fields into selections on entity types
/// so downstream entity resolution always has the reference values.
fn augment_for_entities(
    supergraph: &Supergraph,
    set: &mut SelectionSet<'static, String>,
    parent_type: &str,
) {
    if set.items.is_empty() {
        return;
    }

    if let Some(entity) = supergraph.entity(parent_type) {
        let pos = Pos { line: 0, column: 0 };
        let mut present: HashSet<String> = set
            .items
            .iter()
            .filter_map(|sel| match sel {
                Selection::Field(f) => Some(f.name.clone()),
                _ => None,
            })
            .collect();
        for needed in std::iter::once("__typename".to_string()).chain(entity.keys.iter().cloned())
        {
            if !present.contains(&needed) {
                present.insert(needed.clone());
                set.items.push(Selection::Field(Field {
                    position: pos,
                    alias: None,
                    name: needed,
                    arguments: Vec::new(),
                    directives: Vec::new(),
                    selection_set: SelectionSet {
                        span:  (pos, pos),
                        items: Vec::new(),
                    },
                }));
            }
        }
    }

    let child_types: Vec<(usize, String)> = set
        .items
        .iter()
        .enumerate()
        .filter_map(|(idx, sel)| match sel {
            Selection::Field(f) => supergraph
                .field_return_type(parent_type, &f.name)
                .map(|t| (idx, t.to_string())),
            _ => None,
        })
        .collect();
    for (idx, child_type) in child_types {
        if let Selection::Field(f) = &mut set.items[idx] {
            augment_for_entities(supergraph, &mut f.selection_set, &child_type);
        }
    }

    // Inline fragments keep the parent type context unless conditioned.
    for sel in &mut set.items {
        if let Selection::InlineFragment(inline) = sel {
            let context = match &inline.type_condition {
                Some(graphql_parser::query::TypeCondition::On(name)) => name.clone(),
                None => parent_type.to_string(),
            };
            augment_for_entities(supergraph, &mut inline.selection_set, &context);
        }
    }
}

fn collect_fragments(
    group: &[&Field<'_, String>],
    fragments: &Fragments<'_>,
) -> Vec<String> {
    let mut needed = Vec::new();
    let mut seen = HashSet::new();
    for field in group {
        spreads_in(&field.selection_set, fragments, &mut needed, &mut seen, 0);
    }
    needed
}

fn spreads_in(
    set: &SelectionSet<'_, String>,
    fragments: &Fragments<'_>,
    needed: &mut Vec<String>,
    seen: &mut HashSet<String>,
    guard: usize,
) {
    if guard > 32 {
        return;
    }
    for sel in &set.items {
        match sel {
            Selection::Field(f) => spreads_in(&f.selection_set, fragments, needed, seen, guard + 1),
            Selection::InlineFragment(inline) => {
                spreads_in(&inline.selection_set, fragments, needed, seen, guard + 1);
            }
            Selection::FragmentSpread(spread) => {
                if seen.insert(spread.fragment_name.clone()) {
                    needed.push(spread.fragment_name.clone());
                    if let Some(frag) = fragments.get(&spread.fragment_name) {
                        spreads_in(&frag.selection_set, fragments, needed, seen, guard + 1);
                    }
                }
            }
        }
    }
}

// The AST borrows its lifetime parameter only through PhantomData when
// the text type is `String`; these deep clones rebuild nodes with the
// `'static` parameter so planned documents outlive the request text.

fn deep_clone_field(field: &Field<'_, String>) -> Field<'static, String> {
    Field {
        position:      field.position,
        alias:         field.alias.clone(),
        name:          field.name.clone(),
        arguments:     field
            .arguments
            .iter()
            .map(|(name, value)| (name.clone(), deep_clone_value(value)))
            .collect(),
        directives:    Vec::new(),
        selection_set: deep_clone_selection_set(&field.selection_set),
    }
}

fn deep_clone_selection_set(set: &SelectionSet<'_, String>) -> SelectionSet<'static, String> {
    SelectionSet {
        span:  set.span,
        items: set
            .items
            .iter()
            .map(|sel| match sel {
                Selection::Field(f) => Selection::Field(deep_clone_field(f)),
                Selection::FragmentSpread(spread) => {
                    Selection::FragmentSpread(graphql_parser::query::FragmentSpread {
                        position:      spread.position,
                        fragment_name: spread.fragment_name.clone(),
                        directives:    Vec::new(),
                    })
                }
                Selection::InlineFragment(inline) => {
                    Selection::InlineFragment(graphql_parser::query::InlineFragment {
                        position:       inline.position,
                        type_condition: inline.type_condition.as_ref().map(|tc| {
                            let graphql_parser::query::TypeCondition::On(name) = tc;
                            graphql_parser::query::TypeCondition::On(name.clone())
                        }),
                        directives:     Vec::new(),
                        selection_set:  deep_clone_selection_set(&inline.selection_set),
                    })
                }
            })
            .collect(),
    }
}

fn deep_clone_fragment(frag: &FragmentDefinition<'_, String>) -> FragmentDefinition<'static, String> {
    let graphql_parser::query::TypeCondition::On(on) = &frag.type_condition;
    FragmentDefinition {
        position:       frag.position,
        name:           frag.name.clone(),
        type_condition: graphql_parser::query::TypeCondition::On(on.clone()),
        directives:     Vec::new(),
        selection_set:  deep_clone_selection_set(&frag.selection_set),
    }
}

fn deep_clone_variable_definition(
    def: &graphql_parser::query::VariableDefinition<'_, String>,
) -> graphql_parser::query::VariableDefinition<'static, String> {
    graphql_parser::query::VariableDefinition {
        position:      def.position,
        name:          def.name.clone(),
        var_type:      deep_clone_type(&def.var_type),
        default_value: def.default_value.as_ref().map(deep_clone_value),
    }
}

fn deep_clone_type(
    ty: &graphql_parser::query::Type<'_, String>,
) -> graphql_parser::query::Type<'static, String> {
    use graphql_parser::query::Type;
    match ty {
        Type::NamedType(name) => Type::NamedType(name.clone()),
        Type::ListType(inner) => Type::ListType(Box::new(deep_clone_type(inner))),
        Type::NonNullType(inner) => Type::NonNullType(Box::new(deep_clone_type(inner))),
    }
}

fn deep_clone_value(
    value: &graphql_parser::query::Value<'_, String>,
) -> graphql_parser::query::Value<'static, String> {
    use graphql_parser::query::Value;
    match value {
        Value::Variable(name) => Value::Variable(name.clone()),
        Value::Int(n) => Value::Int(n.clone()),
        Value::Float(f) => Value::Float(*f),
        Value::String(s) => Value::String(s.clone()),
        Value::Boolean(b) => Value::Boolean(*b),
        Value::Null => Value::Null,
        Value::Enum(name) => Value::Enum(name.clone()),
        Value::List(items) => Value::List(items.iter().map(deep_clone_value).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), deep_clone_value(v)))
                .collect(),
        ),
    }
}

/// Subgraphs a plan touches (for cache origin sets and invalidation).
#[must_use]
pub fn touched_subgraphs(plan: &QueryPlan) -> HashSet<String> {
    plan.calls.iter().map(|call| call.subgraph.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use devmesh_graphql::ops::{find_operation, parse};

    fn test_supergraph() -> Supergraph {
        let inputs = vec![
            (
                "git".to_string(),
                r#"
                type Query { repoAgentHealth: ServiceHealth! repository(path: String!): Repository }
                type Mutation { hierarchicalCommit(message: String!): CommitResult! }
                type ServiceHealth @shareable { healthy: Boolean! service: String! timestamp: String! }
                type Repository @key(fields: "path") { path: String! branch: String! isDirty: Boolean! }
                type CommitResult { success: Boolean! }
                "#
                .to_string(),
            ),
            (
                "claude-agent".to_string(),
                r#"
                type Query { claudeHealth: ServiceHealth! }
                type ServiceHealth @shareable { healthy: Boolean! service: String! timestamp: String! }
                type AgentRun @key(fields: "id") { id: ID! status: String! }
                type Repository @key(fields: "path") @extends { path: String! @external recentRuns: [AgentRun!]! }
                "#
                .to_string(),
            ),
        ];
        Supergraph::compose(&inputs).unwrap()
    }

    #[test]
    fn test_groups_by_owner_preserving_order() {
        let graph = test_supergraph();
        let doc = parse(
            "{ repoAgentHealth { healthy } claudeHealth { healthy } repository(path: \"/a\") { branch } }",
        )
        .unwrap();
        let op = find_operation(&doc, None).unwrap();
        let plan = plan(&graph, &op, &Map::new()).unwrap();

        assert_eq!(plan.calls.len(), 2);
        assert_eq!(plan.calls[0].subgraph, "git");
        assert_eq!(
            plan.calls[0].response_keys,
            vec!["repoAgentHealth".to_string(), "repository".to_string()]
        );
        assert_eq!(plan.calls[1].subgraph, "claude-agent");
        assert_eq!(
            plan.client_order,
            vec![
                "repoAgentHealth".to_string(),
                "claudeHealth".to_string(),
                "repository".to_string()
            ]
        );

        // The git call's document parses and contains both fields.
        let printed = &plan.calls[0].operation;
        let reparsed = parse(printed).unwrap();
        assert_eq!(reparsed.definitions.len(), 1);
        assert!(printed.contains("repoAgentHealth"));
        assert!(printed.contains("repository"));
        assert!(!printed.contains("claudeHealth"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let graph = test_supergraph();
        let doc = parse("{ nope }").unwrap();
        let op = find_operation(&doc, None).unwrap();
        let err = plan(&graph, &op, &Map::new()).unwrap_err();
        assert_eq!(err.error_code(), "BAD_USER_INPUT");
    }

    #[test]
    fn test_variables_filtered_per_call() {
        let graph = test_supergraph();
        let doc = parse(
            "query($p: String!, $unused: Int) { repository(path: $p) { branch } claudeHealth { healthy } }",
        )
        .unwrap();
        let op = find_operation(&doc, None).unwrap();
        let mut variables = Map::new();
        variables.insert("p".to_string(), serde_json::json!("/a"));
        variables.insert("unused".to_string(), serde_json::json!(9));

        let planned = plan(&graph, &op, &variables).unwrap();
        let git_call = planned
            .calls
            .iter()
            .find(|c| c.subgraph == "git")
            .unwrap();
        assert!(git_call.operation.contains("$p"));
        assert!(!git_call.operation.contains("$unused"));
        assert!(git_call.variables.contains_key("p"));
        assert!(!git_call.variables.contains_key("unused"));

        let agent_call = planned
            .calls
            .iter()
            .find(|c| c.subgraph == "claude-agent")
            .unwrap();
        assert!(agent_call.variables.is_empty());
    }

    #[test]
    fn test_entity_keys_injected() {
        let graph = test_supergraph();
        let doc = parse("{ repository(path: \"/a\") { branch recentRuns { id } } }").unwrap();
        let op = find_operation(&doc, None).unwrap();
        let planned = plan(&graph, &op, &Map::new()).unwrap();

        // The owner call gains __typename and the key field `path`.
        let printed = &planned.calls[0].operation;
        assert!(printed.contains("__typename"));
        assert!(printed.contains("path"));
    }

    #[test]
    fn test_fragments_carried_into_call() {
        let graph = test_supergraph();
        let doc = parse(
            "{ repository(path: \"/a\") { ...Bits } } fragment Bits on Repository { branch isDirty }",
        )
        .unwrap();
        let op = find_operation(&doc, None).unwrap();
        let planned = plan(&graph, &op, &Map::new()).unwrap();
        let printed = &planned.calls[0].operation;
        assert!(printed.contains("fragment Bits on Repository"));
        assert!(printed.contains("...Bits"));
    }

    #[test]
    fn test_mutation_plan() {
        let graph = test_supergraph();
        let doc = parse(r#"mutation { hierarchicalCommit(message: "m") { success } }"#).unwrap();
        let op = find_operation(&doc, None).unwrap();
        let planned = plan(&graph, &op, &Map::new()).unwrap();
        assert_eq!(planned.kind, OperationKind::Mutation);
        assert!(planned.calls[0].operation.trim_start().starts_with("mutation"));
        assert_eq!(
            touched_subgraphs(&planned),
            std::iter::once("git".to_string()).collect()
        );
    }
}
