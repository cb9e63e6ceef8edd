//! The composed supergraph: type and field ownership derived from
//! subgraph SDL.
//!
//! Composition rules:
//! - Root fields (`Query` / `Mutation` / `Subscription`) must be owned
//!   by exactly one subgraph.
//! - A type with `@key` and no `@extends` is an entity owned by its
//!   declaring subgraph; other subgraphs may `@extends` it, declaring
//!   the key fields `@external` and contributing new fields.
//! - A plain type declared by more than one subgraph must carry
//!   `@shareable` in every declaration and have byte-equal field
//!   shapes.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use devmesh_error::{DevmeshError, Result};
use graphql_parser::schema::{Definition, ObjectType, Type, TypeDefinition};
use serde::Serialize;

/// Ownership record for one field of one type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldOwnership {
    /// Subgraph that resolves the field.
    pub subgraph: String,
    /// Base name of the field's return type.
    pub return_type: String,
}

/// An entity type and its cross-subgraph contributors.
#[derive(Debug, Clone, Default)]
pub struct EntityDecl {
    /// Subgraph owning the type (declares `@key` without `@extends`).
    pub owner: String,
    /// Key field names from the owner's `@key` directive.
    pub keys: Vec<String>,
    /// Extension fields: field name to contributing subgraph.
    pub extenders: HashMap<String, String>,
}

/// Health summary of one registered subgraph, surfaced on `/services`.
#[derive(Debug, Clone, Serialize)]
pub struct SubgraphHealth {
    /// Subgraph name.
    pub name: String,
    /// Subgraph base URL.
    pub url: String,
    /// Whether the last SDL fetch succeeded.
    pub healthy: bool,
}

/// The composed schema.
#[derive(Debug, Clone, Default)]
pub struct Supergraph {
    /// Top-level query field to owning subgraph.
    pub query_fields: HashMap<String, String>,
    /// Top-level mutation field to owning subgraph.
    pub mutation_fields: HashMap<String, String>,
    /// Top-level subscription field to owning subgraph.
    pub subscription_fields: HashMap<String, String>,
    /// Per-type field ownership (entities include extender fields).
    pub type_fields: HashMap<String, HashMap<String, FieldOwnership>>,
    /// Entity declarations by typename.
    pub entities: HashMap<String, EntityDecl>,
    /// When composition succeeded.
    pub composed_at: DateTime<Utc>,
}

impl Supergraph {
    /// Compose from `(subgraph name, sdl)` pairs.
    ///
    /// # Errors
    ///
    /// Returns [`DevmeshError::Composition`] listing every violation
    /// found.
    pub fn compose(inputs: &[(String, String)]) -> Result<Self> {
        let mut graph = Self {
            composed_at: Utc::now(),
            ..Self::default()
        };
        let mut problems: Vec<String> = Vec::new();
        // Shape registry for shareable validation:
        // type -> [(subgraph, shape, is_shareable)]
        let mut declared_shapes: HashMap<String, Vec<(String, String, bool)>> = HashMap::new();

        for (subgraph, sdl) in inputs {
            let doc = graphql_parser::parse_schema::<String>(sdl).map_err(|e| {
                DevmeshError::composition(format!("subgraph '{subgraph}' SDL does not parse: {e}"))
            })?;

            for definition in &doc.definitions {
                let Definition::TypeDefinition(TypeDefinition::Object(object)) = definition
                else {
                    continue;
                };
                if is_federation_machinery(&object.name) {
                    continue;
                }

                match object.name.as_str() {
                    "Query" | "Mutation" | "Subscription" => {
                        graph.collect_root_fields(subgraph, object, &mut problems);
                    }
                    _ => {
                        graph.collect_type(subgraph, object, &mut declared_shapes, &mut problems);
                    }
                }
            }
        }

        // Shareable validation for plain types seen in several
        // subgraphs.
        for (type_name, declarations) in &declared_shapes {
            if declarations.len() < 2 {
                continue;
            }
            if let Some((offender, _, _)) = declarations.iter().find(|(_, _, shareable)| !shareable)
            {
                problems.push(format!(
                    "type '{type_name}' is declared by multiple subgraphs but subgraph '{offender}' does not mark it @shareable"
                ));
                continue;
            }
            let reference = &declarations[0].1;
            for (subgraph, shape, _) in &declarations[1..] {
                if shape != reference {
                    problems.push(format!(
                        "shareable type '{type_name}' differs between subgraphs '{}' and '{subgraph}'",
                        declarations[0].0
                    ));
                }
            }
        }

        // Entities need an owner even if only extenders mentioned them.
        for (type_name, entity) in &graph.entities {
            if entity.owner.is_empty() {
                problems.push(format!(
                    "entity '{type_name}' is extended but no subgraph owns it"
                ));
            }
        }

        if problems.is_empty() {
            Ok(graph)
        } else {
            Err(DevmeshError::composition(problems.join("; ")))
        }
    }

    fn collect_root_fields(
        &mut self,
        subgraph: &str,
        object: &ObjectType<'_, String>,
        problems: &mut Vec<String>,
    ) {
        for field in &object.fields {
            if field.name.starts_with('_') {
                continue;
            }
            self.type_fields
                .entry(object.name.clone())
                .or_default()
                .insert(
                    field.name.clone(),
                    FieldOwnership {
                        subgraph:    subgraph.to_string(),
                        return_type: base_type_name(&field.field_type),
                    },
                );
            let target = match object.name.as_str() {
                "Query" => &mut self.query_fields,
                "Mutation" => &mut self.mutation_fields,
                _ => &mut self.subscription_fields,
            };
            if let Some(previous) = target.insert(field.name.clone(), subgraph.to_string()) {
                problems.push(format!(
                    "root field '{}.{}' is declared by both '{previous}' and '{subgraph}'",
                    object.name, field.name
                ));
            }
        }
    }

    fn collect_type(
        &mut self,
        subgraph: &str,
        object: &ObjectType<'_, String>,
        declared_shapes: &mut HashMap<String, Vec<(String, String, bool)>>,
        problems: &mut Vec<String>,
    ) {
        let extends = has_directive(object, "extends");
        let keys = key_fields(object);
        let shareable = has_directive(object, "shareable");

        if extends {
            {
                let entity = self.entities.entry(object.name.clone()).or_default();
                for field in &object.fields {
                    if has_field_directive(field, "external") {
                        continue;
                    }
                    entity
                        .extenders
                        .insert(field.name.clone(), subgraph.to_string());
                }
            }
            let fields = self.type_fields.entry(object.name.clone()).or_default();
            for field in &object.fields {
                if has_field_directive(field, "external") {
                    continue;
                }
                fields.insert(
                    field.name.clone(),
                    FieldOwnership {
                        subgraph:    subgraph.to_string(),
                        return_type: base_type_name(&field.field_type),
                    },
                );
            }
            return;
        }

        if let Some(keys) = keys {
            let entity = self.entities.entry(object.name.clone()).or_default();
            if !entity.owner.is_empty() && entity.owner != subgraph {
                problems.push(format!(
                    "entity '{}' has two owners: '{}' and '{subgraph}'",
                    object.name, entity.owner
                ));
            }
            entity.owner = subgraph.to_string();
            entity.keys = keys;
        } else {
            declared_shapes.entry(object.name.clone()).or_default().push((
                subgraph.to_string(),
                shape_of(object),
                shareable,
            ));
        }

        let fields = self.type_fields.entry(object.name.clone()).or_default();
        for field in &object.fields {
            fields
                .entry(field.name.clone())
                .or_insert_with(|| FieldOwnership {
                    subgraph:    subgraph.to_string(),
                    return_type: base_type_name(&field.field_type),
                });
        }
    }

    /// Owning subgraph of a top-level field for the given operation
    /// kind.
    #[must_use]
    pub fn owner_of(
        &self,
        kind: devmesh_graphql::OperationKind,
        field: &str,
    ) -> Option<&str> {
        use devmesh_graphql::OperationKind;
        let map = match kind {
            OperationKind::Query => &self.query_fields,
            OperationKind::Mutation => &self.mutation_fields,
            OperationKind::Subscription => &self.subscription_fields,
        };
        map.get(field).map(String::as_str)
    }

    /// Base return type of `field` on `parent_type`.
    #[must_use]
    pub fn field_return_type(&self, parent_type: &str, field: &str) -> Option<&str> {
        self.type_fields
            .get(parent_type)?
            .get(field)
            .map(|info| info.return_type.as_str())
    }

    /// Entity declaration for a typename.
    #[must_use]
    pub fn entity(&self, typename: &str) -> Option<&EntityDecl> {
        self.entities.get(typename)
    }
}

fn is_federation_machinery(name: &str) -> bool {
    name == "_Service" || name.starts_with("__")
}

fn has_directive(object: &ObjectType<'_, String>, name: &str) -> bool {
    object.directives.iter().any(|d| d.name == name)
}

fn has_field_directive(field: &graphql_parser::schema::Field<'_, String>, name: &str) -> bool {
    field.directives.iter().any(|d| d.name == name)
}

fn key_fields(object: &ObjectType<'_, String>) -> Option<Vec<String>> {
    let key = object.directives.iter().find(|d| d.name == "key")?;
    let fields = key.arguments.iter().find_map(|(name, value)| {
        if name == "fields" {
            if let graphql_parser::schema::Value::String(s) = value {
                return Some(s.clone());
            }
        }
        None
    })?;
    Some(fields.split_whitespace().map(ToString::to_string).collect())
}

fn base_type_name(ty: &Type<'_, String>) -> String {
    match ty {
        Type::NamedType(name) => name.clone(),
        Type::ListType(inner) | Type::NonNullType(inner) => base_type_name(inner),
    }
}

/// Byte-comparable shape of an object type: its printed fields.
fn shape_of(object: &ObjectType<'_, String>) -> String {
    object
        .fields
        .iter()
        .map(|field| format!("{}: {}", field.name, field.field_type))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use devmesh_graphql::OperationKind;

    const GIT_SDL: &str = r#"
        type Query { repoAgentHealth: ServiceHealth! repository(path: String!): Repository }
        type Mutation { hierarchicalCommit(message: String!): CommitResult! }
        type ServiceHealth @shareable { healthy: Boolean! service: String! timestamp: String! }
        type Repository @key(fields: "path") { path: String! branch: String! }
        type CommitResult { success: Boolean! }
    "#;

    const AGENT_SDL: &str = r#"
        type Query { claudeHealth: ServiceHealth! agentSession(id: ID!): AgentSession }
        type Subscription { commandOutput(sessionId: ID!): CommandOutput! }
        type ServiceHealth @shareable { healthy: Boolean! service: String! timestamp: String! }
        type AgentSession @key(fields: "id") { id: ID! status: String! }
        type CommandOutput { content: String! }
        type Repository @key(fields: "path") @extends { path: String! @external recentRuns: [AgentSession!]! }
    "#;

    fn inputs() -> Vec<(String, String)> {
        vec![
            ("git".to_string(), GIT_SDL.to_string()),
            ("claude-agent".to_string(), AGENT_SDL.to_string()),
        ]
    }

    #[test]
    fn test_root_field_ownership() {
        let graph = Supergraph::compose(&inputs()).unwrap();
        assert_eq!(graph.owner_of(OperationKind::Query, "repoAgentHealth"), Some("git"));
        assert_eq!(graph.owner_of(OperationKind::Query, "claudeHealth"), Some("claude-agent"));
        assert_eq!(
            graph.owner_of(OperationKind::Mutation, "hierarchicalCommit"),
            Some("git")
        );
        assert_eq!(
            graph.owner_of(OperationKind::Subscription, "commandOutput"),
            Some("claude-agent")
        );
        assert_eq!(graph.owner_of(OperationKind::Query, "nope"), None);
    }

    #[test]
    fn test_entity_ownership_and_extension() {
        let graph = Supergraph::compose(&inputs()).unwrap();
        let repo = graph.entity("Repository").unwrap();
        assert_eq!(repo.owner, "git");
        assert_eq!(repo.keys, vec!["path".to_string()]);
        assert_eq!(
            repo.extenders.get("recentRuns").map(String::as_str),
            Some("claude-agent")
        );

        let session = graph.entity("AgentSession").unwrap();
        assert_eq!(session.owner, "claude-agent");
    }

    #[test]
    fn test_field_return_types() {
        let graph = Supergraph::compose(&inputs()).unwrap();
        assert_eq!(
            graph.field_return_type("Query", "repository"),
            Some("Repository")
        );
        assert_eq!(
            graph.field_return_type("Repository", "recentRuns"),
            Some("AgentSession")
        );
    }

    #[test]
    fn test_duplicate_root_field_rejected() {
        let dup = vec![
            ("a".to_string(), "type Query { health: String }".to_string()),
            ("b".to_string(), "type Query { health: String }".to_string()),
        ];
        let err = Supergraph::compose(&dup).unwrap_err();
        assert!(err.to_string().contains("declared by both"));
    }

    #[test]
    fn test_unshareable_duplicate_type_rejected() {
        let dup = vec![
            (
                "a".to_string(),
                "type Query { x: Health } type Health { ok: Boolean }".to_string(),
            ),
            (
                "b".to_string(),
                "type Query { y: Health } type Health { ok: Boolean }".to_string(),
            ),
        ];
        let err = Supergraph::compose(&dup).unwrap_err();
        assert!(err.to_string().contains("@shareable"));
    }

    #[test]
    fn test_shareable_shape_mismatch_rejected() {
        let dup = vec![
            (
                "a".to_string(),
                "type Query { x: Health } type Health @shareable { ok: Boolean }".to_string(),
            ),
            (
                "b".to_string(),
                "type Query { y: Health } type Health @shareable { ok: String }".to_string(),
            ),
        ];
        let err = Supergraph::compose(&dup).unwrap_err();
        assert!(err.to_string().contains("differs"));
    }

    #[test]
    fn test_extension_without_owner_rejected() {
        let orphan = vec![(
            "a".to_string(),
            r#"type Query { x: String } type Ghost @key(fields: "id") @extends { id: ID! @external name: String }"#
                .to_string(),
        )];
        let err = Supergraph::compose(&orphan).unwrap_err();
        assert!(err.to_string().contains("no subgraph owns it"));
    }

    #[test]
    fn test_invalid_sdl_rejected() {
        let broken = vec![("a".to_string(), "type Query {".to_string())];
        let err = Supergraph::compose(&broken).unwrap_err();
        assert_eq!(err.error_code(), "INTERNAL_SERVER_ERROR");
        assert!(err.to_string().contains("does not parse"));
    }
}
