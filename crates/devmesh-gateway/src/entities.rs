//! Entity routing: resolve cross-subgraph references via `_entities`.
//!
//! After the per-subgraph responses merge, extension fields on entity
//! values are still null (their owner cannot resolve them). This pass
//! walks the merged data alongside the client's selection tree,
//! collects unresolved extension fields, batches one
//! `_entities(representations:)` query per contributing subgraph
//! (deduplicating identical references, preserving index alignment),
//! and patches the results back in place. The pass repeats up to the
//! configured depth bound so entities reachable through other entities
//! also resolve.

use std::collections::HashMap;

use devmesh_error::Result;
use devmesh_graphql::projection::{print_selections, OwnedSelection};
use devmesh_graphql::request::WireError;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::executor::SubgraphClient;
use crate::supergraph::Supergraph;

/// Where a patch lands in the merged data.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum PathSeg {
    Key(String),
    Index(usize),
}

/// One unresolved extension field occurrence.
#[derive(Debug)]
struct PendingField {
    /// Path to the owning object in the merged data.
    object_path: Vec<PathSeg>,
    /// Entity typename.
    typename: String,
    /// Key fields captured from the object.
    keys: Map<String, Value>,
    /// Contributing subgraph.
    subgraph: String,
    /// The selection to request and merge (field with sub-selections).
    selection: OwnedSelection,
}

/// Resolve extension fields in `data`, mutating it in place. Returns
/// errors for references that failed to resolve.
pub async fn resolve_extensions(
    supergraph: &Supergraph,
    client: &SubgraphClient,
    data: &mut Value,
    selections: &[OwnedSelection],
    max_depth: usize,
) -> Vec<WireError> {
    let mut errors = Vec::new();

    for _round in 0..max_depth.max(1) {
        let mut pending = Vec::new();
        collect(
            supergraph,
            data,
            selections,
            "Query",
            &mut Vec::new(),
            &mut pending,
        );
        if pending.is_empty() {
            break;
        }
        resolve_round(supergraph, client, data, pending, &mut errors).await;
    }

    errors
}

fn collect(
    supergraph: &Supergraph,
    value: &Value,
    selections: &[OwnedSelection],
    parent_type: &str,
    path: &mut Vec<PathSeg>,
    pending: &mut Vec<PendingField>,
) {
    match value {
        Value::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                path.push(PathSeg::Index(idx));
                collect(supergraph, item, selections, parent_type, path, pending);
                path.pop();
            }
        }
        Value::Object(obj) => {
            collect_object(supergraph, obj, selections, parent_type, path, pending);
        }
        _ => {}
    }
}

fn collect_object(
    supergraph: &Supergraph,
    obj: &Map<String, Value>,
    selections: &[OwnedSelection],
    parent_type: &str,
    path: &mut Vec<PathSeg>,
    pending: &mut Vec<PendingField>,
) {
    let entity = supergraph.entity(parent_type);

    for sel in selections {
        match sel {
            OwnedSelection::Field {
                name, selections, ..
            } => {
                let key = sel.key().unwrap_or(name).to_string();

                // An unresolved extension field on an entity value?
                if let Some(entity) = entity {
                    if let Some(extender) = entity.extenders.get(name) {
                        let current = obj.get(&key);
                        if current.is_none() || current == Some(&Value::Null) {
                            if let Some(keys) = capture_keys(obj, &entity.keys) {
                                pending.push(PendingField {
                                    object_path: path.clone(),
                                    typename: parent_type.to_string(),
                                    keys,
                                    subgraph: extender.clone(),
                                    selection: sel.clone(),
                                });
                            }
                            continue;
                        }
                    }
                }

                // Recurse into resolved children.
                if let Some(child) = obj.get(&key) {
                    if let Some(child_type) = supergraph.field_return_type(parent_type, name) {
                        let child_type = child_type.to_string();
                        path.push(PathSeg::Key(key));
                        collect(supergraph, child, selections, &child_type, path, pending);
                        path.pop();
                    }
                }
            }
            OwnedSelection::Fragment {
                type_condition,
                selections,
            } => {
                let context = type_condition
                    .as_deref()
                    .unwrap_or(parent_type)
                    .to_string();
                let applies = obj
                    .get("__typename")
                    .and_then(Value::as_str)
                    .is_none_or(|actual| actual == context || type_condition.is_none());
                if applies {
                    collect_object(supergraph, obj, selections, &context, path, pending);
                }
            }
        }
    }
}

fn capture_keys(obj: &Map<String, Value>, key_names: &[String]) -> Option<Map<String, Value>> {
    let mut keys = Map::new();
    for name in key_names {
        let value = obj.get(name)?;
        if value.is_null() {
            return None;
        }
        keys.insert(name.clone(), value.clone());
    }
    Some(keys)
}

async fn resolve_round(
    supergraph: &Supergraph,
    client: &SubgraphClient,
    data: &mut Value,
    pending: Vec<PendingField>,
    errors: &mut Vec<WireError>,
) {
    // Group work by contributing subgraph.
    let mut by_subgraph: HashMap<String, Vec<PendingField>> = HashMap::new();
    for item in pending {
        by_subgraph.entry(item.subgraph.clone()).or_default().push(item);
    }

    for (subgraph, work) in by_subgraph {
        // Deduplicate identical references, preserving first-seen
        // order; remember each work item's representation index.
        let mut representations: Vec<Value> = Vec::new();
        let mut rep_index: HashMap<String, usize> = HashMap::new();
        let mut item_reps: Vec<usize> = Vec::with_capacity(work.len());
        // Union of requested selections per typename.
        let mut selections_by_type: HashMap<String, Vec<OwnedSelection>> = HashMap::new();

        for item in &work {
            let rep_key = format!("{}:{}", item.typename, Value::Object(item.keys.clone()));
            let idx = *rep_index.entry(rep_key).or_insert_with(|| {
                let mut rep = item.keys.clone();
                rep.insert("__typename".to_string(), json!(item.typename));
                representations.push(Value::Object(rep));
                representations.len() - 1
            });
            item_reps.push(idx);

            let bucket = selections_by_type.entry(item.typename.clone()).or_default();
            if !bucket.contains(&item.selection) {
                bucket.push(item.selection.clone());
            }
        }

        let mut fragments = String::new();
        for (typename, selections) in &selections_by_type {
            fragments.push_str(&format!(
                "... on {typename} {{ __typename {} }} ",
                print_selections(selections)
            ));
        }
        let query = format!(
            "query($representations: [_Any!]!) {{ _entities(representations: $representations) {{ {fragments}}} }}"
        );

        debug!(
            subgraph = %subgraph,
            representations = representations.len(),
            "entity batch"
        );

        let mut variables = Map::new();
        variables.insert("representations".to_string(), Value::Array(representations));

        let entities = match fetch_entities(client, &subgraph, query, variables).await {
            Ok(entities) => entities,
            Err(err) => {
                errors.push(
                    WireError::from_error(&err)
                        .from_subgraph(subgraph.clone())
                        .at_path(vec![json!("_entities")]),
                );
                continue;
            }
        };

        for (item, rep_idx) in work.iter().zip(item_reps) {
            let resolved = entities.get(rep_idx).cloned().unwrap_or(Value::Null);
            let field_key = item
                .selection
                .key()
                .unwrap_or_default()
                .to_string();
            let value = match &resolved {
                Value::Object(entity_obj) => {
                    entity_obj.get(&field_key).cloned().unwrap_or(Value::Null)
                }
                _ => Value::Null,
            };
            patch(data, &item.object_path, &field_key, value);
        }
    }
}

async fn fetch_entities(
    client: &SubgraphClient,
    subgraph: &str,
    query: String,
    variables: Map<String, Value>,
) -> Result<Vec<Value>> {
    let response = client.call(subgraph, &query, variables).await?;
    Ok(response
        .data
        .as_ref()
        .and_then(|d| d.get("_entities"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default())
}

fn patch(data: &mut Value, object_path: &[PathSeg], field_key: &str, value: Value) {
    let mut cursor = data;
    for seg in object_path {
        cursor = match seg {
            PathSeg::Key(key) => match cursor.get_mut(key) {
                Some(next) => next,
                None => return,
            },
            PathSeg::Index(idx) => match cursor.get_mut(idx) {
                Some(next) => next,
                None => return,
            },
        };
    }
    if let Value::Object(obj) = cursor {
        obj.insert(field_key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capture_keys_requires_all_present() {
        let mut obj = Map::new();
        obj.insert("path".to_string(), json!("/a"));
        assert!(capture_keys(&obj, &["path".to_string()]).is_some());
        assert!(capture_keys(&obj, &["path".to_string(), "missing".to_string()]).is_none());

        obj.insert("nullkey".to_string(), Value::Null);
        assert!(capture_keys(&obj, &["nullkey".to_string()]).is_none());
    }

    #[test]
    fn test_patch_navigates_arrays_and_objects() {
        let mut data = json!({"repos": [{"path": "/a"}, {"path": "/b"}]});
        patch(
            &mut data,
            &[PathSeg::Key("repos".to_string()), PathSeg::Index(1)],
            "recentRuns",
            json!([{"id": "r1"}]),
        );
        assert_eq!(data["repos"][1]["recentRuns"][0]["id"], json!("r1"));
        assert!(data["repos"][0].get("recentRuns").is_none());
    }

    #[test]
    fn test_patch_on_missing_path_is_noop() {
        let mut data = json!({"a": 1});
        patch(
            &mut data,
            &[PathSeg::Key("missing".to_string())],
            "x",
            json!(2),
        );
        assert_eq!(data, json!({"a": 1}));
    }
}
