//! The cache tree: nodes keyed by resource path, path resolution and the
//! own-cache versus shared-cache decision

use crate::node::{CacheNode, CacheNodeKind, NodeData, NodeId, drill_down_mut};
use crate::query::QueryOptions;
use odata_trait::{MetadataProvider, Multiplicity, ODataResult, ResourcePath, Segment, key_predicate};
use serde_json::{Map, Value};
use std::collections::HashMap;
use tracing::debug;

/// Where a path lands in the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub node: NodeId,
    /// Row predicate when the node is a collection and the path addresses a row
    pub row: Option<String>,
    /// Remaining segments below the node (or row)
    pub rest: Vec<Segment>,
}

#[derive(Default)]
pub struct CacheTree {
    nodes: HashMap<NodeId, CacheNode>,
    by_path: HashMap<ResourcePath, NodeId>,
    next_id: NodeId,
}

impl CacheTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an owner for the node at `path`, creating the node on first use.
    /// The owner's query options are merged into the node's options.
    pub fn attach(&mut self, kind: CacheNodeKind, path: &ResourcePath, query: &QueryOptions) -> NodeId {
        if let Some(id) = self.by_path.get(path).copied() {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.owners += 1;
                node.query.merge(query);
                if query.has_row_options() {
                    node.query.filter = node.query.filter.take().or_else(|| query.filter.clone());
                    node.query.orderby = node.query.orderby.take().or_else(|| query.orderby.clone());
                    node.query.count |= query.count;
                }
                return id;
            }
        }
        self.next_id += 1;
        let id = self.next_id;
        debug!("Created {:?} cache node {} for {}", kind, id, path);
        self.nodes
            .insert(id, CacheNode::new(id, kind, path.clone(), query.clone()));
        self.by_path.insert(path.clone(), id);
        id
    }

    /// Drops one owner; the node is removed with its last owner
    pub fn release(&mut self, id: NodeId) -> Option<CacheNode> {
        let node = self.nodes.get_mut(&id)?;
        node.owners = node.owners.saturating_sub(1);
        if node.owners > 0 {
            return None;
        }
        self.remove(id)
    }

    pub fn remove(&mut self, id: NodeId) -> Option<CacheNode> {
        let node = self.nodes.remove(&id)?;
        self.by_path.remove(&node.path);
        debug!("Removed cache node {} for {}", id, node.path);
        Some(node)
    }

    pub fn get(&self, id: NodeId) -> Option<&CacheNode> {
        self.nodes.get(&id)
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut CacheNode> {
        self.nodes.get_mut(&id)
    }

    pub fn node_at(&self, path: &ResourcePath) -> Option<NodeId> {
        self.by_path.get(path).copied()
    }

    pub fn is_alive(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.by_path.clear();
    }

    /// Every place the path lands, most specific node first
    pub fn locate_all(&self, path: &ResourcePath) -> Vec<Location> {
        let mut locations = Vec::new();
        for len in (1..=path.len()).rev() {
            let prefix = path.prefix(len);
            let rest = path.segments()[len..].to_vec();
            if let Some(id) = self.node_at(&prefix) {
                locations.push(Location {
                    node: id,
                    row: None,
                    rest: rest.clone(),
                });
            }
            let Some(predicate) = prefix.last().and_then(|segment| segment.predicate.clone()) else {
                continue;
            };
            if let Some(id) = self.node_at(&prefix.without_last_predicate()) {
                if self.nodes.get(&id).is_some_and(CacheNode::is_collection) {
                    locations.push(Location {
                        node: id,
                        row: Some(predicate),
                        rest,
                    });
                }
            }
        }
        locations
    }

    /// Most specific location of a path
    pub fn resolve(&self, path: &ResourcePath) -> Option<Location> {
        self.locate_all(path).into_iter().next()
    }

    /// Nodes strictly below `path`
    pub fn descendants(&self, path: &ResourcePath) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|node| path.is_ancestor_of(&node.path))
            .map(|node| node.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Removes every node at or below `path`
    pub fn remove_subtree(&mut self, path: &ResourcePath) -> Vec<CacheNode> {
        let ids: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|node| node.path.starts_with(path))
            .map(|node| node.id)
            .collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Re-keys nodes below `old_prefix` after a transient predicate was replaced
    pub fn rename(&mut self, old_prefix: &ResourcePath, new_prefix: &ResourcePath) {
        let moved: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|node| node.path.starts_with(old_prefix))
            .map(|node| node.id)
            .collect();
        for id in moved {
            if let Some(node) = self.nodes.get_mut(&id) {
                if let Some(path) = node.path.rebase(old_prefix, new_prefix) {
                    self.by_path.remove(&node.path);
                    debug!("Renamed cache node {} from {} to {}", id, node.path, path);
                    node.path = path.clone();
                    self.by_path.insert(path, id);
                }
            }
        }
    }

    /// Entity data at a location, if cached
    pub fn entity_mut(
        &mut self,
        location: &Location,
        metadata: &dyn MetadataProvider,
    ) -> Option<&mut Map<String, Value>> {
        let node = self.nodes.get_mut(&location.node)?;
        let meta_base = node.path.meta_path();
        let root: &mut Map<String, Value> = match (&mut node.data, &location.row) {
            (NodeData::Entity(Some(entity)), None) => entity,
            (NodeData::Collection(collection), Some(predicate)) => &mut collection.row_mut(predicate)?.data,
            _ => return None,
        };
        if location.rest.is_empty() {
            return Some(root);
        }
        let (first, rest) = location.rest.split_first()?;
        let mut value = root.get_mut(&first.name)?;
        let meta = format!("{}/{}", meta_base, first.name);
        if let Some(predicate) = &first.predicate {
            let keys = metadata.resolve_key_properties(&meta).ok()?;
            value = value.as_array_mut()?.iter_mut().find(|element| {
                element
                    .as_object()
                    .and_then(|object| key_predicate(&keys, object))
                    .as_deref()
                    == Some(predicate.as_str())
            })?;
        }
        if !rest.is_empty() {
            value = drill_down_mut(value, rest, &meta, metadata)?;
        }
        value.as_object_mut()
    }
}

/// Decides whether a binding at `relative` below a parent needs its own cache.
///
/// Own requests are honored; collection-valued navigation with row options
/// (filter, order, count) always gets its own cache because `$expand` cannot
/// express paging. Everything else shares the parent's cache.
pub fn needs_own_cache(
    metadata: &dyn MetadataProvider,
    parent: &ResourcePath,
    relative: &str,
    query: &QueryOptions,
    own_request: bool,
) -> ODataResult<bool> {
    if own_request {
        return Ok(true);
    }
    let path = parent.join(relative)?;
    let multiplicity = metadata.resolve_navigation_multiplicity(&path.meta_path())?;
    Ok(multiplicity == Some(Multiplicity::Many) && query.has_row_options())
}

/// Node kind for a resource, from metadata
pub fn kind_for_path(metadata: &dyn MetadataProvider, path: &ResourcePath) -> ODataResult<CacheNodeKind> {
    let has_predicate = path.last().is_some_and(|segment| segment.predicate.is_some());
    Ok(match metadata.resolve_navigation_multiplicity(&path.meta_path())? {
        Some(Multiplicity::Many) if !has_predicate => CacheNodeKind::Collection,
        Some(_) => CacheNodeKind::Entity,
        None => CacheNodeKind::Value,
    })
}
