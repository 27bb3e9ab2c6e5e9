//! Cache nodes: the unit of cached data for one resource path

use crate::constants::ETAG_ANNOTATION;
use crate::query::QueryOptions;
use futures::future::{BoxFuture, Shared};
use odata_trait::{MetadataProvider, ODataResult, ResourcePath, Segment, key_predicate};
use serde_json::{Map, Value};
use tracing::warn;

pub type NodeId = u64;

/// Completion of an in-flight read, shared by every reader waiting for it
pub type SharedRead = Shared<BoxFuture<'static, ODataResult<()>>>;

/// Decided from metadata when the node is created, never from payload shape
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheNodeKind {
    Entity,
    Collection,
    OperationResult,
    /// Single primitive or complex property read as `{"value": ...}`
    Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowState {
    Persisted,
    /// Created on the client; POST not sent yet (or failed and waiting for retry)
    Transient {
        uid: String,
        group_id: String,
        request_id: Option<u64>,
    },
    /// POST is in flight
    PendingPost { uid: String },
    /// Persisted through a create; stays in the created area until refresh
    Created,
}

#[derive(Debug, Clone)]
pub struct Row {
    pub predicate: String,
    pub data: Map<String, Value>,
    pub state: RowState,
    /// Properties read for this row on top of the collection's options
    pub extra: Option<QueryOptions>,
    /// Transient predicate kept resolvable after the key became known
    pub alias: Option<String>,
}

impl Row {
    pub fn persisted(predicate: String, data: Map<String, Value>) -> Self {
        Self {
            predicate,
            data,
            state: RowState::Persisted,
            extra: None,
            alias: None,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self.state,
            RowState::Transient { .. } | RowState::PendingPost { .. }
        )
    }

    pub fn matches(&self, predicate: &str) -> bool {
        self.predicate == predicate || self.alias.as_deref() == Some(predicate)
    }

    pub fn etag(&self) -> Option<&str> {
        self.data.get(ETAG_ANNOTATION).and_then(Value::as_str)
    }
}

/// Rows of a collection in visible order: created rows (newest first),
/// server rows by server index, rows created at the end
#[derive(Debug, Clone, Default)]
pub struct CollectionData {
    pub created: Vec<Row>,
    pub server: Vec<Option<Row>>,
    pub created_at_end: Vec<Row>,
    pub server_count: Option<usize>,
}

impl CollectionData {
    pub fn visible_len(&self) -> usize {
        self.created.len() + self.server.len() + self.created_at_end.len()
    }

    /// `$count` corrected by the rows created on the client
    pub fn count(&self) -> Option<usize> {
        self.server_count
            .map(|count| count + self.created.len() + self.created_at_end.len())
    }

    pub fn is_complete(&self) -> bool {
        self.server_count
            .is_some_and(|count| self.server.len() >= count && self.server.iter().all(Option::is_some))
    }

    pub fn rows(&self) -> impl Iterator<Item = &Row> {
        self.created
            .iter()
            .chain(self.server.iter().flatten())
            .chain(self.created_at_end.iter())
    }

    pub fn rows_mut(&mut self) -> impl Iterator<Item = &mut Row> {
        self.created
            .iter_mut()
            .chain(self.server.iter_mut().flatten())
            .chain(self.created_at_end.iter_mut())
    }

    pub fn row(&self, predicate: &str) -> Option<&Row> {
        self.rows().find(|row| row.matches(predicate))
    }

    pub fn row_mut(&mut self, predicate: &str) -> Option<&mut Row> {
        self.rows_mut().find(|row| row.matches(predicate))
    }

    /// Row at a visible index
    pub fn row_at(&self, index: usize) -> Option<&Row> {
        let front = self.created.len();
        if index < front {
            return self.created.get(index);
        }
        let index = index - front;
        if index < self.server.len() {
            return self.server[index].as_ref();
        }
        self.created_at_end.get(index - self.server.len())
    }

    /// Removes a row by identity; the server count shrinks for server rows
    pub fn remove(&mut self, predicate: &str) -> Option<Row> {
        if let Some(index) = self.created.iter().position(|row| row.matches(predicate)) {
            return Some(self.created.remove(index));
        }
        if let Some(index) = self.created_at_end.iter().position(|row| row.matches(predicate)) {
            return Some(self.created_at_end.remove(index));
        }
        let index = self
            .server
            .iter()
            .position(|row| row.as_ref().is_some_and(|row| row.matches(predicate)))?;
        if let Some(count) = &mut self.server_count {
            *count = count.saturating_sub(1);
        }
        self.server.remove(index)
    }

    /// Server rows still missing for the visible range, as `($skip, $top)`
    pub fn missing_server_range(&self, start: usize, length: usize) -> Option<(usize, usize)> {
        let front = self.created.len();
        let mut from = start.saturating_sub(front);
        let mut to = start.saturating_add(length).saturating_sub(front);
        if let Some(count) = self.server_count {
            to = to.min(count);
        }
        while from < to && self.server.get(from).is_some_and(Option::is_some) {
            from += 1;
        }
        while to > from && self.server.get(to - 1).is_some_and(Option::is_some) {
            to -= 1;
        }
        if from >= to { None } else { Some((from, to - from)) }
    }

    /// Stores rows read with `$skip`
    pub fn store_server_rows(&mut self, skip: usize, rows: Vec<Row>) {
        let end = skip + rows.len();
        if self.server.len() < end {
            self.server.resize(end, None);
        }
        for (offset, row) in rows.into_iter().enumerate() {
            self.server[skip + offset] = Some(row);
        }
    }

    pub fn clear_server_rows(&mut self) {
        self.server.clear();
        self.server_count = None;
    }
}

#[derive(Debug, Clone)]
pub enum NodeData {
    Entity(Option<Map<String, Value>>),
    Collection(CollectionData),
    Value(Option<Value>),
}

impl NodeData {
    pub fn for_kind(kind: CacheNodeKind) -> Self {
        match kind {
            CacheNodeKind::Entity => NodeData::Entity(None),
            CacheNodeKind::Collection => NodeData::Collection(CollectionData::default()),
            CacheNodeKind::OperationResult | CacheNodeKind::Value => NodeData::Value(None),
        }
    }
}

/// Read in flight for a node (or one of its rows)
#[derive(Clone)]
pub struct PendingRead {
    pub id: u64,
    pub row: Option<String>,
    /// `($skip, $top)` of a collection page read
    pub range: Option<(usize, usize)>,
    pub query: QueryOptions,
    pub done: SharedRead,
}

pub struct CacheNode {
    pub id: NodeId,
    pub kind: CacheNodeKind,
    pub path: ResourcePath,
    /// Requirements of all bindings attached to this node
    pub query: QueryOptions,
    /// What the cached data contains; `None` until the first response
    pub fetched: Option<QueryOptions>,
    pub data: NodeData,
    /// Bumped on refresh; responses for older generations are dropped
    pub generation: u64,
    pub owners: usize,
    pub pending_reads: Vec<PendingRead>,
}

impl CacheNode {
    pub fn new(id: NodeId, kind: CacheNodeKind, path: ResourcePath, query: QueryOptions) -> Self {
        Self {
            id,
            kind,
            path,
            query,
            fetched: None,
            data: NodeData::for_kind(kind),
            generation: 0,
            owners: 1,
            pending_reads: Vec::new(),
        }
    }

    pub fn collection(&self) -> Option<&CollectionData> {
        match &self.data {
            NodeData::Collection(collection) => Some(collection),
            _ => None,
        }
    }

    pub fn collection_mut(&mut self) -> Option<&mut CollectionData> {
        match &mut self.data {
            NodeData::Collection(collection) => Some(collection),
            _ => None,
        }
    }

    /// True if `path` (relative to the node or a row) is already cached
    pub fn covers(&self, row: Option<&str>, path: &str) -> bool {
        if self.fetched.as_ref().is_some_and(|fetched| fetched.covers(path)) {
            return true;
        }
        match (row, self.collection()) {
            (Some(predicate), Some(collection)) => collection
                .row(predicate)
                .is_some_and(|row| {
                    row.is_transient()
                        || row.extra.as_ref().is_some_and(|extra| extra.covers(path))
                }),
            _ => false,
        }
    }

    /// Drops cached data so that the next read goes to the server.
    /// Transient rows survive; they have no server counterpart to re-read.
    pub fn invalidate(&mut self) {
        self.generation += 1;
        self.fetched = None;
        self.pending_reads.clear();
        match &mut self.data {
            NodeData::Collection(collection) => {
                collection.clear_server_rows();
                collection.created.retain(Row::is_transient);
                collection.created_at_end.retain(Row::is_transient);
            }
            other => *other = NodeData::for_kind(self.kind),
        }
    }

    pub fn is_collection(&self) -> bool {
        self.kind == CacheNodeKind::Collection
    }
}

// =============================================================================
// JSON helpers
// =============================================================================

/// Predicate of an element of an expanded collection
fn element_predicate(
    element: &Value,
    meta_path: &str,
    metadata: &dyn MetadataProvider,
) -> Option<String> {
    let keys = metadata.resolve_key_properties(meta_path).ok()?;
    key_predicate(&keys, element.as_object()?)
}

/// Resolves `segments` below `value`; `Err(segment)` names the segment that
/// does not exist in the cached data
pub fn drill_down<'a>(
    value: &'a Value,
    segments: &[Segment],
    meta_base: &str,
    metadata: &dyn MetadataProvider,
) -> Result<&'a Value, String> {
    let mut current = value;
    let mut meta_path = meta_base.to_string();
    for segment in segments {
        meta_path = format!("{}/{}", meta_path, segment.name);
        current = current
            .as_object()
            .and_then(|object| object.get(&segment.name))
            .ok_or_else(|| segment.name.clone())?;
        if let Some(predicate) = &segment.predicate {
            current = current
                .as_array()
                .and_then(|elements| {
                    elements.iter().find(|element| {
                        element_predicate(element, &meta_path, metadata).as_deref()
                            == Some(predicate.as_str())
                    })
                })
                .ok_or_else(|| segment.to_string())?;
        }
    }
    Ok(current)
}

/// `drill_down` starting at an entity's property map
pub fn drill_down_entity<'a>(
    entity: &'a Map<String, Value>,
    segments: &[Segment],
    meta_base: &str,
    metadata: &dyn MetadataProvider,
) -> Result<&'a Value, String> {
    let Some((first, rest)) = segments.split_first() else {
        return Err(String::new());
    };
    let meta_path = format!("{}/{}", meta_base, first.name);
    let mut value = entity.get(&first.name).ok_or_else(|| first.name.clone())?;
    if let Some(predicate) = &first.predicate {
        value = value
            .as_array()
            .and_then(|elements| {
                elements.iter().find(|element| {
                    element_predicate(element, &meta_path, metadata).as_deref() == Some(predicate.as_str())
                })
            })
            .ok_or_else(|| first.to_string())?;
    }
    drill_down(value, rest, &meta_path, metadata)
}

pub fn drill_down_mut<'a>(
    value: &'a mut Value,
    segments: &[Segment],
    meta_base: &str,
    metadata: &dyn MetadataProvider,
) -> Option<&'a mut Value> {
    let mut current = value;
    let mut meta_path = meta_base.to_string();
    for segment in segments {
        meta_path = format!("{}/{}", meta_path, segment.name);
        current = current.as_object_mut()?.get_mut(&segment.name)?;
        if let Some(predicate) = &segment.predicate {
            current = current.as_array_mut()?.iter_mut().find(|element| {
                element_predicate(element, &meta_path, metadata).as_deref() == Some(predicate.as_str())
            })?;
        }
    }
    Some(current)
}

/// Reads a `/`-separated structural property path of an entity
pub fn get_property<'a>(entity: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('/');
    let mut current = entity.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// Writes a property path, creating intermediate complex values; returns the old value
pub fn set_property(entity: &mut Map<String, Value>, path: &str, value: Value) -> Option<Value> {
    let parts: Vec<&str> = path.split('/').collect();
    let (last, parents) = parts.split_last()?;
    let mut current = entity;
    for part in parents {
        let next = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !next.is_object() {
            *next = Value::Object(Map::new());
        }
        current = next.as_object_mut()?;
    }
    current.insert(last.to_string(), value)
}

/// Builds a nested PATCH body from flat property paths
pub fn nest_properties(flat: &Map<String, Value>) -> Map<String, Value> {
    let mut body = Map::new();
    for (path, value) in flat {
        set_property(&mut body, path, value.clone());
    }
    body
}

/// Deep-merges `source` into `target` and returns the changed property paths.
///
/// Complex values are merged key by key; everything else, including arrays of
/// expanded rows, is replaced. Paths for which `keep` answers true keep their
/// local value.
pub fn merge_entity(
    target: &mut Map<String, Value>,
    source: &Map<String, Value>,
    keep: &dyn Fn(&str) -> bool,
) -> Vec<String> {
    let mut changed = Vec::new();
    merge_into(target, source, "", keep, &mut changed);
    changed
}

fn merge_into(
    target: &mut Map<String, Value>,
    source: &Map<String, Value>,
    base: &str,
    keep: &dyn Fn(&str) -> bool,
    changed: &mut Vec<String>,
) {
    for (key, value) in source {
        let path = if base.is_empty() {
            key.clone()
        } else {
            format!("{}/{}", base, key)
        };
        if keep(&path) {
            continue;
        }
        let nested = matches!(
            (target.get(key), value),
            (Some(Value::Object(_)), Value::Object(incoming))
                if !key.starts_with('@') && !is_entity_like(incoming)
        );
        if nested {
            if let (Some(Value::Object(existing)), Value::Object(incoming)) =
                (target.get_mut(key), value)
            {
                merge_into(existing, incoming, &path, keep, changed);
            }
            continue;
        }
        if target.get(key) == Some(value) {
            continue;
        }
        target.insert(key.clone(), value.clone());
        changed.push(path);
    }
}

/// Expanded single-valued navigation properties carry their own ETag
fn is_entity_like(object: &Map<String, Value>) -> bool {
    object.contains_key(ETAG_ANNOTATION)
}

/// Logs a failed drill-down; never fatal
pub fn log_drill_down_failure(path: &str, segment: &str) {
    warn!("Failed to drill-down into {}, invalid segment: {}", path, segment);
}

#[cfg(test)]
mod tests {
    use super::*;
    use odata_trait::{Multiplicity, ODataResult};
    use serde_json::json;

    struct Keys;

    impl MetadataProvider for Keys {
        fn resolve_navigation_multiplicity(&self, _meta_path: &str) -> ODataResult<Option<Multiplicity>> {
            Ok(None)
        }

        fn resolve_key_properties(&self, meta_path: &str) -> ODataResult<Vec<String>> {
            Ok(match meta_path {
                "/SalesOrderList/SO_2_SOITEM" => vec!["ItemPosition".to_string()],
                _ => vec!["SalesOrderID".to_string()],
            })
        }
    }

    fn row(id: &str) -> Row {
        Row::persisted(
            format!("('{}')", id),
            json!({ "SalesOrderID": id }).as_object().cloned().unwrap(),
        )
    }

    #[test]
    fn test_drill_down_into_expanded_collection() {
        let order = json!({
            "SalesOrderID": "42",
            "SO_2_SOITEM": [
                {"ItemPosition": "10", "Quantity": 1},
                {"ItemPosition": "20", "Quantity": 2}
            ]
        });
        let segments = ResourcePath::parse("SO_2_SOITEM('20')/Quantity").unwrap();
        let value = drill_down(&order, segments.segments(), "/SalesOrderList", &Keys).unwrap();
        assert_eq!(value, &json!(2));

        let missing = ResourcePath::parse("SO_2_SOITEM('30')/Quantity").unwrap();
        assert_eq!(
            drill_down(&order, missing.segments(), "/SalesOrderList", &Keys),
            Err("SO_2_SOITEM('30')".to_string())
        );
    }

    #[test]
    fn test_merge_keeps_siblings_and_pending_values() {
        let mut entity = json!({"Note": "local", "GrossAmount": "1", "Address": {"City": "A", "Street": "S"}})
            .as_object()
            .cloned()
            .unwrap();
        let incoming = json!({"Note": "server", "GrossAmount": "2", "Address": {"City": "B"}})
            .as_object()
            .cloned()
            .unwrap();

        let changed = merge_entity(&mut entity, &incoming, &|path| path == "Note");

        assert_eq!(entity["Note"], "local");
        assert_eq!(entity["GrossAmount"], "2");
        assert_eq!(entity["Address"], json!({"City": "B", "Street": "S"}));
        assert_eq!(changed, vec!["Address/City".to_string(), "GrossAmount".to_string()]);
    }

    #[test]
    fn test_set_property_creates_complex_values() {
        let mut entity = Map::new();
        assert_eq!(set_property(&mut entity, "Address/City", json!("Walldorf")), None);
        assert_eq!(get_property(&entity, "Address/City"), Some(&json!("Walldorf")));

        let flat = json!({"Note": "n", "Address/City": "c"}).as_object().cloned().unwrap();
        assert_eq!(
            Value::Object(nest_properties(&flat)),
            json!({"Note": "n", "Address": {"City": "c"}})
        );
    }

    #[test]
    fn test_collection_identity_and_gaps() {
        let mut collection = CollectionData::default();
        collection.store_server_rows(0, vec![row("1"), row("2"), row("3")]);
        collection.server_count = Some(10);
        collection.created.push(Row {
            predicate: "($uid=id-1)".to_string(),
            state: RowState::Transient {
                uid: "id-1".to_string(),
                group_id: "update".to_string(),
                request_id: None,
            },
            ..row("new")
        });

        assert_eq!(collection.count(), Some(11));
        assert_eq!(collection.row_at(0).unwrap().predicate, "($uid=id-1)");
        assert_eq!(collection.row_at(2).unwrap().predicate, "('2')");

        collection.remove("('2')");
        assert_eq!(collection.server_count, Some(9));
        assert_eq!(collection.row_at(2).unwrap().predicate, "('3')");
        assert_eq!(collection.missing_server_range(0, 4), Some((2, 1)));
        assert_eq!(collection.missing_server_range(0, 3), None);
    }

    #[test]
    fn test_open_ended_range() {
        let mut collection = CollectionData::default();
        collection.store_server_rows(0, vec![row("1"), row("2")]);
        assert_eq!(collection.missing_server_range(1, usize::MAX), Some((2, usize::MAX - 2)));

        collection.server_count = Some(2);
        assert_eq!(collection.missing_server_range(1, usize::MAX), None);
    }
}
