//! Reads: coverage checks, deduplicated GETs and paged collection reads

use crate::constants::{COUNT_ANNOTATION, VALUE_PROPERTY};
use crate::coordinator::{CacheCoordinator, CacheState, Properties, ready, receive};
use crate::node::{
    CacheNodeKind, NodeData, NodeId, PendingRead, Row, RowState, SharedRead, drill_down_entity,
    log_drill_down_failure, set_property,
};
use crate::query::{QueryOptions, append_query};
use crate::requestor::RequestSpec;
use futures::FutureExt;
use futures::future::BoxFuture;
use odata_trait::{ODataError, ODataResult, ResourcePath, Response, key_filter, key_predicate};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// One visible row of a collection
#[derive(Debug, Clone, PartialEq)]
pub struct RowSnapshot {
    pub path: ResourcePath,
    pub data: Map<String, Value>,
    pub transient: bool,
}

impl CacheCoordinator {
    /// Reads properties (relative paths such as `SO_2_BP/CompanyName`) of the
    /// entity at `path`. Resolves without a request if the cache covers them.
    pub fn read(&self, path: &str, properties: &[&str]) -> BoxFuture<'static, ODataResult<Properties>> {
        let path = match ResourcePath::parse(path) {
            Ok(path) => path,
            Err(e) => return ready(Err(e)),
        };
        let properties: Vec<String> = properties.iter().map(|p| p.to_string()).collect();
        let path = self.with_state(|state| state.canonical_path(&path));
        let waits = match self.with_state(|state| self.prepare_read(state, &path, &properties)) {
            Ok(waits) => waits,
            Err(e) => return ready(Err(e)),
        };
        if waits.is_empty() {
            debug!("Read of {} served from cache", path);
            return ready(Ok(self.with_state(|state| self.snapshot(state, &path, &properties))));
        }
        let coordinator = self.clone();
        async move {
            for wait in waits {
                wait.await?;
            }
            Ok(coordinator.with_state(|state| coordinator.snapshot(state, &path, &properties)))
        }
        .boxed()
    }

    /// Reads a single property; a path with its own `Value` cache is read as
    /// a property resource
    pub fn read_value(&self, path: &str) -> BoxFuture<'static, ODataResult<Option<Value>>> {
        let path = match ResourcePath::parse(path) {
            Ok(path) => path,
            Err(e) => return ready(Err(e)),
        };
        let own_value = self.with_state(|state| {
            state
                .tree
                .node_at(&path)
                .and_then(|id| state.tree.get(id))
                .is_some_and(|node| node.kind == CacheNodeKind::Value)
        });
        if own_value {
            return self
                .read(&path.to_string(), &[])
                .map(|result| result.map(|mut values| values.remove(VALUE_PROPERTY).flatten()))
                .boxed();
        }
        let (Some(parent), Some(last)) = (path.parent(), path.last()) else {
            return ready(Err(ODataError::validation("path", format!("{} is not a property path", path))));
        };
        if last.predicate.is_some() {
            return ready(Err(ODataError::validation("path", format!("{} is not a property path", path))));
        }
        let name = last.name.clone();
        self.read(&parent.to_string(), &[name.as_str()])
            .map(move |result| result.map(|mut values| values.remove(&name).flatten()))
            .boxed()
    }

    /// Visible rows `start..start + length` of a collection cache. Missing
    /// server rows are read with `$skip`/`$top` computed from what is loaded.
    pub fn read_range(
        &self,
        collection_path: &str,
        start: usize,
        length: usize,
    ) -> BoxFuture<'static, ODataResult<Vec<RowSnapshot>>> {
        let path = match ResourcePath::parse(collection_path) {
            Ok(path) => path,
            Err(e) => return ready(Err(e)),
        };
        let wait = match self.with_state(|state| self.prepare_range(state, &path, start, length, &self.read_group(None))) {
            Ok(wait) => wait,
            Err(e) => return ready(Err(e)),
        };
        let Some(wait) = wait else {
            return ready(Ok(self.with_state(|state| snapshot_rows(state, &path, start, length))));
        };
        let coordinator = self.clone();
        async move {
            wait.await?;
            Ok(coordinator.with_state(|state| snapshot_rows(state, &path, start, length)))
        }
        .boxed()
    }

    /// Server-side `$count` corrected by created rows, if known
    pub fn count(&self, collection_path: &str) -> ODataResult<Option<usize>> {
        let path = ResourcePath::parse(collection_path)?;
        Ok(self.with_state(|state| {
            state
                .tree
                .node_at(&path)
                .and_then(|id| state.tree.get(id))
                .and_then(|node| node.collection())
                .and_then(|collection| collection.count())
        }))
    }

    fn prepare_read(
        &self,
        state: &mut CacheState,
        path: &ResourcePath,
        properties: &[String],
    ) -> ODataResult<Vec<SharedRead>> {
        Self::ensure_alive(state)?;
        let location = state
            .tree
            .resolve(path)
            .ok_or_else(|| ODataError::validation("path", format!("nothing is cached for {}", path)))?;
        let node = state
            .tree
            .get(location.node)
            .ok_or_else(|| ODataError::internal(format!("cache node {} vanished", location.node)))?;

        match node.kind {
            CacheNodeKind::OperationResult => return Ok(Vec::new()),
            CacheNodeKind::Value => {
                if node.fetched.is_some() {
                    return Ok(Vec::new());
                }
                if let Some(pending) = node.pending_reads.first() {
                    return Ok(vec![pending.done.clone()]);
                }
                let node_id = node.id;
                return Ok(vec![self.start_value_read(state, node_id, &self.read_group(None))]);
            }
            CacheNodeKind::Collection if location.row.is_none() && location.rest.is_empty() => {
                return Err(ODataError::validation(
                    "path",
                    format!("{} is a collection; read it with read_range", path),
                ));
            }
            _ => {}
        }
        if let Some(predicate) = &location.row {
            if node.collection().and_then(|c| c.row(predicate)).is_none() {
                return Ok(Vec::new());
            }
        }

        let prefix = location
            .rest
            .iter()
            .map(|segment| segment.name.as_str())
            .collect::<Vec<_>>()
            .join("/");
        let missing: Vec<String> = properties
            .iter()
            .map(|property| {
                if prefix.is_empty() {
                    property.clone()
                } else {
                    format!("{}/{}", prefix, property)
                }
            })
            .filter(|property| !node.covers(location.row.as_deref(), property))
            .collect();
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        let mut waits: Vec<SharedRead> = Vec::new();
        let mut joined: Vec<u64> = Vec::new();
        let mut unserved = Vec::new();
        for property in missing {
            let pending = node
                .pending_reads
                .iter()
                .find(|read| read.range.is_none() && read.row == location.row && read.query.covers(&property));
            match pending {
                Some(read) => {
                    if !joined.contains(&read.id) {
                        debug!("Read of {} joins pending read {}", property, read.id);
                        joined.push(read.id);
                        waits.push(read.done.clone());
                    }
                }
                None => unserved.push(property),
            }
        }
        if unserved.is_empty() {
            return Ok(waits);
        }

        let meta_base = node.path.meta_path();
        let is_navigation = self.navigation_check(meta_base.clone());
        let mut query = QueryOptions::for_paths(&unserved, &*is_navigation);
        if location.row.is_none() && node.fetched.is_none() {
            query.merge(&node.query);
        }
        let keys = self.metadata().resolve_key_properties(&meta_base).unwrap_or_default();
        query.ensure_selected(&keys);
        let node_id = node.id;
        waits.push(self.start_entity_read(state, node_id, location.row.clone(), query, &self.read_group(None)));
        Ok(waits)
    }

    pub(crate) fn start_entity_read(
        &self,
        state: &mut CacheState,
        node_id: NodeId,
        row: Option<String>,
        query: QueryOptions,
        group_id: &str,
    ) -> SharedRead {
        let read_id = state.next_id();
        let Some(node) = state.tree.get_mut(node_id) else {
            return ready(Ok(())).shared();
        };
        let entity_path = match &row {
            Some(predicate) => node.path.with_predicate(predicate.clone()),
            None => node.path.clone(),
        };
        let generation = node.generation;
        let (sender, receiver) = oneshot::channel();
        let done = receive(receiver).shared();
        node.pending_reads.push(PendingRead {
            id: read_id,
            row,
            range: None,
            query: query.clone(),
            done: done.clone(),
        });

        let url = append_query(&entity_path.to_relative_url(), &query.to_query_string());
        let resource = entity_path.to_string();
        let weak = self.weak();
        self.inner.requestor.enqueue(
            group_id,
            RequestSpec::get(url, resource),
            Box::new(move |result| {
                let outcome = match CacheCoordinator::upgrade(&weak) {
                    Some(coordinator) => coordinator.with_state(|state| {
                        coordinator.entity_read_completed(state, node_id, read_id, &entity_path, generation, &query, result)
                    }),
                    None => Err(ODataError::canceled("model destroyed")),
                };
                let _ = sender.send(outcome);
            }),
        );
        done
    }

    #[allow(clippy::too_many_arguments)]
    fn entity_read_completed(
        &self,
        state: &mut CacheState,
        node_id: NodeId,
        read_id: u64,
        entity_path: &ResourcePath,
        generation: u64,
        query: &QueryOptions,
        result: ODataResult<Response>,
    ) -> ODataResult<()> {
        let Some(node) = state.tree.get_mut(node_id) else {
            debug!("Discarding read of {}: cache was destroyed", entity_path);
            return Ok(());
        };
        node.pending_reads.retain(|read| read.id != read_id);
        if node.generation != generation {
            debug!("Discarding stale read of {}", entity_path);
            return Ok(());
        }
        let response = result?;
        self.apply_entity(state, entity_path, &response, Some(query));
        Ok(())
    }

    pub(crate) fn start_value_read(&self, state: &mut CacheState, node_id: NodeId, group_id: &str) -> SharedRead {
        let read_id = state.next_id();
        let Some(node) = state.tree.get_mut(node_id) else {
            return ready(Ok(())).shared();
        };
        let path = node.path.clone();
        let generation = node.generation;
        let (sender, receiver) = oneshot::channel();
        let done = receive(receiver).shared();
        node.pending_reads.push(PendingRead {
            id: read_id,
            row: None,
            range: None,
            query: QueryOptions::default(),
            done: done.clone(),
        });

        let weak = self.weak();
        let resource = path.parent().unwrap_or_else(|| path.clone()).to_string();
        self.inner.requestor.enqueue(
            group_id,
            RequestSpec::get(path.to_relative_url(), resource),
            Box::new(move |result: ODataResult<Response>| {
                let outcome = match CacheCoordinator::upgrade(&weak) {
                    Some(coordinator) => coordinator.with_state(|state| {
                        let Some(node) = state.tree.get_mut(node_id) else {
                            return Ok(());
                        };
                        node.pending_reads.retain(|read| read.id != read_id);
                        if node.generation != generation {
                            return Ok(());
                        }
                        let response = result?;
                        let value = match response.body.get(VALUE_PROPERTY) {
                            Some(value) => value.clone(),
                            None => response.body.clone(),
                        };
                        node.data = NodeData::Value(Some(value));
                        node.fetched = Some(QueryOptions::default());
                        state.data_changed(&path, vec![VALUE_PROPERTY.to_string()]);
                        Ok(())
                    }),
                    None => Err(ODataError::canceled("model destroyed")),
                };
                let _ = sender.send(outcome);
            }),
        );
        done
    }

    fn snapshot(&self, state: &CacheState, path: &ResourcePath, properties: &[String]) -> Properties {
        let mut values = Properties::new();
        let Some(location) = state.tree.resolve(path) else {
            for property in properties {
                log_drill_down_failure(&path.to_string(), property);
                values.insert(property.clone(), None);
            }
            return values;
        };
        let Some(node) = state.tree.get(location.node) else {
            return values;
        };
        if let NodeData::Value(value) = &node.data {
            values.insert(VALUE_PROPERTY.to_string(), value.clone());
            return values;
        }
        let entity = match (&node.data, &location.row) {
            (NodeData::Entity(entity), None) => entity.as_ref(),
            (NodeData::Collection(collection), Some(predicate)) => collection.row(predicate).map(|row| &row.data),
            _ => None,
        };
        let meta_base = node.path.meta_path();
        for property in properties {
            let mut segments = location.rest.clone();
            let value = match ResourcePath::parse(property) {
                Ok(relative) => {
                    segments.extend_from_slice(relative.segments());
                    match entity {
                        Some(entity) => drill_down_entity(entity, &segments, &meta_base, self.metadata()),
                        None => Err(segments.first().map(ToString::to_string).unwrap_or_default()),
                    }
                }
                Err(_) => Err(property.clone()),
            };
            match value {
                Ok(value) => {
                    values.insert(property.clone(), Some(value.clone()));
                }
                Err(segment) => {
                    log_drill_down_failure(&format!("{}/{}", path, property), &segment);
                    values.insert(property.clone(), None);
                }
            }
        }
        values
    }

    pub(crate) fn prepare_range(
        &self,
        state: &mut CacheState,
        path: &ResourcePath,
        start: usize,
        length: usize,
        group_id: &str,
    ) -> ODataResult<Option<SharedRead>> {
        Self::ensure_alive(state)?;
        let node = state
            .tree
            .node_at(path)
            .and_then(|id| state.tree.get(id))
            .filter(|node| node.is_collection())
            .ok_or_else(|| ODataError::validation("collection_path", format!("no collection cache for {}", path)))?;
        let Some(collection) = node.collection() else {
            return Ok(None);
        };
        let Some((skip, top)) = collection.missing_server_range(start, length) else {
            return Ok(None);
        };
        if let Some(pending) = node
            .pending_reads
            .iter()
            .find(|read| read.range.is_some_and(|(s, t)| s <= skip && skip.saturating_add(top) <= s.saturating_add(t)))
        {
            return Ok(Some(pending.done.clone()));
        }

        let meta_base = node.path.meta_path();
        let keys = self.metadata().resolve_key_properties(&meta_base)?;
        let mut query = node.query.clone();
        query.ensure_selected(&keys);
        if self.config().request_count {
            query.count = true;
        }
        let excluded: Vec<String> = collection
            .rows()
            .filter(|row| row.state == RowState::Created)
            .filter_map(|row| key_filter(&keys, &row.data))
            .collect();
        if !excluded.is_empty() {
            let exclusion = format!("not ({})", excluded.join(" or "));
            query.filter = Some(match query.filter.take() {
                Some(filter) => format!("({}) and {}", filter, exclusion),
                None => exclusion,
            });
        }
        let url = append_query(
            &append_query(&node.path.to_relative_url(), &query.to_query_string()),
            &paging(skip, top),
        );
        let node_id = node.id;
        let collection_path = node.path.clone();
        let generation = node.generation;

        let read_id = state.next_id();
        let (sender, receiver) = oneshot::channel();
        let done = receive(receiver).shared();
        if let Some(node) = state.tree.get_mut(node_id) {
            node.pending_reads.push(PendingRead {
                id: read_id,
                row: None,
                range: Some((skip, top)),
                query: query.clone(),
                done: done.clone(),
            });
        }
        debug!("Reading rows {}..{} of {}", skip, skip.saturating_add(top), collection_path);

        let weak = self.weak();
        self.inner.requestor.enqueue(
            group_id,
            RequestSpec::get(url, collection_path.to_string()),
            Box::new(move |result: ODataResult<Response>| {
                let outcome = match CacheCoordinator::upgrade(&weak) {
                    Some(coordinator) => coordinator.with_state(|state| {
                        coordinator.range_completed(state, node_id, read_id, (skip, top), generation, &query, &keys, result)
                    }),
                    None => Err(ODataError::canceled("model destroyed")),
                };
                let _ = sender.send(outcome);
            }),
        );
        Ok(Some(done))
    }

    #[allow(clippy::too_many_arguments)]
    fn range_completed(
        &self,
        state: &mut CacheState,
        node_id: NodeId,
        read_id: u64,
        (skip, top): (usize, usize),
        generation: u64,
        query: &QueryOptions,
        keys: &[String],
        result: ODataResult<Response>,
    ) -> ODataResult<()> {
        let Some(node) = state.tree.get_mut(node_id) else {
            return Ok(());
        };
        node.pending_reads.retain(|read| read.id != read_id);
        if node.generation != generation {
            debug!("Discarding stale page of {}", node.path);
            return Ok(());
        }
        let response = result?;
        let collection_path = node.path.clone();
        let elements = response
            .body
            .get(VALUE_PROPERTY)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let received = elements.len();
        let mut rows = Vec::with_capacity(received);
        for element in elements {
            let Value::Object(data) = element else {
                warn!("Ignoring non-object row in {}", collection_path);
                continue;
            };
            match key_predicate(keys, &data) {
                Some(predicate) => rows.push(Row::persisted(predicate, data)),
                None => warn!("Ignoring row without key in {}", collection_path),
            }
        }
        for row in &mut rows {
            let row_path = collection_path.with_predicate(row.predicate.clone());
            if let Some(slot) = state.patches.get(&row_path) {
                for (property, value) in slot.local_values() {
                    set_property(&mut row.data, &property, value);
                }
            }
        }
        let count = response.body.get(COUNT_ANNOTATION).and_then(|count| {
            count
                .as_u64()
                .or_else(|| count.as_str().and_then(|s| s.parse().ok()))
                .map(|count| count as usize)
        });

        let messages_property = self.metadata().messages_property(&collection_path.meta_path());
        let row_messages: Vec<(ResourcePath, Vec<odata_trait::Message>)> = rows
            .iter()
            .filter_map(|row| {
                let row_path = collection_path.with_predicate(row.predicate.clone());
                let property = messages_property.as_deref()?;
                let messages = crate::messages::messages_from_entity(&row.data, property, &row_path.to_string())?;
                Some((row_path, messages))
            })
            .collect();

        let Some(node) = state.tree.get_mut(node_id) else {
            return Ok(());
        };
        if let Some(collection) = node.collection_mut() {
            collection.store_server_rows(skip, rows);
            match count {
                Some(count) => collection.server_count = Some(count),
                None if received < top => collection.server_count = Some(skip + received),
                None => {}
            }
        }
        match &mut node.fetched {
            Some(fetched) => fetched.merge(query),
            None => node.fetched = Some(query.clone()),
        }
        state.data_changed(&collection_path, Vec::new());

        let header = crate::messages::messages_from_header(&response, &collection_path.to_string());
        let delta = state.messages.add(header);
        state.messages_changed(delta);
        for (row_path, messages) in row_messages {
            state.replace_messages(&row_path, messages);
        }
        Ok(())
    }
}

/// `$skip`/`$top` of a range read; a range reaching the end of the
/// addressable rows reads everything from `skip`
fn paging(skip: usize, top: usize) -> String {
    if skip.saturating_add(top) == usize::MAX {
        format!("$skip={}", skip)
    } else {
        format!("$skip={}&$top={}", skip, top)
    }
}

fn snapshot_rows(state: &CacheState, path: &ResourcePath, start: usize, length: usize) -> Vec<RowSnapshot> {
    let Some(collection) = state
        .tree
        .node_at(path)
        .and_then(|id| state.tree.get(id))
        .and_then(|node| node.collection())
    else {
        return Vec::new();
    };
    let end = start.saturating_add(length).min(collection.visible_len());
    let mut rows = Vec::new();
    for index in start..end {
        let Some(row) = collection.row_at(index) else {
            break;
        };
        rows.push(RowSnapshot {
            path: path.with_predicate(row.predicate.clone()),
            data: row.data.clone(),
            transient: row.is_transient(),
        });
    }
    rows
}
