//! Side effects and refresh: reloading what a change on the server may have touched

use crate::constants::VALUE_PROPERTY;
use crate::coordinator::{CacheCoordinator, CacheState, pending_changes_below, ready, receive};
use crate::node::{CacheNodeKind, NodeData, NodeId, RowState, merge_entity};
use crate::query::{QueryOptions, append_query};
use crate::requestor::RequestSpec;
use crate::tree::Location;
use futures::FutureExt;
use futures::future::BoxFuture;
use odata_trait::{ODataError, ODataResult, ResourcePath, Response, key_filter, key_predicate};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

type Completion = BoxFuture<'static, ODataResult<()>>;

impl CacheCoordinator {
    /// Reloads the parts of the cache below `context_path` that `paths`
    /// (relative property or navigation paths, `*` for all) may have changed.
    ///
    /// Only data that is cached is requested again; the rows of dependent
    /// collection caches stay the same and are read by key.
    pub fn request_side_effects(
        &self,
        context_path: &str,
        paths: &[&str],
        group_id: Option<&str>,
    ) -> ODataResult<Completion> {
        let context = ResourcePath::parse(context_path)?;
        let paths: Vec<String> = paths.iter().map(|path| path.to_string()).collect();
        let group_id = self.read_group(group_id);
        crate::config::validate_group_id(&group_id).map_err(|e| ODataError::validation("group_id", e))?;

        let waits = self.with_state(|state| -> ODataResult<Vec<Completion>> {
            Self::ensure_alive(state)?;
            let context = state.canonical_path(&context);
            let mut waits = Vec::new();

            for node_id in state.tree.descendants(&context) {
                let Some(node) = state.tree.get(node_id) else {
                    continue;
                };
                let Some(fetched) = node.fetched.as_ref().filter(|_| node.is_collection()) else {
                    continue;
                };
                let Some(relative) = node.path.strip_prefix(&context) else {
                    continue;
                };
                let relative = relative
                    .iter()
                    .map(|segment| segment.name.as_str())
                    .collect::<Vec<_>>()
                    .join("/");
                let remainders: Vec<String> = paths
                    .iter()
                    .filter_map(|path| {
                        if path == "*" || *path == relative {
                            Some("*".to_string())
                        } else {
                            path.strip_prefix(&format!("{}/", relative)).map(str::to_string)
                        }
                    })
                    .collect();
                if remainders.is_empty() {
                    continue;
                }
                if let Some(options) = fetched.intersect(&remainders) {
                    if let Some(wait) = self.reload_loaded_rows(state, node_id, options, &group_id) {
                        waits.push(wait);
                    }
                }
            }

            if let Some(location) = state.tree.resolve(&context) {
                let affected = fetched_at(state, &location).and_then(|fetched| fetched.intersect(&paths));
                if let Some(options) = affected {
                    waits.push(self.reload_entity(state, &location, &context, options, &group_id));
                }
            }
            Ok(waits)
        })?;

        if waits.is_empty() {
            debug!("No cached data affected by side effects of {}", context);
            return Ok(ready(Ok(())));
        }
        info!("🔁 Requesting {} side-effect reads for {}", waits.len(), context);
        Ok(async move {
            for wait in waits {
                wait.await?;
            }
            Ok(())
        }
        .boxed())
    }

    /// GET of the context entity with exactly the affected options, merged in place
    fn reload_entity(
        &self,
        state: &mut CacheState,
        location: &Location,
        context: &ResourcePath,
        mut options: QueryOptions,
        group_id: &str,
    ) -> Completion {
        let Some(node) = state.tree.get(location.node) else {
            return ready(Ok(()));
        };
        let generation = node.generation;
        let keys = self
            .metadata()
            .resolve_key_properties(&context.without_last_predicate().meta_path())
            .unwrap_or_default();
        options.ensure_selected(&keys);
        let url = append_query(&context.to_relative_url(), &options.to_query_string());
        let node_id = location.node;
        let path = context.clone();
        let (sender, receiver) = oneshot::channel();
        let weak = self.weak();
        self.inner.requestor.enqueue(
            group_id,
            RequestSpec::get(url, context.to_string()),
            Box::new(move |result: ODataResult<Response>| {
                let outcome = match CacheCoordinator::upgrade(&weak) {
                    Some(coordinator) => result.map(|response| {
                        coordinator.with_state(|state| {
                            if is_current(state, node_id, generation) {
                                coordinator.apply_entity(state, &path, &response, Some(&options));
                            } else {
                                debug!("Discarding stale side effects for {}", path);
                            }
                        })
                    }),
                    None => Err(ODataError::canceled("model destroyed")),
                };
                let _ = sender.send(outcome);
            }),
        );
        receive(receiver)
    }

    /// GET of the loaded rows of a collection cache filtered by their keys
    fn reload_loaded_rows(
        &self,
        state: &mut CacheState,
        node_id: NodeId,
        mut options: QueryOptions,
        group_id: &str,
    ) -> Option<Completion> {
        let node = state.tree.get(node_id)?;
        let collection = node.collection()?;
        let keys = self.metadata().resolve_key_properties(&node.path.meta_path()).ok()?;
        let filters: Vec<String> = collection
            .rows()
            .filter(|row| matches!(row.state, RowState::Persisted | RowState::Created))
            .filter_map(|row| key_filter(&keys, &row.data))
            .collect();
        if filters.is_empty() {
            return None;
        }
        options.ensure_selected(&keys);
        options.filter = Some(filters.join(" or "));
        let url = append_query(
            &append_query(&node.path.to_relative_url(), &options.to_query_string()),
            &format!("$top={}", filters.len()),
        );
        let collection_path = node.path.clone();
        let generation = node.generation;
        let (sender, receiver) = oneshot::channel();
        let weak = self.weak();
        debug!("Reloading {} loaded rows of {}", filters.len(), collection_path);
        self.inner.requestor.enqueue(
            group_id,
            RequestSpec::get(url, collection_path.to_string()),
            Box::new(move |result: ODataResult<Response>| {
                let outcome = match CacheCoordinator::upgrade(&weak) {
                    Some(coordinator) => result.map(|response| {
                        coordinator.with_state(|state| {
                            if is_current(state, node_id, generation) {
                                coordinator.merge_rows(state, node_id, &collection_path, &keys, &response);
                            } else {
                                debug!("Discarding stale side effects for {}", collection_path);
                            }
                        })
                    }),
                    None => Err(ODataError::canceled("model destroyed")),
                };
                let _ = sender.send(outcome);
            }),
        );
        Some(receive(receiver))
    }

    fn merge_rows(
        &self,
        state: &mut CacheState,
        node_id: NodeId,
        collection_path: &ResourcePath,
        keys: &[String],
        response: &Response,
    ) {
        let elements = response
            .body
            .get(VALUE_PROPERTY)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let messages_property = self.metadata().messages_property(&collection_path.meta_path());
        for element in elements {
            let Some(data) = element.as_object() else {
                continue;
            };
            let Some(predicate) = key_predicate(keys, data) else {
                warn!("Ignoring row without key in {}", collection_path);
                continue;
            };
            let row_path = collection_path.with_predicate(predicate.clone());
            let keep = state.pending_properties(&row_path);
            let Some(row) = state
                .tree
                .get_mut(node_id)
                .and_then(|node| node.collection_mut())
                .and_then(|collection| collection.row_mut(&predicate))
            else {
                debug!("Row {} is no longer loaded", row_path);
                continue;
            };
            let changed = merge_entity(&mut row.data, data, &|property| keep.contains(property));
            state.data_changed(&row_path, changed);
            if let Some(property) = &messages_property {
                if let Some(messages) = crate::messages::messages_from_entity(data, property, &row_path.to_string()) {
                    state.replace_messages(&row_path, messages);
                }
            }
        }
    }

    /// Reads the data at `path` again. A collection or entity cache is
    /// discarded and re-read; a single row is re-read in place, or removed
    /// if `allow_removal` is set and it no longer matches the list's filter.
    pub fn refresh(&self, path: &str, allow_removal: bool, group_id: Option<&str>) -> ODataResult<Completion> {
        let path = ResourcePath::parse(path)?;
        let group_id = self.read_group(group_id);
        crate::config::validate_group_id(&group_id).map_err(|e| ODataError::validation("group_id", e))?;
        self.with_state(|state| {
            Self::ensure_alive(state)?;
            let path = state.canonical_path(&path);
            if pending_changes_below(state, Some(&path)) {
                return Err(ODataError::validation(
                    "path",
                    format!("{} has pending changes; submit or reset them first", path),
                ));
            }
            for node_id in state.tree.descendants(&path) {
                if let Some(node) = state.tree.get_mut(node_id) {
                    node.invalidate();
                }
            }
            if let Some(node_id) = state.tree.node_at(&path) {
                return self.refresh_node(state, node_id, &path, &group_id);
            }
            let location = state
                .tree
                .resolve(&path)
                .ok_or_else(|| ODataError::validation("path", format!("nothing is cached for {}", path)))?;
            match (&location.row, location.rest.is_empty()) {
                (Some(predicate), true) => {
                    let predicate = predicate.clone();
                    self.refresh_row(state, location.node, &predicate, &path, allow_removal, &group_id)
                }
                _ => Err(ODataError::validation(
                    "path",
                    format!("{} is part of another cache; refresh its parent", path),
                )),
            }
        })
    }

    fn refresh_node(
        &self,
        state: &mut CacheState,
        node_id: NodeId,
        path: &ResourcePath,
        group_id: &str,
    ) -> ODataResult<Completion> {
        let node = state
            .tree
            .get_mut(node_id)
            .ok_or_else(|| ODataError::internal(format!("cache node {} vanished", node_id)))?;
        let kind = node.kind;
        let loaded = node
            .collection()
            .map(|collection| (collection.created.len(), collection.server.len()));
        let mut query = node.query.clone();
        if kind == CacheNodeKind::Entity {
            if let Some(fetched) = &node.fetched {
                query.merge(fetched);
            }
        }
        node.invalidate();
        info!("🔄 Refreshing {}", path);
        state.data_changed(path, Vec::new());
        state.replace_messages(path, Vec::new());

        let wait = match kind {
            CacheNodeKind::Collection => {
                let (front, server) = loaded.unwrap_or_default();
                let length = if server == 0 { self.config().page_size } else { server };
                match self.prepare_range(state, path, 0, front + length, group_id)? {
                    Some(wait) => wait,
                    None => return Ok(ready(Ok(()))),
                }
            }
            CacheNodeKind::Entity => {
                let keys = self
                    .metadata()
                    .resolve_key_properties(&path.without_last_predicate().meta_path())
                    .unwrap_or_default();
                query.ensure_selected(&keys);
                self.start_entity_read(state, node_id, None, query, group_id)
            }
            CacheNodeKind::Value => self.start_value_read(state, node_id, group_id),
            CacheNodeKind::OperationResult => {
                return Err(ODataError::validation(
                    "path",
                    format!("{} is an operation result; invoke the operation again", path),
                ));
            }
        };
        Ok(wait.boxed())
    }

    fn refresh_row(
        &self,
        state: &mut CacheState,
        node_id: NodeId,
        predicate: &str,
        path: &ResourcePath,
        allow_removal: bool,
        group_id: &str,
    ) -> ODataResult<Completion> {
        let node = state
            .tree
            .get(node_id)
            .ok_or_else(|| ODataError::internal(format!("cache node {} vanished", node_id)))?;
        let row = node
            .collection()
            .and_then(|collection| collection.row(predicate))
            .ok_or_else(|| ODataError::validation("path", format!("row {} is not loaded", path)))?;
        if row.is_transient() {
            return Err(ODataError::validation("path", format!("{} is not persisted yet", path)));
        }
        let keys = self.metadata().resolve_key_properties(&node.path.meta_path())?;
        let mut query = node.query.clone();
        if let Some(extra) = &row.extra {
            query.merge(extra);
        }
        query.ensure_selected(&keys);
        let list_filter = query.filter.take();
        query.orderby = None;
        query.count = false;
        info!("🔄 Refreshing row {}", path);

        if !allow_removal {
            return Ok(self
                .start_entity_read(state, node_id, Some(predicate.to_string()), query, group_id)
                .boxed());
        }

        let key_filter = key_filter(&keys, &row.data)
            .ok_or_else(|| ODataError::internal(format!("row {} has no key values", path)))?;
        let mut list_query = query.clone();
        list_query.filter = Some(match list_filter {
            Some(filter) => format!("({}) and {}", filter, key_filter),
            None => key_filter,
        });
        let url = append_query(&node.path.to_relative_url(), &list_query.to_query_string());
        let generation = node.generation;
        let collection_path = node.path.clone();
        let row_path = path.clone();
        let predicate = predicate.to_string();
        let (sender, receiver) = oneshot::channel();
        let weak = self.weak();
        self.inner.requestor.enqueue(
            group_id,
            RequestSpec::get(url, path.to_string()),
            Box::new(move |result: ODataResult<Response>| {
                let outcome = match CacheCoordinator::upgrade(&weak) {
                    Some(coordinator) => result.map(|response| {
                        coordinator.with_state(|state| {
                            if !is_current(state, node_id, generation) {
                                debug!("Discarding stale refresh of {}", row_path);
                                return;
                            }
                            let element = response
                                .body
                                .get(VALUE_PROPERTY)
                                .and_then(Value::as_array)
                                .and_then(|elements| elements.first())
                                .cloned();
                            match element {
                                Some(element) => {
                                    let row_response = Response {
                                        status: response.status,
                                        headers: response.headers.clone(),
                                        body: element,
                                    };
                                    coordinator.apply_entity(state, &row_path, &row_response, Some(&query));
                                }
                                None => {
                                    info!("Row {} no longer matches {}, removing it", row_path, collection_path);
                                    if let Some(rows) =
                                        state.tree.get_mut(node_id).and_then(|node| node.collection_mut())
                                    {
                                        rows.remove(&predicate);
                                    }
                                    state.forget(&row_path);
                                    state.data_changed(&collection_path, Vec::new());
                                }
                            }
                        })
                    }),
                    None => Err(ODataError::canceled("model destroyed")),
                };
                let _ = sender.send(outcome);
            }),
        );
        Ok(receive(receiver))
    }
}

fn is_current(state: &CacheState, node_id: NodeId, generation: u64) -> bool {
    state
        .tree
        .get(node_id)
        .is_some_and(|node| node.generation == generation)
}

/// What is cached at a location, relative to it
fn fetched_at(state: &CacheState, location: &Location) -> Option<QueryOptions> {
    let node = state.tree.get(location.node)?;
    if matches!(node.data, NodeData::Value(_)) {
        return None;
    }
    let mut fetched = match &location.row {
        Some(predicate) => {
            let row = node.collection()?.row(predicate)?;
            match (&node.fetched, &row.extra) {
                (Some(fetched), Some(extra)) => {
                    let mut fetched = fetched.clone();
                    fetched.merge(extra);
                    fetched
                }
                (Some(fetched), None) => fetched.clone(),
                (None, Some(extra)) => extra.clone(),
                (None, None) => return None,
            }
        }
        None => node.fetched.clone()?,
    };
    for segment in &location.rest {
        fetched = fetched.expand.get(&segment.name)?.clone();
    }
    fetched.filter = None;
    fetched.orderby = None;
    fetched.count = false;
    Some(fetched)
}
