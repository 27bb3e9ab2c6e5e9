//! Transient rows: `Transient -> PendingPost -> Created`, or `Canceled`

use crate::coordinator::{CacheCoordinator, CacheState, Waiter, receive, resolve_all};
use crate::node::{NodeId, Row, RowState, merge_entity};
use crate::query::append_query;
use crate::requestor::{Payload, Prepared, RequestSpec};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use odata_trait::{Method, ODataError, ODataResult, ResourcePath, Response, key_predicate, transient_predicate};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    /// Group of the POST; the update group if `None`
    pub group_id: Option<String>,
    /// Insert after the server rows instead of in front of them
    pub at_end: bool,
    /// `CreatedContext::path` keeps the transient path after the POST
    pub keep_transient_path: bool,
    /// No GET of the created entity after the POST
    pub skip_refresh: bool,
}

pub type CreatedFuture = Shared<BoxFuture<'static, ODataResult<ResourcePath>>>;

/// Handle of a row created on the client
#[derive(Clone)]
pub struct CreatedContext {
    transient_path: ResourcePath,
    current: Arc<Mutex<ResourcePath>>,
    created: CreatedFuture,
}

impl CreatedContext {
    pub fn transient_path(&self) -> &ResourcePath {
        &self.transient_path
    }

    /// Current path of the row; the key predicate replaces the transient one
    /// once the POST succeeded
    pub fn path(&self) -> ResourcePath {
        self.current.lock().clone()
    }

    /// Resolves with the persisted path, or fails with `Canceled` when the
    /// creation is discarded before the POST was sent
    pub fn created(&self) -> CreatedFuture {
        self.created.clone()
    }
}

impl std::fmt::Debug for CreatedContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CreatedContext")
            .field("transient_path", &self.transient_path)
            .field("path", &self.path())
            .finish()
    }
}

pub(crate) struct PendingCreate {
    uid: String,
    collection: ResourcePath,
    node: NodeId,
    group_id: String,
    options: CreateOptions,
    current: Arc<Mutex<ResourcePath>>,
    pub(crate) waiters: Vec<Waiter<ResourcePath>>,
    pub(crate) edit_waiters: Vec<Waiter<()>>,
}

impl PendingCreate {
    /// Transient path of the row
    pub(crate) fn path(&self) -> ResourcePath {
        self.collection.with_predicate(transient_predicate(&self.uid))
    }

    pub(crate) fn group_id(&self) -> &str {
        &self.group_id
    }

    pub(crate) fn cancel(self, reason: &str) {
        resolve_all(self.waiters, Err(ODataError::canceled(reason)));
        resolve_all(self.edit_waiters, Err(ODataError::canceled(reason)));
    }
}

fn transient_row<'a>(state: &'a mut CacheState, node: NodeId, uid: &str) -> Option<&'a mut Row> {
    state
        .tree
        .get_mut(node)?
        .collection_mut()?
        .row_mut(&transient_predicate(uid))
}

impl CacheCoordinator {
    /// Inserts a transient row into the collection cache at `collection_path`
    /// and queues its POST
    pub fn create(&self, collection_path: &str, initial: Value, options: CreateOptions) -> ODataResult<CreatedContext> {
        let collection = ResourcePath::parse(collection_path)?;
        let data = match initial {
            Value::Object(data) => data,
            Value::Null => Map::new(),
            other => {
                return Err(ODataError::validation(
                    "initial",
                    format!("initial data must be an object, got {}", other),
                ));
            }
        };
        let group_id = self.update_group(options.group_id.as_deref());
        crate::config::validate_group_id(&group_id).map_err(|e| ODataError::validation("group_id", e))?;

        self.with_state(|state| {
            Self::ensure_alive(state)?;
            let collection = state.canonical_path(&collection);
            let node_id = state
                .tree
                .node_at(&collection)
                .filter(|id| state.tree.get(*id).is_some_and(|node| node.is_collection()))
                .ok_or_else(|| {
                    ODataError::validation("collection_path", format!("no collection cache for {}", collection))
                })?;
            let uid = state.next_uid();
            let predicate = transient_predicate(&uid);
            let path = collection.with_predicate(predicate.clone());
            let request_id = self.enqueue_post(&uid, &path, &group_id);
            let row = Row {
                predicate,
                data,
                state: RowState::Transient {
                    uid: uid.clone(),
                    group_id: group_id.clone(),
                    request_id: Some(request_id),
                },
                extra: None,
                alias: None,
            };
            if let Some(rows) = state.tree.get_mut(node_id).and_then(|node| node.collection_mut()) {
                if options.at_end {
                    rows.created_at_end.push(row);
                } else {
                    rows.created.insert(0, row);
                }
            }

            let (sender, receiver) = oneshot::channel();
            let current = Arc::new(Mutex::new(path.clone()));
            state.creates.insert(
                uid.clone(),
                PendingCreate {
                    uid,
                    collection: collection.clone(),
                    node: node_id,
                    group_id,
                    options,
                    current: current.clone(),
                    waiters: vec![sender],
                    edit_waiters: Vec::new(),
                },
            );
            state.data_changed(&collection, Vec::new());
            info!("➕ Created transient row {}", path);
            Ok(CreatedContext {
                transient_path: path,
                current,
                created: receive(receiver).shared(),
            })
        })
    }

    fn enqueue_post(&self, uid: &str, transient: &ResourcePath, group_id: &str) -> u64 {
        let url = transient.without_last_predicate().to_relative_url();
        let prepare = {
            let weak = self.weak();
            let uid = uid.to_string();
            move || CacheCoordinator::upgrade(&weak)?.prepare_post(&uid)
        };
        let weak = self.weak();
        let uid = uid.to_string();
        self.inner.requestor.enqueue(
            group_id,
            RequestSpec::write(Method::Post, url, transient.to_string(), Payload::Deferred(Box::new(prepare))),
            Box::new(move |result: ODataResult<Response>| {
                if let Some(coordinator) = CacheCoordinator::upgrade(&weak) {
                    coordinator.post_completed(&uid, result);
                }
            }),
        )
    }

    /// The payload is the row's data at send time, including edits made so far
    fn prepare_post(&self, uid: &str) -> Option<Prepared> {
        self.with_state(|state| {
            let node = state.creates.get(uid)?.node;
            let row = transient_row(state, node, uid)?;
            if !matches!(row.state, RowState::Transient { .. }) {
                return None;
            }
            row.state = RowState::PendingPost { uid: uid.to_string() };
            let body: Map<String, Value> = row
                .data
                .iter()
                .filter(|(key, _)| !key.starts_with('@'))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            Some(Prepared::new(Some(Value::Object(body))))
        })
    }

    fn post_completed(&self, uid: &str, result: ODataResult<Response>) {
        self.with_state(|state| {
            let Some(create) = state.creates.get(uid) else {
                return;
            };
            let transient = create.path();
            let node_id = create.node;
            let group_id = create.group_id.clone();
            let response = match result {
                Ok(response) => response,
                Err(error) if error.is_canceled() => return,
                Err(error) => {
                    warn!("POST of {} failed, keeping the row for retry: {}", transient, error);
                    if let Some(row) = transient_row(state, node_id, uid) {
                        row.state = RowState::Transient {
                            uid: uid.to_string(),
                            group_id,
                            request_id: None,
                        };
                    }
                    if let Some(create) = state.creates.get_mut(uid) {
                        let edits = std::mem::take(&mut create.edit_waiters);
                        resolve_all(edits, Err(error));
                    }
                    return;
                }
            };
            self.persist_created(state, uid, &transient, &response);
        });
    }

    fn persist_created(&self, state: &mut CacheState, uid: &str, transient: &ResourcePath, response: &Response) {
        let Some(create) = state.creates.remove(uid) else {
            return;
        };
        let body = response.body.as_object().cloned().unwrap_or_default();
        let keys = self
            .metadata()
            .resolve_key_properties(&create.collection.meta_path())
            .unwrap_or_default();
        let Some(row) = transient_row(state, create.node, uid) else {
            debug!("Created row {} is no longer cached", transient);
            create.cancel("row was removed while it was created");
            return;
        };
        let changed = merge_entity(&mut row.data, &body, &|_| false);
        let Some(key) = key_predicate(&keys, &row.data) else {
            error!("Created entity {} has no key in the response", transient);
            row.state = RowState::Created;
            resolve_all(create.waiters, Err(ODataError::internal("created entity has no key")));
            resolve_all(create.edit_waiters, Ok(()));
            return;
        };
        let old_predicate = std::mem::replace(&mut row.predicate, key.clone());
        row.alias = Some(old_predicate);
        row.state = RowState::Created;

        let persisted = create.collection.with_predicate(key);
        state.tree.rename(transient, &persisted);
        let moved: Vec<ResourcePath> = state
            .patches
            .keys()
            .filter(|path| path.starts_with(transient))
            .cloned()
            .collect();
        for path in moved {
            if let (Some(slot), Some(target)) = (state.patches.remove(&path), path.rebase(transient, &persisted)) {
                state.patches.insert(target, slot);
            }
        }
        let delta = state.messages.rename(&transient.to_string(), &persisted.to_string());
        state.messages_changed(delta);
        if let Some(messages) = self.response_messages(&persisted, response, Some(&body)) {
            state.replace_messages(&persisted, messages);
        }

        if !create.options.keep_transient_path {
            *create.current.lock() = persisted.clone();
        }
        info!("✅ {} persisted as {}", transient, persisted);
        state.data_changed(&create.collection, Vec::new());
        state.data_changed(&persisted, changed);
        resolve_all(create.waiters, Ok(persisted.clone()));
        resolve_all(create.edit_waiters, Ok(()));

        if !create.options.skip_refresh {
            self.refresh_created(state, create.node, &persisted, &create.group_id, &keys);
        }
    }

    /// Reads the complete created entity in the same submit
    fn refresh_created(&self, state: &CacheState, node_id: NodeId, persisted: &ResourcePath, group_id: &str, keys: &[String]) {
        let Some(node) = state.tree.get(node_id) else {
            return;
        };
        let mut query = node.query.clone();
        query.filter = None;
        query.orderby = None;
        query.count = false;
        query.ensure_selected(keys);
        let generation = node.generation;
        let url = append_query(&persisted.to_relative_url(), &query.to_query_string());
        let weak = self.weak();
        let path = persisted.clone();
        self.inner.requestor.enqueue(
            group_id,
            RequestSpec::get(url, persisted.to_string()).as_follow_up(),
            Box::new(move |result: ODataResult<Response>| {
                let Some(coordinator) = CacheCoordinator::upgrade(&weak) else {
                    return;
                };
                let Ok(response) = result else {
                    return;
                };
                coordinator.with_state(|state| {
                    let current = state.tree.get(node_id).map(|node| node.generation);
                    if current == Some(generation) {
                        coordinator.apply_entity(state, &path, &response, Some(&query));
                    }
                });
            }),
        );
    }

    /// Discards a row whose POST was not sent; no request is made
    pub(crate) fn cancel_create(&self, state: &mut CacheState, uid: &str, reason: &str) -> bool {
        let Some(create) = state.creates.get(uid) else {
            return false;
        };
        let node_id = create.node;
        let transient = create.path();
        let collection = create.collection.clone();
        let Some(row) = transient_row(state, node_id, uid) else {
            return false;
        };
        let RowState::Transient { group_id, request_id, .. } = &row.state else {
            debug!("Cannot cancel {}: POST already sent", transient);
            return false;
        };
        if let Some(request_id) = request_id {
            self.inner.requestor.remove(group_id, *request_id);
        }
        if let Some(rows) = state.tree.get_mut(node_id).and_then(|node| node.collection_mut()) {
            rows.remove(&transient_predicate(uid));
        }
        state.forget(&transient);
        if let Some(create) = state.creates.remove(uid) {
            create.cancel(reason);
        }
        info!("🚫 Canceled creation of {}", transient);
        state.data_changed(&collection, Vec::new());
        true
    }

    /// Queues the POST of a transient row again after a failure
    pub(crate) fn requeue_post(&self, state: &mut CacheState, uid: &str) {
        let Some(create) = state.creates.get(uid) else {
            return;
        };
        let node_id = create.node;
        let transient = create.path();
        let group_id = create.group_id.clone();
        let needs_request = transient_row(state, node_id, uid).is_some_and(|row| {
            matches!(row.state, RowState::Transient { request_id: None, .. })
        });
        if !needs_request {
            return;
        }
        info!("🔄 Retrying POST of {}", transient);
        let request_id = self.enqueue_post(uid, &transient, &group_id);
        if let Some(row) = transient_row(state, node_id, uid) {
            row.state = RowState::Transient {
                uid: uid.to_string(),
                group_id,
                request_id: Some(request_id),
            };
        }
    }

    /// Resolves with the persisted path once the POST in flight succeeded
    pub(crate) fn after_created(&self, state: &mut CacheState, uid: &str) -> Option<BoxFuture<'static, ODataResult<ResourcePath>>> {
        let create = state.creates.get_mut(uid)?;
        let (sender, receiver) = oneshot::channel();
        create.waiters.push(sender);
        Some(receive(receiver))
    }
}
