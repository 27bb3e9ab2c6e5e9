//! Deletion of cached entities, including rows that are still being created

use crate::coordinator::{CacheCoordinator, CacheState, Waiter, ready, receive, resolve_all};
use crate::node::RowState;
use crate::requestor::{Payload, Prepared, RequestSpec};
use crate::tree::Location;
use futures::FutureExt;
use futures::future::BoxFuture;
use odata_trait::{HEADER_IF_MATCH, Method, ODataError, ODataResult, ResourcePath, Response, key_predicate};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub(crate) struct PendingDelete {
    group_id: String,
    request_id: Option<u64>,
    waiters: Vec<Waiter<()>>,
}

impl PendingDelete {
    pub(crate) fn cancel(self, reason: &str) {
        resolve_all(self.waiters, Err(ODataError::canceled(reason)));
    }

    /// DELETE is queued but not sent yet
    pub(crate) fn is_unsent(&self) -> bool {
        self.request_id.is_some()
    }
}

impl CacheCoordinator {
    /// Deletes the entity at `entity_path`. A transient row whose POST was not
    /// sent is discarded without a request; a row whose POST is in flight is
    /// deleted once it is persisted.
    pub fn delete(&self, entity_path: &str, group_id: Option<&str>) -> ODataResult<BoxFuture<'static, ODataResult<()>>> {
        let path = ResourcePath::parse(entity_path)?;
        let group_id = self.update_group(group_id);
        crate::config::validate_group_id(&group_id).map_err(|e| ODataError::validation("group_id", e))?;
        self.with_state(|state| {
            Self::ensure_alive(state)?;
            let path = state.canonical_path(&path);
            let location = state
                .tree
                .resolve(&path)
                .ok_or_else(|| ODataError::validation("entity_path", format!("nothing is cached for {}", path)))?;
            if let Some(row_state) = row_state(state, &location) {
                match row_state {
                    RowState::Transient { uid, .. } => {
                        self.cancel_create(state, &uid, "row was deleted before it was sent");
                        return Ok(ready(Ok(())));
                    }
                    RowState::PendingPost { uid } => {
                        return Ok(self.delete_after_create(state, &uid, &group_id));
                    }
                    RowState::Persisted | RowState::Created => {}
                }
            }
            if state.tree.entity_mut(&location, self.metadata()).is_none() {
                return Err(ODataError::validation("entity_path", format!("no entity cached at {}", path)));
            }
            Ok(self.queue_delete(state, &path, &group_id))
        })
    }

    /// The DELETE of a row being created waits for its POST under a group lock
    /// so that a submit in between cannot send the group without it
    fn delete_after_create(&self, state: &mut CacheState, uid: &str, group_id: &str) -> BoxFuture<'static, ODataResult<()>> {
        let Some(created) = self.after_created(state, uid) else {
            return ready(Err(ODataError::internal(format!("no pending creation {}", uid))));
        };
        let lock = self
            .inner
            .requestor
            .locks()
            .lock_group(group_id, &format!("delete {}", uid), true, false);
        debug!("Delete of {} waits for its POST", uid);
        let coordinator = self.clone();
        let group_id = group_id.to_string();
        async move {
            let queued = match created.await {
                Ok(path) => coordinator.with_state(|state| coordinator.queue_delete(state, &path, &group_id)),
                Err(error) => ready(Err(error)),
            };
            lock.unlock();
            queued.await
        }
        .boxed()
    }

    fn queue_delete(&self, state: &mut CacheState, path: &ResourcePath, group_id: &str) -> BoxFuture<'static, ODataResult<()>> {
        let (sender, receiver) = oneshot::channel();
        if let Some(pending) = state.deletes.get_mut(path) {
            pending.waiters.push(sender);
            return receive(receiver);
        }
        self.reset_patches(state, path);

        let prepare = {
            let weak = self.weak();
            let path = path.clone();
            move || CacheCoordinator::upgrade(&weak)?.prepare_delete(&path)
        };
        let weak = self.weak();
        let completed = path.clone();
        let request_id = self.inner.requestor.enqueue(
            group_id,
            RequestSpec::write(
                Method::Delete,
                path.to_relative_url(),
                path.to_string(),
                Payload::Deferred(Box::new(prepare)),
            ),
            Box::new(move |result: ODataResult<Response>| {
                if let Some(coordinator) = CacheCoordinator::upgrade(&weak) {
                    coordinator.delete_completed(&completed, result);
                }
            }),
        );
        state.deletes.insert(
            path.clone(),
            PendingDelete {
                group_id: group_id.to_string(),
                request_id: Some(request_id),
                waiters: vec![sender],
            },
        );
        info!("🗑️ Queued DELETE of {} in group {}", path, group_id);
        receive(receiver)
    }

    fn prepare_delete(&self, path: &ResourcePath) -> Option<Prepared> {
        self.with_state(|state| {
            let etag = self.etag_of(state, path);
            let pending = state.deletes.get_mut(path)?;
            pending.request_id = None;
            let prepared = Prepared::new(None);
            Some(match etag {
                Some(etag) => prepared.with_header(HEADER_IF_MATCH, etag),
                None => prepared,
            })
        })
    }

    fn delete_completed(&self, path: &ResourcePath, result: ODataResult<Response>) {
        self.with_state(|state| {
            let Some(pending) = state.deletes.remove(path) else {
                return;
            };
            match result {
                Ok(_) => {
                    info!("✅ Deleted {}", path);
                    self.remove_deleted(state, path);
                    resolve_all(pending.waiters, Ok(()));
                }
                Err(error) if error.status() == Some(404) => {
                    warn!("{} was already deleted on the server", path);
                    self.remove_deleted(state, path);
                    resolve_all(pending.waiters, Ok(()));
                }
                Err(error) => resolve_all(pending.waiters, Err(error)),
            }
        });
    }

    /// Drops a deleted entity from its collection, its parent's expanded data
    /// or the tree, together with everything cached below it
    fn remove_deleted(&self, state: &mut CacheState, path: &ResourcePath) {
        let Some(location) = state.tree.resolve(path) else {
            state.forget(path);
            return;
        };
        let parent_path = state.tree.get(location.node).map(|node| node.path.clone());
        match (&location.row, location.rest.is_empty()) {
            (Some(predicate), true) => {
                if let Some(rows) = state.tree.get_mut(location.node).and_then(|node| node.collection_mut()) {
                    rows.remove(predicate);
                }
                if let Some(parent_path) = parent_path {
                    state.data_changed(&parent_path, Vec::new());
                }
            }
            (_, false) => self.remove_expanded(state, &location, path),
            (None, true) => {}
        }
        state.forget(path);
        state.data_changed(path, Vec::new());
    }

    fn remove_expanded(&self, state: &mut CacheState, location: &Location, path: &ResourcePath) {
        let Some(last) = location.rest.last() else {
            return;
        };
        let Some(predicate) = last.predicate.clone() else {
            return;
        };
        let keys = self
            .metadata()
            .resolve_key_properties(&path.without_last_predicate().meta_path())
            .unwrap_or_default();
        let parent = Location {
            node: location.node,
            row: location.row.clone(),
            rest: location.rest[..location.rest.len() - 1].to_vec(),
        };
        let Some(entity) = state.tree.entity_mut(&parent, self.metadata()) else {
            return;
        };
        if let Some(Value::Array(elements)) = entity.get_mut(&last.name) {
            elements.retain(|element| {
                element
                    .as_object()
                    .and_then(|element| key_predicate(&keys, element))
                    .is_none_or(|key| key != predicate)
            });
        }
        if let Some(parent_path) = path.parent() {
            state.data_changed(&parent_path, vec![last.name.clone()]);
        }
    }

    /// Cancels unsent DELETEs at or below `path`
    pub(crate) fn cancel_deletes(&self, state: &mut CacheState, path: &ResourcePath) {
        let unsent: Vec<ResourcePath> = state
            .deletes
            .iter()
            .filter(|(deleted, pending)| deleted.starts_with(path) && pending.is_unsent())
            .map(|(deleted, _)| deleted.clone())
            .collect();
        for deleted in unsent {
            if let Some(pending) = state.deletes.remove(&deleted) {
                if let Some(request_id) = pending.request_id {
                    self.inner.requestor.remove(&pending.group_id, request_id);
                }
                info!("↩️ Canceled DELETE of {}", deleted);
                pending.cancel("changes were reset");
            }
        }
    }
}

fn row_state(state: &CacheState, location: &Location) -> Option<RowState> {
    if !location.rest.is_empty() {
        return None;
    }
    let predicate = location.row.as_ref()?;
    state
        .tree
        .get(location.node)?
        .collection()?
        .row(predicate)
        .map(|row| row.state.clone())
}
