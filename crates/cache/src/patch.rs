//! Edits: one PATCH per entity at a time, merged payloads, lazy `If-Match`

use crate::coordinator::{CacheCoordinator, CacheState, Waiter, ready, receive, resolve_all};
use crate::node::{RowState, get_property, nest_properties, set_property};
use crate::requestor::{Payload, Prepared, RequestSpec};
use futures::future::BoxFuture;
use odata_trait::{HEADER_IF_MATCH, Method, ODataError, ODataResult, ResourcePath, Response};
use serde_json::{Map, Value};
use std::collections::HashSet;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Edits of one entity
pub(crate) struct PatchSlot {
    pub(crate) group_id: String,
    /// Unsent values by property path; the last write wins
    pub(crate) pending: Map<String, Value>,
    /// Values before the first unsent edit, restored by a reset
    pub(crate) originals: Map<String, Value>,
    /// Values of the PATCH on the wire
    pub(crate) in_flight: Option<Map<String, Value>>,
    waiters: Vec<Waiter<()>>,
    in_flight_waiters: Vec<Waiter<()>>,
    /// Queued request carrying `pending`
    pub(crate) request_id: Option<u64>,
    /// Last PATCH failed; `pending` is sent again with the next submit
    pub(crate) retry: bool,
}

impl PatchSlot {
    fn new(group_id: &str) -> Self {
        Self {
            group_id: group_id.to_string(),
            pending: Map::new(),
            originals: Map::new(),
            in_flight: None,
            waiters: Vec::new(),
            in_flight_waiters: Vec::new(),
            request_id: None,
            retry: false,
        }
    }

    pub(crate) fn has_changes(&self) -> bool {
        !self.pending.is_empty() || self.in_flight.is_some()
    }

    pub(crate) fn edited_properties(&self) -> HashSet<String> {
        self.pending
            .keys()
            .chain(self.in_flight.iter().flat_map(|sent| sent.keys()))
            .cloned()
            .collect()
    }

    /// Local values that a server response must not overwrite
    pub(crate) fn local_values(&self) -> Map<String, Value> {
        let mut values = self.in_flight.clone().unwrap_or_default();
        values.extend(self.pending.clone());
        values
    }

    /// Rejects every waiter with `Canceled`
    pub(crate) fn cancel(self, reason: &str) {
        resolve_all(self.waiters, Err(ODataError::canceled(reason)));
        resolve_all(self.in_flight_waiters, Err(ODataError::canceled(reason)));
    }
}

impl CacheCoordinator {
    /// Sets a property of a cached entity. The returned future completes when
    /// the PATCH carrying the edit (or the POST of a transient row) is done.
    ///
    /// Fails synchronously if nothing is cached at `entity_path` or the row is
    /// being created right now.
    pub fn update(
        &self,
        entity_path: &str,
        property: &str,
        value: Value,
        group_id: Option<&str>,
    ) -> ODataResult<BoxFuture<'static, ODataResult<()>>> {
        let path = ResourcePath::parse(entity_path)?;
        if property.is_empty() || property.starts_with('@') {
            return Err(ODataError::validation("property", format!("cannot update '{}'", property)));
        }
        let group_id = self.update_group(group_id);
        crate::config::validate_group_id(&group_id).map_err(|e| ODataError::validation("group_id", e))?;
        self.with_state(|state| {
            Self::ensure_alive(state)?;
            let path = state.canonical_path(&path);
            if let Some(future) = self.update_transient(state, &path, property, &value)? {
                return Ok(future);
            }

            let location = state
                .tree
                .resolve(&path)
                .ok_or_else(|| ODataError::validation("entity_path", format!("nothing is cached for {}", path)))?;
            let entity = state
                .tree
                .entity_mut(&location, self.metadata())
                .ok_or_else(|| ODataError::validation("entity_path", format!("no entity cached at {}", path)))?;
            let old = get_property(entity, property).cloned();
            if old.as_ref() == Some(&value) {
                debug!("Value of {}/{} unchanged", path, property);
                return Ok(ready(Ok(())));
            }
            if let Some(slot) = state.patches.get(&path) {
                if slot.group_id != group_id && slot.has_changes() {
                    return Err(ODataError::validation(
                        "group_id",
                        format!("{} has changes in group {}, not {}", path, slot.group_id, group_id),
                    ));
                }
            }
            set_property(entity, property, value.clone());

            let slot = state
                .patches
                .entry(path.clone())
                .or_insert_with(|| PatchSlot::new(&group_id));
            slot.group_id = group_id.clone();
            slot.originals
                .entry(property.to_string())
                .or_insert(old.unwrap_or(Value::Null));
            slot.pending.insert(property.to_string(), value);
            slot.retry = false;
            let (sender, receiver) = oneshot::channel();
            slot.waiters.push(sender);
            let enqueue = slot.in_flight.is_none() && slot.request_id.is_none();
            if enqueue {
                let request_id = self.enqueue_patch(&path, &group_id, false);
                if let Some(slot) = state.patches.get_mut(&path) {
                    slot.request_id = Some(request_id);
                }
            } else {
                debug!("Edit of {}/{} joins the pending PATCH", path, property);
            }
            state.data_changed(&path, vec![property.to_string()]);
            Ok(receive(receiver))
        })
    }

    /// Edits of a row whose POST was not sent yet go into the POST payload
    fn update_transient(
        &self,
        state: &mut CacheState,
        path: &ResourcePath,
        property: &str,
        value: &Value,
    ) -> ODataResult<Option<BoxFuture<'static, ODataResult<()>>>> {
        let Some(location) = state.tree.resolve(path) else {
            return Ok(None);
        };
        let (Some(predicate), true) = (&location.row, location.rest.is_empty()) else {
            return Ok(None);
        };
        let Some(row) = state
            .tree
            .get_mut(location.node)
            .and_then(|node| node.collection_mut())
            .and_then(|collection| collection.row_mut(predicate))
        else {
            return Ok(None);
        };
        let uid = match &row.state {
            RowState::PendingPost { .. } => {
                return Err(ODataError::validation(
                    "entity_path",
                    format!("{} is being created; wait for created()", path),
                ));
            }
            RowState::Transient { uid, .. } => uid.clone(),
            RowState::Persisted | RowState::Created => return Ok(None),
        };
        let failed = matches!(row.state, RowState::Transient { request_id: None, .. });
        set_property(&mut row.data, property, value.clone());
        let (sender, receiver) = oneshot::channel();
        if let Some(create) = state.creates.get_mut(&uid) {
            create.edit_waiters.push(sender);
        }
        if failed {
            self.requeue_post(state, &uid);
        }
        debug!("Edit of transient {}/{} merged into its POST", path, property);
        state.data_changed(path, vec![property.to_string()]);
        Ok(Some(receive(receiver)))
    }

    /// Queues the PATCH of `path`; body and `If-Match` are taken when the batch is built
    pub(crate) fn enqueue_patch(&self, path: &ResourcePath, group_id: &str, follow_up: bool) -> u64 {
        let prepare = {
            let weak = self.weak();
            let path = path.clone();
            move || CacheCoordinator::upgrade(&weak)?.prepare_patch(&path)
        };
        let weak = self.weak();
        let completed_path = path.clone();
        let mut spec = RequestSpec::write(
            Method::Patch,
            path.to_relative_url(),
            path.to_string(),
            Payload::Deferred(Box::new(prepare)),
        );
        if follow_up {
            spec = spec.as_follow_up();
        }
        self.inner.requestor.enqueue(
            group_id,
            spec,
            Box::new(move |result: ODataResult<Response>| {
                if let Some(coordinator) = CacheCoordinator::upgrade(&weak) {
                    coordinator.patch_completed(&completed_path, result);
                }
            }),
        )
    }

    fn prepare_patch(&self, path: &ResourcePath) -> Option<Prepared> {
        self.with_state(|state| {
            let etag = self.etag_of(state, path);
            let slot = state.patches.get_mut(path)?;
            slot.request_id = None;
            if slot.pending.is_empty() {
                return None;
            }
            let sent = std::mem::take(&mut slot.pending);
            let body = Value::Object(nest_properties(&sent));
            slot.in_flight = Some(sent);
            slot.in_flight_waiters = std::mem::take(&mut slot.waiters);
            let prepared = Prepared::new(Some(body));
            Some(match etag {
                Some(etag) => prepared.with_header(HEADER_IF_MATCH, etag),
                None => prepared,
            })
        })
    }

    fn patch_completed(&self, path: &ResourcePath, result: ODataResult<Response>) {
        self.with_state(|state| {
            let Some(slot) = state.patches.get_mut(path) else {
                return;
            };
            let Some(sent) = slot.in_flight.take() else {
                return;
            };
            let waiters = std::mem::take(&mut slot.in_flight_waiters);
            match result {
                Ok(response) => {
                    for property in sent.keys() {
                        if !slot.pending.contains_key(property) {
                            slot.originals.remove(property);
                        }
                    }
                    let follow_up = !slot.pending.is_empty() && slot.request_id.is_none();
                    let group_id = slot.group_id.clone();
                    if !slot.has_changes() {
                        state.patches.remove(path);
                    }
                    info!("✅ PATCH of {} succeeded", path);
                    self.merge_patch_response(state, path, &response);
                    resolve_all(waiters, Ok(()));
                    if follow_up {
                        debug!("Sending follow-up PATCH for {}", path);
                        let request_id = self.enqueue_patch(path, &group_id, true);
                        if let Some(slot) = state.patches.get_mut(path) {
                            slot.request_id = Some(request_id);
                        }
                    }
                }
                Err(error) if error.is_canceled() => {
                    resolve_all(waiters, Err(error));
                }
                Err(error) => {
                    warn!("PATCH of {} failed, keeping edits for retry: {}", path, error);
                    for (property, value) in sent {
                        slot.pending.entry(property).or_insert(value);
                    }
                    slot.retry = slot.request_id.is_none();
                    resolve_all(waiters, Err(error));
                }
            }
        });
    }

    /// Applies exactly the returned properties and the new ETag
    fn merge_patch_response(&self, state: &mut CacheState, path: &ResourcePath, response: &Response) {
        let etag = response.etag();
        if response.body.is_object() {
            self.apply_entity(state, path, response, None);
        } else {
            if let Some(messages) = self.response_messages(path, response, None) {
                state.replace_messages(path, messages);
            }
        }
        if let Some(etag) = etag {
            if let Some(location) = state.tree.resolve(path) {
                if let Some(entity) = state.tree.entity_mut(&location, self.metadata()) {
                    entity.insert(crate::constants::ETAG_ANNOTATION.to_string(), Value::String(etag));
                }
            }
        }
    }

    /// Puts unsent edits below `path` back to their original values
    pub(crate) fn reset_patches(&self, state: &mut CacheState, path: &ResourcePath) {
        let affected: Vec<ResourcePath> = state
            .patches
            .iter()
            .filter(|(edited, slot)| edited.starts_with(path) && !slot.pending.is_empty())
            .map(|(edited, _)| edited.clone())
            .collect();
        for edited in affected {
            let Some(slot) = state.patches.get_mut(&edited) else {
                continue;
            };
            let pending = std::mem::take(&mut slot.pending);
            let waiters = std::mem::take(&mut slot.waiters);
            let mut restore = Vec::new();
            for property in pending.keys() {
                if let Some(original) = slot.originals.remove(property) {
                    restore.push((property.clone(), original));
                }
            }
            if let Some(request_id) = slot.request_id.take() {
                self.inner.requestor.remove(&slot.group_id, request_id);
            }
            slot.retry = false;
            if !slot.has_changes() {
                state.patches.remove(&edited);
            }
            if let Some(location) = state.tree.resolve(&edited) {
                if let Some(entity) = state.tree.entity_mut(&location, self.metadata()) {
                    for (property, original) in &restore {
                        set_property(entity, property, original.clone());
                    }
                }
            }
            info!("↩️ Reset {} unsent edits of {}", restore.len(), edited);
            resolve_all(waiters, Err(ODataError::canceled("changes were reset")));
            state.data_changed(&edited, restore.into_iter().map(|(property, _)| property).collect());
        }
    }

    /// Queues failed edits of the group again
    pub(crate) fn retry_patches(&self, state: &mut CacheState, group_id: &str) {
        let retry: Vec<ResourcePath> = state
            .patches
            .iter()
            .filter(|(_, slot)| {
                slot.retry
                    && slot.group_id == group_id
                    && slot.in_flight.is_none()
                    && slot.request_id.is_none()
                    && !slot.pending.is_empty()
            })
            .map(|(path, _)| path.clone())
            .collect();
        for path in retry {
            info!("🔄 Retrying PATCH of {}", path);
            let request_id = self.enqueue_patch(&path, group_id, false);
            if let Some(slot) = state.patches.get_mut(&path) {
                slot.retry = false;
                slot.request_id = Some(request_id);
            }
        }
    }
}
