//! `CacheCoordinator`: one per model instance, shared by every binding

use crate::config::CacheConfig;
use crate::create::PendingCreate;
use crate::delete::PendingDelete;
use crate::group_lock::{GroupLock, GroupLockManager};
use crate::messages::{MessageStore, messages_from_entity, messages_from_error, messages_from_header};
use crate::node::{CacheNodeKind, NodeData};
use crate::patch::PatchSlot;
use crate::query::QueryOptions;
use crate::requestor::{RequestObserver, Requestor};
use crate::tree::{CacheTree, Location};
use futures::FutureExt;
use futures::future::BoxFuture;
use odata_trait::{
    ChangeNotifier, HEADER_SAP_MESSAGES, Message, MessageDelta, MetadataProvider, ODataError, ODataResult,
    ResourcePath, Response, Transport,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Values of a read, keyed by the requested property path; `None` marks a
/// property that is not part of the cached data
pub type Properties = BTreeMap<String, Option<Value>>;

pub(crate) type Waiter<T> = oneshot::Sender<ODataResult<T>>;

pub(crate) type NavigationCheck = Box<dyn Fn(&str) -> bool + Send + Sync>;

pub(crate) enum Event {
    Data { path: String, properties: Vec<String> },
    Messages(MessageDelta),
}

#[derive(Default)]
pub(crate) struct CacheState {
    pub(crate) tree: CacheTree,
    pub(crate) messages: MessageStore,
    pub(crate) patches: HashMap<ResourcePath, PatchSlot>,
    pub(crate) creates: HashMap<String, PendingCreate>,
    pub(crate) deletes: HashMap<ResourcePath, PendingDelete>,
    pub(crate) disposed: bool,
    next_uid: u64,
    next_id: u64,
    events: Vec<Event>,
}

impl CacheState {
    pub(crate) fn data_changed(&mut self, path: &ResourcePath, properties: Vec<String>) {
        self.events.push(Event::Data {
            path: path.to_string(),
            properties,
        });
    }

    pub(crate) fn messages_changed(&mut self, delta: MessageDelta) {
        if !delta.is_empty() {
            self.events.push(Event::Messages(delta));
        }
    }

    /// Replaces the messages below `path`; messages of dependent caches
    /// below it are left to those caches
    pub(crate) fn replace_messages(&mut self, path: &ResourcePath, incoming: Vec<Message>) {
        let excluded: Vec<String> = self
            .tree
            .descendants(path)
            .into_iter()
            .filter_map(|id| self.tree.get(id))
            .map(|node| node.path.to_string())
            .collect();
        let delta = self.messages.replace(&path.to_string(), &excluded, incoming);
        self.messages_changed(delta);
    }

    pub(crate) fn next_uid(&mut self) -> String {
        self.next_uid += 1;
        format!("{}{}", crate::constants::TRANSIENT_UID_PREFIX, self.next_uid)
    }

    /// Ids for reads and bindings
    pub(crate) fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Property paths of the entity that carry unsent or in-flight edits
    pub(crate) fn pending_properties(&self, path: &ResourcePath) -> HashSet<String> {
        self.patches
            .get(path)
            .map(PatchSlot::edited_properties)
            .unwrap_or_default()
    }

    /// Replaces transient predicates of persisted rows by their key predicates
    pub(crate) fn canonical_path(&self, path: &ResourcePath) -> ResourcePath {
        let mut segments = path.segments().to_vec();
        for len in 1..=segments.len() {
            let Some(predicate) = segments[len - 1].predicate.clone() else {
                continue;
            };
            if !odata_trait::is_transient_predicate(&predicate) {
                continue;
            }
            let collection = ResourcePath::from_segments(segments[..len].to_vec()).without_last_predicate();
            let key = self
                .tree
                .node_at(&collection)
                .and_then(|id| self.tree.get(id))
                .and_then(|node| node.collection())
                .and_then(|collection| collection.row(&predicate))
                .map(|row| row.predicate.clone());
            if let Some(key) = key {
                segments[len - 1].predicate = Some(key);
            }
        }
        ResourcePath::from_segments(segments)
    }

    /// Drops everything cached at or below `path`: nodes, messages, edits
    pub(crate) fn forget(&mut self, path: &ResourcePath) {
        for node in self.tree.remove_subtree(path) {
            debug!("Dropped cache node {} below {}", node.id, path);
        }
        let delta = self.messages.remove_within(&path.to_string());
        self.messages_changed(delta);
        let edited: Vec<ResourcePath> = self
            .patches
            .keys()
            .filter(|edited| edited.starts_with(path))
            .cloned()
            .collect();
        for edited in edited {
            if let Some(slot) = self.patches.remove(&edited) {
                slot.cancel("entity was removed");
            }
        }
    }

    fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }
}

pub(crate) struct CoordinatorInner {
    pub(crate) config: CacheConfig,
    pub(crate) metadata: Arc<dyn MetadataProvider>,
    notifier: Arc<dyn ChangeNotifier>,
    pub(crate) requestor: Arc<Requestor>,
    state: Mutex<CacheState>,
    me: Weak<CoordinatorInner>,
}

/// Cache and request coordination for one model instance
#[derive(Clone)]
pub struct CacheCoordinator {
    pub(crate) inner: Arc<CoordinatorInner>,
}

impl CacheCoordinator {
    pub fn new(
        config: CacheConfig,
        transport: Arc<dyn Transport>,
        metadata: Arc<dyn MetadataProvider>,
        notifier: Arc<dyn ChangeNotifier>,
    ) -> Self {
        info!(
            "🚀 Creating cache coordinator for {} (transport: {})",
            config.service_url,
            transport.transport_name()
        );
        let inner = Arc::new_cyclic(|me: &Weak<CoordinatorInner>| {
            let observer: Weak<dyn RequestObserver> = me.clone();
            let requestor = Requestor::new(transport, config.clone(), GroupLockManager::new(), observer);
            CoordinatorInner {
                config,
                metadata,
                notifier,
                requestor,
                state: Mutex::new(CacheState::default()),
                me: me.clone(),
            }
        });
        Self { inner }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub(crate) fn metadata(&self) -> &dyn MetadataProvider {
        self.inner.metadata.as_ref()
    }

    pub(crate) fn weak(&self) -> Weak<CoordinatorInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<CoordinatorInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Runs `f` under the state lock and emits the collected events afterwards
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut CacheState) -> R) -> R {
        let (result, events) = {
            let mut state = self.inner.state.lock();
            let result = f(&mut state);
            (result, state.take_events())
        };
        self.emit(events);
        result
    }

    fn emit(&self, events: Vec<Event>) {
        for event in events {
            match event {
                Event::Data { path, properties } => self.inner.notifier.on_data_changed(&path, &properties),
                Event::Messages(delta) => self.inner.notifier.on_messages_changed(&delta),
            }
        }
    }

    pub(crate) fn read_group(&self, group_id: Option<&str>) -> String {
        group_id.unwrap_or(&self.inner.config.group_id).to_string()
    }

    pub(crate) fn update_group(&self, group_id: Option<&str>) -> String {
        group_id
            .unwrap_or(&self.inner.config.update_group_id)
            .to_string()
    }

    /// Answers whether a relative path below `meta_base` is a navigation property
    pub(crate) fn navigation_check(&self, meta_base: String) -> NavigationCheck {
        let metadata = self.inner.metadata.clone();
        Box::new(move |relative: &str| {
            metadata
                .resolve_navigation_multiplicity(&format!("{}/{}", meta_base, relative))
                .ok()
                .flatten()
                .is_some()
        })
    }

    /// Messages of a response for the entity at `path`; `None` if the
    /// response carries neither a `sap-messages` header nor the entity's
    /// messages property, so the cached messages stay valid
    pub(crate) fn response_messages(
        &self,
        path: &ResourcePath,
        response: &Response,
        entity: Option<&Map<String, Value>>,
    ) -> Option<Vec<Message>> {
        let target = path.to_string();
        let mut messages = response
            .header(HEADER_SAP_MESSAGES)
            .map(|_| messages_from_header(response, &target));
        let embedded = self
            .metadata()
            .messages_property(&path.meta_path())
            .zip(entity)
            .and_then(|(property, entity)| messages_from_entity(entity, &property, &target));
        if let Some(embedded) = embedded {
            messages.get_or_insert_with(Vec::new).extend(embedded);
        }
        messages
    }

    /// Merges an entity payload into the cache at `path`, keeping properties
    /// with pending edits, records what was fetched and replaces the
    /// entity's messages. Returns false if nothing is cached there anymore.
    pub(crate) fn apply_entity(
        &self,
        state: &mut CacheState,
        path: &ResourcePath,
        response: &Response,
        fetched: Option<&QueryOptions>,
    ) -> bool {
        let empty = Map::new();
        let body = response.body.as_object().unwrap_or(&empty);
        let Some(location) = state.tree.resolve(path) else {
            debug!("Discarding response for {}: no longer cached", path);
            return false;
        };
        let keep = state.pending_properties(path);
        let changed = {
            let uninitialized = location.row.is_none()
                && location.rest.is_empty()
                && state
                    .tree
                    .get(location.node)
                    .is_some_and(|node| matches!(node.data, NodeData::Entity(None)));
            if uninitialized {
                if let Some(node) = state.tree.get_mut(location.node) {
                    node.data = NodeData::Entity(Some(body.clone()));
                }
                body.keys().cloned().collect()
            } else {
                match state.tree.entity_mut(&location, self.metadata()) {
                    Some(entity) => crate::node::merge_entity(entity, body, &|property| keep.contains(property)),
                    None => {
                        debug!("Discarding response for {}: entity not in cache", path);
                        return false;
                    }
                }
            }
        };
        if let Some(query) = fetched {
            record_fetched(&mut state.tree, &location, query);
        }
        state.data_changed(path, changed);
        if let Some(messages) = self.response_messages(path, response, Some(body)) {
            state.replace_messages(path, messages);
        }
        true
    }

    /// Reads the ETag of a cached entity
    pub(crate) fn etag_of(&self, state: &mut CacheState, path: &ResourcePath) -> Option<String> {
        if self.inner.config.ignore_etags {
            return Some(crate::constants::ANY_ETAG.to_string());
        }
        let location = state.tree.resolve(path)?;
        state
            .tree
            .entity_mut(&location, self.metadata())?
            .get(crate::constants::ETAG_ANNOTATION)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Creates the node for `path` unless one exists; used by operations that
    /// run without a binding
    pub(crate) fn ensure_node(&self, state: &mut CacheState, kind: CacheNodeKind, path: &ResourcePath) -> crate::node::NodeId {
        match state.tree.node_at(path) {
            Some(id) => id,
            None => state.tree.attach(kind, path, &QueryOptions::default()),
        }
    }

    pub fn lock_group(&self, group_id: &str, owner: &str, locked: bool) -> GroupLock {
        self.inner.requestor.locks().lock_group(group_id, owner, locked, false)
    }

    /// Sends all requests of the group; resolves after every response was merged
    pub async fn submit_batch(&self, group_id: &str) -> ODataResult<()> {
        crate::config::validate_group_id(group_id)
            .map_err(|e| ODataError::validation("group_id", e))?;
        debug!("Submitting group {}", group_id);
        self.inner.requestor.submit_batch(group_id).await
    }

    pub fn add_change_set(&self, group_id: &str) {
        self.inner.requestor.add_change_set(group_id);
    }

    /// True if unsent or in-flight changes exist at or below `path` (anywhere if `None`)
    pub fn has_pending_changes(&self, path: Option<&str>) -> ODataResult<bool> {
        let path = path.map(ResourcePath::parse).transpose()?;
        Ok(self.with_state(|state| pending_changes_below(state, path.as_ref())))
    }

    pub fn messages(&self) -> Vec<Message> {
        self.with_state(|state| state.messages.all().to_vec())
    }

    /// Number of live cache nodes
    pub fn cache_size(&self) -> usize {
        self.with_state(|state| state.tree.len())
    }

    /// Tears the model down; pending futures fail with `Canceled` and still
    /// held group locks are reported. Returns the number of leaked locks.
    pub fn dispose(&self) -> usize {
        let leaked = self.inner.requestor.locks().report_leaks();
        self.inner.requestor.clear();
        self.with_state(|state| {
            state.disposed = true;
            for (_, slot) in state.patches.drain() {
                slot.cancel("model disposed");
            }
            for (_, create) in state.creates.drain() {
                create.cancel("model disposed");
            }
            for (_, delete) in state.deletes.drain() {
                delete.cancel("model disposed");
            }
            state.tree.clear();
            let delta = state.messages.clear();
            state.messages_changed(delta);
        });
        info!("🛑 Cache coordinator disposed ({} leaked locks)", leaked);
        leaked
    }

    pub(crate) fn ensure_alive(state: &CacheState) -> ODataResult<()> {
        if state.disposed {
            Err(ODataError::internal("model is disposed"))
        } else {
            Ok(())
        }
    }

    fn report(&self, resource: &str, error: &ODataError) {
        let messages = messages_from_error(error, resource);
        if messages.is_empty() {
            return;
        }
        self.with_state(|state| {
            let delta = state.messages.add(messages);
            state.messages_changed(delta);
        });
    }
}

impl RequestObserver for CoordinatorInner {
    fn before_submit(&self, group_id: &str) {
        if let Some(coordinator) = CacheCoordinator::upgrade(&self.me) {
            coordinator.retry_failed(group_id);
        }
    }

    fn request_failed(&self, resource: &str, error: &ODataError) {
        match error {
            ODataError::Skipped { .. } => warn!("Request for {} was not processed: {}", resource, error),
            _ => error!("❌ Request for {} failed: {}", resource, error),
        }
        if let Some(coordinator) = CacheCoordinator::upgrade(&self.me) {
            coordinator.report(resource, error);
        }
    }

    fn batch_failed(&self, group_id: &str, error: &ODataError) {
        error!("❌ Batch for group {} failed: {}", group_id, error);
        if let Some(coordinator) = CacheCoordinator::upgrade(&self.me) {
            coordinator.report("", error);
        }
    }
}

pub(crate) fn pending_changes_below(state: &CacheState, path: Option<&ResourcePath>) -> bool {
    let within = |candidate: &ResourcePath| path.is_none_or(|path| candidate.starts_with(path));
    state
        .patches
        .iter()
        .any(|(edited, slot)| slot.has_changes() && within(edited))
        || state.creates.values().any(|create| within(&create.path()))
        || state.deletes.keys().any(within)
}

/// Records what a response contained for a node or row
pub(crate) fn record_fetched(tree: &mut CacheTree, location: &Location, query: &QueryOptions) {
    let Some(node) = tree.get_mut(location.node) else {
        return;
    };
    let query = nest_below(&location.rest, query);
    match &location.row {
        Some(predicate) => {
            if let Some(row) = node.collection_mut().and_then(|collection| collection.row_mut(predicate)) {
                match &mut row.extra {
                    Some(extra) => extra.merge(&query),
                    None => row.extra = Some(query),
                }
            }
        }
        None => match &mut node.fetched {
            Some(fetched) => fetched.merge(&query),
            None => node.fetched = Some(query),
        },
    }
}

/// Wraps options read for a nested resource into `$expand`s of its parents
pub(crate) fn nest_below(rest: &[odata_trait::Segment], query: &QueryOptions) -> QueryOptions {
    rest.iter().rev().fold(query.clone(), |inner, segment| {
        QueryOptions::empty().with_expand(&segment.name, inner)
    })
}

pub(crate) fn resolve_all<T: Clone>(waiters: Vec<Waiter<T>>, result: ODataResult<T>) {
    for waiter in waiters {
        let _ = waiter.send(result.clone());
    }
}

pub(crate) fn receive<T: Send + 'static>(receiver: oneshot::Receiver<ODataResult<T>>) -> BoxFuture<'static, ODataResult<T>> {
    async move {
        receiver
            .await
            .unwrap_or_else(|_| Err(ODataError::canceled("operation was discarded")))
    }
    .boxed()
}

pub(crate) fn ready<T: Send + 'static>(result: ODataResult<T>) -> BoxFuture<'static, ODataResult<T>> {
    futures::future::ready(result).boxed()
}
