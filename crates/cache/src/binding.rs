//! Binding handles: the per-binding view on the shared cache

use crate::coordinator::{CacheCoordinator, Properties, nest_below};
use crate::create::{CreateOptions, CreatedContext};
use crate::group_lock::GroupLock;
use crate::node::{CacheNodeKind, NodeId};
use crate::operation::OperationKind;
use crate::query::QueryOptions;
use crate::read::RowSnapshot;
use crate::tree::{kind_for_path, needs_own_cache};
use futures::future::BoxFuture;
use odata_trait::{ODataError, ODataResult, ResourcePath};
use serde_json::{Map, Value};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    Context,
    List,
    Property,
    Operation,
}

#[derive(Debug, Clone, Default)]
pub struct BindingParameters {
    /// `$select`/`$expand` (and row options for lists) the binding needs
    pub query: QueryOptions,
    /// Read through an own cache even if a parent cache could serve the data
    pub own_request: bool,
    /// Group for reads; the model's group if `None`
    pub group_id: Option<String>,
    /// Group for writes; the model's update group if `None`
    pub update_group_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attachment {
    /// The binding owns (a share of) the node at its path
    Own(NodeId),
    /// The binding's data lives inside a parent's node
    Inherited(NodeId),
}

/// Handle of one binding. Dropping it releases its cache node and the group
/// locks it asked to unlock on destruction.
pub struct Binding {
    coordinator: CacheCoordinator,
    id: u64,
    kind: BindingKind,
    path: ResourcePath,
    attachment: Attachment,
    parameters: BindingParameters,
}

impl CacheCoordinator {
    pub fn bind_context(&self, path: &str, parameters: BindingParameters) -> ODataResult<Binding> {
        self.bind(BindingKind::Context, path, parameters)
    }

    pub fn bind_list(&self, path: &str, parameters: BindingParameters) -> ODataResult<Binding> {
        self.bind(BindingKind::List, path, parameters)
    }

    pub fn bind_property(&self, path: &str, parameters: BindingParameters) -> ODataResult<Binding> {
        self.bind(BindingKind::Property, path, parameters)
    }

    pub fn bind_operation(&self, path: &str, parameters: BindingParameters) -> ODataResult<Binding> {
        self.bind(BindingKind::Operation, path, parameters)
    }

    /// Attaches a binding at `path`: to its own cache node if it needs one,
    /// otherwise to the cache of the closest parent that contains the path
    pub fn bind(&self, kind: BindingKind, path: &str, parameters: BindingParameters) -> ODataResult<Binding> {
        let path = ResourcePath::parse(path)?;
        let (id, path, attachment) = self.with_state(|state| -> ODataResult<_> {
            Self::ensure_alive(state)?;
            let path = state.canonical_path(&path);
            let id = state.next_id();
            let query = &parameters.query;

            if kind == BindingKind::Operation {
                let node = state.tree.attach(CacheNodeKind::OperationResult, &path, query);
                return Ok((id, path, Attachment::Own(node)));
            }
            if state.tree.node_at(&path).is_some() {
                let kind = state
                    .tree
                    .node_at(&path)
                    .and_then(|node| state.tree.get(node))
                    .map(|node| node.kind)
                    .ok_or_else(|| ODataError::internal(format!("cache node for {} vanished", path)))?;
                let node = state.tree.attach(kind, &path, query);
                return Ok((id, path, Attachment::Own(node)));
            }

            let parent = state.tree.resolve(&path).and_then(|location| {
                let node = state.tree.get(location.node)?;
                let base = match &location.row {
                    Some(predicate) => node.path.with_predicate(predicate.clone()),
                    None => node.path.clone(),
                };
                Some((location, base))
            });
            let shared = match &parent {
                Some((location, base)) if !location.rest.is_empty() => {
                    let relative = location
                        .rest
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("/");
                    !needs_own_cache(self.metadata(), base, &relative, query, parameters.own_request)?
                }
                Some(_) => !parameters.own_request,
                None => false,
            };

            match parent {
                Some((location, _)) if shared => {
                    let registered = match (kind, location.rest.split_last()) {
                        (BindingKind::Property, Some((property, parents))) => {
                            nest_below(parents, &QueryOptions::empty().with_select([property.name.clone()]))
                        }
                        _ => nest_below(&location.rest, query),
                    };
                    if let Some(node) = state.tree.get_mut(location.node) {
                        node.query.merge(&registered);
                    }
                    Ok((id, path, Attachment::Inherited(location.node)))
                }
                _ => {
                    let node_kind = kind_for_path(self.metadata(), &path)?;
                    let node_kind = match (kind, node_kind) {
                        (BindingKind::List, CacheNodeKind::Collection) => CacheNodeKind::Collection,
                        (BindingKind::List, _) => {
                            return Err(ODataError::validation("path", format!("{} is not a collection", path)));
                        }
                        (_, kind) => kind,
                    };
                    let node = state.tree.attach(node_kind, &path, query);
                    Ok((id, path, Attachment::Own(node)))
                }
            }
        })?;
        info!("🔗 Bound {:?} binding {} to {} ({:?})", kind, id, path, attachment);
        Ok(Binding {
            coordinator: self.clone(),
            id,
            kind,
            path,
            attachment,
            parameters,
        })
    }
}

impl Binding {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> BindingKind {
        self.kind
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn has_own_cache(&self) -> bool {
        matches!(self.attachment, Attachment::Own(_))
    }

    /// Owner name used for group locks
    pub fn owner(&self) -> String {
        format!("binding-{}", self.id)
    }

    fn path_string(&self) -> String {
        self.path.to_string()
    }

    fn write_group(&self) -> Option<&str> {
        self.parameters.update_group_id.as_deref()
    }

    pub fn read(&self, properties: &[&str]) -> BoxFuture<'static, ODataResult<Properties>> {
        self.coordinator.read(&self.path_string(), properties)
    }

    pub fn read_range(&self, start: usize, length: usize) -> BoxFuture<'static, ODataResult<Vec<RowSnapshot>>> {
        self.coordinator.read_range(&self.path_string(), start, length)
    }

    /// Value of a property binding
    pub fn value(&self) -> BoxFuture<'static, ODataResult<Option<Value>>> {
        self.coordinator.read_value(&self.path_string())
    }

    pub fn count(&self) -> ODataResult<Option<usize>> {
        self.coordinator.count(&self.path_string())
    }

    pub fn update(&self, property: &str, value: Value) -> ODataResult<BoxFuture<'static, ODataResult<()>>> {
        self.coordinator
            .update(&self.path_string(), property, value, self.write_group())
    }

    /// Sets the value of a property binding
    pub fn set_value(&self, value: Value) -> ODataResult<BoxFuture<'static, ODataResult<()>>> {
        let (Some(parent), Some(last)) = (self.path.parent(), self.path.last()) else {
            return Err(ODataError::validation("path", format!("{} is not a property", self.path)));
        };
        self.coordinator
            .update(&parent.to_string(), &last.name, value, self.write_group())
    }

    pub fn create(&self, initial: Value, mut options: CreateOptions) -> ODataResult<CreatedContext> {
        if self.kind != BindingKind::List {
            return Err(ODataError::validation("binding", "only list bindings create rows"));
        }
        if options.group_id.is_none() {
            options.group_id = self.parameters.update_group_id.clone();
        }
        self.coordinator.create(&self.path_string(), initial, options)
    }

    pub fn delete(&self) -> ODataResult<BoxFuture<'static, ODataResult<()>>> {
        self.coordinator.delete(&self.path_string(), self.write_group())
    }

    pub fn invoke(&self, kind: OperationKind, parameters: Map<String, Value>) -> ODataResult<BoxFuture<'static, ODataResult<Option<Value>>>> {
        if self.kind != BindingKind::Operation {
            return Err(ODataError::validation("binding", "only operation bindings invoke"));
        }
        let group = match kind {
            OperationKind::Action => self.parameters.update_group_id.as_deref(),
            OperationKind::Function => self.parameters.group_id.as_deref(),
        };
        self.coordinator.invoke(&self.path_string(), kind, parameters, group)
    }

    pub fn refresh(&self, allow_removal: bool) -> ODataResult<BoxFuture<'static, ODataResult<()>>> {
        self.coordinator
            .refresh(&self.path_string(), allow_removal, self.parameters.group_id.as_deref())
    }

    pub fn request_side_effects(&self, paths: &[&str]) -> ODataResult<BoxFuture<'static, ODataResult<()>>> {
        self.coordinator
            .request_side_effects(&self.path_string(), paths, self.parameters.group_id.as_deref())
    }

    pub fn has_pending_changes(&self) -> ODataResult<bool> {
        self.coordinator.has_pending_changes(Some(&self.path_string()))
    }

    pub fn reset_changes(&self) -> ODataResult<()> {
        self.coordinator.reset_changes(&self.path_string())
    }

    /// Lock owned by this binding; with `unlock_on_destroy` it is released
    /// when the binding is dropped
    pub fn lock_group(&self, group_id: &str, locked: bool, unlock_on_destroy: bool) -> GroupLock {
        self.coordinator
            .inner
            .requestor
            .locks()
            .lock_group(group_id, &self.owner(), locked, unlock_on_destroy)
    }

    /// Same as dropping the handle
    pub fn destroy(self) {}
}

impl Drop for Binding {
    fn drop(&mut self) {
        if let Attachment::Own(node) = self.attachment {
            self.coordinator.with_state(|state| {
                if let Some(removed) = state.tree.release(node) {
                    debug!("Cache of {} released with its last binding", removed.path);
                }
            });
        }
        self.coordinator.inner.requestor.locks().unlock_owned_by(&self.owner());
        debug!("Destroyed binding {} for {}", self.id, self.path);
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("path", &self.path)
            .field("own_cache", &self.has_own_cache())
            .finish()
    }
}
