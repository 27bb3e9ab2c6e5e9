//! Bound and unbound operations

use crate::constants::VALUE_PROPERTY;
use crate::coordinator::{CacheCoordinator, CacheState, receive};
use crate::node::{CacheNodeKind, NodeData, NodeId};
use crate::query::QueryOptions;
use crate::requestor::{Payload, Prepared, RequestSpec};
use futures::future::BoxFuture;
use odata_trait::{
    HEADER_IF_MATCH, Method, ODataError, ODataResult, ResourcePath, Response, format_key_value, key_predicate,
};
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// POST with the parameters as body
    Action,
    /// GET with the parameters inline
    Function,
}

impl CacheCoordinator {
    /// Invokes the operation whose last segment is the operation name, e.g.
    /// `/SalesOrderList('1')/SalesOrder_Confirm` (bound) or `/GetEmployeeByID`.
    /// The result is cached at `operation_path`; `None` for an empty response.
    pub fn invoke(
        &self,
        operation_path: &str,
        kind: OperationKind,
        parameters: Map<String, Value>,
        group_id: Option<&str>,
    ) -> ODataResult<BoxFuture<'static, ODataResult<Option<Value>>>> {
        let path = ResourcePath::parse(operation_path)?;
        if path.last().is_some_and(|segment| segment.predicate.is_some()) {
            return Err(ODataError::validation(
                "operation_path",
                format!("{} does not end with an operation name", path),
            ));
        }
        let group_id = match kind {
            OperationKind::Action => self.update_group(group_id),
            OperationKind::Function => self.read_group(group_id),
        };
        crate::config::validate_group_id(&group_id).map_err(|e| ODataError::validation("group_id", e))?;

        self.with_state(|state| {
            Self::ensure_alive(state)?;
            let path = state.canonical_path(&path);
            let binding = path.parent();
            let node_id = self.ensure_node(state, CacheNodeKind::OperationResult, &path);
            let (sender, receiver) = oneshot::channel();

            let spec = match kind {
                OperationKind::Action => {
                    let prepare = {
                        let weak = self.weak();
                        let binding = binding.clone();
                        let body = Value::Object(parameters);
                        move || {
                            let coordinator = CacheCoordinator::upgrade(&weak)?;
                            let prepared = Prepared::new(Some(body));
                            let etag = binding
                                .as_ref()
                                .and_then(|binding| coordinator.with_state(|state| coordinator.etag_of(state, binding)));
                            Some(match etag {
                                Some(etag) => prepared.with_header(HEADER_IF_MATCH, etag),
                                None => prepared,
                            })
                        }
                    };
                    RequestSpec::write(
                        Method::Post,
                        path.to_relative_url(),
                        path.to_string(),
                        Payload::Deferred(Box::new(prepare)),
                    )
                }
                OperationKind::Function => RequestSpec::get(function_url(&path, &parameters)?, path.to_string()),
            };
            let weak = self.weak();
            let result_path = path.clone();
            self.inner.requestor.enqueue(
                &group_id,
                spec,
                Box::new(move |result: ODataResult<Response>| {
                    let outcome = match CacheCoordinator::upgrade(&weak) {
                        Some(coordinator) => result.map(|response| {
                            coordinator.with_state(|state| {
                                coordinator.operation_completed(state, node_id, &result_path, binding.as_ref(), &response)
                            })
                        }),
                        None => Err(ODataError::canceled("model destroyed")),
                    };
                    let _ = sender.send(outcome);
                }),
            );
            info!("⚙️ Invoking {:?} {} in group {}", kind, path, group_id);
            Ok(receive(receiver))
        })
    }

    fn operation_completed(
        &self,
        state: &mut CacheState,
        node_id: NodeId,
        path: &ResourcePath,
        binding: Option<&ResourcePath>,
        response: &Response,
    ) -> Option<Value> {
        let result = match &response.body {
            Value::Null => None,
            Value::Object(body) if is_value_wrapper(body) => body.get(VALUE_PROPERTY).cloned(),
            body => Some(body.clone()),
        };
        if let Some(node) = state.tree.get_mut(node_id) {
            node.data = NodeData::Value(result.clone());
            node.fetched = Some(QueryOptions::default());
        }
        state.data_changed(path, vec![VALUE_PROPERTY.to_string()]);

        let returned = response.body.as_object();
        match (binding, returned) {
            (Some(binding), Some(entity)) if self.is_same_entity(binding, entity) => {
                debug!("Operation {} returned its binding parameter; merging it", path);
                self.apply_entity(state, binding, response, None);
            }
            _ => {
                let resource = binding.unwrap_or(path);
                let messages = crate::messages::messages_from_header(response, &resource.to_string());
                let delta = state.messages.add(messages);
                state.messages_changed(delta);
            }
        }
        result
    }

    fn is_same_entity(&self, binding: &ResourcePath, entity: &Map<String, Value>) -> bool {
        let Some(predicate) = binding.last().and_then(|segment| segment.predicate.as_deref()) else {
            return false;
        };
        let keys = self
            .metadata()
            .resolve_key_properties(&binding.without_last_predicate().meta_path())
            .unwrap_or_default();
        key_predicate(&keys, entity).as_deref() == Some(predicate)
    }
}

/// `{"value": ...}` with nothing but annotations next to it
fn is_value_wrapper(body: &Map<String, Value>) -> bool {
    body.contains_key(VALUE_PROPERTY) && body.keys().all(|key| key == VALUE_PROPERTY || key.starts_with('@'))
}

/// `Binding/Name(p1=v1,p2=v2)`
fn function_url(path: &ResourcePath, parameters: &Map<String, Value>) -> ODataResult<String> {
    let parameters = parameters
        .iter()
        .map(|(name, value)| {
            let value = match format_key_value(value) {
                Some(value) => value,
                None => serde_json::to_string(value).map_err(|e| ODataError::validation(name.clone(), e))?,
            };
            Ok(format!("{}={}", name, value))
        })
        .collect::<ODataResult<Vec<_>>>()?;
    Ok(format!("{}({})", path.to_relative_url(), parameters.join(",")))
}
