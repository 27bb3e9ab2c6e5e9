//! OData Trait - collaborator interfaces for the cache coordinator
//!
//! This crate defines what the cache & request coordination layer needs from
//! the outside world: a `Transport` that executes batches, a `MetadataProvider`
//! answering structural questions, and a `ChangeNotifier` that receives data
//! and message change events.

use async_trait::async_trait;

pub mod error;
pub mod types;

pub use error::{ErrorDetail, ODataError, ODataResult, SKIPPED_MESSAGE};
pub use types::*;

/// Executes requests against an OData V4 service
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send the requests of one group as a `$batch`.
    ///
    /// Responses map 1:1 to `requests` by position. A shorter vector means the
    /// service stopped processing; the remaining requests count as not processed.
    /// An `Err` fails the whole batch.
    async fn send_batch(&self, group_id: &str, requests: Vec<Request>) -> ODataResult<Vec<Response>>;

    /// Send a single request outside of any batch
    async fn send_request(&self, request: Request) -> ODataResult<Response> {
        let mut responses = self.send_batch("$direct", vec![request]).await?;
        responses
            .pop()
            .ok_or_else(|| ODataError::transport(None, "empty response"))
    }

    /// Optional: transport name for logging
    fn transport_name(&self) -> &'static str {
        "Unknown"
    }
}

/// Cardinality of a navigation property or entity set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multiplicity {
    One,
    Many,
}

/// Structural knowledge about the service, answered from `$metadata`
pub trait MetadataProvider: Send + Sync {
    /// Multiplicity of the resource addressed by a meta path such as
    /// `/SalesOrderList/SO_2_SOITEM`; `None` for structural properties.
    /// Entity sets resolve to `Many`, singletons to `One`.
    fn resolve_navigation_multiplicity(&self, meta_path: &str) -> ODataResult<Option<Multiplicity>>;

    /// Key property names of the entity type reached by `meta_path`
    fn resolve_key_properties(&self, meta_path: &str) -> ODataResult<Vec<String>>;

    /// Name of the property carrying embedded messages for entities at `meta_path`
    fn messages_property(&self, _meta_path: &str) -> Option<String> {
        None
    }
}

/// Receives change events; must not block and must not call back synchronously
/// into the coordinator while holding its own locks
pub trait ChangeNotifier: Send + Sync {
    fn on_data_changed(&self, path: &str, properties: &[String]);

    fn on_messages_changed(&self, delta: &MessageDelta);
}

/// Notifier that drops every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl ChangeNotifier for NoopNotifier {
    fn on_data_changed(&self, _path: &str, _properties: &[String]) {}

    fn on_messages_changed(&self, _delta: &MessageDelta) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct EchoTransport;

    #[async_trait]
    impl Transport for EchoTransport {
        async fn send_batch(&self, _group_id: &str, requests: Vec<Request>) -> ODataResult<Vec<Response>> {
            Ok(requests
                .into_iter()
                .map(|request| Response::ok(json!({ "url": request.url })))
                .collect())
        }
    }

    #[tokio::test]
    async fn test_send_request_defaults_to_single_batch() {
        let request = Request {
            id: 1,
            method: Method::Get,
            url: "EMPLOYEES('2')/Name".to_string(),
            headers: Default::default(),
            body: None,
            change_set: None,
        };
        let response = EchoTransport.send_request(request).await.unwrap();
        assert_eq!(response.body["url"], "EMPLOYEES('2')/Name");
    }
}
