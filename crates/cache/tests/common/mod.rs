#![allow(dead_code)]

use async_trait::async_trait;
use odata_cache::odata_trait::{
    ChangeNotifier, Message, MessageDelta, MetadataProvider, Method, Multiplicity, ODataError, ODataResult,
    Request, Response, Transport,
};
use odata_cache::{CacheConfig, CacheCoordinator};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Notify;

/// Transport answering from scripted batches first, then from routes
#[derive(Default)]
pub struct MockTransport {
    batches: Mutex<Vec<(String, Vec<Request>)>>,
    scripted: Mutex<VecDeque<ODataResult<Vec<Response>>>>,
    routes: Mutex<HashMap<(Method, String), Response>>,
    gate: Mutex<Option<Arc<Notify>>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fixed response for every request with this method and URL
    pub fn route(&self, method: Method, url: &str, response: Response) {
        self.routes.lock().insert((method, url.to_string()), response);
    }

    /// Responses of the next batch, by position
    pub fn script(&self, responses: Vec<Response>) {
        self.scripted.lock().push_back(Ok(responses));
    }

    /// The next batch fails as a whole
    pub fn fail_next_batch(&self, error: ODataError) {
        self.scripted.lock().push_back(Err(error));
    }

    /// The next batch is held until the returned notify fires
    pub fn hold_next_batch(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn batches(&self) -> Vec<(String, Vec<Request>)> {
        self.batches.lock().clone()
    }

    pub fn batch_count(&self) -> usize {
        self.batches.lock().len()
    }

    pub fn requests(&self) -> Vec<Request> {
        self.batches
            .lock()
            .iter()
            .flat_map(|(_, requests)| requests.clone())
            .collect()
    }

    pub fn request_urls(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|request| format!("{} {}", request.method, request.url))
            .collect()
    }

    fn answer(&self, request: &Request) -> Response {
        let routes = self.routes.lock();
        match routes.get(&(request.method, request.url.clone())) {
            Some(response) => response.clone(),
            None if request.method == Method::Get => {
                Response::error(404, "NotFound", &format!("no route for {}", request.url))
            }
            None => Response::no_content(),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send_batch(&self, group_id: &str, requests: Vec<Request>) -> ODataResult<Vec<Response>> {
        self.batches
            .lock()
            .push((group_id.to_string(), requests.clone()));
        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        let scripted = self.scripted.lock().pop_front();
        match scripted {
            Some(result) => result,
            None => Ok(requests.iter().map(|request| self.answer(request)).collect()),
        }
    }

    fn transport_name(&self) -> &'static str {
        "mock"
    }
}

/// Sales order and employee service
pub struct MockMetadata;

impl MetadataProvider for MockMetadata {
    fn resolve_navigation_multiplicity(&self, meta_path: &str) -> ODataResult<Option<Multiplicity>> {
        Ok(match meta_path {
            "/SalesOrderList" | "/SalesOrderList/SO_2_SOITEM" | "/EMPLOYEES" | "/TEAMS" => {
                Some(Multiplicity::Many)
            }
            "/SalesOrderList/SO_2_BP" | "/EMPLOYEES/EMPLOYEE_2_TEAM" | "/SalesOrderList/SO_2_SOITEM/SOITEM_2_PRODUCT" => {
                Some(Multiplicity::One)
            }
            _ => None,
        })
    }

    fn resolve_key_properties(&self, meta_path: &str) -> ODataResult<Vec<String>> {
        let keys: &[&str] = match meta_path {
            "/SalesOrderList" => &["SalesOrderID"],
            "/SalesOrderList/SO_2_SOITEM" => &["SalesOrderID", "ItemPosition"],
            "/SalesOrderList/SO_2_BP" => &["BusinessPartnerID"],
            "/SalesOrderList/SO_2_SOITEM/SOITEM_2_PRODUCT" => &["ProductID"],
            "/EMPLOYEES" => &["ID"],
            "/TEAMS" | "/EMPLOYEES/EMPLOYEE_2_TEAM" => &["Team_Id"],
            other => return Err(ODataError::metadata(format!("no entity type at {}", other))),
        };
        Ok(keys.iter().map(|key| key.to_string()).collect())
    }

    fn messages_property(&self, meta_path: &str) -> Option<String> {
        (meta_path == "/SalesOrderList").then(|| "Messages".to_string())
    }
}

/// Records every change event
#[derive(Default)]
pub struct RecordingNotifier {
    data: Mutex<Vec<(String, Vec<String>)>>,
    messages: Mutex<Vec<MessageDelta>>,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn data_events(&self) -> Vec<(String, Vec<String>)> {
        self.data.lock().clone()
    }

    pub fn changed_paths(&self) -> Vec<String> {
        self.data.lock().iter().map(|(path, _)| path.clone()).collect()
    }

    pub fn removed_messages(&self) -> Vec<Message> {
        self.messages
            .lock()
            .iter()
            .flat_map(|delta| delta.removed.clone())
            .collect()
    }
}

impl ChangeNotifier for RecordingNotifier {
    fn on_data_changed(&self, path: &str, properties: &[String]) {
        self.data.lock().push((path.to_string(), properties.to_vec()));
    }

    fn on_messages_changed(&self, delta: &MessageDelta) {
        self.messages.lock().push(delta.clone());
    }
}

/// Reads go to group "read", writes to group "update"; both wait for `submit_batch`
pub fn config() -> CacheConfig {
    CacheConfig {
        group_id: "read".to_string(),
        update_group_id: "update".to_string(),
        ..CacheConfig::default()
    }
}

pub struct Fixture {
    pub coordinator: CacheCoordinator,
    pub transport: Arc<MockTransport>,
    pub notifier: Arc<RecordingNotifier>,
}

pub fn fixture_with(config: CacheConfig) -> Fixture {
    monitoring::init_test_logging();
    let transport = MockTransport::new();
    let notifier = RecordingNotifier::new();
    let coordinator = CacheCoordinator::new(config, transport.clone(), Arc::new(MockMetadata), notifier.clone());
    Fixture {
        coordinator,
        transport,
        notifier,
    }
}

pub fn fixture() -> Fixture {
    fixture_with(config())
}
