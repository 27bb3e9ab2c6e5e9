//! Request queues per group, `$batch` assembly and response dispatch

use crate::config::{CacheConfig, SubmitMode};
use crate::error::check_response;
use crate::group_lock::GroupLockManager;
use odata_trait::{Method, ODataError, ODataResult, Request, Response, Transport};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

/// Called once with the outcome of a request
pub type ResponseHandler = Box<dyn FnOnce(ODataResult<Response>) + Send>;

/// Builds the payload when the batch is assembled; `None` drops the request
pub type DeferredPayload = Box<dyn FnOnce() -> Option<Prepared> + Send>;

/// Body and extra headers of a request as sent
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Prepared {
    pub body: Option<Value>,
    pub headers: BTreeMap<String, String>,
}

impl Prepared {
    pub fn new(body: Option<Value>) -> Self {
        Self {
            body,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_string(), value.into());
        self
    }
}

pub enum Payload {
    Ready(Prepared),
    Deferred(DeferredPayload),
}

pub struct RequestSpec {
    pub method: Method,
    /// Relative URL including the query string
    pub url: String,
    /// Absolute resource path that messages of this request are relative to
    pub resource: String,
    pub payload: Payload,
    /// Sent by the submit that caused it, even though it was queued while
    /// that submit was running
    pub follow_up: bool,
}

impl RequestSpec {
    pub fn get(url: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            resource: resource.into(),
            payload: Payload::Ready(Prepared::default()),
            follow_up: false,
        }
    }

    pub fn write(method: Method, url: impl Into<String>, resource: impl Into<String>, payload: Payload) -> Self {
        Self {
            method,
            url: url.into(),
            resource: resource.into(),
            payload,
            follow_up: false,
        }
    }

    pub fn as_follow_up(mut self) -> Self {
        self.follow_up = true;
        self
    }
}

/// Receives submit and failure notifications from the requestor
pub trait RequestObserver: Send + Sync {
    /// A submit of `group_id` is about to drain the queue
    fn before_submit(&self, group_id: &str);

    /// A single request failed; not called for cancellations or for requests
    /// that failed together with their whole batch
    fn request_failed(&self, resource: &str, error: &ODataError);

    /// The whole batch failed
    fn batch_failed(&self, group_id: &str, error: &ODataError);
}

struct QueuedRequest {
    id: u64,
    method: Method,
    url: String,
    resource: String,
    payload: Payload,
    change_set: Option<u32>,
    follow_up: bool,
    handlers: Vec<ResponseHandler>,
}

struct GroupQueue {
    requests: Vec<QueuedRequest>,
    open_change_set: u32,
    flush_scheduled: bool,
}

impl Default for GroupQueue {
    fn default() -> Self {
        Self {
            requests: Vec::new(),
            open_change_set: 1,
            flush_scheduled: false,
        }
    }
}

struct Outgoing {
    request: Request,
    resource: String,
    handlers: Vec<ResponseHandler>,
}

pub struct Requestor {
    transport: Arc<dyn Transport>,
    config: CacheConfig,
    locks: GroupLockManager,
    queues: Mutex<HashMap<String, GroupQueue>>,
    next_id: AtomicU64,
    observer: Weak<dyn RequestObserver>,
    me: Weak<Requestor>,
}

impl Requestor {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: CacheConfig,
        locks: GroupLockManager,
        observer: Weak<dyn RequestObserver>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            transport,
            config,
            locks,
            queues: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            observer,
            me: me.clone(),
        })
    }

    pub fn locks(&self) -> &GroupLockManager {
        &self.locks
    }

    /// Queues a request; identical GETs share one request
    pub fn enqueue(&self, group_id: &str, spec: RequestSpec, handler: ResponseHandler) -> u64 {
        let mode = self.config.submit_mode(group_id);
        let (id, schedule) = {
            let mut queues = self.queues.lock();
            let queue = queues.entry(group_id.to_string()).or_default();
            if spec.method == Method::Get {
                if let Some(existing) = queue
                    .requests
                    .iter_mut()
                    .find(|queued| queued.method == Method::Get && queued.url == spec.url)
                {
                    debug!("♻️ Reusing queued GET {} in group {}", spec.url, group_id);
                    existing.handlers.push(handler);
                    existing.follow_up |= spec.follow_up;
                    return existing.id;
                }
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let change_set = spec.method.is_modifying().then_some(queue.open_change_set);
            debug!(
                "📥 Queued {} {} as request {} in group {}",
                spec.method, spec.url, id, group_id
            );
            queue.requests.push(QueuedRequest {
                id,
                method: spec.method,
                url: spec.url,
                resource: spec.resource,
                payload: spec.payload,
                change_set,
                follow_up: spec.follow_up,
                handlers: vec![handler],
            });
            let schedule = mode != SubmitMode::Api && !queue.flush_scheduled;
            if schedule {
                queue.flush_scheduled = true;
            }
            (id, schedule)
        };
        if schedule {
            self.schedule_flush(group_id, mode);
        }
        id
    }

    /// Removes an unsent request; its handlers are dropped without being called
    pub fn remove(&self, group_id: &str, request_id: u64) -> bool {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(group_id) else {
            return false;
        };
        let before = queue.requests.len();
        queue.requests.retain(|queued| queued.id != request_id);
        let removed = queue.requests.len() < before;
        if removed {
            debug!("🗑️ Removed unsent request {} from group {}", request_id, group_id);
        }
        removed
    }

    /// Opens the next change-set for writes queued from now on
    pub fn add_change_set(&self, group_id: &str) {
        let mut queues = self.queues.lock();
        let queue = queues.entry(group_id.to_string()).or_default();
        let current = queue.open_change_set;
        if queue
            .requests
            .iter()
            .any(|queued| queued.change_set == Some(current))
        {
            queue.open_change_set += 1;
        }
    }

    /// Drops every queued request; used on disposal
    pub fn clear(&self) {
        self.queues.lock().clear();
    }

    fn schedule_flush(&self, group_id: &str, mode: SubmitMode) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime to flush group {}; requests stay queued", group_id);
            return;
        };
        let group_id = group_id.to_string();
        runtime.spawn(async move {
            if mode == SubmitMode::Auto {
                // let every request of the current tick join the batch
                tokio::task::yield_now().await;
            }
            if let Err(e) = me.submit_batch(&group_id).await {
                warn!("Automatic submit of group {} failed: {}", group_id, e);
            }
        });
    }

    /// Sends everything queued for the group once older group locks are released.
    ///
    /// Completion handlers run before this returns. Follow-up requests queued
    /// by those handlers are sent in further round trips of the same submit.
    pub async fn submit_batch(&self, group_id: &str) -> ODataResult<()> {
        let serial = self.locks.current_serial();
        self.locks.wait_for_earlier(group_id, serial).await;
        if let Some(observer) = self.observer.upgrade() {
            observer.before_submit(group_id);
        }

        let mut result = Ok(());
        loop {
            let queued = self.drain(group_id);
            if queued.is_empty() {
                break;
            }
            if let Err(e) = self.send(group_id, queued).await {
                result = Err(e);
            }
            if !self.has_follow_ups(group_id) {
                break;
            }
        }
        result
    }

    fn drain(&self, group_id: &str) -> Vec<QueuedRequest> {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(group_id) else {
            return Vec::new();
        };
        queue.open_change_set = 1;
        queue.flush_scheduled = false;
        std::mem::take(&mut queue.requests)
    }

    fn has_follow_ups(&self, group_id: &str) -> bool {
        self.queues
            .lock()
            .get(group_id)
            .is_some_and(|queue| queue.requests.iter().any(|queued| queued.follow_up))
    }

    async fn send(&self, group_id: &str, queued: Vec<QueuedRequest>) -> ODataResult<()> {
        let outgoing = materialize(arrange_change_sets(queued));
        if outgoing.is_empty() {
            debug!("Nothing left to send for group {}", group_id);
            return Ok(());
        }
        let direct = self.config.submit_mode(group_id) == SubmitMode::Direct;
        let requests: Vec<Request> = outgoing.iter().map(|o| o.request.clone()).collect();

        if direct {
            let mut results = Vec::with_capacity(requests.len());
            for mut request in requests {
                request.change_set = None;
                info!("📤 Sending {} directly", request);
                results.push(
                    self.transport
                        .send_request(request)
                        .await
                        .and_then(check_response),
                );
            }
            self.dispatch(outgoing, results, false);
            return Ok(());
        }

        info!(
            "📤 Sending batch for group {} with {} requests via {}",
            group_id,
            requests.len(),
            self.transport.transport_name()
        );
        match self.transport.send_batch(group_id, requests).await {
            Ok(responses) => {
                let results = map_responses(&outgoing, responses);
                self.dispatch(outgoing, results, false);
                Ok(())
            }
            Err(error) => {
                warn!("❌ Batch for group {} failed: {}", group_id, error);
                if let Some(observer) = self.observer.upgrade() {
                    observer.batch_failed(group_id, &error);
                }
                let results = outgoing
                    .iter()
                    .map(|_| Err(ODataError::skipped(error.clone())))
                    .collect();
                self.dispatch(outgoing, results, true);
                Err(error)
            }
        }
    }

    fn dispatch(&self, outgoing: Vec<Outgoing>, results: Vec<ODataResult<Response>>, batch_failed: bool) {
        let observer = self.observer.upgrade();
        for (item, result) in outgoing.into_iter().zip(results) {
            match &result {
                Ok(response) => debug!(
                    "✅ Request {} ({}) finished with status {}",
                    item.request.id, item.request, response.status
                ),
                Err(error) => debug!("Request {} ({}) failed: {}", item.request.id, item.request, error),
            }
            let failure = result.as_ref().err().cloned();
            for handler in item.handlers {
                handler(result.clone());
            }
            if let (Some(error), Some(observer)) = (failure, &observer) {
                if !error.is_canceled() && !batch_failed {
                    observer.request_failed(&item.resource, &error);
                }
            }
        }
    }
}

/// Places every change-set at the position of its first request
fn arrange_change_sets(queued: Vec<QueuedRequest>) -> Vec<QueuedRequest> {
    let mut order: Vec<Option<u32>> = Vec::new();
    for request in &queued {
        match request.change_set {
            Some(number) if order.contains(&Some(number)) => {}
            change_set => order.push(change_set),
        }
    }
    let mut reads: Vec<QueuedRequest> = Vec::new();
    let mut change_sets: BTreeMap<u32, Vec<QueuedRequest>> = BTreeMap::new();
    for request in queued {
        match request.change_set {
            Some(number) => change_sets.entry(number).or_default().push(request),
            None => reads.push(request),
        }
    }
    let mut reads = reads.into_iter();
    let mut arranged = Vec::new();
    for slot in order {
        match slot {
            Some(number) => arranged.extend(change_sets.remove(&number).unwrap_or_default()),
            None => arranged.extend(reads.next()),
        }
    }
    arranged
}

/// Computes deferred payloads and renumbers change-sets from 1
fn materialize(queued: Vec<QueuedRequest>) -> Vec<Outgoing> {
    let mut numbering: Vec<u32> = Vec::new();
    let mut outgoing = Vec::new();
    for request in queued {
        let prepared = match request.payload {
            Payload::Ready(prepared) => Some(prepared),
            Payload::Deferred(build) => build(),
        };
        let Some(prepared) = prepared else {
            debug!("Dropped request {} ({} {}) before sending", request.id, request.method, request.url);
            for handler in request.handlers {
                handler(Err(ODataError::canceled("request dropped before sending")));
            }
            continue;
        };
        let change_set = request.change_set.map(|number| {
            match numbering.iter().position(|known| *known == number) {
                Some(index) => index as u32 + 1,
                None => {
                    numbering.push(number);
                    numbering.len() as u32
                }
            }
        });
        outgoing.push(Outgoing {
            request: Request {
                id: request.id,
                method: request.method,
                url: request.url,
                headers: prepared.headers,
                body: prepared.body,
                change_set,
            },
            resource: request.resource,
            handlers: request.handlers,
        });
    }
    outgoing
}

/// Maps batch responses by position. A missing response means the request was
/// not processed; a failure inside a change-set fails its other members too.
fn map_responses(outgoing: &[Outgoing], responses: Vec<Response>) -> Vec<ODataResult<Response>> {
    let mut responses = responses.into_iter();
    let mut first_error: Option<ODataError> = None;
    let mut results: Vec<ODataResult<Response>> = Vec::with_capacity(outgoing.len());
    for _ in outgoing {
        let result = match responses.next() {
            Some(response) => check_response(response),
            None => Err(ODataError::skipped(
                first_error
                    .clone()
                    .unwrap_or_else(|| ODataError::internal("no response for request")),
            )),
        };
        if let Err(error) = &result {
            if first_error.is_none() && !matches!(error, ODataError::Skipped { .. }) {
                first_error = Some(error.clone());
            }
        }
        results.push(result);
    }

    let mut poisoned: HashMap<u32, ODataError> = HashMap::new();
    for (item, result) in outgoing.iter().zip(&results) {
        if let (Some(number), Err(error)) = (item.request.change_set, result) {
            if !matches!(error, ODataError::Skipped { .. }) {
                poisoned.entry(number).or_insert_with(|| error.clone());
            }
        }
    }
    for (item, result) in outgoing.iter().zip(results.iter_mut()) {
        if let Some(cause) = item.request.change_set.and_then(|number| poisoned.get(&number)) {
            if result.is_ok() {
                *result = Err(ODataError::skipped(cause.clone()));
            }
        }
    }
    results
}
