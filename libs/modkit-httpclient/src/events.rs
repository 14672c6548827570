//! Request/response lifecycle events.
//!
//! Listeners are plain closures invoked synchronously at two points of every
//! call: before the first attempt (`request`) and once the final outcome is
//! known (`response`). Each call's pair is ordered and shares one tracer.

use crate::error::HttpClientError;
use crate::request::{DataType, RequestArgs, Timeout};
use crate::response::HttpResponse;
use crate::tracer::Tracer;
use http::{HeaderMap, Method, Uri};
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Payload of the `request` event.
///
/// Listeners may change `args.headers`; the change is what the transport sends.
pub struct RequestEvent<'a> {
    pub url: &'a str,
    pub args: &'a mut RequestArgs,
}

impl RequestEvent<'_> {
    #[must_use]
    pub fn tracer(&self) -> &Arc<Tracer> {
        &self.args.tracer
    }
}

/// Descriptor actually sent, after request listeners ran
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub method: Method,
    pub url: Uri,
    pub headers: HeaderMap,
    pub timeout: Timeout,
    pub data_type: DataType,
}

/// The call as seen by response listeners
#[derive(Debug)]
pub struct RequestRecord {
    pub url: String,
    pub options: RequestSnapshot,
    pub args: RequestArgs,
}

impl RequestRecord {
    #[must_use]
    pub fn tracer(&self) -> &Arc<Tracer> {
        &self.args.tracer
    }
}

/// Payload of the `response` event; `res` is the call's final outcome
pub struct ResponseEvent<'a> {
    pub req: &'a RequestRecord,
    pub res: Result<&'a HttpResponse, &'a HttpClientError>,
}

impl ResponseEvent<'_> {
    #[must_use]
    pub fn tracer(&self) -> &Arc<Tracer> {
        self.req.tracer()
    }

    #[must_use]
    pub fn error(&self) -> Option<&HttpClientError> {
        self.res.err()
    }
}

pub type RequestListener = Arc<dyn Fn(&mut RequestEvent<'_>) + Send + Sync>;
pub type ResponseListener = Arc<dyn Fn(&ResponseEvent<'_>) + Send + Sync>;

/// Handle returned on registration, used to remove the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Ordered listener registry shared by all calls of one client
#[derive(Default)]
pub struct EventHub {
    next_id: AtomicU64,
    request: RwLock<Vec<(ListenerId, RequestListener)>>,
    response: RwLock<Vec<(ListenerId, ResponseListener)>>,
}

impl EventHub {
    fn next_id(&self) -> ListenerId {
        ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    pub fn on_request(&self, listener: RequestListener) -> ListenerId {
        let id = self.next_id();
        self.request.write().push((id, listener));
        id
    }

    pub fn on_response(&self, listener: ResponseListener) -> ListenerId {
        let id = self.next_id();
        self.response.write().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut removed = false;
        self.request.write().retain(|(lid, _)| {
            let keep = *lid != id;
            removed |= !keep;
            keep
        });
        self.response.write().retain(|(lid, _)| {
            let keep = *lid != id;
            removed |= !keep;
            keep
        });
        removed
    }

    pub fn listener_count(&self) -> usize {
        self.request.read().len() + self.response.read().len()
    }

    // Listeners run on a snapshot so they may (un)register without deadlocking.
    pub fn emit_request(&self, event: &mut RequestEvent<'_>) {
        let listeners: Vec<RequestListener> = self
            .request
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&mut *event);
        }
    }

    pub fn emit_response(&self, event: &ResponseEvent<'_>) {
        let listeners: Vec<ResponseListener> = self
            .response
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("request_listeners", &self.request.read().len())
            .field("response_listeners", &self.response.read().len())
            .finish()
    }
}
