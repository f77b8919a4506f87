use crate::common::data::{HttpRequest, HttpResponse};
use async_trait::async_trait;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};
use tokio::sync::oneshot;

pub type ResponseCallbackFn = dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync;
pub type ForwardCallbackFn = dyn Fn(&HttpRequest) -> HttpRequest + Send + Sync;

/// Resolves callback names to locally registered functions. Stands in for dynamic
/// code loading: callbacks are registered up front under a name and referenced by
/// expectations.
pub trait CallbackLoader: Send + Sync {
    fn response_callback(&self, name: &str) -> Option<Arc<ResponseCallbackFn>>;
    fn forward_callback(&self, name: &str) -> Option<Arc<ForwardCallbackFn>>;
}

/// Name-keyed in-process callback registry, the default [`CallbackLoader`].
#[derive(Default)]
pub struct InMemoryCallbackLoader {
    response: Mutex<HashMap<String, Arc<ResponseCallbackFn>>>,
    forward: Mutex<HashMap<String, Arc<ForwardCallbackFn>>>,
}

impl InMemoryCallbackLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_response<F>(&self, name: &str, callback: F)
    where
        F: Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static,
    {
        self.response
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(callback));
    }

    pub fn register_forward<F>(&self, name: &str, callback: F)
    where
        F: Fn(&HttpRequest) -> HttpRequest + Send + Sync + 'static,
    {
        self.forward
            .lock()
            .unwrap()
            .insert(name.to_string(), Arc::new(callback));
    }
}

impl CallbackLoader for InMemoryCallbackLoader {
    fn response_callback(&self, name: &str) -> Option<Arc<ResponseCallbackFn>> {
        self.response.lock().unwrap().get(name).cloned()
    }

    fn forward_callback(&self, name: &str) -> Option<Arc<ForwardCallbackFn>> {
        self.forward.lock().unwrap().get(name).cloned()
    }
}

/// Transport for object callbacks: delivers a request to a remote client and
/// reports whether delivery succeeded. Replies arrive asynchronously through
/// [`CallbackRegistry::complete`].
#[async_trait]
pub trait CallbackChannel: Send + Sync {
    async fn deliver(&self, client_id: &str, correlation_id: &str, request: &HttpRequest) -> bool;
}

/// A remote client's answer to an object callback.
#[derive(Debug)]
pub enum CallbackReply {
    Response(HttpResponse),
    Request(HttpRequest),
}

/// Correlation table for in-flight object callbacks. Each outbound callback gets a
/// correlation id and a oneshot slot; the reply completes the slot.
#[derive(Default)]
pub struct CallbackRegistry {
    pending: Mutex<HashMap<String, oneshot::Sender<CallbackReply>>>,
    next_id: AtomicU64,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new in-flight callback and returns its correlation id together
    /// with the receiver the reply will arrive on.
    pub fn register(&self) -> (String, oneshot::Receiver<CallbackReply>) {
        let correlation_id = format!("cb-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap()
            .insert(correlation_id.clone(), tx);
        (correlation_id, rx)
    }

    /// Completes an in-flight callback. Returns false when the correlation id is
    /// unknown or the waiter has already given up.
    pub fn complete(&self, correlation_id: &str, reply: CallbackReply) -> bool {
        let sender = self.pending.lock().unwrap().remove(correlation_id);
        match sender {
            Some(sender) => sender.send(reply).is_ok(),
            None => {
                tracing::warn!(correlation_id, "reply for unknown callback");
                false
            }
        }
    }

    /// Drops a pending callback slot, e.g. after a timeout.
    pub fn abandon(&self, correlation_id: &str) {
        self.pending.lock().unwrap().remove(correlation_id);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::common::util::BodyBytes;

    fn request() -> HttpRequest {
        HttpRequest::new(
            "http".to_string(),
            "/".to_string(),
            "GET".to_string(),
            Vec::new(),
            BodyBytes::default(),
        )
    }

    #[test]
    fn loader_lookup_test() {
        let loader = InMemoryCallbackLoader::new();
        loader.register_response("ok", |_| HttpResponse {
            status: Some(204),
            ..Default::default()
        });

        let callback = loader.response_callback("ok").unwrap();
        assert_eq!(callback(&request()).status, Some(204));
        assert!(loader.response_callback("missing").is_none());
    }

    #[tokio::test]
    async fn registry_round_trip_test() {
        let registry = CallbackRegistry::new();
        let (id, rx) = registry.register();

        assert_eq!(
            registry.complete(
                &id,
                CallbackReply::Response(HttpResponse {
                    status: Some(201),
                    ..Default::default()
                })
            ),
            true
        );

        match rx.await.unwrap() {
            CallbackReply::Response(res) => assert_eq!(res.status, Some(201)),
            other => panic!("unexpected reply: {:?}", other),
        }
        assert_eq!(registry.pending_count(), 0);
    }

    #[test]
    fn unknown_correlation_id_test() {
        let registry = CallbackRegistry::new();
        assert_eq!(
            registry.complete("cb-404", CallbackReply::Request(request())),
            false
        );
    }

    #[test]
    fn abandon_removes_slot_test() {
        let registry = CallbackRegistry::new();
        let (id, _rx) = registry.register();
        registry.abandon(&id);
        assert_eq!(registry.pending_count(), 0);
    }
}
