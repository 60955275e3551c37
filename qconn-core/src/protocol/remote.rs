use std::fmt;
use std::sync::{OnceLock, Weak};

use crate::error::RpcError;
use crate::promise::{Forward, Promise, Resolver};
use crate::value::{Function, Value};

/// Who decides the outcome of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The peer is authoritative; we wait for its `resolve`/`reject`.
    Question,
    /// We are authoritative and reply once the local promise settles.
    Answer,
}

/// One question or answer slot.
///
/// A slot moves once from buffering to a bound value, a bound remote handle,
/// or a rejection. Question promises are far: operations sent to them while
/// they are unsettled go straight to the peer.
pub(crate) struct Remote {
    pub(crate) id: i64,
    pub(crate) role: Role,
    pub(crate) promise: Promise,
    resolver: Resolver,
    /// Value exported by reference under this slot.
    bound: Option<Value>,
    proxy: OnceLock<Function>,
}

impl Remote {
    pub(crate) fn question(forwarder: Weak<dyn Forward>, id: i64) -> Self {
        let (resolver, promise) = Promise::far(forwarder, id);
        Remote {
            id,
            role: Role::Question,
            promise,
            resolver,
            bound: None,
            proxy: OnceLock::new(),
        }
    }

    pub(crate) fn answer(id: i64) -> Self {
        let (resolver, promise) = Promise::deferred();
        Remote {
            id,
            role: Role::Answer,
            promise,
            resolver,
            bound: None,
            proxy: OnceLock::new(),
        }
    }

    /// An answer slot standing for `value` itself. It settles at once and
    /// never sends a reply; the peer already holds a handle.
    pub(crate) fn bound(id: i64, value: Value) -> Self {
        let mut remote = Remote::answer(id);
        remote.resolver.resolve(value.clone());
        remote.bound = Some(value);
        remote
    }

    /// Resolving a slot with its own promise marks it as a remote handle.
    pub(crate) fn resolve(&self, value: Value) {
        if let Value::Promise(p) = &value {
            if p.ptr_eq(&self.promise) {
                self.resolver.settle_far();
                return;
            }
        }
        self.resolver.resolve(value);
    }

    pub(crate) fn reject(&self, error: RpcError) {
        self.resolver.reject(error);
    }

    /// Stops waiting for a resolution. Returns false if the slot had
    /// already settled.
    pub(crate) fn mark_far(&self) -> bool {
        self.resolver.settle_far()
    }

    pub(crate) fn revoke(&self, error: RpcError) -> bool {
        self.resolver.revoke(error)
    }

    /// What a reference to this slot decodes to.
    pub(crate) fn value(&self) -> Value {
        match &self.bound {
            Some(value) => value.clone(),
            None => Value::Promise(self.promise.clone()),
        }
    }

    /// Local callable forwarding calls to this slot. Created once per slot so
    /// it keeps a stable identity.
    pub(crate) fn callable(&self) -> Function {
        self.proxy
            .get_or_init(|| {
                let promise = self.promise.clone();
                Function::new(move |args| {
                    let result = promise.call(args);
                    async move { result.await }
                })
            })
            .clone()
    }
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remote")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("promise", &self.promise)
            .field("bound", &self.bound.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(i64, String)>>,
    }

    impl Forward for Recorder {
        fn forward(&self, id: i64, op: Operation) -> Promise {
            self.sent
                .lock()
                .unwrap()
                .push((id, op.code().to_string()));
            Promise::resolved("forwarded")
        }
    }

    fn question(id: i64) -> (Arc<Recorder>, Remote) {
        let recorder = Arc::new(Recorder::default());
        let weak: Weak<dyn Forward> = Arc::downgrade(&(recorder.clone() as Arc<dyn Forward>));
        (recorder, Remote::question(weak, id))
    }

    #[tokio::test]
    async fn test_pending_question_forwards_operations() {
        let (recorder, remote) = question(-3);
        let result = remote.promise.get("x");
        assert_eq!(result.await.unwrap().as_str(), Some("forwarded"));
        assert_eq!(recorder.sent.lock().unwrap().clone(), vec![(-3, "get".to_string())]);
    }

    #[tokio::test]
    async fn test_resolved_question_applies_locally() {
        let (recorder, remote) = question(-3);
        remote.resolve(Value::from(serde_json::json!({"x": 1})));
        let x = remote.promise.get("x").await.unwrap();
        assert_eq!(x.as_f64(), Some(1.0));
        assert!(recorder.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_self_resolution_binds_remote() {
        let (recorder, remote) = question(-5);
        remote.resolve(Value::Promise(remote.promise.clone()));
        assert!(remote.promise.is_far());

        // A far handle keeps forwarding.
        remote.promise.keys().await.unwrap();
        assert_eq!(recorder.sent.lock().unwrap().len(), 1);

        // Settlement is final.
        assert!(!remote.mark_far());
        remote.reject(RpcError::internal("late"));
        assert!(remote.promise.is_far());
    }

    #[tokio::test]
    async fn test_revocation_rejects() {
        let (_recorder, remote) = question(-7);
        assert!(remote.revoke(RpcError::cap_revoked("evicted")));
        let err = remote.promise.clone().await.unwrap_err();
        assert!(err.is_revocation());
    }

    #[tokio::test]
    async fn test_bound_answer_decodes_to_value() {
        let f = Function::from_fn(|_| Ok(Value::Null));
        let remote = Remote::bound(3, Value::Function(f.clone()));
        match remote.value() {
            Value::Function(g) => assert!(g.ptr_eq(&f)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(!remote.promise.is_pending());
    }

    #[tokio::test]
    async fn test_callable_identity_is_stable() {
        let (_recorder, remote) = question(-9);
        assert!(remote.callable().ptr_eq(&remote.callable()));
    }
}
