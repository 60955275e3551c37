//! Eventual values.
//!
//! A [`Promise`] is a shared handle on a value that may not exist yet. It is
//! settled at most once through its [`Resolver`]. Promises created by a
//! connection are *far*: while unsettled (or once marked as a permanent
//! remote handle) every operation sent to them travels over the wire instead
//! of waiting, which is what makes pipelining possible.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::IntoFuture;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;

use crate::error::RpcError;
use crate::operation::{self, Operation};
use crate::value::{lock_recovering, Value};

/// Outcome of a settled promise.
pub type Settlement = Result<Value, RpcError>;

type Continuation = Box<dyn FnOnce(Settlement) + Send>;
pub(crate) type PassListener = Box<dyn FnOnce() + Send>;

/// Sends operations addressed to a far promise over its connection.
pub(crate) trait Forward: Send + Sync {
    fn forward(&self, id: i64, op: Operation) -> Promise;
}

struct FarRef {
    forwarder: Weak<dyn Forward>,
    id: i64,
}

#[derive(Clone)]
enum State {
    Pending,
    Fulfilled(Value),
    Rejected(RpcError),
    /// Settled as a handle on a value that stays on the far side.
    Far,
}

#[derive(Default)]
struct Queue {
    continuations: Vec<Continuation>,
    draining: bool,
}

struct Shared {
    state: watch::Sender<State>,
    /// Set once a resolver has claimed the promise, possibly before it
    /// settles (while following another promise).
    resolved: AtomicBool,
    queue: Mutex<Queue>,
    passing: AtomicBool,
    pass_listeners: Mutex<Vec<PassListener>>,
    far: Option<FarRef>,
    /// The promise this one was resolved with, while that one is pending.
    following: Mutex<Option<Promise>>,
}

impl Shared {
    fn new(far: Option<FarRef>) -> Arc<Self> {
        let (state, _) = watch::channel(State::Pending);
        Arc::new(Shared {
            state,
            resolved: AtomicBool::new(false),
            queue: Mutex::new(Queue::default()),
            passing: AtomicBool::new(false),
            pass_listeners: Mutex::new(Vec::new()),
            far,
            following: Mutex::new(None),
        })
    }

    fn is_pending(&self) -> bool {
        matches!(*self.state.borrow(), State::Pending)
    }

    fn settlement(self: &Arc<Self>) -> Option<Settlement> {
        let state = self.state.borrow().clone();
        self.settlement_of(state)
    }

    fn settlement_of(self: &Arc<Self>, state: State) -> Option<Settlement> {
        match state {
            State::Pending => None,
            State::Fulfilled(value) => Some(Ok(value)),
            State::Rejected(error) => Some(Err(error)),
            State::Far => Some(Ok(Value::Promise(Promise {
                shared: self.clone(),
            }))),
        }
    }

    /// First settlement wins; returns whether this call settled the promise.
    fn settle(self: &Arc<Self>, next: State) -> bool {
        let mut queue = lock_recovering(&self.queue);
        let changed = self.state.send_if_modified(|current| {
            if matches!(current, State::Pending) {
                *current = next;
                true
            } else {
                false
            }
        });
        if changed && !queue.continuations.is_empty() && !queue.draining {
            queue.draining = true;
            drop(queue);
            self.spawn_drain();
        }
        changed
    }

    fn enqueue(self: &Arc<Self>, continuation: Continuation) {
        let mut queue = lock_recovering(&self.queue);
        queue.continuations.push(continuation);
        if !queue.draining && !self.is_pending() {
            queue.draining = true;
            drop(queue);
            self.spawn_drain();
        }
    }

    // Continuations run on a spawned task, one batch at a time, so they never
    // run inline with the code that settled the promise and keep their order.
    fn spawn_drain(self: &Arc<Self>) {
        let shared = self.clone();
        tokio::spawn(async move {
            let outcome = shared.settlement();
            loop {
                let batch = {
                    let mut queue = lock_recovering(&shared.queue);
                    if queue.continuations.is_empty() || outcome.is_none() {
                        queue.draining = false;
                        return;
                    }
                    std::mem::take(&mut queue.continuations)
                };
                if let Some(outcome) = &outcome {
                    for continuation in batch {
                        continuation(outcome.clone());
                    }
                }
            }
        });
    }
}

/// A shared eventual value.
#[derive(Clone)]
pub struct Promise {
    shared: Arc<Shared>,
}

/// The settling half of a [`Promise`].
#[derive(Clone)]
pub struct Resolver {
    shared: Arc<Shared>,
}

impl Promise {
    /// A pending promise and the resolver that settles it.
    pub fn deferred() -> (Resolver, Promise) {
        let shared = Shared::new(None);
        (
            Resolver {
                shared: shared.clone(),
            },
            Promise { shared },
        )
    }

    pub(crate) fn far(forwarder: Weak<dyn Forward>, id: i64) -> (Resolver, Promise) {
        let shared = Shared::new(Some(FarRef { forwarder, id }));
        (
            Resolver {
                shared: shared.clone(),
            },
            Promise { shared },
        )
    }

    /// A promise for `value`. A promise value is returned as is.
    pub fn resolved(value: impl Into<Value>) -> Promise {
        match value.into() {
            Value::Promise(p) => p,
            value => {
                let (resolver, promise) = Promise::deferred();
                resolver.resolve(value);
                promise
            }
        }
    }

    pub fn rejected(error: RpcError) -> Promise {
        let (resolver, promise) = Promise::deferred();
        resolver.reject(error);
        promise
    }

    pub fn is_pending(&self) -> bool {
        self.shared.is_pending()
    }

    /// True for a promise settled as a permanent handle on a far value.
    pub fn is_far(&self) -> bool {
        matches!(*self.shared.state.borrow(), State::Far)
    }

    /// The settlement, if there is one yet.
    pub fn peek(&self) -> Option<Settlement> {
        self.shared.settlement()
    }

    pub async fn settled(&self) -> Settlement {
        let mut rx = self.shared.state.subscribe();
        let state = match rx.wait_for(|state| !matches!(state, State::Pending)).await {
            Ok(state) => state.clone(),
            Err(_) => return Err(RpcError::canceled("promise state dropped")),
        };
        self.shared
            .settlement_of(state)
            .unwrap_or_else(|| Err(RpcError::internal("promise settled without a value")))
    }

    /// Registers `continuation` to observe the settlement. Continuations are
    /// never run inline and run in registration order.
    pub fn when<F>(&self, continuation: F)
    where
        F: FnOnce(Settlement) + Send + 'static,
    {
        self.shared.enqueue(Box::new(continuation));
    }

    /// Sends `op` to the eventual value and returns a promise for its result.
    pub fn dispatch(&self, op: Operation) -> Promise {
        if let Some(far) = &self.shared.far {
            if self.is_pending() || self.is_far() {
                return match far.forwarder.upgrade() {
                    Some(forwarder) => forwarder.forward(far.id, op),
                    None => Promise::rejected(RpcError::connection_closed(None)),
                };
            }
        }
        if self.is_pending() {
            let following = lock_recovering(&self.shared.following).clone();
            if let Some(target) = following {
                return target.dispatch(op);
            }
        }

        let (resolver, result) = Promise::deferred();
        self.when(move |outcome| match outcome {
            Ok(value) => {
                let mut applying = operation::apply(value, op);
                // Synchronous operations settle here, keeping them in order.
                match (&mut applying).now_or_never() {
                    Some(outcome) => resolver.settle(outcome),
                    None => {
                        tokio::spawn(async move {
                            resolver.settle(applying.await);
                        });
                    }
                }
            }
            Err(error) => resolver.reject(error),
        });
        result
    }

    pub fn get(&self, name: impl Into<String>) -> Promise {
        self.dispatch(Operation::Get(name.into()))
    }

    pub fn set(&self, name: impl Into<String>, value: impl Into<Value>) -> Promise {
        self.dispatch(Operation::Set(name.into(), value.into()))
    }

    pub fn delete(&self, name: impl Into<String>) -> Promise {
        self.dispatch(Operation::Delete(name.into()))
    }

    pub fn keys(&self) -> Promise {
        self.dispatch(Operation::Keys)
    }

    pub fn invoke(&self, name: impl Into<String>, args: Vec<Value>) -> Promise {
        self.dispatch(Operation::Invoke(name.into(), args))
    }

    pub fn call(&self, args: Vec<Value>) -> Promise {
        self.dispatch(Operation::Call(args))
    }

    /// Marks the promise to cross connections as a permanent handle: the
    /// receiving side stops waiting for a resolution and keeps forwarding.
    pub fn pass(self) -> Promise {
        if !self.shared.passing.swap(true, Ordering::SeqCst) {
            let listeners = std::mem::take(&mut *lock_recovering(&self.shared.pass_listeners));
            for listener in listeners {
                listener();
            }
        }
        self
    }

    pub fn is_passed(&self) -> bool {
        self.shared.passing.load(Ordering::SeqCst)
    }

    /// Registers a callback for a later [`Promise::pass`]. Returns false,
    /// without registering, when the promise is already marked.
    pub(crate) fn on_pass(&self, listener: PassListener) -> bool {
        let mut listeners = lock_recovering(&self.shared.pass_listeners);
        if self.is_passed() {
            return false;
        }
        listeners.push(listener);
        true
    }

    pub fn ptr_eq(&self, other: &Promise) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub(crate) fn identity(&self) -> usize {
        Arc::as_ptr(&self.shared) as *const () as usize
    }
}

impl IntoFuture for Promise {
    type Output = Settlement;
    type IntoFuture = BoxFuture<'static, Settlement>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.settled().await })
    }
}

impl fmt::Debug for Promise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.shared.state.borrow() {
            State::Pending => "pending",
            State::Fulfilled(_) => "fulfilled",
            State::Rejected(_) => "rejected",
            State::Far => "far",
        };
        match &self.shared.far {
            Some(far) => write!(f, "Promise({}, far #{})", state, far.id),
            None => write!(f, "Promise({})", state),
        }
    }
}

impl Resolver {
    /// Fulfills with `value`, or follows it when it is a promise. Ignored if
    /// the promise was already resolved.
    pub fn resolve(&self, value: impl Into<Value>) {
        if self.claim() {
            self.become_value(value.into());
        }
    }

    pub fn reject(&self, error: RpcError) {
        if self.claim() {
            self.shared.settle(State::Rejected(error));
        }
    }

    pub fn settle(&self, outcome: Settlement) {
        match outcome {
            Ok(value) => self.resolve(value),
            Err(error) => self.reject(error),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.shared.resolved.load(Ordering::SeqCst)
    }

    pub fn promise(&self) -> Promise {
        Promise {
            shared: self.shared.clone(),
        }
    }

    /// Settles as a far handle. Only meaningful for far promises.
    pub(crate) fn settle_far(&self) -> bool {
        self.shared.resolved.store(true, Ordering::SeqCst);
        self.shared.settle(State::Far)
    }

    /// Rejects even if the promise is following another one.
    pub(crate) fn revoke(&self, error: RpcError) -> bool {
        self.shared.resolved.store(true, Ordering::SeqCst);
        self.shared.settle(State::Rejected(error))
    }

    fn claim(&self) -> bool {
        !self.shared.resolved.swap(true, Ordering::SeqCst)
    }

    fn become_value(&self, value: Value) {
        let target = match value {
            Value::Promise(target) => target,
            value => {
                self.shared.settle(State::Fulfilled(value));
                return;
            }
        };
        if Arc::ptr_eq(&target.shared, &self.shared) {
            self.shared.settle(State::Rejected(RpcError::type_error(
                "promise resolved with itself",
            )));
            return;
        }
        match target.peek() {
            Some(outcome) => {
                self.shared.settle(state_of(outcome));
            }
            None => {
                *lock_recovering(&self.shared.following) = Some(target.clone());
                let shared = self.shared.clone();
                target.when(move |outcome| {
                    *lock_recovering(&shared.following) = None;
                    shared.settle(state_of(outcome));
                });
            }
        }
    }
}

fn state_of(outcome: Settlement) -> State {
    match outcome {
        Ok(value) => State::Fulfilled(value),
        Err(error) => State::Rejected(error),
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Resolver({:?})", self.promise())
    }
}
