use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::ids::{peer_view, IdAllocator, ROOT_ANSWER, ROOT_QUESTION};
use super::message::Message;
use super::qson::{failure_marker, Decoder, Encoded, Encoder};
use super::remote::{Remote, Role};
use super::tables::{Memo, RefTable, WireRef};
use crate::channel::MessageChannel;
use crate::error::RpcError;
use crate::operation::{OpCode, Operation};
use crate::promise::{Forward, Promise, Settlement};
use crate::value::{lock_recovering, Value};

/// Called with every inbound message addressed to a slot that no longer
/// exists (evicted, or never known).
pub type LostHook = Arc<dyn Fn(&Message) + Send + Sync>;

/// Per-connection limits and hooks.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// Capacity of the question/answer table, root slots excluded.
    pub max_remotes: usize,
    /// Capacity of the exported/imported object table.
    pub max_objects: usize,
    pub on_lost: Option<LostHook>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_remotes: usize::MAX,
            max_objects: usize::MAX,
            on_lost: None,
        }
    }
}

impl ConnectionConfig {
    pub fn with_max_remotes(mut self, max_remotes: usize) -> Self {
        self.max_remotes = max_remotes;
        self
    }

    pub fn with_max_objects(mut self, max_objects: usize) -> Self {
        self.max_objects = max_objects;
        self
    }

    pub fn on_lost<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        self.on_lost = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("max_remotes", &self.max_remotes)
            .field("max_objects", &self.max_objects)
            .field("on_lost", &self.on_lost.is_some())
            .finish()
    }
}

/// Snapshot of a connection's bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    pub id: Uuid,
    pub remotes: usize,
    pub objects: usize,
    pub memo: usize,
    pub closed: bool,
}

pub(crate) struct ConnectionState {
    pub(crate) remotes: RefTable<Arc<Remote>>,
    pub(crate) objects: RefTable<Value>,
    pub(crate) memo: Memo,
    /// The rejection handed to everything once the connection has closed.
    pub(crate) closed: Option<RpcError>,
    connection: Uuid,
}

impl ConnectionState {
    fn new(connection: Uuid, config: &ConnectionConfig) -> Self {
        Self {
            remotes: RefTable::new(config.max_remotes),
            objects: RefTable::new(config.max_objects),
            memo: Memo::new(),
            closed: None,
            connection,
        }
    }

    /// Registers a slot, revoking whatever falls out of the table.
    pub(crate) fn insert_remote(&mut self, remote: Arc<Remote>) -> bool {
        let id = remote.id;
        match self.remotes.insert(id, remote) {
            Ok(evicted) => {
                for (slot, remote) in evicted {
                    let revoked = remote.revoke(RpcError::cap_revoked(format!(
                        "Slot {} was evicted for capacity",
                        slot
                    )));
                    self.memo.forget_slot(slot);
                    debug!(
                        connection = %self.connection,
                        slot,
                        revoked,
                        "evicted remote"
                    );
                }
                true
            }
            Err(err) => {
                warn!(connection = %self.connection, error = %err, "slot reused");
                false
            }
        }
    }

    pub(crate) fn insert_object(&mut self, id: i64, value: Value) -> bool {
        match self.objects.insert(id, value) {
            Ok(evicted) => {
                for (slot, _) in evicted {
                    self.memo.forget_slot(slot);
                    debug!(connection = %self.connection, slot, "evicted object");
                }
                true
            }
            Err(err) => {
                warn!(connection = %self.connection, error = %err, "object slot reused");
                false
            }
        }
    }
}

pub(crate) struct ConnectionInner {
    pub(crate) id: Uuid,
    pub(crate) ids: IdAllocator,
    pub(crate) this: Weak<ConnectionInner>,
    channel: Arc<dyn MessageChannel>,
    config: ConnectionConfig,
    state: Mutex<ConnectionState>,
}

impl ConnectionInner {
    fn lock_state(&self) -> MutexGuard<'_, ConnectionState> {
        lock_recovering(&self.state)
    }

    pub(crate) fn forwarder(&self) -> Weak<dyn Forward> {
        self.this.clone()
    }

    pub(crate) fn send(&self, message: Message) {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(err) => {
                warn!(connection = %self.id, error = %err, "failed to serialize outbound message");
                return;
            }
        };
        trace!(connection = %self.id, message = %json, "send");
        if let Err(err) = self.channel.put(json) {
            debug!(connection = %self.id, error = %err, kind = message.kind(), "dropping outbound message");
        }
    }

    /// Sends the payload of an encode pass in wire order: the objects batch,
    /// the message carrying the tokens, then any notices.
    fn transmit(&self, encoded: Encoded, carrier: Message) {
        if !encoded.objects.is_empty() {
            self.send(Message::Objects {
                objects: encoded.objects,
            });
        }
        self.send(carrier);
        for notice in encoded.notices {
            self.send(notice);
        }
        for (answer, source) in encoded.answers {
            self.arm_answer(&answer, Value::Promise(source.clone()), Some(source));
        }
    }

    /// Resolves an answer slot and replies to the peer once it settles.
    /// Answers exported for a promise marked with `pass` send nothing: the
    /// peer was told to stop waiting.
    fn arm_answer(&self, answer: &Arc<Remote>, value: Value, source: Option<Promise>) {
        answer.resolve(value);
        let connection = self.this.clone();
        let id = answer.id;
        answer.promise.when(move |outcome| {
            if source.as_ref().is_some_and(Promise::is_passed) {
                return;
            }
            if let Some(inner) = connection.upgrade() {
                inner.reply(id, outcome);
            }
        });
    }

    fn reply(&self, id: i64, outcome: Settlement) {
        let mut state = self.lock_state();
        if state.closed.is_some() {
            return;
        }
        match outcome {
            Ok(value) => {
                let mut encoder = Encoder::new(self, &mut state);
                match encoder.encode(&value) {
                    Ok(json) => {
                        let encoded = encoder.finish();
                        self.transmit(encoded, Message::Resolve { id, value: json });
                    }
                    Err(err) => {
                        encoder.abort();
                        warn!(connection = %self.id, answer = id, error = %err, "reply could not be encoded");
                        let error = RpcError::internal(err.to_string());
                        self.send(Message::Resolve {
                            id,
                            value: failure_marker(&error),
                        });
                    }
                }
            }
            Err(error) => self.send(Message::Reject { id, error }),
        }
    }

    fn lost(&self, message: &Message) {
        debug!(
            connection = %self.id,
            kind = message.kind(),
            slot = ?message.addressed_id(),
            "message for unknown slot"
        );
        if let Some(hook) = &self.config.on_lost {
            hook(message);
        }
    }

    async fn run(self: Arc<Self>) {
        info!(connection = %self.id, "connection started");
        loop {
            match self.channel.get().await {
                Ok(json) => self.receive(json),
                Err(err) => {
                    self.shutdown(err.reason());
                    break;
                }
            }
        }
    }

    fn receive(&self, json: JsonValue) {
        trace!(connection = %self.id, message = %json, "receive");
        let message = match Message::from_json(&json) {
            Ok(message) => message,
            Err(err) => {
                warn!(connection = %self.id, error = %err, "ignoring malformed message");
                return;
            }
        };
        match &message {
            Message::Dispatch { to, from, op, args } => {
                self.on_dispatch(*to, *from, *op, args, &message)
            }
            Message::Resolve { id, value } => {
                self.on_settle(*id, Ok(value), &message);
            }
            Message::Reject { id, error } => {
                self.on_settle(*id, Err(error.clone()), &message);
            }
            Message::Objects { objects } => self.on_objects(objects),
            Message::Pass { id } => self.on_pass(*id, &message),
        }
    }

    fn on_dispatch(&self, to: i64, from: i64, op: OpCode, args: &[JsonValue], message: &Message) {
        let target_id = peer_view(to);
        let answer_id = peer_view(from);

        let (target, answer, args) = {
            let mut state = self.lock_state();
            if state.closed.is_some() {
                return;
            }
            let target = state.remotes.get(target_id).cloned();
            let Some(target) = target else {
                drop(state);
                self.lost(message);
                self.send(Message::Reject {
                    id: answer_id,
                    error: RpcError::cap_revoked(format!(
                        "Reference {} is no longer available",
                        target_id
                    )),
                });
                return;
            };
            let mut decoder = Decoder::new(self, &mut state);
            let args: Vec<Value> = args.iter().map(|arg| decoder.decode(arg)).collect();
            let answer = Arc::new(Remote::answer(answer_id));
            if !state.insert_remote(answer.clone()) {
                return;
            }
            (target, answer, args)
        };

        debug!(connection = %self.id, target = target_id, answer = answer_id, %op, "dispatch");
        let result = match Operation::from_parts(op, args) {
            Ok(operation) => target.promise.dispatch(operation),
            Err(error) => Promise::rejected(error),
        };
        self.arm_answer(&answer, Value::Promise(result), None);
    }

    fn on_settle(&self, id: i64, outcome: Result<&JsonValue, RpcError>, message: &Message) {
        let slot = peer_view(id);
        let mut state = self.lock_state();
        if state.closed.is_some() {
            return;
        }
        let remote = state.remotes.get(slot).cloned();
        let Some(remote) = remote else {
            drop(state);
            self.lost(message);
            return;
        };
        if remote.role == Role::Answer {
            warn!(connection = %self.id, slot, "peer tried to settle one of our answers");
            return;
        }
        match outcome {
            Ok(json) => {
                let value = Decoder::new(self, &mut state).decode(json);
                remote.resolve(value);
            }
            Err(error) => remote.reject(error),
        }
    }

    fn on_objects(&self, objects: &BTreeMap<i64, JsonValue>) {
        let mut state = self.lock_state();
        if state.closed.is_some() {
            return;
        }
        Decoder::new(self, &mut state).decode_objects(objects);
    }

    fn on_pass(&self, id: i64, message: &Message) {
        let slot = peer_view(id);
        let state = self.lock_state();
        if state.closed.is_some() {
            return;
        }
        let remote = state.remotes.peek(slot).cloned();
        drop(state);
        match remote {
            Some(remote) if remote.role == Role::Question => {
                if !remote.mark_far() {
                    debug!(connection = %self.id, slot, "pass for a settled slot ignored");
                }
            }
            Some(_) => {
                warn!(connection = %self.id, slot, "pass addressed to one of our answers");
            }
            None => self.lost(message),
        }
    }

    /// Rejects everything outstanding and clears the tables. Idempotent.
    fn shutdown(&self, reason: Option<RpcError>) {
        let mut state = self.lock_state();
        if state.closed.is_some() {
            return;
        }
        let error = RpcError::connection_closed(reason);
        state.closed = Some(error.clone());
        let remotes = state.remotes.drain();
        let objects = state.objects.drain();
        state.memo.clear();
        drop(state);

        info!(
            connection = %self.id,
            outstanding = remotes.len(),
            objects = objects.len(),
            cause = ?error.cause,
            "connection closed"
        );
        for (_, remote) in remotes {
            remote.revoke(error.clone());
        }
    }
}

impl Forward for ConnectionInner {
    fn forward(&self, to: i64, op: Operation) -> Promise {
        let (code, args) = op.into_parts();
        let mut state = self.lock_state();
        if let Some(error) = &state.closed {
            return Promise::rejected(error.clone());
        }

        let question = self.ids.allocate_question();
        let remote = Arc::new(Remote::question(self.forwarder(), question));
        let promise = remote.promise.clone();
        state
            .memo
            .insert(&Value::Promise(promise.clone()), WireRef::Question(question));
        state.insert_remote(remote);

        let mut encoder = Encoder::new(self, &mut state);
        let mut encoded_args = Vec::with_capacity(args.len());
        for arg in &args {
            match encoder.encode(arg) {
                Ok(json) => encoded_args.push(json),
                Err(err) => {
                    encoder.abort();
                    state.remotes.remove(question);
                    state.memo.forget_slot(question);
                    warn!(connection = %self.id, error = %err, "arguments could not be encoded");
                    return Promise::rejected(RpcError::bad_request(format!(
                        "Cannot encode arguments: {}",
                        err
                    )));
                }
            }
        }
        let encoded = encoder.finish();
        trace!(connection = %self.id, to, question, op = %code, "forward");
        // Sent under the state lock so tokens never overtake the objects
        // batch that defines them.
        self.transmit(
            encoded,
            Message::Dispatch {
                to,
                from: question,
                op: code,
                args: encoded_args,
            },
        );
        drop(state);
        promise
    }
}

/// One end of a peer-to-peer object connection.
///
/// Each side exposes a local value and receives a promise for the peer's.
/// The connection reads the channel on a spawned task until it closes, at
/// which point every outstanding promise rejects.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(channel: impl MessageChannel + 'static, local: impl Into<Value>) -> Self {
        Self::with_config(Arc::new(channel), local, ConnectionConfig::default())
    }

    /// Attaches to `channel`. Must be called within a tokio runtime.
    pub fn with_config(
        channel: Arc<dyn MessageChannel>,
        local: impl Into<Value>,
        config: ConnectionConfig,
    ) -> Self {
        let id = Uuid::new_v4();
        let inner = Arc::new_cyclic(|this| ConnectionInner {
            id,
            ids: IdAllocator::new(),
            this: this.clone(),
            channel,
            state: Mutex::new(ConnectionState::new(id, &config)),
            config,
        });

        let root_answer = Arc::new(Remote::answer(ROOT_ANSWER));
        let root_question = Arc::new(Remote::question(inner.forwarder(), ROOT_QUESTION));
        {
            let mut state = inner.lock_state();
            state.remotes.pin(ROOT_ANSWER);
            state.remotes.pin(ROOT_QUESTION);
            state.memo.insert(
                &Value::Promise(root_question.promise.clone()),
                WireRef::Question(ROOT_QUESTION),
            );
            state.insert_remote(root_answer.clone());
            state.insert_remote(root_question);
        }
        inner.arm_answer(&root_answer, local.into(), None);

        tokio::spawn(inner.clone().run());
        Connection { inner }
    }

    /// Promise for the peer's local value.
    pub fn root(&self) -> Promise {
        let state = self.inner.lock_state();
        match state.remotes.peek(ROOT_QUESTION) {
            Some(remote) => remote.promise.clone(),
            None => Promise::rejected(
                state
                    .closed
                    .clone()
                    .unwrap_or_else(|| RpcError::connection_closed(None)),
            ),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock_state().closed.is_some()
    }

    /// Closes the channel and rejects everything outstanding with a
    /// `connection_closed` error whose cause is `reason`.
    pub fn close(&self, reason: Option<RpcError>) {
        self.inner.channel.close(reason.clone());
        self.inner.shutdown(reason);
    }

    /// Settles when the underlying channel closes.
    pub async fn closed(&self) -> Option<RpcError> {
        self.inner.channel.closed().await
    }

    pub fn stats(&self) -> ConnectionStats {
        let state = self.inner.lock_state();
        ConnectionStats {
            id: self.inner.id,
            remotes: state.remotes.len(),
            objects: state.objects.len(),
            memo: state.memo.len(),
            closed: state.closed.is_some(),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{pair, LocalChannel};
    use crate::MockRpcTarget;
    use serde_json::json;
    use std::time::Duration;
    use tokio::sync::mpsc;

    async fn next(raw: &LocalChannel) -> JsonValue {
        tokio::time::timeout(Duration::from_secs(1), raw.get())
            .await
            .expect("timed out waiting for a message")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_root_value_is_announced() {
        let (end, raw) = pair();
        let _connection = Connection::new(end, 10);
        assert_eq!(next(&raw).await, json!({"type": "resolve", "id": 1, "value": 10}));
    }

    #[tokio::test]
    async fn test_dispatch_to_root_target() {
        let (end, raw) = pair();
        let target: Arc<dyn crate::RpcTarget> = Arc::new(MockRpcTarget::new());
        let _connection = Connection::new(end, Value::Target(target));

        assert_eq!(
            next(&raw).await,
            json!({"type": "resolve", "id": 1, "value": {"@": 3, "$": 2}})
        );

        raw.put(json!({"type": "dispatch", "to": -1, "from": 3, "op": "get", "args": ["name"]}))
            .unwrap();
        assert_eq!(
            next(&raw).await,
            json!({"type": "resolve", "id": -3, "value": "Mock property name"})
        );

        raw.put(json!({"type": "dispatch", "to": -3, "from": 5, "op": "invoke", "args": ["ping", 1]}))
            .unwrap();
        assert_eq!(
            next(&raw).await,
            json!({"type": "resolve", "id": -5, "value": "Mock call to ping with 1 args"})
        );
    }

    #[tokio::test]
    async fn test_unknown_slot_reaches_lost_hook() {
        let (end, raw) = pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = ConnectionConfig::default().on_lost(move |message| {
            let _ = tx.send(message.clone());
        });
        let _connection = Connection::with_config(Arc::new(end), Value::Null, config);
        next(&raw).await;

        raw.put(json!({"type": "resolve", "id": 41, "value": 1})).unwrap();
        let lost = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lost, Message::Resolve { id: 41, value: json!(1) });

        // A dispatch to nothing is answered so the caller does not hang.
        raw.put(json!({"type": "dispatch", "to": 9, "from": 3, "op": "keys", "args": []}))
            .unwrap();
        let reply = next(&raw).await;
        assert_eq!(reply["type"], "reject");
        assert_eq!(reply["id"], -3);
        assert_eq!(reply["error"]["code"], "cap_revoked");
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_malformed_messages_are_ignored() {
        let (end, raw) = pair();
        let connection = Connection::new(end, Value::from(json!({"a": 1})));
        // objects batch, then the root resolution
        next(&raw).await;
        next(&raw).await;

        raw.put(json!("garbage")).unwrap();
        raw.put(json!({"type": "abort"})).unwrap();
        raw.put(json!({"type": "dispatch", "to": "x"})).unwrap();
        // Ids that have no negation in our frame.
        raw.put(json!({"type": "pass", "id": i64::MIN})).unwrap();
        raw.put(json!({"type": "dispatch", "to": -1, "from": i64::MIN, "op": "keys", "args": []}))
            .unwrap();
        raw.put(json!({"type": "resolve", "id": 1, "value": {"@": i64::MIN}}))
            .unwrap();
        raw.put(json!({"type": "dispatch", "to": -1, "from": 3, "op": "get", "args": ["a"]}))
            .unwrap();

        assert_eq!(next(&raw).await, json!({"type": "resolve", "id": -3, "value": 1}));
        assert!(!connection.is_closed());

        let err = tokio::time::timeout(Duration::from_secs(1), connection.root())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::BadRequest);
    }

    #[tokio::test]
    async fn test_peer_cannot_settle_our_answers() {
        let (end, raw) = pair();
        let (resolver, pending) = Promise::deferred();
        let connection = Connection::new(end, pending);

        raw.put(json!({"type": "resolve", "id": -1, "value": "forged"})).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        resolver.resolve("real");

        assert_eq!(
            next(&raw).await,
            json!({"type": "resolve", "id": 1, "value": "real"})
        );
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn test_close_rejects_root_with_cause() {
        let (end, _raw) = pair();
        let connection = Connection::new(end, Value::Null);
        let root = connection.root();

        connection.close(Some(RpcError::internal("bye")));
        let err = tokio::time::timeout(Duration::from_secs(1), root)
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_connection_closed());
        assert_eq!(err.cause.as_deref(), Some(&RpcError::internal("bye")));

        let stats = connection.stats();
        assert!(stats.closed);
        assert_eq!(stats.remotes, 0);
        assert_eq!(stats.memo, 0);

        let late = connection.root().get("x").await.unwrap_err();
        assert!(late.is_connection_closed());
    }

    #[tokio::test]
    async fn test_stats_track_exports() {
        let (end, raw) = pair();
        let connection = Connection::new(end, Value::from(json!({"a": [1, 2]})));
        next(&raw).await;
        next(&raw).await;

        let stats = connection.stats();
        assert_eq!(stats.id, connection.id());
        // Root answer, root question, two copied containers.
        assert_eq!(stats.remotes, 2);
        assert_eq!(stats.objects, 2);
        assert!(!stats.closed);
    }
}
