//! QSON: JSON plus the reference and sentinel tokens needed to move object
//! graphs with promises, functions and cycles between two peers.
//!
//! Encoding and decoding run with the connection state locked. Neither ever
//! calls application code, and neither fails the connection: tokens that
//! cannot be honoured decode to rejected promises.

use serde_json::{json, Map, Value as JsonValue};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use super::connection::{ConnectionInner, ConnectionState};
use super::ids::{is_local, is_wire_id, peer_view};
use super::message::{error_from_json, Message};
use super::remote::Remote;
use super::tables::WireRef;
use crate::error::RpcError;
use crate::promise::Promise;
use crate::value::{number_to_json, Array, Object, PassBy, Value};

/// Deepest container nesting a single encode pass accepts.
pub const MAX_DEPTH: usize = 256;

const SPECIAL_KEY_CHARS: [char; 6] = ['@', '!', '%', '$', '\\', '-'];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Value nested deeper than {0} levels")]
    TooDeep(usize),
}

/// Prefixes every reserved character of a property name with a backslash.
pub fn escape_key(key: &str) -> Cow<'_, str> {
    if !key.chars().any(|c| SPECIAL_KEY_CHARS.contains(&c)) {
        return Cow::Borrowed(key);
    }
    let mut escaped = String::with_capacity(key.len() + 2);
    for c in key.chars() {
        if SPECIAL_KEY_CHARS.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    Cow::Owned(escaped)
}

/// Inverse of [`escape_key`]: the character after a backslash is literal.
pub fn unescape_key(key: &str) -> Cow<'_, str> {
    if !key.contains('\\') {
        return Cow::Borrowed(key);
    }
    let mut unescaped = String::with_capacity(key.len());
    let mut chars = key.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(literal) = chars.next() {
                unescaped.push(literal);
            }
        } else {
            unescaped.push(c);
        }
    }
    Cow::Owned(unescaped)
}

fn sentinel(name: &str) -> JsonValue {
    json!({"%": name})
}

/// `{"!": error}`, sent in place of a value that could not be encoded.
pub fn failure_marker(error: &RpcError) -> JsonValue {
    json!({"!": serde_json::to_value(error).unwrap_or(JsonValue::Null)})
}

fn encode_number(n: f64) -> JsonValue {
    if n.is_nan() {
        sentinel("nan")
    } else if n == f64::INFINITY {
        sentinel("infinity")
    } else if n == f64::NEG_INFINITY {
        sentinel("-infinity")
    } else {
        number_to_json(n).unwrap_or(JsonValue::Null)
    }
}

/// Everything one encode pass produced besides the payload itself.
#[derive(Default)]
pub(crate) struct Encoded {
    /// Copied containers, sent as one `objects` message ahead of the payload.
    pub(crate) objects: BTreeMap<i64, JsonValue>,
    /// Messages that must follow the payload.
    pub(crate) notices: Vec<Message>,
    /// Answer slots to wire to the promises they were exported for.
    pub(crate) answers: Vec<(Arc<Remote>, Promise)>,
}

pub(crate) struct Encoder<'a> {
    inner: &'a ConnectionInner,
    state: &'a mut ConnectionState,
    out: Encoded,
    created: Vec<i64>,
}

impl<'a> Encoder<'a> {
    pub(crate) fn new(inner: &'a ConnectionInner, state: &'a mut ConnectionState) -> Self {
        Encoder {
            inner,
            state,
            out: Encoded::default(),
            created: Vec::new(),
        }
    }

    pub(crate) fn encode(&mut self, value: &Value) -> Result<JsonValue, CodecError> {
        self.encode_at(value, 0)
    }

    pub(crate) fn finish(self) -> Encoded {
        self.out
    }

    /// Forgets every slot this pass allocated; nothing of it was sent.
    pub(crate) fn abort(self) {
        for slot in self.created {
            self.state.remotes.remove(slot);
            self.state.objects.remove(slot);
            self.state.memo.forget_slot(slot);
        }
    }

    fn encode_at(&mut self, value: &Value, depth: usize) -> Result<JsonValue, CodecError> {
        if depth > MAX_DEPTH {
            return Err(CodecError::TooDeep(MAX_DEPTH));
        }
        match value {
            Value::Undefined => return Ok(sentinel("undefined")),
            Value::Null => return Ok(JsonValue::Null),
            Value::Bool(b) => return Ok(JsonValue::Bool(*b)),
            Value::Number(n) => return Ok(encode_number(*n)),
            Value::String(s) => return Ok(JsonValue::String(s.clone())),
            _ => {}
        }

        if let Some(token) = self.state.memo.get(value) {
            return Ok(token.to_json());
        }

        match value {
            Value::Promise(p) => Ok(self.export_promise(p)),
            Value::Function(_) => Ok(self.export_reference(value, true)),
            Value::Target(_) => Ok(self.export_reference(value, false)),
            Value::Object(o) if o.pass_by() == PassBy::Reference => {
                Ok(self.export_reference(value, false))
            }
            Value::Array(a) if a.pass_by() == PassBy::Reference => {
                Ok(self.export_reference(value, false))
            }
            Value::Object(o) => self.export_object(value, o, depth),
            Value::Array(a) => self.export_array(value, a, depth),
            _ => Ok(JsonValue::Null),
        }
    }

    fn export_promise(&mut self, promise: &Promise) -> JsonValue {
        let question = self.inner.ids.allocate_question();
        let answer = Arc::new(Remote::answer(question));
        self.state
            .memo
            .insert(&Value::Promise(promise.clone()), WireRef::Question(question));
        self.state.insert_remote(answer.clone());
        self.created.push(question);

        let pass_now = promise.is_passed() || {
            let connection = self.inner.this.clone();
            !promise.on_pass(Box::new(move || {
                if let Some(inner) = connection.upgrade() {
                    inner.send(Message::Pass { id: question });
                }
            }))
        };
        if pass_now {
            self.out.notices.push(Message::Pass { id: question });
        }

        self.out.answers.push((answer, promise.clone()));
        WireRef::Question(question).to_json()
    }

    fn export_reference(&mut self, value: &Value, callable: bool) -> JsonValue {
        let question = self.inner.ids.allocate_question();
        let export = self.inner.ids.allocate_export();
        self.state.insert_object(export, value.clone());
        self.state
            .insert_remote(Arc::new(Remote::bound(question, value.clone())));
        self.created.push(question);
        self.created.push(export);

        let token = if callable {
            WireRef::Callable(question)
        } else {
            WireRef::Handle { question, export }
        };
        self.state.memo.insert(value, token);
        token.to_json()
    }

    fn begin_copy(&mut self, value: &Value) -> i64 {
        let export = self.inner.ids.allocate_export();
        // Memoized before the contents so a cycle back to `value` finds it.
        self.state.memo.insert(value, WireRef::Export(export));
        self.state.insert_object(export, value.clone());
        self.created.push(export);
        export
    }

    fn export_object(
        &mut self,
        value: &Value,
        object: &Object,
        depth: usize,
    ) -> Result<JsonValue, CodecError> {
        let export = self.begin_copy(value);
        let mut repr = Map::new();
        for (key, field) in object.entries() {
            let encoded = self.encode_at(&field, depth + 1)?;
            repr.insert(escape_key(&key).into_owned(), encoded);
        }
        self.out.objects.insert(export, JsonValue::Object(repr));
        Ok(WireRef::Export(export).to_json())
    }

    fn export_array(
        &mut self,
        value: &Value,
        array: &Array,
        depth: usize,
    ) -> Result<JsonValue, CodecError> {
        let export = self.begin_copy(value);
        let mut repr = Vec::with_capacity(array.len());
        for item in array.to_vec() {
            repr.push(self.encode_at(&item, depth + 1)?);
        }
        self.out.objects.insert(export, JsonValue::Array(repr));
        Ok(WireRef::Export(export).to_json())
    }
}

pub(crate) struct Decoder<'a> {
    inner: &'a ConnectionInner,
    state: &'a mut ConnectionState,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(inner: &'a ConnectionInner, state: &'a mut ConnectionState) -> Self {
        Decoder { inner, state }
    }

    pub(crate) fn decode(&mut self, json: &JsonValue) -> Value {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(*b),
            JsonValue::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            JsonValue::String(s) => Value::String(s.clone()),
            JsonValue::Array(items) => {
                Value::Array(Array::from_vec(items.iter().map(|item| self.decode(item)).collect()))
            }
            JsonValue::Object(map) => self.decode_object(map),
        }
    }

    /// Decodes an `objects` batch: every container is allocated and
    /// registered first, then populated, so references inside the batch
    /// (including cycles) resolve to the new containers.
    pub(crate) fn decode_objects(&mut self, batch: &BTreeMap<i64, JsonValue>) {
        let mut allocated = Vec::with_capacity(batch.len());
        for (wire_id, repr) in batch {
            let id = peer_view(*wire_id);
            let container = match repr {
                JsonValue::Array(_) => Value::Array(Array::new()),
                JsonValue::Object(_) => Value::Object(Object::new()),
                other => {
                    warn!(
                        connection = %self.inner.id,
                        export = id,
                        "ignoring object representation that is not a container: {}",
                        other
                    );
                    continue;
                }
            };
            if !self.state.insert_object(id, container.clone()) {
                continue;
            }
            self.state.memo.insert(&container, WireRef::Export(id));
            allocated.push((container, repr));
        }

        for (container, repr) in allocated {
            match (container, repr) {
                (Value::Array(array), JsonValue::Array(items)) => {
                    for item in items {
                        let decoded = self.decode(item);
                        array.push(decoded);
                    }
                }
                (Value::Object(object), JsonValue::Object(fields)) => {
                    for (key, field) in fields {
                        let decoded = self.decode(field);
                        object.set(unescape_key(key).into_owned(), decoded);
                    }
                }
                _ => {}
            }
        }
    }

    fn decode_object(&mut self, map: &Map<String, JsonValue>) -> Value {
        if let Some(tag) = map.get("%") {
            return decode_sentinel(tag);
        }
        if let Some(error) = map.get("!") {
            return Value::Promise(Promise::rejected(error_from_json(error.clone())));
        }
        if let Some(question) = map.get("@") {
            let export = match map.get("$") {
                Some(export) => match token_id(export) {
                    Some(e) => Some(e),
                    None => return malformed(map),
                },
                None => None,
            };
            return match token_id(question) {
                Some(n) => self.decode_question(n, export),
                None => malformed(map),
            };
        }
        if let Some(callable) = map.get("->") {
            return match token_id(callable) {
                Some(n) => self.decode_callable(n),
                None => malformed(map),
            };
        }
        if let Some(export) = map.get("$") {
            return match token_id(export) {
                Some(n) => self.decode_export(n),
                None => malformed(map),
            };
        }

        let object = Object::new();
        for (key, field) in map {
            let decoded = self.decode(field);
            object.set(unescape_key(key).into_owned(), decoded);
        }
        Value::Object(object)
    }

    fn decode_question(&mut self, wire_id: i64, wire_export: Option<i64>) -> Value {
        let id = peer_view(wire_id);
        if is_local(id) {
            if let Some(value) = wire_export.and_then(|e| self.state.objects.get(peer_view(e)).cloned()) {
                return value;
            }
            return self.own_slot(id);
        }
        if let Some(remote) = self.state.remotes.get(id) {
            return remote.value();
        }

        let remote = Arc::new(Remote::question(self.inner.forwarder(), id));
        let token = match wire_export {
            Some(export) => {
                remote.mark_far();
                WireRef::Handle {
                    question: id,
                    export: peer_view(export),
                }
            }
            None => WireRef::Question(id),
        };
        let value = Value::Promise(remote.promise.clone());
        self.state.memo.insert(&value, token);
        self.state.insert_remote(remote);
        value
    }

    fn decode_callable(&mut self, wire_id: i64) -> Value {
        let id = peer_view(wire_id);
        if is_local(id) {
            return self.own_slot(id);
        }
        if let Some(remote) = self.state.remotes.get(id) {
            return Value::Function(remote.callable());
        }

        let remote = Arc::new(Remote::question(self.inner.forwarder(), id));
        remote.mark_far();
        let function = Value::Function(remote.callable());
        self.state.memo.insert(&function, WireRef::Callable(id));
        self.state.insert_remote(remote);
        function
    }

    fn decode_export(&mut self, wire_id: i64) -> Value {
        let id = peer_view(wire_id);
        match self.state.objects.get(id) {
            Some(value) => value.clone(),
            None => revoked(id),
        }
    }

    fn own_slot(&mut self, id: i64) -> Value {
        match self.state.remotes.get(id) {
            Some(remote) => remote.value(),
            None => revoked(id),
        }
    }
}

fn decode_sentinel(tag: &JsonValue) -> Value {
    match tag.as_str() {
        Some("undefined") => Value::Undefined,
        Some("infinity") | Some("+Infinity") => Value::Number(f64::INFINITY),
        Some("-infinity") | Some("-Infinity") => Value::Number(f64::NEG_INFINITY),
        Some("nan") | Some("NaN") => Value::Number(f64::NAN),
        _ => Value::Promise(Promise::rejected(RpcError::type_error(format!(
            "Unrecognized type: {}",
            tag
        )))),
    }
}

fn token_id(raw: &JsonValue) -> Option<i64> {
    raw.as_i64().filter(|id| is_wire_id(*id))
}

fn revoked(id: i64) -> Value {
    Value::Promise(Promise::rejected(RpcError::cap_revoked(format!(
        "Reference {} is no longer available",
        id
    ))))
}

fn malformed(map: &Map<String, JsonValue>) -> Value {
    Value::Promise(Promise::rejected(RpcError::bad_request(format!(
        "Malformed reference: {}",
        JsonValue::Object(map.clone())
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_special_keys() {
        assert_eq!(escape_key("plain"), "plain");
        assert_eq!(escape_key("@"), "\\@");
        assert_eq!(escape_key("!!"), "\\!\\!");
        assert_eq!(escape_key("->"), "\\->");
        assert_eq!(escape_key("\\"), "\\\\");
        assert_eq!(escape_key("a$b"), "a\\$b");
    }

    #[test]
    fn test_unescape_inverts_escape() {
        for key in ["@", "@@", "!", "!!", "%", "%%", "\\@", "\\", "$", "->", "x-y", "plain"] {
            assert_eq!(unescape_key(&escape_key(key)), key, "key {:?}", key);
        }
    }

    #[test]
    fn test_escaped_keys_never_look_like_tokens() {
        for key in ["@", "!", "%", "$", "->"] {
            let escaped = escape_key(key);
            assert_ne!(escaped, key);
            assert!(escaped.starts_with('\\'));
        }
    }

    #[test]
    fn test_number_encoding() {
        assert_eq!(encode_number(f64::NAN), json!({"%": "nan"}));
        assert_eq!(encode_number(f64::INFINITY), json!({"%": "infinity"}));
        assert_eq!(encode_number(f64::NEG_INFINITY), json!({"%": "-infinity"}));
        assert_eq!(encode_number(10.0), json!(10));
        assert_eq!(encode_number(0.5), json!(0.5));
    }

    #[test]
    fn test_sentinel_decoding() {
        assert!(decode_sentinel(&json!("undefined")).is_undefined());
        assert_eq!(decode_sentinel(&json!("infinity")).as_f64(), Some(f64::INFINITY));
        assert_eq!(decode_sentinel(&json!("-Infinity")).as_f64(), Some(f64::NEG_INFINITY));
        assert!(decode_sentinel(&json!("nan")).as_f64().is_some_and(f64::is_nan));
    }

    #[tokio::test]
    async fn test_unknown_sentinel_is_rejected_type_error() {
        let value = decode_sentinel(&json!("date"));
        let promise = value.as_promise().cloned().unwrap();
        let err = promise.await.unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::TypeError);
        assert_eq!(err.message, "Unrecognized type: \"date\"");
    }

    #[test]
    fn test_token_ids_must_negate() {
        assert_eq!(token_id(&json!(-3)), Some(-3));
        assert_eq!(token_id(&json!(i64::MIN)), None);
        assert_eq!(token_id(&json!("3")), None);
        assert_eq!(token_id(&json!(1.5)), None);
    }

    #[test]
    fn test_failure_marker_shape() {
        let marker = failure_marker(&RpcError::internal("boom"));
        assert_eq!(marker["!"]["code"], "internal");
        assert_eq!(marker["!"]["message"], "boom");
    }
}
