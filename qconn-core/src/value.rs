// In-memory values that can cross a connection.
//
// Objects and arrays are shared, mutable containers with identity, so a graph
// may contain cycles and the same container may be reachable twice. Whether a
// container is copied or passed as a handle is an explicit attribute.

use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde_json::{Number, Value as JsonValue};
use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::RpcError;
use crate::operation::RpcTarget;
use crate::promise::Promise;

/// How a container crosses the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PassBy {
    /// The far side receives a structural copy in an `objects` batch.
    #[default]
    Copy,
    /// The far side receives a handle; reads and writes travel back here.
    Reference,
}

#[derive(Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Array),
    Object(Object),
    Function(Function),
    Target(Arc<dyn RpcTarget>),
    Promise(Promise),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
            Value::Target(_) => "target",
            Value::Promise(_) => "promise",
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Array> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_promise(&self) -> Option<&Promise> {
        match self {
            Value::Promise(p) => Some(p),
            _ => None,
        }
    }

    /// Marks a container for by-reference passing. Other values are
    /// returned unchanged: functions, targets and promises always travel
    /// by reference, primitives always by copy.
    pub fn by_reference(self) -> Self {
        match &self {
            Value::Object(o) => o.set_pass_by(PassBy::Reference),
            Value::Array(a) => a.set_pass_by(PassBy::Reference),
            _ => {}
        }
        self
    }

    /// Identity of a reference-typed value, used to memoize wire references.
    /// Primitives have no identity.
    pub(crate) fn identity(&self) -> Option<usize> {
        match self {
            Value::Array(a) => Some(Arc::as_ptr(&a.cell) as *const () as usize),
            Value::Object(o) => Some(Arc::as_ptr(&o.cell) as *const () as usize),
            Value::Function(f) => Some(Arc::as_ptr(&f.call) as *const () as usize),
            Value::Target(t) => Some(Arc::as_ptr(t) as *const () as usize),
            Value::Promise(p) => Some(p.identity()),
            _ => None,
        }
    }

    /// True when both values are the same primitive or the same container.
    pub fn same_value(&self, other: &Value) -> bool {
        match (self.identity(), other.identity()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => match (self, other) {
                (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
                (Value::Bool(a), Value::Bool(b)) => a == b,
                (Value::Number(a), Value::Number(b)) => a == b || (a.is_nan() && b.is_nan()),
                (Value::String(a), Value::String(b)) => a == b,
                _ => false,
            },
            _ => false,
        }
    }

    /// Converts a plain data graph into JSON.
    ///
    /// Returns `None` when the graph holds anything JSON cannot express:
    /// undefined, non-finite numbers, functions, targets, promises or cycles.
    pub fn to_plain_json(&self) -> Option<JsonValue> {
        let mut visiting = HashSet::new();
        self.to_plain_json_inner(&mut visiting)
    }

    fn to_plain_json_inner(&self, visiting: &mut HashSet<usize>) -> Option<JsonValue> {
        match self {
            Value::Null => Some(JsonValue::Null),
            Value::Bool(b) => Some(JsonValue::Bool(*b)),
            Value::Number(n) => number_to_json(*n),
            Value::String(s) => Some(JsonValue::String(s.clone())),
            Value::Array(a) => {
                let id = self.identity()?;
                if !visiting.insert(id) {
                    return None;
                }
                let items = a
                    .to_vec()
                    .iter()
                    .map(|item| item.to_plain_json_inner(visiting))
                    .collect::<Option<Vec<_>>>();
                visiting.remove(&id);
                items.map(JsonValue::Array)
            }
            Value::Object(o) => {
                let id = self.identity()?;
                if !visiting.insert(id) {
                    return None;
                }
                let mut map = serde_json::Map::new();
                for (key, value) in o.entries() {
                    match value.to_plain_json_inner(visiting) {
                        Some(json) => {
                            map.insert(key, json);
                        }
                        None => {
                            visiting.remove(&id);
                            return None;
                        }
                    }
                }
                visiting.remove(&id);
                Some(JsonValue::Object(map))
            }
            _ => None,
        }
    }
}

/// JSON number for a finite float; integral values in the safe integer range
/// are written without a fractional part.
pub(crate) fn number_to_json(n: f64) -> Option<JsonValue> {
    const MAX_SAFE: f64 = 9_007_199_254_740_991.0;
    if !n.is_finite() {
        return None;
    }
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE && !(n == 0.0 && n.is_sign_negative()) {
        return Some(JsonValue::Number(Number::from(n as i64)));
    }
    Number::from_f64(n).map(JsonValue::Number)
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "Undefined"),
            Value::Null => write!(f, "Null"),
            Value::Bool(b) => write!(f, "Bool({})", b),
            Value::Number(n) => write!(f, "Number({})", n),
            Value::String(s) => write!(f, "String({:?})", s),
            Value::Array(a) => write!(f, "{:?}", a),
            Value::Object(o) => write!(f, "{:?}", o),
            Value::Function(func) => write!(f, "{:?}", func),
            Value::Target(t) => write!(f, "Target({:?})", t),
            Value::Promise(p) => write!(f, "{:?}", p),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Number(f64::from(n))
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(Array::from_vec(items))
    }
}

impl From<Array> for Value {
    fn from(a: Array) -> Self {
        Value::Array(a)
    }
}

impl From<Object> for Value {
    fn from(o: Object) -> Self {
        Value::Object(o)
    }
}

impl From<Function> for Value {
    fn from(f: Function) -> Self {
        Value::Function(f)
    }
}

impl From<Promise> for Value {
    fn from(p: Promise) -> Self {
        Value::Promise(p)
    }
}

impl From<Arc<dyn RpcTarget>> for Value {
    fn from(t: Arc<dyn RpcTarget>) -> Self {
        Value::Target(t)
    }
}

impl From<JsonValue> for Value {
    fn from(json: JsonValue) -> Self {
        match json {
            JsonValue::Null => Value::Null,
            JsonValue::Bool(b) => Value::Bool(b),
            JsonValue::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            JsonValue::String(s) => Value::String(s),
            JsonValue::Array(items) => {
                Value::Array(Array::from_vec(items.into_iter().map(Value::from).collect()))
            }
            JsonValue::Object(map) => Value::Object(Object::from_entries(
                map.into_iter().map(|(k, v)| (k, Value::from(v))),
            )),
        }
    }
}

pub(crate) fn lock_recovering<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Container contents are plain values; a panic elsewhere cannot leave
    // them half-updated, so a poisoned lock is still usable.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ObjectCell {
    fields: Mutex<IndexMap<String, Value>>,
    pass_by: Mutex<PassBy>,
}

/// Shared, ordered map of properties.
#[derive(Clone)]
pub struct Object {
    cell: Arc<ObjectCell>,
}

impl Object {
    pub fn new() -> Self {
        Self::from_entries(std::iter::empty::<(String, Value)>())
    }

    pub fn from_entries<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Object {
            cell: Arc::new(ObjectCell {
                fields: Mutex::new(entries.into_iter().map(|(k, v)| (k.into(), v)).collect()),
                pass_by: Mutex::new(PassBy::Copy),
            }),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        lock_recovering(&self.cell.fields).get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        lock_recovering(&self.cell.fields).insert(key.into(), value.into())
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        lock_recovering(&self.cell.fields).shift_remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        lock_recovering(&self.cell.fields).contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        lock_recovering(&self.cell.fields).keys().cloned().collect()
    }

    /// Snapshot of the properties in insertion order.
    pub fn entries(&self) -> Vec<(String, Value)> {
        lock_recovering(&self.cell.fields)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        lock_recovering(&self.cell.fields).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pass_by(&self) -> PassBy {
        *lock_recovering(&self.cell.pass_by)
    }

    pub fn set_pass_by(&self, pass_by: PassBy) {
        *lock_recovering(&self.cell.pass_by) = pass_by;
    }

    pub fn by_reference(self) -> Self {
        self.set_pass_by(PassBy::Reference);
        self
    }

    pub fn ptr_eq(&self, other: &Object) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Default for Object {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Not recursive: the graph may be cyclic.
        write!(
            f,
            "Object({:p}, keys={:?}, {:?})",
            Arc::as_ptr(&self.cell),
            self.keys(),
            self.pass_by()
        )
    }
}

struct ArrayCell {
    items: Mutex<Vec<Value>>,
    pass_by: Mutex<PassBy>,
}

/// Shared, growable sequence.
#[derive(Clone)]
pub struct Array {
    cell: Arc<ArrayCell>,
}

impl Array {
    pub fn new() -> Self {
        Self::from_vec(Vec::new())
    }

    pub fn from_vec(items: Vec<Value>) -> Self {
        Array {
            cell: Arc::new(ArrayCell {
                items: Mutex::new(items),
                pass_by: Mutex::new(PassBy::Copy),
            }),
        }
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        lock_recovering(&self.cell.items).get(index).cloned()
    }

    /// Stores `value` at `index`, padding with undefined as needed.
    /// Returns false, leaving the array untouched, when `index + 1` does not
    /// fit in a `usize`.
    pub fn set(&self, index: usize, value: impl Into<Value>) -> bool {
        let Some(len) = index.checked_add(1) else {
            return false;
        };
        let mut items = lock_recovering(&self.cell.items);
        if index >= items.len() {
            items.resize(len, Value::Undefined);
        }
        items[index] = value.into();
        true
    }

    pub fn push(&self, value: impl Into<Value>) {
        lock_recovering(&self.cell.items).push(value.into());
    }

    pub fn len(&self) -> usize {
        lock_recovering(&self.cell.items).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the elements.
    pub fn to_vec(&self) -> Vec<Value> {
        lock_recovering(&self.cell.items).clone()
    }

    pub fn pass_by(&self) -> PassBy {
        *lock_recovering(&self.cell.pass_by)
    }

    pub fn set_pass_by(&self, pass_by: PassBy) {
        *lock_recovering(&self.cell.pass_by) = pass_by;
    }

    pub fn by_reference(self) -> Self {
        self.set_pass_by(PassBy::Reference);
        self
    }

    pub fn ptr_eq(&self, other: &Array) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl Default for Array {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Array {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Array({:p}, len={}, {:?})",
            Arc::as_ptr(&self.cell),
            self.len(),
            self.pass_by()
        )
    }
}

type Callable = dyn Fn(Vec<Value>) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync;

/// A callable value. Local functions run in this process; functions decoded
/// from the wire are proxies that dispatch a remote call.
#[derive(Clone)]
pub struct Function {
    call: Arc<Callable>,
}

impl Function {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        Function {
            call: Arc::new(move |args| Box::pin(f(args))),
        }
    }

    /// Wraps a synchronous closure.
    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value, RpcError> + Send + Sync + 'static,
    {
        Function {
            call: Arc::new(move |args| {
                let result = f(args);
                Box::pin(async move { result })
            }),
        }
    }

    pub fn call(&self, args: Vec<Value>) -> BoxFuture<'static, Result<Value, RpcError>> {
        (self.call)(args)
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.call, &other.call)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Function({:p})", Arc::as_ptr(&self.call) as *const ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_conversion_roundtrip() {
        let json = json!({"a": 1, "b": [true, null, "x"], "c": {"d": 2.5}});
        let value = Value::from(json.clone());
        assert_eq!(value.to_plain_json(), Some(json));
    }

    #[test]
    fn test_plain_json_rejects_cycles_and_sentinels() {
        let a = Array::new();
        a.push(Value::Array(a.clone()));
        assert_eq!(Value::Array(a).to_plain_json(), None);

        assert_eq!(Value::Undefined.to_plain_json(), None);
        assert_eq!(Value::Number(f64::NAN).to_plain_json(), None);
    }

    #[test]
    fn test_integral_numbers_stay_integral() {
        assert_eq!(number_to_json(10.0), Some(json!(10)));
        assert_eq!(number_to_json(-3.0), Some(json!(-3)));
        assert_eq!(number_to_json(2.5), Some(json!(2.5)));
        assert_eq!(number_to_json(f64::INFINITY), None);
    }

    #[test]
    fn test_by_reference_marking() {
        let obj = Object::new();
        assert_eq!(obj.pass_by(), PassBy::Copy);
        let marked = Value::Object(obj.clone()).by_reference();
        assert_eq!(obj.pass_by(), PassBy::Reference);
        assert!(marked.same_value(&Value::Object(obj)));
    }

    #[test]
    fn test_array_set_pads_with_undefined() {
        let a = Array::new();
        assert!(a.set(2, 7));
        assert_eq!(a.len(), 3);
        assert!(a.get(0).map(|v| v.is_undefined()).unwrap_or(false));
        assert_eq!(a.get(2).and_then(|v| v.as_f64()), Some(7.0));
    }

    #[test]
    fn test_array_set_refuses_unrepresentable_index() {
        let a = Array::from_vec(vec![Value::from(1)]);
        assert!(!a.set(usize::MAX, 2));
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn test_same_value_semantics() {
        assert!(Value::Number(f64::NAN).same_value(&Value::Number(f64::NAN)));
        assert!(!Value::from(1).same_value(&Value::from("1")));
        let a = Object::new();
        let b = Object::new();
        assert!(!Value::Object(a.clone()).same_value(&Value::Object(b)));
        assert!(Value::Object(a.clone()).same_value(&Value::Object(a)));
    }

    #[test]
    fn test_object_preserves_insertion_order() {
        let o = Object::new();
        o.set("b", 1);
        o.set("a", 2);
        assert_eq!(o.keys(), vec!["b".to_string(), "a".to_string()]);
        o.remove("b");
        assert_eq!(o.keys(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_function_call() {
        let add = Function::from_fn(|args| {
            let sum: f64 = args.iter().filter_map(Value::as_f64).sum();
            Ok(Value::Number(sum))
        });
        let result = add.call(vec![2.into(), 3.into()]).await.unwrap();
        assert_eq!(result.as_f64(), Some(5.0));
    }
}
