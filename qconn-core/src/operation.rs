use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::error::RpcError;
use crate::value::{Array, Function, Object, Value};

/// Application object that can be exported over a connection.
///
/// Only `call` is required. Property access defaults to "not found" for
/// reads and "permission denied" for writes.
#[async_trait]
pub trait RpcTarget: Send + Sync + std::fmt::Debug {
    /// Call a method on this capability
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError>;

    /// Get a property from this capability
    async fn get_property(&self, property: &str) -> Result<Value, RpcError> {
        Err(RpcError::not_found(format!("Property not found: {}", property)))
    }

    async fn set_property(&self, property: &str, _value: Value) -> Result<(), RpcError> {
        Err(RpcError::permission_denied(format!(
            "Property is read-only: {}",
            property
        )))
    }

    async fn delete_property(&self, property: &str) -> Result<(), RpcError> {
        Err(RpcError::permission_denied(format!(
            "Property cannot be deleted: {}",
            property
        )))
    }

    async fn keys(&self) -> Result<Vec<String>, RpcError> {
        Ok(Vec::new())
    }

    /// Invoked when the target itself is called as a function.
    async fn apply(&self, _args: Vec<Value>) -> Result<Value, RpcError> {
        Err(RpcError::type_error("target is not callable"))
    }
}

/// Operation names as they appear in `dispatch` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpCode {
    Get,
    Set,
    Delete,
    Keys,
    Invoke,
    Call,
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpCode::Get => "get",
            OpCode::Set => "set",
            OpCode::Delete => "delete",
            OpCode::Keys => "keys",
            OpCode::Invoke => "invoke",
            OpCode::Call => "call",
        };
        write!(f, "{}", s)
    }
}

/// An observation or mutation addressed to an eventual value.
#[derive(Debug, Clone)]
pub enum Operation {
    Get(String),
    Set(String, Value),
    Delete(String),
    Keys,
    Invoke(String, Vec<Value>),
    Call(Vec<Value>),
}

impl Operation {
    pub fn code(&self) -> OpCode {
        match self {
            Operation::Get(_) => OpCode::Get,
            Operation::Set(..) => OpCode::Set,
            Operation::Delete(_) => OpCode::Delete,
            Operation::Keys => OpCode::Keys,
            Operation::Invoke(..) => OpCode::Invoke,
            Operation::Call(_) => OpCode::Call,
        }
    }

    /// Splits into the op name and the flat argument list carried on the wire.
    pub fn into_parts(self) -> (OpCode, Vec<Value>) {
        match self {
            Operation::Get(name) => (OpCode::Get, vec![Value::String(name)]),
            Operation::Set(name, value) => (OpCode::Set, vec![Value::String(name), value]),
            Operation::Delete(name) => (OpCode::Delete, vec![Value::String(name)]),
            Operation::Keys => (OpCode::Keys, Vec::new()),
            Operation::Invoke(name, args) => {
                let mut parts = Vec::with_capacity(args.len() + 1);
                parts.push(Value::String(name));
                parts.extend(args);
                (OpCode::Invoke, parts)
            }
            Operation::Call(args) => (OpCode::Call, args),
        }
    }

    pub fn from_parts(code: OpCode, args: Vec<Value>) -> Result<Self, RpcError> {
        let mut args = args.into_iter();
        let op = match code {
            OpCode::Get => Operation::Get(property_name(code, args.next())?),
            OpCode::Set => {
                let name = property_name(code, args.next())?;
                Operation::Set(name, args.next().unwrap_or(Value::Undefined))
            }
            OpCode::Delete => Operation::Delete(property_name(code, args.next())?),
            OpCode::Keys => Operation::Keys,
            OpCode::Invoke => {
                let name = property_name(code, args.next())?;
                Operation::Invoke(name, args.collect())
            }
            OpCode::Call => Operation::Call(args.collect()),
        };
        Ok(op)
    }
}

fn property_name(code: OpCode, arg: Option<Value>) -> Result<String, RpcError> {
    match arg {
        Some(Value::String(name)) => Ok(name),
        Some(Value::Number(n)) if n.fract() == 0.0 && n >= 0.0 => Ok(format!("{}", n as u64)),
        Some(other) => Err(RpcError::bad_request(format!(
            "{} expects a property name, got {}",
            code,
            other.type_name()
        ))),
        None => Err(RpcError::bad_request(format!(
            "{} expects a property name",
            code
        ))),
    }
}

/// Performs `op` on a local value.
///
/// A promise receiver is not awaited here; the operation is forwarded to it
/// and the resulting promise becomes the answer.
pub fn apply(target: Value, op: Operation) -> BoxFuture<'static, Result<Value, RpcError>> {
    Box::pin(async move {
        match target {
            Value::Promise(p) => Ok(Value::Promise(p.dispatch(op))),
            Value::Object(o) => apply_object(&o, op).await,
            Value::Array(a) => apply_array(&a, op).await,
            Value::Function(f) => apply_function(&f, op).await,
            Value::Target(t) => apply_target(t, op).await,
            Value::String(s) => match op {
                Operation::Get(name) if name == "length" => {
                    Ok(Value::Number(s.chars().count() as f64))
                }
                Operation::Get(_) => Ok(Value::Undefined),
                other => Err(unsupported(&other, "string")),
            },
            other => Err(unsupported(&op, other.type_name())),
        }
    })
}

fn unsupported(op: &Operation, type_name: &str) -> RpcError {
    RpcError::type_error(format!("cannot {} on {}", op.code(), type_name))
}

async fn call_member(member: Option<Value>, name: &str, args: Vec<Value>) -> Result<Value, RpcError> {
    match member {
        Some(Value::Function(f)) => f.call(args).await,
        Some(Value::Promise(p)) => Ok(Value::Promise(p.call(args))),
        Some(Value::Target(t)) => t.apply(args).await,
        _ => Err(RpcError::type_error(format!("{} is not a function", name))),
    }
}

async fn apply_object(o: &Object, op: Operation) -> Result<Value, RpcError> {
    match op {
        Operation::Get(name) => Ok(o.get(&name).unwrap_or(Value::Undefined)),
        Operation::Set(name, value) => {
            o.set(name, value);
            Ok(Value::Undefined)
        }
        Operation::Delete(name) => {
            o.remove(&name);
            Ok(Value::Undefined)
        }
        Operation::Keys => Ok(string_array(o.keys())),
        Operation::Invoke(name, args) => call_member(o.get(&name), &name, args).await,
        op @ Operation::Call(_) => Err(unsupported(&op, "object")),
    }
}

/// Largest index an array property name can denote.
const MAX_ARRAY_INDEX: usize = u32::MAX as usize - 1;

/// How far past the end a single `set` may grow an array.
pub const MAX_ARRAY_GROWTH: usize = 1 << 16;

fn array_index(name: &str) -> Option<usize> {
    name.parse::<usize>().ok().filter(|i| *i <= MAX_ARRAY_INDEX)
}

async fn apply_array(a: &Array, op: Operation) -> Result<Value, RpcError> {
    match op {
        Operation::Get(name) if name == "length" => Ok(Value::Number(a.len() as f64)),
        Operation::Get(name) => Ok(array_index(&name)
            .and_then(|i| a.get(i))
            .unwrap_or(Value::Undefined)),
        Operation::Set(name, value) => {
            let Some(i) = array_index(&name) else {
                return Err(RpcError::type_error(format!(
                    "cannot set property {} on array",
                    name
                )));
            };
            let len = a.len();
            if i > len.saturating_add(MAX_ARRAY_GROWTH) || !a.set(i, value) {
                return Err(RpcError::bad_request(format!(
                    "array index {} is too far past the end (length {})",
                    i, len
                )));
            }
            Ok(Value::Undefined)
        }
        Operation::Delete(name) => {
            if let Some(i) = array_index(&name).filter(|i| *i < a.len()) {
                a.set(i, Value::Undefined);
            }
            Ok(Value::Undefined)
        }
        Operation::Keys => Ok(string_array((0..a.len()).map(|i| i.to_string()).collect())),
        Operation::Invoke(name, args) => {
            let member = array_index(&name).and_then(|i| a.get(i));
            call_member(member, &name, args).await
        }
        op @ Operation::Call(_) => Err(unsupported(&op, "array")),
    }
}

async fn apply_function(f: &Function, op: Operation) -> Result<Value, RpcError> {
    match op {
        Operation::Call(args) => f.call(args).await,
        other => Err(unsupported(&other, "function")),
    }
}

async fn apply_target(t: Arc<dyn RpcTarget>, op: Operation) -> Result<Value, RpcError> {
    match op {
        Operation::Get(name) => t.get_property(&name).await,
        Operation::Set(name, value) => {
            t.set_property(&name, value).await?;
            Ok(Value::Undefined)
        }
        Operation::Delete(name) => {
            t.delete_property(&name).await?;
            Ok(Value::Undefined)
        }
        Operation::Keys => Ok(string_array(t.keys().await?)),
        Operation::Invoke(name, args) => t.call(&name, args).await,
        Operation::Call(args) => t.apply(args).await,
    }
}

fn string_array(keys: Vec<String>) -> Value {
    Value::Array(Array::from_vec(keys.into_iter().map(Value::String).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Calculator;

    #[async_trait]
    impl RpcTarget for Calculator {
        async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
            match method {
                "add" => Ok(Value::Number(args.iter().filter_map(Value::as_f64).sum())),
                _ => Err(RpcError::not_found(format!("Method not found: {}", method))),
            }
        }
    }

    #[test]
    fn test_operation_parts_roundtrip() {
        let op = Operation::Invoke("add".into(), vec![2.into(), 3.into()]);
        let (code, args) = op.into_parts();
        assert_eq!(code, OpCode::Invoke);
        assert_eq!(args.len(), 3);

        match Operation::from_parts(code, args).unwrap() {
            Operation::Invoke(name, args) => {
                assert_eq!(name, "add");
                assert_eq!(args.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_from_parts_requires_name() {
        let err = Operation::from_parts(OpCode::Get, vec![]).unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::BadRequest);

        let err = Operation::from_parts(OpCode::Set, vec![Value::Null]).unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::BadRequest);

        match Operation::from_parts(OpCode::Get, vec![Value::Number(2.0)]).unwrap() {
            Operation::Get(name) => assert_eq!(name, "2"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_opcode_serialization() {
        assert_eq!(serde_json::to_value(OpCode::Invoke).unwrap(), "invoke");
        let code: OpCode = serde_json::from_value(serde_json::json!("delete")).unwrap();
        assert_eq!(code, OpCode::Delete);
    }

    #[tokio::test]
    async fn test_apply_on_object() {
        let o = Object::new();
        o.set("a", 10);

        let got = apply(Value::Object(o.clone()), Operation::Get("a".into())).await.unwrap();
        assert_eq!(got.as_f64(), Some(10.0));

        apply(Value::Object(o.clone()), Operation::Set("b".into(), 1.into())).await.unwrap();
        apply(Value::Object(o.clone()), Operation::Delete("a".into())).await.unwrap();
        let keys = apply(Value::Object(o), Operation::Keys).await.unwrap();
        let keys: Vec<_> = keys.as_array().unwrap().to_vec();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].as_str(), Some("b"));
    }

    #[tokio::test]
    async fn test_apply_on_array() {
        let a = Array::from_vec(vec![1.into(), 2.into()]);
        let len = apply(Value::Array(a.clone()), Operation::Get("length".into())).await.unwrap();
        assert_eq!(len.as_f64(), Some(2.0));

        let missing = apply(Value::Array(a.clone()), Operation::Get("9".into())).await.unwrap();
        assert!(missing.is_undefined());

        let err = apply(Value::Array(a), Operation::Call(vec![])).await.unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::TypeError);
    }

    #[tokio::test]
    async fn test_array_set_bounds() {
        let a = Array::from_vec(vec![1.into()]);
        apply(Value::Array(a.clone()), Operation::Set("3".into(), 5.into()))
            .await
            .unwrap();
        assert_eq!(a.len(), 4);

        for index in ["18446744073709551615", "4000000000", "70000"] {
            let err = apply(Value::Array(a.clone()), Operation::Set(index.into(), 1.into()))
                .await
                .unwrap_err();
            println!("set {} -> {}", index, err);
            assert!(matches!(
                err.code,
                crate::ErrorCode::BadRequest | crate::ErrorCode::TypeError
            ));
        }
        assert_eq!(a.len(), 4);
    }

    #[tokio::test]
    async fn test_apply_invoke_member_function() {
        let o = Object::new();
        o.set(
            "double",
            Function::from_fn(|args| Ok(Value::Number(args[0].as_f64().unwrap_or(0.0) * 2.0))),
        );
        let result = apply(Value::Object(o.clone()), Operation::Invoke("double".into(), vec![4.into()]))
            .await
            .unwrap();
        assert_eq!(result.as_f64(), Some(8.0));

        let err = apply(Value::Object(o), Operation::Invoke("missing".into(), vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.message, "missing is not a function");
    }

    #[tokio::test]
    async fn test_apply_on_target() {
        let target: Arc<dyn RpcTarget> = Arc::new(Calculator);
        let sum = apply(
            Value::Target(target.clone()),
            Operation::Invoke("add".into(), vec![2.into(), 3.into()]),
        )
        .await
        .unwrap();
        assert_eq!(sum.as_f64(), Some(5.0));

        let err = apply(Value::Target(target.clone()), Operation::Get("x".into()))
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::NotFound);

        let err = apply(Value::Target(target), Operation::Set("x".into(), 1.into()))
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn test_apply_on_primitive_fails() {
        let err = apply(Value::Number(1.0), Operation::Keys).await.unwrap_err();
        assert_eq!(err.code, crate::ErrorCode::TypeError);
        assert_eq!(err.message, "cannot keys on number");
    }
}
