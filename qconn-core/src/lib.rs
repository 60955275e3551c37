pub mod channel;
pub mod error;
pub mod operation;
pub mod promise;
pub mod protocol;
pub mod value;

pub use channel::{pair, ChannelError, CloseSignal, LocalChannel, MessageChannel};
pub use error::{ErrorCode, RpcError};
pub use operation::{OpCode, Operation, RpcTarget};
pub use promise::{Promise, Resolver, Settlement};
pub use protocol::{
    Connection, ConnectionConfig, ConnectionStats, LostHook, Message, MessageError,
};
pub use value::{Array, Function, Object, PassBy, Value};

// Mock RPC target for testing
#[cfg(test)]
#[derive(Debug)]
pub struct MockRpcTarget {}

#[cfg(test)]
impl MockRpcTarget {
    pub fn new() -> Self {
        Self {}
    }
}

#[cfg(test)]
impl Default for MockRpcTarget {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[async_trait::async_trait]
impl RpcTarget for MockRpcTarget {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        Ok(Value::String(format!(
            "Mock call to {} with {} args",
            method,
            args.len()
        )))
    }

    async fn get_property(&self, property: &str) -> Result<Value, RpcError> {
        Ok(Value::String(format!("Mock property {}", property)))
    }
}
