// qconn Node Tests
// Two nodes talking over real sockets: TCP with both framings, WebSocket,
// callbacks in both directions and registry bookkeeping.

use qconn_core::{ErrorCode, Function, Object, RpcError, Value};
use qconn_node::{init_test_logging, Node, NodeConfig, TransportKind};
use qconn_transport::Framing;
use std::time::Duration;

fn calculator() -> Value {
    Object::from_entries([
        (
            "add",
            Value::Function(Function::from_fn(|args| {
                Ok(Value::Number(args.iter().filter_map(Value::as_f64).sum()))
            })),
        ),
        (
            "twice",
            Value::Function(Function::new(|args: Vec<Value>| async move {
                let callback = args
                    .first()
                    .and_then(Value::as_function)
                    .cloned()
                    .ok_or_else(|| RpcError::bad_request("expected a callback"))?;
                let first = callback.call(vec![]).await?;
                let second = callback.call(vec![]).await?;
                Ok(Value::Number(
                    first.as_f64().unwrap_or(0.0) + second.as_f64().unwrap_or(0.0),
                ))
            })),
        ),
    ])
    .by_reference()
    .into()
}

fn config(transport: TransportKind, framing: Framing) -> NodeConfig {
    NodeConfig {
        port: 0,
        transport,
        framing,
        ..NodeConfig::default()
    }
}

async fn with_timeout<T>(future: impl std::future::IntoFuture<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

#[cfg(test)]
mod node_tests {
    use super::*;

    async fn round_trip(transport: TransportKind, framing: Framing) {
        init_test_logging();
        let server = Node::new(config(transport, framing), calculator());
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().to_string();
        tokio::spawn(listener.serve());

        let client = Node::new(config(transport, framing), Value::Undefined);
        let connection = client.connect(&addr).await.unwrap();

        let sum = with_timeout(connection.root().invoke("add", vec![2.into(), 3.into()]))
            .await
            .unwrap();
        assert_eq!(sum.as_f64(), Some(5.0));

        let counter = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let seen = counter.clone();
        let tick = Function::from_fn(move |_| {
            let n = seen.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            Ok(Value::from(n))
        });
        let total = with_timeout(connection.root().invoke("twice", vec![tick.into()]))
            .await
            .unwrap();
        assert_eq!(total.as_f64(), Some(3.0));

        assert_eq!(client.registry().len(), 1);
        with_timeout(async {
            while server.registry().len() != 1 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
    }

    #[tokio::test]
    async fn test_tcp_newline_delimited() {
        round_trip(TransportKind::Tcp, Framing::NewlineDelimited).await;
    }

    #[tokio::test]
    async fn test_tcp_length_prefixed() {
        round_trip(TransportKind::Tcp, Framing::LengthPrefixed).await;
    }

    #[tokio::test]
    async fn test_websocket() {
        round_trip(TransportKind::WebSocket, Framing::NewlineDelimited).await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_client_calls() {
        let hang = Object::from_entries([(
            "hang",
            Value::Function(Function::from_fn(|_| {
                let (_resolver, never) = qconn_core::Promise::deferred();
                Ok(Value::Promise(never))
            })),
        )])
        .by_reference();
        let server = Node::new(config(TransportKind::Tcp, Framing::NewlineDelimited), hang);
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().to_string();

        let client = Node::new(NodeConfig::default(), Value::Undefined);
        let (accepted, connection) = tokio::join!(listener.accept(), client.connect(&addr));
        let _accepted = accepted.unwrap();
        let connection = connection.unwrap();

        let pending = connection.root().invoke("hang", vec![]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.shutdown(Some(RpcError::canceled("maintenance")));

        let err = with_timeout(pending).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ConnectionClosed);
        assert!(server.registry().is_empty());
        with_timeout(async {
            while !client.registry().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
    }

    #[tokio::test]
    async fn test_connect_failure_is_an_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = Node::new(NodeConfig::default(), Value::Undefined);
        assert!(client.connect(&addr).await.is_err());
        assert!(client.registry().is_empty());
    }
}
