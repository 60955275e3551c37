//! qconn node binary
//!
//! `qconn-node serve [config.json]` exposes a small calculator service to
//! every peer. `qconn-node call <addr> <method> [json-arg ...]` connects to
//! a node, invokes one method on its root and prints the result.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use qconn_core::{RpcError, RpcTarget, Value};
use qconn_node::{init_logging, Node, NodeConfig};
use std::sync::Arc;
use tracing::{error, info};

/// Example calculator service
#[derive(Debug)]
struct CalculatorService;

fn numbers(args: &[Value], method: &str) -> Result<Vec<f64>, RpcError> {
    args.iter()
        .map(|arg| {
            arg.as_f64().ok_or_else(|| {
                RpcError::bad_request(format!("{} expects numbers, got {}", method, arg.type_name()))
            })
        })
        .collect()
}

#[async_trait]
impl RpcTarget for CalculatorService {
    async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value, RpcError> {
        match method {
            "add" => Ok(Value::Number(numbers(&args, method)?.into_iter().sum())),
            "multiply" => Ok(Value::Number(numbers(&args, method)?.into_iter().product())),
            "echo" => Ok(Value::from(args)),
            "now" => Ok(Value::from(chrono::Utc::now().to_rfc3339())),
            _ => Err(RpcError::not_found(format!("Unknown method: {}", method))),
        }
    }

    async fn get_property(&self, property: &str) -> Result<Value, RpcError> {
        match property {
            "name" => Ok(Value::from("calculator")),
            _ => Err(RpcError::not_found(format!("Property not found: {}", property))),
        }
    }

    async fn keys(&self) -> Result<Vec<String>, RpcError> {
        Ok(vec!["name".to_string()])
    }
}

async fn serve(config: NodeConfig) -> Result<()> {
    let _logs = init_logging(&config.log)?;
    let service: Arc<dyn RpcTarget> = Arc::new(CalculatorService);
    let node = Node::new(config, Value::Target(service));
    let listener = node.bind().await?;
    info!(address = %listener.local_addr(), "qconn node ready");

    tokio::select! {
        result = listener.serve() => result,
        _ = tokio::signal::ctrl_c() => {
            info!(connections = node.registry().len(), "shutting down");
            node.shutdown(Some(RpcError::canceled("node shutting down")));
            Ok(())
        }
    }
}

async fn call(addr: &str, method: &str, raw_args: &[String]) -> Result<()> {
    let args = raw_args
        .iter()
        .map(|raw| {
            serde_json::from_str::<serde_json::Value>(raw)
                .map(Value::from)
                .with_context(|| format!("argument is not JSON: {}", raw))
        })
        .collect::<Result<Vec<_>>>()?;

    let node = Node::new(NodeConfig::default(), Value::Undefined);
    let connection = node.connect(addr).await?;
    let result = connection.root().invoke(method, args).await;
    connection.close(None);

    match result {
        Ok(value) => {
            match value.to_plain_json() {
                Some(json) => println!("{}", json),
                None => println!("{:?}", value),
            }
            Ok(())
        }
        Err(err) => bail!("{}: {}", err.code, err.message),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let result = match args.first().map(String::as_str) {
        Some("serve") | None => {
            let config = match args.get(1) {
                Some(path) => NodeConfig::from_file(path)?,
                None => NodeConfig::default(),
            };
            serve(config).await
        }
        Some("call") if args.len() >= 3 => call(&args[1], &args[2], &args[3..]).await,
        _ => bail!("usage: qconn-node serve [config.json] | qconn-node call <addr> <method> [json-arg ...]"),
    };
    if let Err(err) = &result {
        error!(error = %err, "qconn-node failed");
    }
    result
}
