use qconn_core::ConnectionConfig;
use qconn_transport::{FrameCodec, Framing, DEFAULT_MAX_FRAME_SIZE};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which channel a node speaks on its sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Framed JSON directly on the TCP stream.
    #[default]
    Tcp,
    /// JSON text frames over a WebSocket.
    WebSocket,
}

/// Where and how a node writes its logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Directory for daily log files. `None` logs to stderr only.
    pub dir: Option<PathBuf>,
    pub file_prefix: String,
    /// Level for the qconn crates when `QCONN_LOG` is unset.
    pub level: String,
    /// Write the log files as JSON lines.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: Some(PathBuf::from("logs")),
            file_prefix: "qconn-node".to_string(),
            level: "debug".to_string(),
            json: false,
        }
    }
}

/// Node configuration. Every field has a default, so a partial JSON
/// document is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    pub framing: Framing,
    pub max_frame_size: usize,
    /// Per-connection question/answer table capacity. `None` is unbounded.
    pub max_remotes: Option<usize>,
    /// Per-connection object table capacity. `None` is unbounded.
    pub max_objects: Option<usize>,
    pub log: LogConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7070,
            transport: TransportKind::default(),
            framing: Framing::default(),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_remotes: None,
            max_objects: None,
            log: LogConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Reads a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {}", path.display(), e))?;
        let config = serde_json::from_str(&text)
            .map_err(|e| anyhow::anyhow!("invalid config {}: {}", path.display(), e))?;
        Ok(config)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.framing, self.max_frame_size)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        let mut config = ConnectionConfig::default();
        if let Some(max_remotes) = self.max_remotes {
            config = config.with_max_remotes(max_remotes);
        }
        if let Some(max_objects) = self.max_objects {
            config = config.with_max_objects(max_objects);
        }
        config
    }
}

impl From<&NodeConfig> for ConnectionConfig {
    fn from(config: &NodeConfig) -> Self {
        config.connection_config()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_partial_document_uses_defaults() {
        let config: NodeConfig =
            serde_json::from_value(json!({"port": 9000, "framing": "length_prefixed"})).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.framing, Framing::LengthPrefixed);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.transport, TransportKind::Tcp);
        assert_eq!(config.address(), "127.0.0.1:9000");
    }

    #[test]
    fn test_limits_reach_connection_config() {
        let config = NodeConfig {
            max_remotes: Some(64),
            ..NodeConfig::default()
        };
        let connection = ConnectionConfig::from(&config);
        assert_eq!(connection.max_remotes, 64);
        assert_eq!(connection.max_objects, usize::MAX);
    }

    #[test]
    fn test_websocket_transport_name() {
        let config: NodeConfig = serde_json::from_value(json!({"transport": "web_socket"})).unwrap();
        assert_eq!(config.transport, TransportKind::WebSocket);
    }

    #[test]
    fn test_log_section() {
        let config: NodeConfig =
            serde_json::from_value(json!({"log": {"dir": null, "json": true}})).unwrap();
        assert_eq!(config.log.dir, None);
        assert!(config.log.json);
        assert_eq!(config.log.level, "debug");
        assert_eq!(NodeConfig::default().log.dir, Some(PathBuf::from("logs")));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        assert!(NodeConfig::from_file("/nonexistent/qconn.json").is_err());
    }
}
