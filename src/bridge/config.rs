use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Connection settings for a STOMP broker, over raw TCP or WebSocket.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BrokerConnectorConfig {
    pub username: String,
    pub password: String,
    /// `host:port` of the broker.
    pub server_addr: String,
    /// Carry STOMP frames inside binary WebSocket messages instead of raw
    /// TCP.
    #[serde(default)]
    pub use_ws: bool,
    /// HTTP path of the WebSocket endpoint (e.g. `/fabric`).
    #[serde(default)]
    pub ws_path: String,
    /// Value for the STOMP `host` header; defaults to `/`.
    #[serde(default)]
    pub host_header: Option<String>,
    /// Heart-beat offer in milliseconds; 0 disables heart-beating.
    #[serde(default)]
    pub heartbeat_ms: u64,
}

impl BrokerConnectorConfig {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        server_addr: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            server_addr: server_addr.into(),
            use_ws: false,
            ws_path: String::new(),
            host_header: None,
            heartbeat_ms: 0,
        }
    }

    pub fn websocket(mut self, ws_path: impl Into<String>) -> Self {
        self.use_ws = true;
        self.ws_path = ws_path.into();
        self
    }

    pub fn heartbeat_ms(mut self, ms: u64) -> Self {
        self.heartbeat_ms = ms;
        self
    }

    /// Check required fields before dialling; names the first missing one.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.server_addr.is_empty() {
            return Err(BridgeError::ConfigInvalid("server address"));
        }
        if self.username.is_empty() {
            return Err(BridgeError::ConfigInvalid("username"));
        }
        if self.password.is_empty() {
            return Err(BridgeError::ConfigInvalid("password"));
        }
        Ok(())
    }

    pub(crate) fn host(&self) -> &str {
        self.host_header.as_deref().unwrap_or("/")
    }

    pub(crate) fn ws_url(&self) -> String {
        let path = if self.ws_path.starts_with('/') || self.ws_path.is_empty() {
            self.ws_path.clone()
        } else {
            format!("/{}", self.ws_path)
        };
        format!("ws://{}{}", self.server_addr, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_names_the_missing_field() {
        let cases = [
            (
                BrokerConnectorConfig::new("guest", "guest", ""),
                "config invalid, config missing server address",
            ),
            (
                BrokerConnectorConfig::new("", "guest", "somewhere:000"),
                "config invalid, config missing username",
            ),
            (
                BrokerConnectorConfig::new("hi", "", "somewhere:000"),
                "config invalid, config missing password",
            ),
        ];
        for (config, expected) in cases {
            let err = config.validate().unwrap_err();
            assert_eq!(err.to_string(), expected);
        }

        assert!(
            BrokerConnectorConfig::new("guest", "guest", "localhost:61613")
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn ws_url_normalises_the_path() {
        let config = BrokerConnectorConfig::new("u", "p", "localhost:8090").websocket("fabric");
        assert_eq!(config.ws_url(), "ws://localhost:8090/fabric");

        let config = BrokerConnectorConfig::new("u", "p", "localhost:8090").websocket("/fabric");
        assert_eq!(config.ws_url(), "ws://localhost:8090/fabric");
    }

    #[test]
    fn config_deserialises_with_defaults() {
        let config: BrokerConnectorConfig = serde_json::from_str(
            r#"{"username":"guest","password":"guest","server_addr":"localhost:61613"}"#,
        )
        .unwrap();
        assert!(!config.use_ws);
        assert_eq!(config.heartbeat_ms, 0);
        assert_eq!(config.host(), "/");
    }
}
