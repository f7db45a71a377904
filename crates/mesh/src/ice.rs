//! ICE server configuration
//!
//! The mesh never talks to STUN/TURN servers itself; it hands the server list
//! to every transport it creates. [`IceConfigProvider`] is the seam through
//! which an application can rotate TURN credentials between connections.

use crate::config::MeshConfig;
use serde::{Deserialize, Serialize};

/// One reflection or relay server entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// Server without credentials (STUN)
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    /// Relay server with long-term credentials (TURN)
    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }

    pub fn is_relay(&self) -> bool {
        self.urls
            .iter()
            .any(|u| u.starts_with("turn:") || u.starts_with("turns:"))
    }
}

/// Supplies the ICE servers for each new transport
pub trait IceConfigProvider: Send + Sync {
    fn ice_servers(&self) -> Vec<IceServer>;
}

/// Fixed server list built from configuration
#[derive(Debug, Clone, Default)]
pub struct StaticIceConfig {
    servers: Vec<IceServer>,
}

impl StaticIceConfig {
    pub fn new(servers: Vec<IceServer>) -> Self {
        Self { servers }
    }

    /// All STUN servers are grouped into one entry, followed by one entry per TURN relay
    pub fn from_config(config: &MeshConfig) -> Self {
        let mut servers = Vec::with_capacity(1 + config.turn_servers.len());
        if !config.stun_servers.is_empty() {
            servers.push(IceServer {
                urls: config.stun_servers.clone(),
                username: None,
                credential: None,
            });
        }
        servers.extend(
            config
                .turn_servers
                .iter()
                .map(|t| IceServer::turn(&t.url, &t.username, &t.credential)),
        );
        Self { servers }
    }
}

impl IceConfigProvider for StaticIceConfig {
    fn ice_servers(&self) -> Vec<IceServer> {
        self.servers.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TurnServerConfig;

    #[test]
    fn test_from_default_config() {
        let ice = StaticIceConfig::from_config(&MeshConfig::default());
        let servers = ice.ice_servers();

        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].urls.len(), 5);
        assert!(!servers[0].is_relay());
    }

    #[test]
    fn test_from_config_with_turn() {
        let config = MeshConfig::default().with_turn_servers(vec![TurnServerConfig {
            url: "turn:relay.example.com:3478".to_string(),
            username: "alice".to_string(),
            credential: "secret".to_string(),
        }]);
        let servers = StaticIceConfig::from_config(&config).ice_servers();

        assert_eq!(servers.len(), 2);
        assert!(servers[1].is_relay());
        assert_eq!(servers[1].username.as_deref(), Some("alice"));
        assert_eq!(servers[1].credential.as_deref(), Some("secret"));
    }

    #[test]
    fn test_ice_server_serialization_omits_missing_credentials() {
        let json = serde_json::to_value(IceServer::stun("stun:stun.example.com")).unwrap();
        assert_eq!(json, serde_json::json!({ "urls": ["stun:stun.example.com"] }));
    }
}
