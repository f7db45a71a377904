//! Configuration types for the peer connection mesh

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Public STUN servers used when no other reflection servers are configured
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
    "stun:stun2.l.google.com:19302",
    "stun:stun3.l.google.com:19302",
    "stun:stun4.l.google.com:19302",
];

/// Main configuration for the mesh
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN relay configurations (credentials supplied out of band)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Number of ICE candidates gathered before an offer is created (default: 10)
    pub ice_candidate_pool_size: u8,

    /// Whether this device can encode/decode VP9 efficiently (default: false)
    ///
    /// When set, video codecs are ordered VP9, H.264, VP8; otherwise H.264, VP8.
    pub prefer_vp9: bool,

    /// Timing constants and repair policy
    pub health: HealthOptions,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Timing constants and repair policy for connection health
///
/// Every duration is expressed in milliseconds so the block can be written
/// by hand in a TOML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthOptions {
    /// How long a connection may stay `disconnected` before the initiator
    /// renegotiates (default: 3000)
    pub disconnect_debounce_ms: u64,

    /// ICE restart backoff unit; attempt `n` waits `n * unit` (default: 1000)
    pub restart_backoff_unit_ms: u64,

    /// Maximum reconnect attempts before the connection is removed (default: 3)
    pub max_reconnect_attempts: u32,

    /// Delay before a full recreation after repair is exhausted (default: 2000)
    pub recreate_delay_ms: u64,

    /// Cooldown before recreating a connection whose transport closed (default: 5000)
    pub closed_recreate_cooldown_ms: u64,

    /// Interval of the periodic health sweep (default: 15000)
    pub sweep_interval_ms: u64,

    /// Minimum connection age before the sweep may recreate it (default: 30000)
    pub sweep_min_age_ms: u64,

    /// Time after ICE gathering completes before a slow-connection notice (default: 8000)
    pub slow_connection_watchdog_ms: u64,

    /// Delay before a relay candidate is sent again while ICE is checking (default: 2000)
    pub relay_retransmit_ms: u64,

    /// Delay before recovering from an answer rejected by signaling state (default: 1500)
    pub answer_recovery_ms: u64,

    /// Gap between connections opened to existing call participants (default: 1000)
    pub participant_stagger_ms: u64,

    /// Window in which a caller can produce at most one invitation (default: 5000)
    pub invite_window_ms: u64,

    /// Recreate a connection after its transport closes, if this side initiated it
    /// and the peer is still present (default: true)
    pub recreate_on_close: bool,

    /// Stop local camera/microphone when the last connection goes away (default: false)
    pub auto_stop_local_media: bool,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            turn_servers: Vec::new(),
            ice_candidate_pool_size: 10,
            prefer_vp9: false,
            health: HealthOptions::default(),
        }
    }
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            disconnect_debounce_ms: 3000,
            restart_backoff_unit_ms: 1000,
            max_reconnect_attempts: 3,
            recreate_delay_ms: 2000,
            closed_recreate_cooldown_ms: 5000,
            sweep_interval_ms: 15000,
            sweep_min_age_ms: 30000,
            slow_connection_watchdog_ms: 8000,
            relay_retransmit_ms: 2000,
            answer_recovery_ms: 1500,
            participant_stagger_ms: 1000,
            invite_window_ms: 5000,
            recreate_on_close: true,
            auto_stop_local_media: false,
        }
    }
}

impl HealthOptions {
    pub fn disconnect_debounce(&self) -> Duration {
        Duration::from_millis(self.disconnect_debounce_ms)
    }

    pub fn recreate_delay(&self) -> Duration {
        Duration::from_millis(self.recreate_delay_ms)
    }

    pub fn closed_recreate_cooldown(&self) -> Duration {
        Duration::from_millis(self.closed_recreate_cooldown_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn sweep_min_age(&self) -> Duration {
        Duration::from_millis(self.sweep_min_age_ms)
    }

    pub fn slow_connection_watchdog(&self) -> Duration {
        Duration::from_millis(self.slow_connection_watchdog_ms)
    }

    pub fn relay_retransmit(&self) -> Duration {
        Duration::from_millis(self.relay_retransmit_ms)
    }

    pub fn answer_recovery(&self) -> Duration {
        Duration::from_millis(self.answer_recovery_ms)
    }

    pub fn participant_stagger(&self) -> Duration {
        Duration::from_millis(self.participant_stagger_ms)
    }

    pub fn invite_window(&self) -> Duration {
        Duration::from_millis(self.invite_window_ms)
    }
}

impl MeshConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `stun_servers` is empty or an entry is not a `stun:`/`stuns:` URL
    /// - a TURN entry is not a `turn:`/`turns:` URL or lacks credentials
    /// - `max_reconnect_attempts` is not in range 1-10
    /// - any interval is zero
    /// - `sweep_min_age_ms` is shorter than `disconnect_debounce_ms`
    pub fn validate(&self) -> crate::Result<()> {
        use crate::Error;

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        for url in &self.stun_servers {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN server must start with stun: or stuns:, got {}",
                    url
                )));
            }
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN server must start with turn: or turns:, got {}",
                    turn.url
                )));
            }
            if turn.username.is_empty() || turn.credential.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "TURN server {} requires a username and credential",
                    turn.url
                )));
            }
        }

        let health = &self.health;
        if health.max_reconnect_attempts == 0 || health.max_reconnect_attempts > 10 {
            return Err(Error::InvalidConfig(format!(
                "max_reconnect_attempts must be in range 1-10, got {}",
                health.max_reconnect_attempts
            )));
        }

        let intervals = [
            ("disconnect_debounce_ms", health.disconnect_debounce_ms),
            ("restart_backoff_unit_ms", health.restart_backoff_unit_ms),
            ("sweep_interval_ms", health.sweep_interval_ms),
            ("slow_connection_watchdog_ms", health.slow_connection_watchdog_ms),
            ("relay_retransmit_ms", health.relay_retransmit_ms),
            ("answer_recovery_ms", health.answer_recovery_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(Error::InvalidConfig(format!("{} must be non-zero", name)));
            }
        }

        if health.sweep_min_age_ms < health.disconnect_debounce_ms {
            return Err(Error::InvalidConfig(format!(
                "sweep_min_age_ms ({}) must not be shorter than disconnect_debounce_ms ({})",
                health.sweep_min_age_ms, health.disconnect_debounce_ms
            )));
        }

        Ok(())
    }

    /// Parse a configuration from TOML text and validate it
    ///
    /// Missing keys fall back to their defaults.
    pub fn from_toml_str(text: &str) -> crate::Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| crate::Error::InvalidConfig(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Replace the STUN server list
    pub fn with_stun_servers(mut self, servers: Vec<String>) -> Self {
        self.stun_servers = servers;
        self
    }

    /// Add TURN servers to this configuration
    ///
    /// # Example
    ///
    /// ```
    /// use coderoom_mesh::config::{MeshConfig, TurnServerConfig};
    ///
    /// let config = MeshConfig::default().with_turn_servers(vec![TurnServerConfig {
    ///     url: "turn:turn.example.com:3478".to_string(),
    ///     username: "user".to_string(),
    ///     credential: "pass".to_string(),
    /// }]);
    /// assert_eq!(config.turn_servers.len(), 1);
    /// ```
    pub fn with_turn_servers(mut self, servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers.extend(servers);
        self
    }

    /// Declare whether this device prefers VP9
    pub fn with_prefer_vp9(mut self, prefer_vp9: bool) -> Self {
        self.prefer_vp9 = prefer_vp9;
        self
    }

    /// Replace the health options
    pub fn with_health(mut self, health: HealthOptions) -> Self {
        self.health = health;
        self
    }
}
