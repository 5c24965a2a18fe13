use serde::{Deserialize, Serialize};

/// Top-level configuration for the LipCall signaling server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LipCallConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub jwt: JwtConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub media: MediaConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Path to TLS certificate (auto-generated self-signed cert if absent).
    pub tls_cert: Option<String>,
    /// Path to TLS key (auto-generated self-signed cert if absent).
    pub tls_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtConfig {
    /// PEM-encoded RSA private key, or a filesystem path to one.
    pub private_key: Option<String>,
    /// PEM-encoded RSA public key, or a filesystem path to one.
    pub public_key: Option<String>,
    #[serde(default = "default_access_token_ttl")]
    pub access_token_ttl_secs: u64,
    #[serde(default = "default_refresh_token_ttl")]
    pub refresh_token_ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_max_msgs_per_window")]
    pub max_messages_per_window: u32,
    #[serde(default = "default_ban_secs")]
    pub ban_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// STUN server URLs handed to clients for ICE gathering.
    #[serde(default = "default_stun_urls")]
    pub stun_urls: Vec<String>,
    #[serde(default)]
    pub turn_urls: Vec<String>,
    pub turn_username: Option<String>,
    pub turn_credential: Option<String>,
    /// Number of video frames buffered before a lip-reading prediction is run.
    #[serde(default = "default_sequence_len")]
    pub sequence_len: u32,
    /// Size in milliseconds of audio chunks handed to the speech recognizer.
    #[serde(default = "default_audio_chunk_ms")]
    pub audio_chunk_ms: u32,
    /// Worker count for the audio inference pool. 0 means min(4, cpus - 1).
    #[serde(default)]
    pub audio_workers: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Connection string for a persistent repository backend. Absent means
    /// the in-memory repositories are used.
    pub url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: default_bind(), port: default_port(), tls_cert: None, tls_key: None }
    }
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            private_key: None,
            public_key: None,
            access_token_ttl_secs: default_access_token_ttl(),
            refresh_token_ttl_secs: default_refresh_token_ttl(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_messages_per_window: default_max_msgs_per_window(),
            ban_secs: default_ban_secs(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval_secs: default_heartbeat_interval(), timeout_secs: default_heartbeat_timeout() }
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            stun_urls: default_stun_urls(),
            turn_urls: Vec::new(),
            turn_username: None,
            turn_credential: None,
            sequence_len: default_sequence_len(),
            audio_chunk_ms: default_audio_chunk_ms(),
            audio_workers: 0,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { url: None }
    }
}

impl Default for LipCallConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            jwt: JwtConfig::default(),
            rate_limit: RateLimitConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            media: MediaConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8765
}
fn default_access_token_ttl() -> u64 {
    15 * 60
}
fn default_refresh_token_ttl() -> u64 {
    30 * 24 * 60 * 60
}
fn default_window_secs() -> u64 {
    5
}
fn default_max_msgs_per_window() -> u32 {
    5
}
fn default_ban_secs() -> u64 {
    30
}
fn default_heartbeat_interval() -> u64 {
    10
}
fn default_heartbeat_timeout() -> u64 {
    15
}
fn default_sequence_len() -> u32 {
    75
}
fn default_audio_chunk_ms() -> u32 {
    500
}
fn default_stun_urls() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string(), "stun:stun1.l.google.com:19302".to_string()]
}

impl LipCallConfig {
    /// Validates cross-field and range constraints. Returns a list of
    /// messages, each prefixed `ERROR:` (fatal, startup must abort) or
    /// `WARNING:` (advisory, startup continues).
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut issues = Vec::new();

        match (&self.server.tls_cert, &self.server.tls_key) {
            (Some(_), None) | (None, Some(_)) => {
                issues.push("ERROR: server.tls_cert and server.tls_key must both be set or both absent".to_string());
            }
            _ => {}
        }
        if self.server.port == 0 {
            issues.push("ERROR: server.port must not be 0".to_string());
        }

        match (&self.jwt.private_key, &self.jwt.public_key) {
            (None, None) => {
                issues.push("WARNING: jwt.private_key/public_key not set, an ephemeral RSA keypair will be generated at startup".to_string());
            }
            (Some(_), None) | (None, Some(_)) => {
                issues.push("ERROR: jwt.private_key and jwt.public_key must both be set or both absent".to_string());
            }
            _ => {}
        }
        if self.jwt.access_token_ttl_secs == 0 {
            issues.push("ERROR: jwt.access_token_ttl_secs must be greater than 0".to_string());
        }
        if self.jwt.refresh_token_ttl_secs <= self.jwt.access_token_ttl_secs {
            issues.push("WARNING: jwt.refresh_token_ttl_secs should be larger than jwt.access_token_ttl_secs".to_string());
        }

        if self.rate_limit.window_secs == 0 {
            issues.push("ERROR: rate_limit.window_secs must be greater than 0".to_string());
        }
        if self.rate_limit.max_messages_per_window == 0 {
            issues.push("ERROR: rate_limit.max_messages_per_window must be greater than 0".to_string());
        }

        if self.heartbeat.timeout_secs <= self.heartbeat.interval_secs {
            issues.push("ERROR: heartbeat.timeout_secs must be greater than heartbeat.interval_secs".to_string());
        }

        if self.media.sequence_len == 0 {
            issues.push("ERROR: media.sequence_len must be greater than 0".to_string());
        }
        if self.media.audio_chunk_ms == 0 {
            issues.push("ERROR: media.audio_chunk_ms must be greater than 0".to_string());
        }
        for url in &self.media.stun_urls {
            if !url.starts_with("stun:") && !url.starts_with("stuns:") {
                issues.push(format!("ERROR: media.stun_urls entry '{url}' must start with stun: or stuns:"));
            }
        }
        for url in &self.media.turn_urls {
            if !url.starts_with("turn:") && !url.starts_with("turns:") {
                issues.push(format!("ERROR: media.turn_urls entry '{url}' must start with turn: or turns:"));
            }
        }
        if !self.media.turn_urls.is_empty() && self.media.turn_username.is_none() {
            issues.push("WARNING: media.turn_urls configured without turn_username".to_string());
        }

        if issues.iter().any(|i| i.starts_with("ERROR")) {
            Err(issues)
        } else {
            if !issues.is_empty() {
                return Err(issues);
            }
            Ok(())
        }
    }

    /// True if `validate` would report only warnings (no errors).
    pub fn has_only_warnings(issues: &[String]) -> bool {
        issues.iter().all(|i| i.starts_with("WARNING"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_from_empty_string() {
        let config: LipCallConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8765);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.rate_limit.window_secs, 5);
        assert_eq!(config.rate_limit.max_messages_per_window, 5);
        assert_eq!(config.rate_limit.ban_secs, 30);
        assert_eq!(config.heartbeat.interval_secs, 10);
        assert_eq!(config.heartbeat.timeout_secs, 15);
        assert_eq!(config.media.sequence_len, 75);
        assert_eq!(config.media.stun_urls.len(), 2);
        assert!(config.media.turn_urls.is_empty());
        assert!(config.database.url.is_none());
    }

    #[test]
    fn default_trait_produces_valid_config_modulo_ephemeral_jwt_warning() {
        let config = LipCallConfig::default();
        let from_empty: LipCallConfig = toml::from_str("").unwrap();
        assert_eq!(config.server.port, from_empty.server.port);
        assert_eq!(config.rate_limit.max_messages_per_window, from_empty.rate_limit.max_messages_per_window);
    }

    #[test]
    fn partial_config_only_jwt_section() {
        let toml_str = r#"
            [jwt]
            access_token_ttl_secs = 60
        "#;
        let config: LipCallConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.jwt.access_token_ttl_secs, 60);
        assert_eq!(config.server.port, 8765);
    }

    #[test]
    fn custom_values_override_defaults() {
        let toml_str = r#"
            [server]
            bind = "127.0.0.1"
            port = 9000

            [rate_limit]
            window_secs = 10
            max_messages_per_window = 20
            ban_secs = 60
        "#;
        let config: LipCallConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.rate_limit.window_secs, 10);
        assert_eq!(config.rate_limit.ban_secs, 60);
    }

    #[test]
    fn validate_accepts_defaults_with_ephemeral_jwt_warning() {
        let config = LipCallConfig::default();
        let result = config.validate();
        let issues = result.unwrap_err();
        assert_eq!(issues.len(), 1);
        assert!(issues[0].starts_with("WARNING"));
    }

    #[test]
    fn validate_rejects_port_zero() {
        let mut config = LipCallConfig::default();
        config.server.port = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("server.port")));
    }

    #[test]
    fn validate_rejects_mismatched_tls_pair() {
        let mut config = LipCallConfig::default();
        config.server.tls_cert = Some("cert.pem".to_string());
        config.server.tls_key = None;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("tls_cert")));
    }

    #[test]
    fn validate_rejects_zero_rate_limit_window() {
        let mut config = LipCallConfig::default();
        config.rate_limit.window_secs = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("rate_limit.window_secs")));
    }

    #[test]
    fn validate_rejects_heartbeat_timeout_not_greater_than_interval() {
        let mut config = LipCallConfig::default();
        config.heartbeat.interval_secs = 10;
        config.heartbeat.timeout_secs = 10;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("heartbeat.timeout_secs")));
    }

    #[test]
    fn validate_rejects_zero_sequence_len() {
        let mut config = LipCallConfig::default();
        config.media.sequence_len = 0;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("sequence_len")));
    }

    #[test]
    fn validate_rejects_bad_stun_url_prefix() {
        let mut config = LipCallConfig::default();
        config.media.stun_urls = vec!["http://example.com".to_string()];
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("stun_urls")));
    }

    #[test]
    fn validate_rejects_bad_turn_url_prefix() {
        let mut config = LipCallConfig::default();
        config.media.turn_urls = vec!["http://example.com".to_string()];
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("turn_urls")));
    }

    #[test]
    fn validate_warns_on_turn_without_username() {
        let mut config = LipCallConfig::default();
        config.media.turn_urls = vec!["turn:turn.example.com:3478".to_string()];
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.starts_with("WARNING") && i.contains("turn_username")));
    }

    #[test]
    fn validate_rejects_refresh_ttl_shorter_than_access_ttl() {
        let mut config = LipCallConfig::default();
        config.jwt.private_key = Some("key".to_string());
        config.jwt.public_key = Some("key".to_string());
        config.jwt.access_token_ttl_secs = 1000;
        config.jwt.refresh_token_ttl_secs = 10;
        let issues = config.validate().unwrap_err();
        assert!(issues.iter().any(|i| i.contains("refresh_token_ttl_secs")));
    }
}
