use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use url::Url;

use crate::error::{Result, StitchError};

/// Main configuration structure for Stitch
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Client-facing HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Upstream conversation backend configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Continuation engine configuration
    #[serde(default)]
    pub relay: RelayConfig,
    /// Challenge token configuration
    #[serde(default)]
    pub challenge: ChallengeConfig,
}

/// Environment variable overriding the listen port
pub const PORT_ENV: &str = "STITCH_PORT";

/// Environment variable overriding the outbound proxy
pub const PROXY_ENV: &str = "STITCH_PROXY";

impl Config {
    /// Load configuration from an explicit path, or from the first default
    /// location that exists, falling back to built-in defaults. Environment
    /// overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::load_file(path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply `STITCH_PORT` and `STITCH_PROXY` style overrides read through `lookup`.
    ///
    /// Blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let value = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(port) = value(PORT_ENV) {
            let port: u16 = port
                .parse()
                .map_err(|e| StitchError::Config(format!("Invalid {PORT_ENV} '{port}': {e}")))?;
            let mut addr = self.server.socket_addr()?;
            addr.set_port(port);
            self.server.listen_addr = addr.to_string();
            tracing::debug!("Listen port overridden from {PORT_ENV}");
        }

        if let Some(proxy) = value(PROXY_ENV) {
            self.upstream.proxy_url = Some(proxy);
            tracing::debug!("Outbound proxy overridden from {PROXY_ENV}");
        }

        self.validate()
    }

    fn load_file(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            tracing::info!("Loading config from: {}", path.display());
            return Self::from_file(path);
        }

        let default_paths = [
            dirs::home_dir().map(|h| h.join(".stitch").join("config.toml")),
            dirs::config_dir().map(|c| c.join("stitch").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(path);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Config::default())
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StitchError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| StitchError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot check on its own
    pub fn validate(&self) -> Result<()> {
        self.server.socket_addr()?;
        self.upstream.conversation_url()?;

        if let Some(ref proxy) = self.upstream.proxy_url {
            Url::parse(proxy)
                .map_err(|e| StitchError::Config(format!("Invalid proxy URL '{proxy}': {e}")))?;
        }

        if self.challenge.enabled {
            Url::parse(&self.challenge.url).map_err(|e| {
                StitchError::Config(format!(
                    "Invalid challenge URL '{}': {e}",
                    self.challenge.url
                ))
            })?;
        }

        if self.relay.channel_capacity == 0 {
            return Err(StitchError::Config(
                "relay.channel_capacity must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Client-facing HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:4141")
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Answer CORS preflights and allow any origin
    #[serde(default = "default_cors_enabled")]
    pub cors_enabled: bool,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen_addr
            .parse()
            .map_err(|e| StitchError::Config(format!("Invalid listen address: {e}")))
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            cors_enabled: default_cors_enabled(),
        }
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1:4141".to_string()
}

fn default_cors_enabled() -> bool {
    true
}

/// Upstream conversation backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// Scheme and host of the upstream backend
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Path of the streaming conversation endpoint
    #[serde(default = "default_conversation_path")]
    pub conversation_path: String,
    /// User-Agent sent on every upstream request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Overall request timeout in seconds, covering the whole stream
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Optional outbound proxy for all upstream traffic
    #[serde(default)]
    pub proxy_url: Option<String>,
}

impl UpstreamConfig {
    /// Full URL of the conversation endpoint
    pub fn conversation_url(&self) -> Result<Url> {
        let base = Url::parse(&self.base_url).map_err(|e| {
            StitchError::Config(format!("Invalid upstream URL '{}': {e}", self.base_url))
        })?;
        base.join(&self.conversation_path).map_err(|e| {
            StitchError::Config(format!(
                "Invalid conversation path '{}': {e}",
                self.conversation_path
            ))
        })
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            conversation_path: default_conversation_path(),
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
            proxy_url: None,
        }
    }
}

fn default_base_url() -> String {
    "https://chat.openai.com".to_string()
}

fn default_conversation_path() -> String {
    "/backend-api/conversation".to_string()
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36".to_string()
}

fn default_timeout_secs() -> u64 {
    300
}

/// Continuation engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    /// Maximum CONTINUE requests chained onto one client stream
    #[serde(default = "default_max_continuations")]
    pub max_continuations: usize,
    /// Frames buffered between the relay task and the client body
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_continuations: default_max_continuations(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_max_continuations() -> usize {
    16
}

fn default_channel_capacity() -> usize {
    32
}

/// Anti-automation challenge token configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ChallengeConfig {
    /// Fetch tokens for models that require one
    #[serde(default = "default_challenge_enabled")]
    pub enabled: bool,
    /// Token endpoint
    #[serde(default = "default_challenge_url")]
    pub url: String,
    /// Public key identifying the challenge
    #[serde(default = "default_challenge_public_key")]
    pub public_key: String,
    /// Site the token is issued for
    #[serde(default = "default_challenge_site")]
    pub site: String,
    /// Models whose first request must carry a token
    #[serde(default = "default_challenge_models")]
    pub models: Vec<String>,
}

impl ChallengeConfig {
    pub fn requires_token(&self, model: &str) -> bool {
        self.enabled && self.models.iter().any(|m| m == model)
    }
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            enabled: default_challenge_enabled(),
            url: default_challenge_url(),
            public_key: default_challenge_public_key(),
            site: default_challenge_site(),
            models: default_challenge_models(),
        }
    }
}

fn default_challenge_enabled() -> bool {
    true
}

fn default_challenge_url() -> String {
    "https://tcr9i.chat.openai.com/fc/gt2/public_key/35536E1E-65B4-4D96-9D97-6ADB7EFF8147"
        .to_string()
}

fn default_challenge_public_key() -> String {
    "35536E1E-65B4-4D96-9D97-6ADB7EFF8147".to_string()
}

fn default_challenge_site() -> String {
    "https://chat.openai.com".to_string()
}

fn default_challenge_models() -> Vec<String> {
    vec![
        "gpt-4".to_string(),
        "gpt-4-browsing".to_string(),
        "gpt-4-plugins".to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr, "127.0.0.1:4141");
        assert_eq!(config.upstream.timeout_secs, 300);
        assert_eq!(config.relay.max_continuations, 16);
        assert!(config.server.cors_enabled);
        assert!(config.challenge.requires_token("gpt-4"));
        assert!(!config.challenge.requires_token("text-davinci-002-render-sha"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_conversation_url_joins_path() {
        let upstream = UpstreamConfig::default();
        assert_eq!(
            upstream.conversation_url().unwrap().as_str(),
            "https://chat.openai.com/backend-api/conversation"
        );
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [upstream]
            base_url = "http://127.0.0.1:8080"

            [relay]
            max_continuations = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.upstream.base_url, "http://127.0.0.1:8080");
        assert_eq!(config.upstream.conversation_path, "/backend-api/conversation");
        assert_eq!(config.relay.max_continuations, 3);
        assert_eq!(config.relay.channel_capacity, 32);
    }

    #[test]
    fn test_disabled_challenge_requires_nothing() {
        let config: Config = toml::from_str(
            r#"
            [challenge]
            enabled = false
            "#,
        )
        .unwrap();
        assert!(!config.challenge.requires_token("gpt-4"));
    }

    #[test]
    fn test_validate_rejects_bad_listen_addr() {
        let mut config = Config::default();
        config.server.listen_addr = "not-an-address".to_string();
        assert!(matches!(config.validate(), Err(StitchError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = Config::default();
        config.relay.channel_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nlisten_addr = \"0.0.0.0:9000\"\n").unwrap();

        let config = Config::load(Some(path.as_path())).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:9000");
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_port_override_keeps_host() {
        let mut config = Config::default();
        config.apply_overrides(env(&[(PORT_ENV, "8080")])).unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:8080");
    }

    #[test]
    fn test_proxy_override_sets_upstream_proxy() {
        let mut config = Config::default();
        config
            .apply_overrides(env(&[(PROXY_ENV, "socks5://127.0.0.1:1080")]))
            .unwrap();
        assert_eq!(
            config.upstream.proxy_url.as_deref(),
            Some("socks5://127.0.0.1:1080")
        );
    }

    #[test]
    fn test_blank_overrides_are_ignored() {
        let mut config = Config::default();
        config
            .apply_overrides(env(&[(PORT_ENV, " "), (PROXY_ENV, "")]))
            .unwrap();
        assert_eq!(config.server.listen_addr, "127.0.0.1:4141");
        assert!(config.upstream.proxy_url.is_none());
    }

    #[test]
    fn test_invalid_port_override_is_config_error() {
        let mut config = Config::default();
        let result = config.apply_overrides(env(&[(PORT_ENV, "http")]));
        assert!(matches!(result, Err(StitchError::Config(_))));
    }

    #[test]
    fn test_override_applies_over_file_values() {
        let mut config: Config = toml::from_str(
            r#"
            [server]
            listen_addr = "0.0.0.0:9000"
            cors_enabled = false
            "#,
        )
        .unwrap();
        assert!(!config.server.cors_enabled);

        config.apply_overrides(env(&[(PORT_ENV, "4242")])).unwrap();
        assert_eq!(config.server.listen_addr, "0.0.0.0:4242");
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(Some(dir.path().join("absent.toml").as_path()));
        assert!(matches!(result, Err(StitchError::Config(_))));
    }
}
