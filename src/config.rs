//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `AUTH_API_KEY`, `TUNNEL_AUTH_TOKEN`,
//!    `RELAY_LISTEN`
//! 2. **Config file** — path via `--config <path>`, or `relay.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:5345"
//!
//! [proxy]
//! upstream_base = "https://generativelanguage.googleapis.com"
//! request_timeout_secs = 600
//! max_body_bytes = 10485760  # 10 MB
//!
//! [tunnel]
//! read_timeout_secs = 60
//!
//! [auth]
//! api_key = "your-ingress-key"       # or set AUTH_API_KEY
//! proxy_user_id = "user-1"
//! [auth.tunnel_tokens]               # token -> user id
//! "some-long-token" = "user-1"
//!
//! [logging]
//! level = "info"
//! buffer_entries = 1000
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:5345`). Override with `RELAY_LISTEN`.
    #[serde(default = "default_listen")]
    pub listen: String,
}

/// Request forwarding settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Base URL prepended to the inbound path+query in emitted request frames.
    #[serde(default = "default_upstream_base")]
    pub upstream_base: String,
    /// Wall-clock bound on assembling one response, in seconds (default 600).
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Maximum inbound request body size in bytes (default 10 MB).
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Tunnel WebSocket settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelConfig {
    /// Read deadline for tunnel sockets in seconds (default 60). A socket that
    /// sends nothing — not even a ping — for this long is closed.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Expected ingress API key, matched against the `x-goog-api-key` header
    /// or `key` query parameter. Override with `AUTH_API_KEY`. When unset,
    /// every proxy request fails with a server configuration error.
    pub api_key: Option<String>,
    /// The user id all authorized ingress callers are attributed to.
    #[serde(default = "default_proxy_user_id")]
    pub proxy_user_id: String,
    /// Tunnel auth tokens: token -> user id. `TUNNEL_AUTH_TOKEN` adds one
    /// mapped to `proxy_user_id`.
    #[serde(default)]
    pub tunnel_tokens: HashMap<String, String>,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Entries retained in the in-memory log buffer (default 1000).
    #[serde(default = "default_buffer_entries")]
    pub buffer_entries: usize,
}

fn default_listen() -> String {
    "0.0.0.0:5345".to_string()
}
fn default_upstream_base() -> String {
    "https://generativelanguage.googleapis.com".to_string()
}
fn default_request_timeout_secs() -> u64 {
    600
}
fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024 // 10 MB
}
fn default_read_timeout_secs() -> u64 {
    60
}
fn default_proxy_user_id() -> String {
    "user-1".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_buffer_entries() -> usize {
    1000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream_base: default_upstream_base(),
            request_timeout_secs: default_request_timeout_secs(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            proxy_user_id: default_proxy_user_id(),
            tunnel_tokens: HashMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            buffer_entries: default_buffer_entries(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise looks
    /// for `relay.toml` in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("relay.toml").exists() {
            let content =
                std::fs::read_to_string("relay.toml").expect("Failed to read relay.toml");
            toml::from_str(&content).expect("Failed to parse relay.toml")
        } else {
            Config {
                server: ServerConfig::default(),
                proxy: ProxyConfig::default(),
                tunnel: TunnelConfig::default(),
                auth: AuthConfig::default(),
                logging: LoggingConfig::default(),
            }
        };

        // Env var overrides
        if let Ok(key) = std::env::var("AUTH_API_KEY") {
            if !key.is_empty() {
                config.auth.api_key = Some(key);
            }
        }
        if let Ok(token) = std::env::var("TUNNEL_AUTH_TOKEN") {
            if !token.is_empty() {
                config
                    .auth
                    .tunnel_tokens
                    .insert(token, config.auth.proxy_user_id.clone());
            }
        }
        if let Ok(listen) = std::env::var("RELAY_LISTEN") {
            config.server.listen = listen;
        }

        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:5345");
        assert_eq!(
            config.proxy.upstream_base,
            "https://generativelanguage.googleapis.com"
        );
        assert_eq!(config.proxy.request_timeout_secs, 600);
        assert_eq!(config.tunnel.read_timeout_secs, 60);
        assert_eq!(config.auth.proxy_user_id, "user-1");
        assert!(config.auth.api_key.is_none());
        assert_eq!(config.logging.buffer_entries, 1000);
    }

    #[test]
    fn test_partial_file_overrides() {
        let config: Config = toml::from_str(
            r#"
            [proxy]
            request_timeout_secs = 30

            [auth]
            api_key = "k"
            [auth.tunnel_tokens]
            "tok-1" = "user-2"
            "#,
        )
        .unwrap();
        assert_eq!(config.proxy.request_timeout_secs, 30);
        assert_eq!(config.auth.api_key.as_deref(), Some("k"));
        assert_eq!(
            config.auth.tunnel_tokens.get("tok-1").map(String::as_str),
            Some("user-2")
        );
        // Untouched sections keep defaults
        assert_eq!(config.server.listen, "0.0.0.0:5345");
    }
}
