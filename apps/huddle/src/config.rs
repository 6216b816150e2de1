use std::env;
use std::time::Duration;
#[cfg(test)]
use std::sync::Mutex;

use thiserror::Error;

use crate::ids::RoomId;
use crate::orchestrator::DialPolicy;

pub const DEFAULT_SIGNALING_URL: &str = "http://127.0.0.1:5000";
pub const DEFAULT_SHARE_BASE_URL: &str = "http://localhost:3000";
pub const DEFAULT_DIAL_DELAY: Duration = Duration::from_millis(1000);

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("join attempts must be at least 1")]
    NoJoinAttempts,
    #[error("join timeout must be greater than zero")]
    ZeroJoinTimeout,
    #[error("invalid signaling url {url:?}: {reason}")]
    InvalidSignalingUrl { url: String, reason: String },
}

/// Where the connection library registers participants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RendezvousConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl RendezvousConfig {
    pub fn endpoint(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.path)
    }
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5000,
            path: "/peerjs".to_string(),
        }
    }
}

/// How long to wait for the signaling channel to confirm our presence, and
/// how often to try.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinPolicy {
    pub timeout: Duration,
    pub attempts: u32,
    /// Doubled after every failed attempt.
    pub retry_backoff: Duration,
}

impl Default for JoinPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            attempts: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }
}

/// Huddle client configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub signaling_url: String,
    pub rendezvous: RendezvousConfig,
    pub share_base_url: String,
    pub dial_policy: DialPolicy,
    pub join: JoinPolicy,
    pub heartbeat_interval: Duration,
}

impl Config {
    /// Load configuration from environment variables. Unparseable values
    /// fall back to their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let signaling_url = env::var("HUDDLE_SIGNALING_URL")
            .map(|url| normalize_localhost(&url))
            .unwrap_or(defaults.signaling_url);

        let rendezvous = RendezvousConfig {
            host: env::var("HUDDLE_RENDEZVOUS_HOST").unwrap_or(defaults.rendezvous.host),
            port: env_parse("HUDDLE_RENDEZVOUS_PORT").unwrap_or(defaults.rendezvous.port),
            path: env::var("HUDDLE_RENDEZVOUS_PATH").unwrap_or(defaults.rendezvous.path),
        };

        let dial_delay = env_parse::<u64>("HUDDLE_DIAL_DELAY_MS")
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_DIAL_DELAY);
        let dial_policy = match env::var("HUDDLE_DIAL_POLICY").ok().as_deref() {
            Some("delay") => DialPolicy::FixedDelay(dial_delay),
            _ => DialPolicy::ReadyHandshake,
        };

        let join = JoinPolicy {
            timeout: env_parse::<u64>("HUDDLE_JOIN_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.join.timeout),
            attempts: env_parse("HUDDLE_JOIN_ATTEMPTS").unwrap_or(defaults.join.attempts),
            retry_backoff: env_parse::<u64>("HUDDLE_RETRY_BACKOFF_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.join.retry_backoff),
        };

        Self {
            signaling_url,
            rendezvous,
            share_base_url: env::var("HUDDLE_SHARE_BASE_URL").unwrap_or(defaults.share_base_url),
            dial_policy,
            join,
            heartbeat_interval: env_parse::<u64>("HUDDLE_HEARTBEAT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.join.attempts == 0 {
            return Err(ConfigError::NoJoinAttempts);
        }
        if self.join.timeout.is_zero() {
            return Err(ConfigError::ZeroJoinTimeout);
        }
        url::Url::parse(&self.signaling_url).map_err(|err| {
            ConfigError::InvalidSignalingUrl {
                url: self.signaling_url.clone(),
                reason: err.to_string(),
            }
        })?;
        Ok(())
    }

    /// Link other participants can open to land in `room`.
    pub fn share_link(&self, room: &RoomId) -> String {
        format!("{}/room/{}", self.share_base_url.trim_end_matches('/'), room)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            rendezvous: RendezvousConfig::default(),
            share_base_url: DEFAULT_SHARE_BASE_URL.to_string(),
            dial_policy: DialPolicy::default(),
            join: JoinPolicy::default(),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    env::var(var).ok().and_then(|value| value.trim().parse().ok())
}

// Resolve localhost to IPv4 so the client does not try ::1 first.
fn normalize_localhost(url: &str) -> String {
    for scheme in ["http://", "https://", "ws://", "wss://"] {
        if let Some(rest) = url.strip_prefix(scheme) {
            if rest == "localhost" || rest.starts_with("localhost:") || rest.starts_with("localhost/") {
                return format!("{scheme}127.0.0.1{}", &rest["localhost".len()..]);
            }
        }
    }
    url.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::LazyLock;

    // Environment variable tests must not run in parallel
    static ENV_MUTEX: LazyLock<Mutex<()>> = LazyLock::new(|| Mutex::new(()));

    const VARS: &[&str] = &[
        "HUDDLE_SIGNALING_URL",
        "HUDDLE_RENDEZVOUS_HOST",
        "HUDDLE_RENDEZVOUS_PORT",
        "HUDDLE_RENDEZVOUS_PATH",
        "HUDDLE_SHARE_BASE_URL",
        "HUDDLE_DIAL_POLICY",
        "HUDDLE_DIAL_DELAY_MS",
        "HUDDLE_JOIN_TIMEOUT_MS",
        "HUDDLE_JOIN_ATTEMPTS",
        "HUDDLE_RETRY_BACKOFF_MS",
        "HUDDLE_HEARTBEAT_SECS",
    ];

    fn clear_vars() {
        for var in VARS {
            unsafe {
                env::remove_var(var);
            }
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.signaling_url, "http://127.0.0.1:5000");
        assert_eq!(config.dial_policy, DialPolicy::ReadyHandshake);
        assert_eq!(config.join.attempts, 3);
        assert_eq!(config.rendezvous.endpoint(), "localhost:5000/peerjs");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_env_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_vars();
        assert_eq!(Config::from_env(), Config::default());
    }

    #[test]
    fn test_config_from_env_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        clear_vars();
        unsafe {
            env::set_var("HUDDLE_SIGNALING_URL", "http://localhost:7000");
            env::set_var("HUDDLE_RENDEZVOUS_PORT", "9443");
            env::set_var("HUDDLE_DIAL_POLICY", "delay");
            env::set_var("HUDDLE_DIAL_DELAY_MS", "250");
            env::set_var("HUDDLE_JOIN_ATTEMPTS", "not-a-number");
        }
        let config = Config::from_env();
        clear_vars();

        assert_eq!(config.signaling_url, "http://127.0.0.1:7000");
        assert_eq!(config.rendezvous.port, 9443);
        assert_eq!(
            config.dial_policy,
            DialPolicy::FixedDelay(Duration::from_millis(250))
        );
        assert_eq!(config.join.attempts, 3);
    }

    #[test]
    fn validate_rejects_zero_attempts_and_bad_urls() {
        let mut config = Config::default();
        config.join.attempts = 0;
        assert_eq!(config.validate(), Err(ConfigError::NoJoinAttempts));

        let config = Config {
            signaling_url: "not a url".into(),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidSignalingUrl { .. })
        ));
    }

    #[test]
    fn share_link_joins_base_and_room() {
        let config = Config {
            share_base_url: "https://meet.example.com/".into(),
            ..Config::default()
        };
        let room = RoomId::new("k3x9qa").unwrap();
        assert_eq!(config.share_link(&room), "https://meet.example.com/room/k3x9qa");
        assert_eq!(normalize_localhost("ws://localhost"), "ws://127.0.0.1");
        assert_eq!(normalize_localhost("http://localhost.example"), "http://localhost.example");
    }
}
