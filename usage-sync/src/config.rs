use std::path::PathBuf;
use std::time::Duration;

pub const USAGE_URL: &str = "https://api.anthropic.com/api/oauth/usage";
pub const TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
pub const OAUTH_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
pub const USER_AGENT: &str = "claude-code/2.1.5";
pub const ANTHROPIC_BETA: &str = "oauth-2025-04-20";
pub const KEYCHAIN_SERVICE: &str = "Claude Code-credentials";

/// Configuration for the synchronization engine
#[derive(Debug, Clone)]
pub struct Config {
    pub poll_interval_secs: u64,
    pub network_settle_ms: u64,
    pub wake_delay_ms: u64,
    pub watchdog_interval_secs: u64,

    pub usage_url: String,
    pub token_url: String,
    pub keychain_service: String,
    pub history_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,     // half-minute boundaries
            network_settle_ms: 1500,    // let the transport re-establish
            wake_delay_ms: 3000,        // network reconnects after wake
            watchdog_interval_secs: 60, // periodic trigger liveness check

            usage_url: USAGE_URL.to_string(),
            token_url: TOKEN_URL.to_string(),
            keychain_service: KEYCHAIN_SERVICE.to_string(),
            history_path: default_history_path(),
        }
    }
}

macro_rules! env_or_default {
    ($config:expr, $field:ident, $env_var:expr) => {
        if let Ok(val) = std::env::var($env_var)
            && let Ok(parsed) = val.parse()
        {
            $config.$field = parsed;
        }
    };
}

impl Config {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        env_or_default!(config, poll_interval_secs, "USAGE_POLL_INTERVAL_SECS");
        env_or_default!(config, network_settle_ms, "USAGE_NETWORK_SETTLE_MS");
        env_or_default!(config, wake_delay_ms, "USAGE_WAKE_DELAY_MS");
        env_or_default!(config, watchdog_interval_secs, "USAGE_WATCHDOG_INTERVAL_SECS");
        env_or_default!(config, usage_url, "USAGE_API_URL");
        env_or_default!(config, token_url, "USAGE_TOKEN_URL");
        env_or_default!(config, keychain_service, "USAGE_KEYCHAIN_SERVICE");
        env_or_default!(config, history_path, "USAGE_HISTORY_PATH");

        // A zero interval would spin the periodic trigger
        config.poll_interval_secs = config.poll_interval_secs.max(1);
        config.watchdog_interval_secs = config.watchdog_interval_secs.max(1);

        config
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn network_settle_delay(&self) -> Duration {
        Duration::from_millis(self.network_settle_ms)
    }

    pub fn wake_delay(&self) -> Duration {
        Duration::from_millis(self.wake_delay_ms)
    }

    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs)
    }
}

/// `<data dir>/usage-sync/usage-history.json`
///
/// - macOS: `~/Library/Application Support/usage-sync`
/// - Linux: `~/.local/share/usage-sync`
/// - Windows: `%APPDATA%\usage-sync`
pub fn default_history_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("usage-sync")
        .join("usage-history.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert2::assert;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.poll_interval() == Duration::from_secs(30));
        assert!(config.network_settle_delay() == Duration::from_millis(1500));
        assert!(config.usage_url == USAGE_URL);
        assert!(config.history_path.ends_with("usage-history.json"));
    }
}
