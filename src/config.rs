use std::env;
use std::time::Duration;

/// Configuration for the coordination layer, loaded from the environment.
pub struct Config {
    pub agent: AgentConfig,
    pub persist: PersistConfig,
    pub ice: IceConfig,
    pub reconnect: ReconnectPolicy,
}

/// Question-generation / chat collaborator endpoint
pub struct AgentConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

/// Engagement persistence endpoint and flush cadence
pub struct PersistConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub flush_interval_secs: u64,
}

pub struct IceConfig {
    pub stun_servers: Vec<String>,
}

/// Retry policy for room subscription. The underlying transport does no
/// automatic retry; callers opt in via `RoomSession::connect_with_retry`.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl ReconnectPolicy {
    /// Exponential backoff delay before the given attempt (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(8);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 500,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            agent: AgentConfig {
                endpoint: env::var("AGENT_ENDPOINT")
                    .unwrap_or_else(|_| "http://127.0.0.1:8788/buddy-ai".to_string()),
                api_key: env::var("AGENT_API_KEY").ok(),
                timeout_secs: env::var("AGENT_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30),
            },
            persist: PersistConfig {
                base_url: env::var("ENGAGEMENT_BASE_URL")
                    .unwrap_or_else(|_| "http://127.0.0.1:8788/rest/v1".to_string()),
                api_key: env::var("ENGAGEMENT_API_KEY").ok(),
                timeout_secs: env::var("ENGAGEMENT_TIMEOUT_SECS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
                flush_interval_secs: env::var("ENGAGEMENT_FLUSH_INTERVAL_SECS")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
            },
            ice: IceConfig {
                stun_servers: env::var("STUN_SERVERS")
                    .unwrap_or_else(|_| "stun:stun.l.google.com:19302".to_string())
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            reconnect: ReconnectPolicy {
                max_attempts: env::var("ROOM_RECONNECT_ATTEMPTS")
                    .unwrap_or_else(|_| "1".to_string())
                    .parse()
                    .unwrap_or(1),
                base_delay_ms: env::var("ROOM_RECONNECT_BASE_DELAY_MS")
                    .unwrap_or_else(|_| "500".to_string())
                    .parse()
                    .unwrap_or(500),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_exponential() {
        let policy = ReconnectPolicy {
            max_attempts: 4,
            base_delay_ms: 100,
        };

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_caps_shift() {
        let policy = ReconnectPolicy {
            max_attempts: 64,
            base_delay_ms: 1,
        };

        // Shift is capped so large attempt numbers do not overflow
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(256));
    }

    #[test]
    fn test_default_policy_single_shot() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.max_attempts, 1);
    }
}
