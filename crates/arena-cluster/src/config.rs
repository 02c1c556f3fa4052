use crate::error::ClusterError;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Resource limits applied to every per-service connection pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolLimits {
    /// Requests allowed to be queued or in flight before new calls are rejected. Default: 300.
    pub max_pending: usize,
    /// Concurrent requests (sockets) per pool. Default: 10.
    pub max_sockets: usize,
    /// Deadline for a single call, including the wait for a free socket. Default: 10s.
    pub request_timeout: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_pending: 300,
            max_sockets: 10,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Backoff schedule for re-establishing a lost coordination session.
///
/// Attempts are unbounded. The first attempt runs immediately; after that the
/// delay doubles from `initial_backoff` up to `max_backoff`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the second attempt. Default: 500ms.
    pub initial_backoff: Duration,
    /// Upper bound for any delay. Default: 30s.
    pub max_backoff: Duration,
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32 << (attempt - 1).min(16);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Configuration for cluster membership and RPC.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Cluster mode. When false, `MembershipRegistry::init` is a no-op. Default: true.
    pub enabled: bool,
    /// Logical service this process belongs to. Default: "901".
    pub service_id: String,
    /// Deployment environment tag; members register under `/{profiles}`. Default: "dev".
    pub profiles: String,
    /// Port the RPC listener binds and advertises. Default: 9000.
    pub port: u16,
    /// Address to advertise instead of the first non-loopback interface address.
    pub advertise_ip: Option<Ipv4Addr>,
    /// How long to wait for the coordination session to report connected. Default: 3s.
    pub connect_timeout: Duration,
    pub pool: PoolLimits,
    pub reconnect: ReconnectPolicy,
}

impl ClusterConfig {
    /// Validate configuration values.
    ///
    /// Checks:
    /// - `service_id` and `profiles` are non-empty
    /// - `profiles` is a single path segment
    /// - pool limits and timeouts are non-zero
    /// - `reconnect.initial_backoff <= reconnect.max_backoff`
    pub fn validate(&self) -> Result<(), ClusterError> {
        if self.service_id.is_empty() {
            return Err(ClusterError::InvalidConfig {
                reason: "service_id must not be empty".to_string(),
            });
        }
        if self.profiles.is_empty() {
            return Err(ClusterError::InvalidConfig {
                reason: "profiles must not be empty".to_string(),
            });
        }
        if self.profiles.contains('/') {
            return Err(ClusterError::InvalidConfig {
                reason: format!("profiles must not contain '/', got {}", self.profiles),
            });
        }
        if self.connect_timeout.is_zero() {
            return Err(ClusterError::InvalidConfig {
                reason: "connect_timeout must be > 0".to_string(),
            });
        }
        if self.pool.max_pending == 0 {
            return Err(ClusterError::InvalidConfig {
                reason: "pool.max_pending must be >= 1".to_string(),
            });
        }
        if self.pool.max_sockets == 0 {
            return Err(ClusterError::InvalidConfig {
                reason: "pool.max_sockets must be >= 1".to_string(),
            });
        }
        if self.pool.request_timeout.is_zero() {
            return Err(ClusterError::InvalidConfig {
                reason: "pool.request_timeout must be > 0".to_string(),
            });
        }
        if self.reconnect.initial_backoff > self.reconnect.max_backoff {
            return Err(ClusterError::InvalidConfig {
                reason: format!(
                    "reconnect.initial_backoff ({:?}) exceeds reconnect.max_backoff ({:?})",
                    self.reconnect.initial_backoff, self.reconnect.max_backoff
                ),
            });
        }
        Ok(())
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_id: "901".to_string(),
            profiles: "dev".to_string(),
            port: 9000,
            advertise_ip: None,
            connect_timeout: Duration::from_millis(3000),
            pool: PoolLimits::default(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = ClusterConfig::default();
        assert!(config.enabled);
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.pool.max_pending, 300);
        assert_eq!(config.pool.max_sockets, 10);
        assert_eq!(config.pool.request_timeout, Duration::from_secs(10));
        assert_eq!(config.advertise_ip, None);
    }

    #[test]
    fn default_config_is_valid() {
        ClusterConfig::default().validate().unwrap();
    }

    #[test]
    fn custom_config() {
        let config = ClusterConfig {
            service_id: "902".into(),
            profiles: "dev.101".into(),
            ..Default::default()
        };
        assert_eq!(config.service_id, "902");
        // Other fields keep defaults
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn validate_empty_service_id() {
        let config = ClusterConfig {
            service_id: String::new(),
            ..Default::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("service_id"), "got: {msg}");
    }

    #[test]
    fn validate_profiles_with_slash() {
        let config = ClusterConfig {
            profiles: "dev/101".into(),
            ..Default::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("profiles"), "got: {msg}");
    }

    #[test]
    fn validate_zero_sockets() {
        let config = ClusterConfig {
            pool: PoolLimits {
                max_sockets: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("max_sockets"), "got: {msg}");
    }

    #[test]
    fn validate_inverted_backoff() {
        let config = ClusterConfig {
            reconnect: ReconnectPolicy {
                initial_backoff: Duration::from_secs(60),
                max_backoff: Duration::from_secs(1),
            },
            ..Default::default()
        };
        let msg = config.validate().unwrap_err().to_string();
        assert!(msg.contains("initial_backoff"), "got: {msg}");
    }

    #[test]
    fn reconnect_delay_schedule() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), Duration::ZERO);
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(2));
        assert_eq!(policy.delay(8), Duration::from_secs(30));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
    }
}
