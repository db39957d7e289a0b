/// Engine-level configuration.
///
/// Read once when the engine is constructed; changing it afterwards has no
/// effect on a running engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Unique identifier for this node. Prefixes the admission replication key.
    pub node_id: String,
    /// Deadline applied to calls registered with a global timeout scope, in
    /// milliseconds.
    pub default_timeout_ms: u64,
    /// Period of the timeout sweeper in milliseconds. Also the worst-case
    /// overshoot past a call's deadline.
    pub sweep_interval_ms: u64,
    /// Advisory in-flight limit. Exceeding it is reported, never refused.
    pub admission_limit: u32,
    /// Key under which admission state is handed to the replication hook.
    pub admission_key: String,
    /// Default lifetime of a session-affinity binding in milliseconds.
    pub session_ttl_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            default_timeout_ms: 120_000,
            sweep_interval_ms: 1_000,
            admission_limit: 1_000,
            admission_key: "outbound".to_string(),
            session_ttl_ms: 600_000,
        }
    }
}

/// Invalid [`EngineConfig`] values.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("sweep_interval_ms must be greater than zero")]
    ZeroSweepInterval,
    #[error("default_timeout_ms must be greater than zero")]
    ZeroDefaultTimeout,
    #[error("admission_limit must be greater than zero")]
    ZeroAdmissionLimit,
}

impl EngineConfig {
    /// Checks the values an engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns the first zero-valued interval, timeout or limit found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sweep_interval_ms == 0 {
            return Err(ConfigError::ZeroSweepInterval);
        }
        if self.default_timeout_ms == 0 {
            return Err(ConfigError::ZeroDefaultTimeout);
        }
        if self.admission_limit == 0 {
            return Err(ConfigError::ZeroAdmissionLimit);
        }
        Ok(())
    }

    /// Full replication key, `"<node_id>/<admission_key>"` or just the
    /// admission key when no node id is set.
    #[must_use]
    pub fn replication_key(&self) -> String {
        if self.node_id.is_empty() {
            self.admission_key.clone()
        } else {
            format!("{}/{}", self.node_id, self.admission_key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_timeout_ms, 120_000);
        assert_eq!(config.sweep_interval_ms, 1_000);
        assert_eq!(config.admission_limit, 1_000);
        assert_eq!(config.admission_key, "outbound");
        assert_eq!(config.session_ttl_ms, 600_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_values() {
        let config = EngineConfig {
            sweep_interval_ms: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroSweepInterval));

        let config = EngineConfig {
            default_timeout_ms: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroDefaultTimeout));

        let config = EngineConfig {
            admission_limit: 0,
            ..EngineConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroAdmissionLimit));
    }

    #[test]
    fn replication_key_includes_node_id() {
        let mut config = EngineConfig::default();
        assert_eq!(config.replication_key(), "outbound");

        config.node_id = "node-1".to_string();
        assert_eq!(config.replication_key(), "node-1/outbound");
    }
}
