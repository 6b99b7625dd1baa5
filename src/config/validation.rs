use super::*;
use crate::policies::AllocatorFactory;

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &SupervisorConfig) -> ConfigResult<()> {
        Self::validate_worker(config)?;
        Self::validate_pool(config)?;
        Self::validate_allocator(&config.allocator)?;
        Ok(())
    }

    fn validate_worker(config: &SupervisorConfig) -> ConfigResult<()> {
        if config.worker.program.as_os_str().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "worker".to_string(),
            });
        }

        if let Some(title) = &config.title {
            if title.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "title".to_string(),
                    value: title.clone(),
                    reason: "Must not be blank".to_string(),
                });
            }
        }

        if let Some(interval) = config.worker_ping_interval {
            if interval.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: "worker_ping_interval".to_string(),
                    value: "0".to_string(),
                    reason: "Must be > 0, or disabled".to_string(),
                });
            }
        }

        Ok(())
    }

    fn validate_pool(config: &SupervisorConfig) -> ConfigResult<()> {
        if config.num_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "num_workers".to_string(),
                value: config.num_workers.to_string(),
                reason: "Must be at least 1".to_string(),
            });
        }

        if config.kill_timeout.is_some() && config.worker_shutdown_grace.is_zero() {
            return Err(ConfigError::ValidationFailed {
                reason: "kill_timeout requires a non-zero worker_shutdown_grace".to_string(),
            });
        }

        Ok(())
    }

    fn validate_allocator(allocator: &AllocatorConfig) -> ConfigResult<()> {
        if let AllocatorConfig::Cookie { name } = allocator {
            let valid = !name.is_empty()
                && name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
            if !valid {
                return Err(ConfigError::InvalidValue {
                    field: "allocator".to_string(),
                    value: name.clone(),
                    reason: "Cookie name must be a non-empty token".to_string(),
                });
            }
        }

        AllocatorFactory::create(allocator).map(|_| ())
    }
}
