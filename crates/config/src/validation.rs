use crate::{ConfigError, ConfigResult};

/// Trait for configuration validation
pub trait ConfigValidator {
    fn validate(&self) -> ConfigResult<()>;
}

/// General validation utilities
pub struct ValidationUtils;

impl ValidationUtils {
    /// Validate that a string is not empty
    pub fn validate_not_empty(value: &str, field_name: &str) -> ConfigResult<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "{field_name} cannot be empty"
            )));
        }
        Ok(())
    }

    pub fn validate_port(port: u16) -> ConfigResult<()> {
        if port == 0 {
            return Err(ConfigError::Validation("port cannot be 0".to_string()));
        }
        Ok(())
    }

    /// 0 < value <= max
    pub fn validate_range(value: u64, max: u64, field_name: &str) -> ConfigResult<()> {
        if value == 0 {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be greater than 0"
            )));
        }
        if value > max {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be less than or equal to {max}"
            )));
        }
        Ok(())
    }

    pub fn validate_timeout_seconds(timeout_seconds: u64, field_name: &str) -> ConfigResult<()> {
        Self::validate_range(timeout_seconds, 86_400, field_name)
    }

    pub fn validate_count(count: usize, field_name: &str) -> ConfigResult<()> {
        Self::validate_range(count as u64, 10_000, field_name)
    }

    /// `smaller` 必须严格小于 `larger`
    pub fn validate_less_than(
        smaller: u64,
        larger: u64,
        smaller_name: &str,
        larger_name: &str,
    ) -> ConfigResult<()> {
        if smaller >= larger {
            return Err(ConfigError::Validation(format!(
                "{smaller_name} must be less than {larger_name}"
            )));
        }
        Ok(())
    }

    pub fn validate_url(url: &str, field_name: &str) -> ConfigResult<()> {
        Self::validate_not_empty(url, field_name)?;
        if !url.contains(':') {
            return Err(ConfigError::Validation(format!(
                "{field_name} must be a valid URL with scheme"
            )));
        }
        Ok(())
    }
}
