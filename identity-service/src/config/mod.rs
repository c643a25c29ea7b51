use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

use crate::services::TokenPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub tokens: TokenSettings,
    pub providers: FederationSettings,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenSettings {
    pub default_ttl_millis: i64,
    /// 0 means no ceiling.
    pub max_ttl_millis: i64,
    pub allow_non_expiring: bool,
    /// How long dead tokens are kept; 0 keeps them.
    pub retention_millis: i64,
    pub sweep_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FederationSettings {
    pub call_timeout_millis: u64,
    /// 0 disables the background group refresh.
    pub group_refresh_interval_seconds: u64,
}

impl TokenSettings {
    pub fn policy(&self) -> TokenPolicy {
        TokenPolicy {
            default_ttl_millis: self.default_ttl_millis,
            max_ttl_millis: self.max_ttl_millis,
            allow_non_expiring: self.allow_non_expiring,
            retention_millis: self.retention_millis,
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

impl FederationSettings {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_millis)
    }

    pub fn group_refresh_interval(&self) -> Option<Duration> {
        (self.group_refresh_interval_seconds > 0)
            .then(|| Duration::from_secs(self.group_refresh_interval_seconds))
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            common: core_config::Config::default(),
            environment: Environment::Dev,
            service_name: "identity-service".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            tokens: TokenSettings {
                default_ttl_millis: 57_600_000,
                max_ttl_millis: 0,
                allow_non_expiring: false,
                retention_millis: 86_400_000,
                sweep_interval_seconds: 60,
            },
            providers: FederationSettings {
                call_timeout_millis: 10_000,
                group_refresh_interval_seconds: 3600,
            },
        }
    }
}

impl IdentityConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = IdentityConfig {
            common: common_config,
            environment,
            service_name: get_env("SERVICE_NAME", Some("identity-service"), false)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), false)?,
            tokens: TokenSettings {
                default_ttl_millis: parse_env("TOKEN_DEFAULT_TTL_MILLIS", "57600000", is_prod)?,
                max_ttl_millis: parse_env("TOKEN_MAX_TTL_MILLIS", "0", false)?,
                allow_non_expiring: parse_env("TOKEN_ALLOW_NON_EXPIRING", "false", false)?,
                retention_millis: parse_env("TOKEN_RETENTION_MILLIS", "86400000", false)?,
                sweep_interval_seconds: parse_env("TOKEN_SWEEP_INTERVAL_SECONDS", "60", false)?,
            },
            providers: FederationSettings {
                call_timeout_millis: parse_env("PROVIDER_CALL_TIMEOUT_MILLIS", "10000", false)?,
                group_refresh_interval_seconds: parse_env(
                    "GROUP_REFRESH_INTERVAL_SECONDS",
                    "3600",
                    false,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.tokens.default_ttl_millis <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TOKEN_DEFAULT_TTL_MILLIS must be positive"
            )));
        }

        if self.tokens.max_ttl_millis < 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TOKEN_MAX_TTL_MILLIS must not be negative"
            )));
        }

        if self.tokens.retention_millis < 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TOKEN_RETENTION_MILLIS must not be negative"
            )));
        }

        if self.tokens.sweep_interval_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TOKEN_SWEEP_INTERVAL_SECONDS must be greater than 0"
            )));
        }

        if self.providers.call_timeout_millis == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PROVIDER_CALL_TIMEOUT_MILLIS must be greater than 0"
            )));
        }

        if self.environment == Environment::Prod && self.tokens.allow_non_expiring {
            tracing::warn!("Non-expiring tokens are allowed in production");
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_parse() {
        assert_eq!("PROD".parse::<Environment>().unwrap(), Environment::Prod);
        assert!("staging".parse::<Environment>().is_err());
    }

    #[test]
    fn test_malformed_flag_is_rejected() {
        env::set_var("IDENTITY_TEST_FLAG_MALFORMED", "yes");
        let parsed = parse_env::<bool>("IDENTITY_TEST_FLAG_MALFORMED", "false", false);
        assert!(matches!(parsed, Err(AppError::ConfigError(_))));

        env::set_var("IDENTITY_TEST_FLAG_VALID", "true");
        assert!(parse_env::<bool>("IDENTITY_TEST_FLAG_VALID", "false", false).unwrap());
        assert!(!parse_env::<bool>("IDENTITY_TEST_FLAG_UNSET", "false", false).unwrap());
    }

    #[test]
    fn test_defaults_validate() {
        let config = IdentityConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.providers.call_timeout(), Duration::from_millis(10_000));
        assert_eq!(
            config.providers.group_refresh_interval(),
            Some(Duration::from_secs(3600))
        );
        assert_eq!(config.tokens.policy().default_ttl_millis, 57_600_000);
    }

    #[test]
    fn test_zero_refresh_interval_disables_schedule() {
        let mut config = IdentityConfig::default();
        config.providers.group_refresh_interval_seconds = 0;
        assert!(config.providers.group_refresh_interval().is_none());
    }

    #[test]
    fn test_rejects_non_positive_default_ttl() {
        let mut config = IdentityConfig::default();
        config.tokens.default_ttl_millis = 0;
        assert!(config.validate().is_err());
    }
}
