use crate::ecobulles::BASE_URL;
use serde_derive::{Deserialize, Serialize};
use std::env;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_CO2_BOTTLE_WEIGHT_KG: u32 = 10;

/// Account credentials plus the user-supplied CO2 bottle size.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub email: String,
    pub password: String,
    pub co2_bottle_weight_kg: u32,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
            co2_bottle_weight_kg: DEFAULT_CO2_BOTTLE_WEIGHT_KG,
        }
    }

    pub fn with_bottle_weight(mut self, co2_bottle_weight_kg: u32) -> Self {
        self.co2_bottle_weight_kg = co2_bottle_weight_kg;
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("co2_bottle_weight_kg", &self.co2_bottle_weight_kg)
            .finish()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),

    #[error("Invalid value {value:?} for {name}")]
    Invalid { name: &'static str, value: String },
}

/// Daemon configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub credentials: Credentials,
    pub base_url: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let email = required("ECOBULLES_EMAIL")?;
        let password = required("ECOBULLES_PASSWORD")?;
        let co2_bottle_weight_kg = parse_bottle_weight(env::var("ECOBULLES_CO2_BOTTLE_WEIGHT").ok())?;
        let base_url = env::var("ECOBULLES_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| BASE_URL.to_string());

        Ok(Self {
            credentials: Credentials::new(email, password).with_bottle_weight(co2_bottle_weight_kg),
            base_url,
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or(ConfigError::Missing(name))
}

/// Unset or blank means the default; anything else must be a positive integer.
fn parse_bottle_weight(val: Option<String>) -> Result<u32, ConfigError> {
    let Some(raw) = val.filter(|v| !v.trim().is_empty()) else {
        return Ok(DEFAULT_CO2_BOTTLE_WEIGHT_KG);
    };
    match raw.trim().parse::<u32>() {
        Ok(weight) if weight > 0 => Ok(weight),
        _ => Err(ConfigError::Invalid {
            name: "ECOBULLES_CO2_BOTTLE_WEIGHT",
            value: raw,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests touching the process environment must not interleave.
    static ENV_MUTEX: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn clear_env() {
        for name in [
            "ECOBULLES_EMAIL",
            "ECOBULLES_PASSWORD",
            "ECOBULLES_CO2_BOTTLE_WEIGHT",
            "ECOBULLES_URL",
        ] {
            env::remove_var(name);
        }
    }

    #[test]
    fn test_parse_bottle_weight() {
        assert_eq!(parse_bottle_weight(None), Ok(10));
        assert_eq!(parse_bottle_weight(Some("".to_string())), Ok(10));
        assert_eq!(parse_bottle_weight(Some(" 6 ".to_string())), Ok(6));
        assert!(parse_bottle_weight(Some("0".to_string())).is_err());
        assert!(parse_bottle_weight(Some("-4".to_string())).is_err());
        assert!(parse_bottle_weight(Some("ten".to_string())).is_err());
    }

    #[test]
    fn test_from_env() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        env::set_var("ECOBULLES_EMAIL", "user@example.com");
        env::set_var("ECOBULLES_PASSWORD", "hunter2");
        env::set_var("ECOBULLES_CO2_BOTTLE_WEIGHT", "6");

        let config = AppConfig::from_env().unwrap();
        assert_eq!(config.credentials.email, "user@example.com");
        assert_eq!(config.credentials.password, "hunter2");
        assert_eq!(config.credentials.co2_bottle_weight_kg, 6);
        assert_eq!(config.base_url, BASE_URL);

        env::set_var("ECOBULLES_URL", "http://127.0.0.1:8080/cmd/");
        assert_eq!(
            AppConfig::from_env().unwrap().base_url,
            "http://127.0.0.1:8080/cmd/"
        );
        clear_env();
    }

    #[test]
    fn test_from_env_missing_credentials() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env();
        assert_eq!(
            AppConfig::from_env().unwrap_err(),
            ConfigError::Missing("ECOBULLES_EMAIL")
        );

        env::set_var("ECOBULLES_EMAIL", "user@example.com");
        assert_eq!(
            AppConfig::from_env().unwrap_err().to_string(),
            "Missing required environment variable ECOBULLES_PASSWORD"
        );
        clear_env();
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let credentials = Credentials::new("user@example.com", "hunter2");
        let debug = format!("{credentials:?}");
        assert!(debug.contains("user@example.com"));
        assert!(!debug.contains("hunter2"));
    }
}
