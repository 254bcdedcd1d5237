// Connection configuration

use std::str::FromStr;

use serde::Deserialize;

use crate::error::{BusError, Result};

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5672;
pub const DEFAULT_VHOST: &str = "/";
pub const DEFAULT_CREDENTIAL: &str = "guest";
pub const DEFAULT_PARALLELISM: u16 = 1;

/// Broker connection settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,
    /// Max unacknowledged deliveries per worker
    pub parallelism: u16,
    pub wait_for_publisher_confirms: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            vhost: DEFAULT_VHOST.to_string(),
            username: DEFAULT_CREDENTIAL.to_string(),
            password: DEFAULT_CREDENTIAL.to_string(),
            parallelism: DEFAULT_PARALLELISM,
            wait_for_publisher_confirms: true,
        }
    }
}

impl ConnectionConfig {
    /// Defaults overridden by `COURIER_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(host) = lookup("COURIER_HOST") {
            config.host = host;
        }
        if let Some(port) = parse(&lookup, "COURIER_PORT")? {
            config.port = port;
        }
        if let Some(vhost) = lookup("COURIER_VHOST") {
            config.vhost = vhost;
        }
        if let Some(username) = lookup("COURIER_USERNAME") {
            config.username = username;
        }
        if let Some(password) = lookup("COURIER_PASSWORD") {
            config.password = password;
        }
        if let Some(parallelism) = parse(&lookup, "COURIER_PARALLELISM")? {
            config.parallelism = parallelism;
        }
        if let Some(confirms) = parse(&lookup, "COURIER_PUBLISHER_CONFIRMS")? {
            config.wait_for_publisher_confirms = confirms;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_parallelism(mut self, parallelism: u16) -> Self {
        self.parallelism = parallelism;
        self
    }

    pub fn without_publisher_confirms(mut self) -> Self {
        self.wait_for_publisher_confirms = false;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(BusError::Config("host must not be empty".to_string()));
        }
        if self.parallelism == 0 {
            return Err(BusError::Config("parallelism must be at least 1".to_string()));
        }
        Ok(())
    }
}

fn parse<F, T>(lookup: &F, key: &str) -> Result<Option<T>>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| BusError::Config(format!("{} has an invalid value: {}", key, raw)))
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ConnectionConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ConnectionConfig::default());
        assert_eq!(config.port, 5672);
        assert_eq!(config.vhost, "/");
        assert!(config.wait_for_publisher_confirms);
    }

    #[test]
    fn test_overrides() {
        let config = ConnectionConfig::from_lookup(lookup(&[
            ("COURIER_HOST", "rabbit"),
            ("COURIER_PORT", "5673"),
            ("COURIER_PARALLELISM", "8"),
            ("COURIER_PUBLISHER_CONFIRMS", "false"),
        ]))
        .unwrap();
        assert_eq!(config.host, "rabbit");
        assert_eq!(config.port, 5673);
        assert_eq!(config.parallelism, 8);
        assert!(!config.wait_for_publisher_confirms);
    }

    #[test]
    fn test_invalid_values() {
        let err = ConnectionConfig::from_lookup(lookup(&[("COURIER_PORT", "abc")])).unwrap_err();
        assert!(matches!(err, BusError::Config(_)));

        let err =
            ConnectionConfig::from_lookup(lookup(&[("COURIER_PARALLELISM", "0")])).unwrap_err();
        assert_eq!(
            err,
            BusError::Config("parallelism must be at least 1".to_string())
        );
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ConnectionConfig =
            serde_json::from_str(r#"{"host": "broker", "parallelism": 4}"#).unwrap();
        assert_eq!(config.host, "broker");
        assert_eq!(config.parallelism, 4);
        assert_eq!(config.username, "guest");
    }
}
