use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,
    pub gateway_url: String,
    /// Width of the bounded pool used for gateway calls.
    pub hold_workers: usize,
    /// Directory receiving the staged-journal dump on a failed settlement.
    pub dump_dir: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),
    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(std::env::vars().collect())
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn from_env_map(env_map: HashMap<String, String>) -> Result<Self, ConfigError> {
        let database_path = env_map
            .get("DATABASE_PATH")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("DATABASE_PATH".to_string()))?;

        let gateway_url = env_map
            .get("GATEWAY_URL")
            .cloned()
            .ok_or_else(|| ConfigError::MissingEnv("GATEWAY_URL".to_string()))?;

        let hold_workers = env_map
            .get("HOLD_WORKERS")
            .map(|s| s.as_str())
            .unwrap_or("5")
            .parse::<usize>()
            .map_err(|_| {
                ConfigError::InvalidValue(
                    "HOLD_WORKERS".to_string(),
                    "must be a valid usize".to_string(),
                )
            })?;
        if hold_workers == 0 {
            return Err(ConfigError::InvalidValue(
                "HOLD_WORKERS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        let dump_dir = env_map
            .get("DUMP_DIR")
            .cloned()
            .unwrap_or_else(|| ".".to_string());

        Ok(Config {
            database_path,
            gateway_url,
            hold_workers,
            dump_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup_required_env() -> HashMap<String, String> {
        let mut map = HashMap::new();
        map.insert("DATABASE_PATH".to_string(), "/tmp/test.db".to_string());
        map.insert(
            "GATEWAY_URL".to_string(),
            "https://gateway.example.com".to_string(),
        );
        map
    }

    #[test]
    fn test_missing_database_path() {
        let mut env_map = setup_required_env();
        env_map.remove("DATABASE_PATH");
        let result = Config::from_env_map(env_map);
        match result {
            Err(ConfigError::MissingEnv(s)) => assert_eq!(s, "DATABASE_PATH"),
            _ => panic!("Expected MissingEnv error"),
        }
    }

    #[test]
    fn test_missing_gateway_url() {
        let mut env_map = setup_required_env();
        env_map.remove("GATEWAY_URL");
        let result = Config::from_env_map(env_map);
        match result {
            Err(ConfigError::MissingEnv(s)) => assert_eq!(s, "GATEWAY_URL"),
            _ => panic!("Expected MissingEnv error"),
        }
    }

    #[test]
    fn test_default_hold_workers() {
        let config = Config::from_env_map(setup_required_env()).unwrap();
        assert_eq!(config.hold_workers, 5);
        assert_eq!(config.dump_dir, ".");
    }

    #[test]
    fn test_invalid_hold_workers() {
        let mut env_map = setup_required_env();
        env_map.insert("HOLD_WORKERS".to_string(), "zero".to_string());
        let result = Config::from_env_map(env_map);
        match result {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "HOLD_WORKERS"),
            _ => panic!("Expected InvalidValue error"),
        }
    }

    #[test]
    fn test_zero_hold_workers_rejected() {
        let mut env_map = setup_required_env();
        env_map.insert("HOLD_WORKERS".to_string(), "0".to_string());
        let result = Config::from_env_map(env_map);
        match result {
            Err(ConfigError::InvalidValue(k, _)) => assert_eq!(k, "HOLD_WORKERS"),
            _ => panic!("Expected InvalidValue error"),
        }
    }
}
