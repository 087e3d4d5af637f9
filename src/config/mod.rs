use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: u32,
}

/// Upgrade endpoint and liveness settings consumed by the push core.
#[derive(Debug, Deserialize, Clone)]
pub struct WebSocketConfig {
    pub path: String,
    pub heartbeat_interval_secs: u64,
    pub connection_timeout_secs: u64,
    pub enable_heartbeat: bool,
    pub enable_timeout_eviction: bool,
    /// Grace period for a peer to answer a close frame we sent.
    pub close_timeout_ms: u64,
}

impl WebSocketConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allow_any_origin: bool,
    pub max_age: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub log_level: String,
    pub server: ServerConfig,
    pub websocket: WebSocketConfig,
    pub cors: CorsConfig,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Self::with_defaults(Config::builder(), "development")?
            // Add in settings from the config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))

            // Add in settings from environment variables (with prefix "APP_")
            // E.g., `APP_WEBSOCKET__HEARTBEAT_INTERVAL_SECS=15`
            .add_source(
                Environment::with_prefix("app")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()?;

        let settings: Settings = s.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn with_defaults(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
        environment: &str,
    ) -> Result<config::ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        builder
            .set_default("environment", environment)?
            .set_default("log_level", "info")?
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.workers", num_cpus::get() as i64)?
            .set_default("websocket.path", "/ws")?
            .set_default("websocket.heartbeat_interval_secs", 60)?
            .set_default("websocket.connection_timeout_secs", 120)?
            .set_default("websocket.enable_heartbeat", true)?
            .set_default("websocket.enable_timeout_eviction", true)?
            .set_default("websocket.close_timeout_ms", 5000)?
            .set_default("cors.enabled", true)?
            .set_default("cors.allow_any_origin", true)?
            .set_default("cors.max_age", 3600)
    }

    /// Rejects settings the heartbeat monitor and route table cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.websocket.heartbeat_interval_secs == 0 {
            return Err(ConfigError::Message(
                "websocket.heartbeat_interval_secs must be greater than zero".into(),
            ));
        }
        if self.websocket.connection_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "websocket.connection_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.websocket.close_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "websocket.close_timeout_ms must be greater than zero".into(),
            ));
        }
        if !self.websocket.path.starts_with('/') {
            return Err(ConfigError::Message(format!(
                "websocket.path must start with '/', got {}",
                self.websocket.path
            )));
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn new_for_test() -> Result<Self, ConfigError> {
        Self::with_defaults(Config::builder(), "test")?
            .set_override("server.workers", 1)?
            .set_override("websocket.heartbeat_interval_secs", 1)?
            .set_override("websocket.connection_timeout_secs", 2)?
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn cleanup_env() {
        env::remove_var("APP_SERVER__PORT");
        env::remove_var("APP_WEBSOCKET__PATH");
        env::remove_var("APP_WEBSOCKET__HEARTBEAT_INTERVAL_SECS");
        env::remove_var("APP_WEBSOCKET__ENABLE_HEARTBEAT");
    }

    #[test]
    fn test_settings_defaults() {
        cleanup_env();
        let settings = Settings::new_for_test().expect("Failed to load settings");
        assert_eq!(settings.environment, "test");
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.workers, 1);
        assert_eq!(settings.websocket.path, "/ws");
        assert_eq!(settings.websocket.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(settings.websocket.connection_timeout(), Duration::from_secs(2));
        assert!(settings.websocket.enable_heartbeat);
        assert!(settings.websocket.enable_timeout_eviction);
        assert_eq!(settings.websocket.close_timeout(), Duration::from_secs(5));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_environment_override() {
        cleanup_env();

        env::set_var("APP_SERVER__PORT", "9000");
        env::set_var("APP_WEBSOCKET__PATH", "/push");
        env::set_var("APP_WEBSOCKET__HEARTBEAT_INTERVAL_SECS", "15");
        env::set_var("APP_WEBSOCKET__ENABLE_HEARTBEAT", "false");

        let config = Settings::with_defaults(Config::builder(), "test")
            .unwrap()
            // Add environment variables last to override defaults
            .add_source(
                Environment::with_prefix("app")
                    .separator("__")
                    .try_parsing(true)
            )
            .build()
            .expect("Failed to build config")
            .try_deserialize::<Settings>()
            .expect("Failed to deserialize settings");

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.websocket.path, "/push");
        assert_eq!(config.websocket.heartbeat_interval_secs, 15);
        assert!(!config.websocket.enable_heartbeat);
        assert_eq!(config.websocket.connection_timeout_secs, 120);

        cleanup_env();
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        cleanup_env();
        let mut settings = Settings::new_for_test().unwrap();
        settings.websocket.heartbeat_interval_secs = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::new_for_test().unwrap();
        settings.websocket.connection_timeout_secs = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::new_for_test().unwrap();
        settings.websocket.close_timeout_ms = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::new_for_test().unwrap();
        settings.websocket.path = "ws".into();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("must start with '/'"));
    }
}
