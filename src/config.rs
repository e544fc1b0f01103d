use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

// ============================================================
// Analysis Config
// ============================================================

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    #[serde(default = "default_max_concurrent_runs")]
    pub max_concurrent_runs: usize,
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 4,
            progress_interval_ms: 500,
            retry: RetryConfig::default(),
        }
    }
}

fn default_max_concurrent_runs() -> usize {
    4
}

fn default_progress_interval_ms() -> u64 {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30000,
        }
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    30000
}

// ============================================================
// API Config
// ============================================================

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default = "default_api_host")]
    pub host: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 3000,
            host: "0.0.0.0".to_string(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_api_port() -> u16 {
    3000
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("Failed to read config file '{}': {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("Failed to parse config file '{}': {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> eyre::Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre::eyre!("Database url must not be empty"));
        }
        if self.analysis.max_concurrent_runs == 0 {
            return Err(eyre::eyre!("max_concurrent_runs must be at least 1"));
        }
        if self.analysis.retry.max_attempts == 0 {
            return Err(eyre::eyre!("retry.max_attempts must be at least 1"));
        }
        if self.analysis.retry.initial_backoff_ms > self.analysis.retry.max_backoff_ms {
            return Err(eyre::eyre!(
                "retry.initial_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.analysis.retry.initial_backoff_ms,
                self.analysis.retry.max_backoff_ms
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
[database]
url = "postgres://localhost/test"
max_connections = 5

[analysis]
max_concurrent_runs = 8

[analysis.retry]
max_attempts = 3
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database.max_connections, 5);
        assert_eq!(config.analysis.max_concurrent_runs, 8);
        assert_eq!(config.analysis.retry.max_attempts, 3);
        assert_eq!(config.analysis.retry.initial_backoff_ms, 500); // default
        assert_eq!(config.analysis.progress_interval_ms, 500); // default
        assert!(config.api.enabled); // default
        assert_eq!(config.api.port, 3000); // default
    }

    #[test]
    fn test_defaults_when_sections_omitted() {
        let toml_str = r#"
[database]
url = "postgres://localhost/test"
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.database.max_connections, 10);
        assert_eq!(config.analysis.max_concurrent_runs, 4);
        assert_eq!(config.analysis.retry.max_attempts, 5);
        assert_eq!(config.api.host, "0.0.0.0");
    }

    #[test]
    fn test_validate_zero_concurrency() {
        let config = Config {
            database: DatabaseConfig {
                url: "postgres://localhost/test".to_string(),
                max_connections: 5,
            },
            analysis: AnalysisConfig {
                max_concurrent_runs: 0,
                ..AnalysisConfig::default()
            },
            api: ApiConfig::default(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_backoff_ordering() {
        let config = Config {
            database: DatabaseConfig {
                url: "postgres://localhost/test".to_string(),
                max_connections: 5,
            },
            analysis: AnalysisConfig {
                retry: RetryConfig {
                    max_attempts: 5,
                    initial_backoff_ms: 60000,
                    max_backoff_ms: 30000,
                },
                ..AnalysisConfig::default()
            },
            api: ApiConfig::default(),
        };
        assert!(config.validate().is_err());
    }
}
