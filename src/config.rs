use crate::error::{NegotiationError, Result};
use crate::security::HashAlgorithm;
use crate::template::{Template, Templates};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub negotiation: NegotiationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub templates: Vec<TemplateConfig>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct SecurityConfig {
    pub accepted_hash_algorithms: Vec<String>,
    pub timestamp_tolerance_secs: Option<i64>,
    pub certificate_tolerance_secs: Option<i64>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct NegotiationConfig {
    pub id_generation_attempts: Option<u32>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct TemplateConfig {
    pub name: String,
    pub text: Option<String>,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    /// Accepted digests in order of preference.
    pub accepted_hash_algorithms: Vec<HashAlgorithm>,
    /// Allowed skew between a message signature timestamp and now.
    pub timestamp_tolerance: Duration,
    /// Allowed skew around certificate validity windows.
    pub certificate_tolerance: Duration,
    pub id_generation_attempts: u32,
}

pub const DEFAULT_TIMESTAMP_TOLERANCE_SECS: i64 = 30;
pub const DEFAULT_CERTIFICATE_TOLERANCE_SECS: i64 = 24 * 3600;
pub const DEFAULT_ID_GENERATION_ATTEMPTS: u32 = 32;

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            security: SecurityConfig::default(),
            negotiation: NegotiationConfig::default(),
            logging: LoggingConfig::default(),
            templates: Vec::new(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            accepted_hash_algorithms: vec![
                "SHA-256".to_string(),
                "SHA-512".to_string(),
                "BLAKE3".to_string(),
            ],
            timestamp_tolerance_secs: Some(DEFAULT_TIMESTAMP_TOLERANCE_SECS),
            certificate_tolerance_secs: Some(DEFAULT_CERTIFICATE_TOLERANCE_SECS),
        }
    }
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            id_generation_attempts: Some(DEFAULT_ID_GENERATION_ATTEMPTS),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: Some("json".to_string()),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            accepted_hash_algorithms: vec![
                HashAlgorithm::Sha256,
                HashAlgorithm::Sha512,
                HashAlgorithm::Blake3,
            ],
            timestamp_tolerance: Duration::seconds(DEFAULT_TIMESTAMP_TOLERANCE_SECS),
            certificate_tolerance: Duration::seconds(DEFAULT_CERTIFICATE_TOLERANCE_SECS),
            id_generation_attempts: DEFAULT_ID_GENERATION_ATTEMPTS,
        }
    }
}

impl Settings {
    pub fn accepts(&self, algorithm: HashAlgorithm) -> bool {
        self.accepted_hash_algorithms.contains(&algorithm)
    }

    /// Preferred accepted algorithm. Construction guarantees the list is
    /// non-empty.
    pub fn preferred_hash_algorithm(&self) -> HashAlgorithm {
        HashAlgorithm::preferred(&self.accepted_hash_algorithms).unwrap_or(HashAlgorithm::Sha256)
    }
}

impl LoggingConfig {
    /// Installs the global `tracing` subscriber. `RUST_LOG` wins over the
    /// configured level.
    pub fn init(&self) {
        use tracing_subscriber::EnvFilter;

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(self.level.clone()));
        let builder = tracing_subscriber::fmt().with_env_filter(filter);

        let result = match self.format.as_deref() {
            Some("json") => builder.json().try_init(),
            _ => builder.try_init(),
        };
        if result.is_err() {
            tracing::debug!("Tracing subscriber already installed");
        }
    }
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)
            .map_err(|e| NegotiationError::Config(format!("Failed to read config file: {}", e)))?;

        let config: AppConfig = toml::from_str(&config_str)
            .map_err(|e| NegotiationError::Config(format!("Failed to parse config file: {}", e)))?;

        Ok(config)
    }

    pub fn load_with_env_overrides<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::load(path)?;

        // Override with environment variables
        if let Ok(algorithms) = std::env::var("CONTRACT_PROXY_HASH_ALGORITHMS") {
            config.security.accepted_hash_algorithms = algorithms
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(log_level) = std::env::var("RUST_LOG") {
            config.logging.level = log_level;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.settings()?;

        for template in &self.templates {
            if template.name.trim().is_empty() {
                return Err(NegotiationError::Config("Template name cannot be empty".to_string()));
            }
            if template.text.is_some() == template.path.is_some() {
                return Err(NegotiationError::Config(format!(
                    "Template '{}' needs exactly one of `text` or `path`",
                    template.name
                )));
            }
        }

        Ok(())
    }

    pub fn settings(&self) -> Result<Settings> {
        let mut accepted = Vec::new();
        for name in &self.security.accepted_hash_algorithms {
            let algorithm: HashAlgorithm = name.parse()?;
            if !accepted.contains(&algorithm) {
                accepted.push(algorithm);
            }
        }
        if accepted.is_empty() {
            return Err(NegotiationError::Config(
                "At least one hash algorithm must be accepted".to_string(),
            ));
        }

        let timestamp_tolerance = self
            .security
            .timestamp_tolerance_secs
            .unwrap_or(DEFAULT_TIMESTAMP_TOLERANCE_SECS);
        let certificate_tolerance = self
            .security
            .certificate_tolerance_secs
            .unwrap_or(DEFAULT_CERTIFICATE_TOLERANCE_SECS);
        if timestamp_tolerance < 0 || certificate_tolerance < 0 {
            return Err(NegotiationError::Config("Tolerances cannot be negative".to_string()));
        }

        let id_generation_attempts = self
            .negotiation
            .id_generation_attempts
            .unwrap_or(DEFAULT_ID_GENERATION_ATTEMPTS);
        if id_generation_attempts == 0 {
            return Err(NegotiationError::Config(
                "id_generation_attempts must be at least 1".to_string(),
            ));
        }

        Ok(Settings {
            accepted_hash_algorithms: accepted,
            timestamp_tolerance: tolerance("timestamp_tolerance_secs", timestamp_tolerance)?,
            certificate_tolerance: tolerance("certificate_tolerance_secs", certificate_tolerance)?,
            id_generation_attempts,
        })
    }

    pub fn load_templates(&self, settings: &Settings) -> Result<Templates> {
        let templates = self
            .templates
            .iter()
            .map(|config| Template::from_config(config, settings))
            .collect::<Result<Vec<_>>>()?;
        Templates::new(templates)
    }
}

pub fn create_default_config_file<P: AsRef<Path>>(path: P) -> Result<()> {
    let mut default_config = AppConfig::default();
    default_config.templates.push(TemplateConfig {
        name: "simple-purchase".to_string(),
        text: Some(
            "The buyer orders {Quantity} units of article {ArticleNumber}.".to_string(),
        ),
        path: None,
    });

    let toml_str = toml::to_string_pretty(&default_config)
        .map_err(|e| NegotiationError::Config(format!("Failed to serialize default config: {}", e)))?;

    std::fs::write(path, toml_str)
        .map_err(|e| NegotiationError::Config(format!("Failed to write default config file: {}", e)))?;

    Ok(())
}

fn tolerance(key: &str, secs: i64) -> Result<Duration> {
    Duration::try_seconds(secs)
        .ok_or_else(|| NegotiationError::Config(format!("{} is out of range: {}", key, secs)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        let settings = config.settings().unwrap();
        assert_eq!(settings.timestamp_tolerance, Duration::seconds(30));
        assert_eq!(settings.id_generation_attempts, 32);
        assert_eq!(settings.preferred_hash_algorithm(), HashAlgorithm::Sha256);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        assert!(config.validate().is_ok());

        config.security.accepted_hash_algorithms = vec!["MD5".to_string()];
        assert!(config.validate().is_err());

        config.security.accepted_hash_algorithms = vec![];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_out_of_range_tolerance_is_config_error() {
        let mut config = AppConfig::default();
        config.security.timestamp_tolerance_secs = Some(i64::MAX);
        let err = config.settings().unwrap_err();
        assert!(matches!(err, NegotiationError::Config(ref message) if message.contains("timestamp_tolerance_secs")));

        let mut config = AppConfig::default();
        config.security.certificate_tolerance_secs = Some(i64::MAX / 1000 + 1);
        assert!(matches!(config.settings(), Err(NegotiationError::Config(_))));
    }

    #[test]
    fn test_template_needs_one_source() {
        let mut config = AppConfig::default();
        config.templates.push(TemplateConfig {
            name: "empty".to_string(),
            text: None,
            path: None,
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_algorithms_collapse() {
        let mut config = AppConfig::default();
        config.security.accepted_hash_algorithms =
            vec!["BLAKE3".to_string(), "blake3".to_string(), "SHA-512".to_string()];
        let settings = config.settings().unwrap();
        assert_eq!(
            settings.accepted_hash_algorithms,
            vec![HashAlgorithm::Blake3, HashAlgorithm::Sha512]
        );
    }

    #[test]
    fn test_config_file_creation() {
        let temp_file = NamedTempFile::new().unwrap();
        let path = temp_file.path();

        create_default_config_file(path).unwrap();
        assert!(path.exists());

        let loaded_config = AppConfig::load(path).unwrap();
        assert!(loaded_config.validate().is_ok());
        let settings = loaded_config.settings().unwrap();
        let templates = loaded_config.load_templates(&settings).unwrap();
        assert!(templates.get_by_name("simple-purchase").is_ok());
    }

    #[test]
    fn test_template_from_path() {
        let template_file = NamedTempFile::new().unwrap();
        std::fs::write(template_file.path(), "Deliver {Quantity} pallets.").unwrap();

        let config_str = format!(
            r#"
[security]
accepted_hash_algorithms = ["SHA-512"]

[[templates]]
name = "delivery"
path = "{}"
"#,
            template_file.path().display()
        );
        let config: AppConfig = toml::from_str(&config_str).unwrap();
        let settings = config.settings().unwrap();
        let templates = config.load_templates(&settings).unwrap();
        let template = templates.get_by_name("delivery").unwrap();
        assert!(template.parameters().contains("Quantity"));
        assert_eq!(settings.timestamp_tolerance, Duration::seconds(30));
    }
}
