//! Configuration file handling.
//!
//! The configuration is a YAML document:
//! ```yaml
//! vault:
//!   address: "http://vault:8200"
//!   token: "${VAULT_TOKEN}"
//!   namespace: "my-namespace"
//!   max_retries: 3
//!   retry_delay: "1s"
//! migrations:
//!   directory: "./migrations"
//!   concurrent_tasks: true
//! tracking:
//!   backend: store
//!   path: migrations/version
//! log_level: "info"
//! dry_run: false
//! ```
//!
//! `VAULT_ADDR`, `VAULT_TOKEN` and `VAULT_NAMESPACE` fill the matching
//! fields when the file leaves them empty, and `${VAR}` / `$VAR` references
//! inside those fields are expanded from the environment.

use crate::error::{MigrationError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum::{Display, EnumString};

/// Vault connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub address: String,
    pub token: String,
    pub namespace: String,
    /// Attempts per task, including the first one
    pub max_retries: u32,
    /// Backoff step; attempt n waits n times this before the next try
    #[serde(with = "duration_str")]
    pub retry_delay: Duration,
    /// Per-request HTTP timeout
    #[serde(with = "duration_str")]
    pub timeout: Duration,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            token: String::new(),
            namespace: String::new(),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Where change-set files live and how they are applied
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationsConfig {
    pub directory: PathBuf,
    /// Run the tasks of one change-set concurrently
    pub concurrent_tasks: bool,
    /// Only `true` is supported; kept for compatibility with older files
    pub stop_on_error: bool,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::new(),
            concurrent_tasks: true,
            stop_on_error: true,
        }
    }
}

/// Backend holding the version cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TrackingBackend {
    /// A key inside Vault itself
    #[default]
    Store,
    /// A local YAML file
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub backend: TrackingBackend,
    /// Store path of the cursor key
    pub path: String,
    /// Cursor file; defaults to `.version.yaml` inside the migrations directory
    pub file: Option<PathBuf>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            backend: TrackingBackend::Store,
            path: "migrations/version".to_string(),
            file: None,
        }
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub vault: VaultConfig,
    pub migrations: MigrationsConfig,
    pub tracking: TrackingConfig,
    pub log_level: String,
    pub dry_run: bool,
}

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Load configuration from a YAML file, applying environment overrides
    /// from the process environment.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load_with_env(path, |key| std::env::var(key).ok())
    }

    /// Same as `load_from_file` with an explicit environment lookup.
    pub fn load_with_env<P, F>(path: P, env: F) -> Result<Self>
    where
        P: AsRef<Path>,
        F: Fn(&str) -> Option<String>,
    {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            MigrationError::config(format!("failed to read config file {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_yaml(&content)
            .map_err(|e| MigrationError::config(format!("{}: {}", path.display(), e)))?;
        config.apply_env(env);
        Ok(config)
    }

    /// Parse a YAML document; missing fields take their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml::from_str(yaml)
                .map_err(|e| MigrationError::config(format!("failed to parse config: {}", e)))?
        };
        if config.log_level.is_empty() {
            config.log_level = "info".to_string();
        }
        Ok(config)
    }

    /// Expand `${VAR}`/`$VAR` references and fall back to `VAULT_*` variables.
    pub fn apply_env<F>(&mut self, env: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let vault = &mut self.vault;
        for (field, var) in [
            (&mut vault.address, "VAULT_ADDR"),
            (&mut vault.token, "VAULT_TOKEN"),
            (&mut vault.namespace, "VAULT_NAMESPACE"),
        ] {
            *field = expand_env(field, &env);
            if field.is_empty() {
                if let Some(value) = env(var) {
                    *field = value;
                }
            }
        }
    }

    /// Cursor file location for the `file` backend
    pub fn cursor_file(&self) -> PathBuf {
        self.tracking
            .file
            .clone()
            .unwrap_or_else(|| self.migrations.directory.join(".version.yaml"))
    }

    /// Checks needed before applying migrations.
    pub fn validate(&self) -> Result<()> {
        self.validate_common()?;

        if self.tracking.backend == TrackingBackend::Store || !self.dry_run {
            self.validate_connection()?;
        }

        if self.tracking.backend == TrackingBackend::Store && self.tracking.path.trim().is_empty() {
            return Err(MigrationError::config("tracking path must not be empty"));
        }

        if !self.migrations.directory.is_dir() {
            return Err(MigrationError::config(format!(
                "migrations directory does not exist: {}",
                self.migrations.directory.display()
            )));
        }

        Ok(())
    }

    /// Address and token must be usable before any store call.
    pub fn validate_connection(&self) -> Result<()> {
        if self.vault.address.trim().is_empty() {
            return Err(MigrationError::config("vault address is required"));
        }
        if !self.vault.address.starts_with("http://") && !self.vault.address.starts_with("https://")
        {
            return Err(MigrationError::config(format!(
                "vault address '{}' must start with http:// or https://",
                self.vault.address
            )));
        }
        if self.vault.token.trim().is_empty() {
            return Err(MigrationError::config("vault token is required"));
        }
        Ok(())
    }

    /// Checks needed for generating a migration; no store access required.
    pub fn validate_for_generate(&self) -> Result<()> {
        self.validate_common()
    }

    fn validate_common(&self) -> Result<()> {
        if self.migrations.directory.as_os_str().is_empty() {
            return Err(MigrationError::config("migrations directory is required"));
        }
        if !self.migrations.stop_on_error {
            return Err(MigrationError::config(
                "stop_on_error: false is not supported; migrations always stop at the first failure",
            ));
        }
        if self.vault.max_retries == 0 {
            return Err(MigrationError::config("max_retries must be at least 1"));
        }
        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(MigrationError::config(format!(
                "invalid log level '{}' (expected one of: {})",
                self.log_level,
                LOG_LEVELS.join(", ")
            )));
        }
        Ok(())
    }
}

/// Replace `${VAR}` and `$VAR` with values from `env`.
///
/// Unknown variables are left untouched so the validation error shows what
/// was missing.
pub fn expand_env<F>(value: &str, env: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            if let Some(end) = braced.find('}') {
                let name = &braced[..end];
                match env(name) {
                    Some(v) => out.push_str(&v),
                    None => out.push_str(&rest[pos..pos + 1 + 1 + end + 1]),
                }
                rest = &braced[end + 1..];
                continue;
            }
        }

        let name_len = after
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
            .map(|(i, _)| i)
            .unwrap_or(after.len());
        let name = &after[..name_len];
        match (name.is_empty(), env(name)) {
            (false, Some(v)) => out.push_str(&v),
            _ => {
                out.push('$');
                out.push_str(name);
            }
        }
        rest = &after[name_len..];
    }

    out.push_str(rest);
    out
}

/// Durations written as `500ms`, `1s`, `2m` or a bare number of seconds.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(i) => s.split_at(i),
        None => (s, "s"),
    };
    let amount: f64 = digits
        .parse()
        .map_err(|_| format!("invalid duration '{}'", s))?;
    let secs = match unit.trim() {
        "ms" => amount / 1000.0,
        "s" => amount,
        "m" => amount * 60.0,
        other => return Err(format!("unknown duration unit '{}' in '{}'", other, s)),
    };
    Duration::try_from_secs_f64(secs).map_err(|_| format!("duration '{}' is out of range", s))
}

fn format_duration(d: &Duration) -> String {
    if d.subsec_millis() != 0 {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_duration(d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn valid_config(dir: &TempDir) -> Config {
        let mut config = Config::from_yaml("").unwrap();
        config.vault.address = "http://127.0.0.1:8200".to_string();
        config.vault.token = "root".to_string();
        config.migrations.directory = dir.path().to_path_buf();
        config
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_yaml("").unwrap();
        assert_eq!(config.vault.max_retries, 3);
        assert_eq!(config.vault.retry_delay, Duration::from_secs(1));
        assert!(config.migrations.concurrent_tasks);
        assert!(config.migrations.stop_on_error);
        assert_eq!(config.tracking.backend, TrackingBackend::Store);
        assert_eq!(config.tracking.path, "migrations/version");
        assert_eq!(config.log_level, "info");
        assert!(!config.dry_run);
    }

    #[test]
    fn test_parse_full_document() {
        let yaml = r#"
vault:
  address: "http://vault:8200"
  token: "s.abc"
  namespace: "team-a"
  max_retries: 5
  retry_delay: "250ms"
migrations:
  directory: "./migrations"
  concurrent_tasks: false
tracking:
  backend: file
  file: /var/lib/vault-migrations/cursor.yaml
log_level: debug
dry_run: true
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.vault.namespace, "team-a");
        assert_eq!(config.vault.max_retries, 5);
        assert_eq!(config.vault.retry_delay, Duration::from_millis(250));
        assert!(!config.migrations.concurrent_tasks);
        assert_eq!(config.tracking.backend, TrackingBackend::File);
        assert_eq!(
            config.cursor_file(),
            PathBuf::from("/var/lib/vault-migrations/cursor.yaml")
        );
        assert!(config.dry_run);
    }

    #[test]
    fn test_load_from_file_and_env_fallback() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"migrations:\n  directory: ./m\n").unwrap();
        file.flush().unwrap();

        let env = env_from(&[("VAULT_ADDR", "http://env:8200"), ("VAULT_TOKEN", "from-env")]);
        let config = Config::load_with_env(file.path(), env).unwrap();
        assert_eq!(config.vault.address, "http://env:8200");
        assert_eq!(config.vault.token, "from-env");
        assert_eq!(config.vault.namespace, "");
    }

    #[test]
    fn test_file_value_wins_over_env_fallback() {
        let mut config = Config::from_yaml("vault:\n  address: http://file:8200\n").unwrap();
        config.apply_env(env_from(&[("VAULT_ADDR", "http://env:8200")]));
        assert_eq!(config.vault.address, "http://file:8200");
    }

    #[test]
    fn test_interpolation() {
        let env = env_from(&[("VAULT_TOKEN", "s.xyz"), ("HOST", "vault.internal")]);
        assert_eq!(expand_env("${VAULT_TOKEN}", &env), "s.xyz");
        assert_eq!(expand_env("https://$HOST:8200", &env), "https://vault.internal:8200");
        assert_eq!(expand_env("${MISSING}", &env), "${MISSING}");
        assert_eq!(expand_env("$MISSING/x", &env), "$MISSING/x");
        assert_eq!(expand_env("cost: 5$", &env), "cost: 5$");
        assert_eq!(expand_env("${unterminated", &env), "${unterminated");
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = Config::load_from_file("/nonexistent/path/config.yaml");
        assert!(matches!(result, Err(MigrationError::Config(_))));
    }

    #[test]
    fn test_load_invalid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"vault: [unclosed").unwrap();
        file.flush().unwrap();
        let result = Config::load_from_file(file.path());
        assert!(matches!(result, Err(MigrationError::Config(_))));
    }

    #[test]
    fn test_validation_valid_config() {
        let dir = TempDir::new().unwrap();
        assert!(valid_config(&dir).validate().is_ok());
    }

    #[test]
    fn test_validation_requires_address_and_token() {
        let dir = TempDir::new().unwrap();
        let mut config = valid_config(&dir);
        config.vault.address.clear();
        assert!(config.validate().is_err());

        let mut config = valid_config(&dir);
        config.vault.token.clear();
        assert!(config.validate().is_err());

        let mut config = valid_config(&dir);
        config.vault.address = "vault:8200".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_missing_directory() {
        let dir = TempDir::new().unwrap();
        let mut config = valid_config(&dir);
        config.migrations.directory = dir.path().join("does-not-exist");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_offline_dry_run_with_file_backend_needs_no_vault() {
        let dir = TempDir::new().unwrap();
        let mut config = valid_config(&dir);
        config.vault.address.clear();
        config.vault.token.clear();
        config.tracking.backend = TrackingBackend::File;
        config.dry_run = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_continue_on_error() {
        let dir = TempDir::new().unwrap();
        let mut config = valid_config(&dir);
        config.migrations.stop_on_error = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_bad_log_level() {
        let dir = TempDir::new().unwrap();
        let mut config = valid_config(&dir);
        config.log_level = "verbose".to_string();
        assert!(config.validate().is_err());
        config.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_generate_validation_skips_vault() {
        let mut config = Config::from_yaml("migrations:\n  directory: ./m\n").unwrap();
        assert!(config.validate_for_generate().is_ok());
        config.migrations.directory = PathBuf::new();
        assert!(config.validate_for_generate().is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
        assert!(parse_duration("1h").is_err());
        assert!(parse_duration("fast").is_err());
    }

    #[test]
    fn test_oversized_duration_is_config_error() {
        assert!(parse_duration("99999999999999999999999s").is_err());

        let result = Config::from_yaml("vault:\n  retry_delay: \"99999999999999999999999s\"\n");
        assert!(matches!(result, Err(MigrationError::Config(_))));
    }
}
