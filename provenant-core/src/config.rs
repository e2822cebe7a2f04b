//! Configuration for the Provenant engine.
//!
//! Uses `figment` for layered configuration: defaults -> TOML file ->
//! `PROVENANT_`-prefixed environment variables. Configuration errors are
//! fatal at startup; everything downstream of a validated config is
//! fail-open.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Path of the SQLite audit store.
    pub storage_path: PathBuf,
    /// Token required by the audit query API when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audit_token: Option<String>,
    /// Hosts whose outbound calls are never recorded.
    #[serde(default)]
    pub ignored_hosts: HashSet<String>,
    /// Record SHARE events even when no tag matched.
    #[serde(default = "default_true")]
    pub record_unmatched_shares: bool,
    /// Maximum characters kept in value previews.
    #[serde(default = "default_preview_len")]
    pub preview_max_len: usize,
    /// Suspicious-sharing detector settings.
    #[serde(default)]
    pub suspicious: SuspiciousConfig,
    /// Ingress field name -> tagging rule.
    #[serde(default)]
    pub input_fields: HashMap<String, InputFieldConfig>,
    /// Entity type name -> tracked column map for the storage interceptor.
    #[serde(default)]
    pub tracked_models: HashMap<String, ModelConfig>,
}

fn default_true() -> bool {
    true
}

fn default_preview_len() -> usize {
    100
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_path: PathBuf::from("provenant.db"),
            audit_token: None,
            ignored_hosts: HashSet::new(),
            record_unmatched_shares: true,
            preview_max_len: default_preview_len(),
            suspicious: SuspiciousConfig::default(),
            input_fields: HashMap::new(),
            tracked_models: HashMap::new(),
        }
    }
}

/// Tagging rule for one ingress field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputFieldConfig {
    /// Data category (e.g. `contact.email`).
    pub category: String,
    /// Human-readable description carried onto tags.
    pub description: String,
    /// Whether this field holds personal data. Non-personal fields are
    /// still matchable but never re-registered from storage.
    #[serde(default = "default_true")]
    pub personal: bool,
}

/// Tracked columns of one persisted entity type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub fields: HashMap<String, FieldConfig>,
}

/// Tagging rule for one tracked model column.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfig {
    pub category: String,
    pub description: String,
    #[serde(default = "default_true")]
    pub personal: bool,
    /// Column on the same entity that identifies the owner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_attribute: Option<String>,
}

/// Settings for the suspicious-sharing detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspiciousConfig {
    /// Minimum events per (destination, owner-set) group to surface.
    pub threshold: usize,
    /// Trailing detection window in hours.
    pub window_hours: i64,
}

impl Default for SuspiciousConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            window_hours: 24,
        }
    }
}

impl EngineConfig {
    /// Load configuration: defaults, then the TOML file (when given), then
    /// `PROVENANT_*` environment variables. Validates before returning.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()));
        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("PROVENANT_").split("__"));

        let config: EngineConfig = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Startup validation. Malformed field maps and a missing storage path
    /// are fatal here so the interception paths never have to re-check.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingField {
                field: "storage_path".into(),
            });
        }
        for (name, rule) in &self.input_fields {
            if rule.category.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    message: format!("input field '{name}' has an empty category"),
                });
            }
        }
        for (model, model_config) in &self.tracked_models {
            if model_config.fields.is_empty() {
                return Err(ConfigError::Invalid {
                    message: format!("tracked model '{model}' has no fields"),
                });
            }
            for (field, rule) in &model_config.fields {
                if rule.category.trim().is_empty() {
                    return Err(ConfigError::Invalid {
                        message: format!("field '{model}.{field}' has an empty category"),
                    });
                }
            }
        }
        if self.suspicious.threshold == 0 {
            return Err(ConfigError::Invalid {
                message: "suspicious.threshold must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Tracked-column rule for `model.field`, if any.
    pub fn field_rule(&self, model: &str, field: &str) -> Option<&FieldConfig> {
        self.tracked_models.get(model)?.fields.get(field)
    }

    /// True when `host` is on the egress ignore-list.
    pub fn is_ignored_host(&self, host: &str) -> bool {
        self.ignored_hosts.contains(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn input_field(category: &str) -> InputFieldConfig {
        InputFieldConfig {
            category: category.into(),
            description: "test".into(),
            personal: true,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_empty_storage_path_is_fatal() {
        let config = EngineConfig {
            storage_path: PathBuf::new(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_empty_category_is_fatal() {
        let mut config = EngineConfig::default();
        config.input_fields.insert("email".into(), input_field(" "));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_model_without_fields_is_fatal() {
        let mut config = EngineConfig::default();
        config
            .tracked_models
            .insert("User".into(), ModelConfig::default());
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_missing_file_is_fatal() {
        let err = EngineConfig::load(Some(Path::new("/nonexistent/provenant.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_load_from_toml() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
storage_path = "/tmp/audit.db"
ignored_hosts = ["localhost"]

[input_fields.email]
category = "contact.email"
description = "Email address"

[tracked_models.User.fields.email]
category = "contact.email"
description = "User email"
owner_attribute = "email"

[suspicious]
threshold = 3
window_hours = 48
"#
        )
        .unwrap();

        let config = EngineConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.storage_path, PathBuf::from("/tmp/audit.db"));
        assert!(config.is_ignored_host("localhost"));
        assert_eq!(config.input_fields["email"].category, "contact.email");
        assert_eq!(
            config.field_rule("User", "email").unwrap().owner_attribute,
            Some("email".to_string())
        );
        assert_eq!(config.suspicious.threshold, 3);
        assert_eq!(config.suspicious.window_hours, 48);
    }

    #[test]
    fn test_field_rule_unknown_model() {
        let config = EngineConfig::default();
        assert!(config.field_rule("Ghost", "email").is_none());
    }
}
