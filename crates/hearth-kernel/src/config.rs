//! Hierarchical configuration.
//!
//! Configuration is a YAML file parsed with `serde_yaml` into a tree of
//! [`ConfigSection`]s: nested mappings become sections, scalar values stay
//! accessible through typed getters.  Modules receive their own section
//! (keyed by module name) verbatim and interpret it however they like.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{KernelError, Result};

/// One level of the configuration tree.
#[derive(Debug, Clone, Default)]
pub struct ConfigSection {
    values: HashMap<String, serde_yaml::Value>,
    sections: HashMap<String, ConfigSection>,
}

impl ConfigSection {
    fn from_mapping(mapping: &serde_yaml::Mapping) -> Self {
        let mut section = ConfigSection::default();
        for (key, value) in mapping {
            let Some(key) = key.as_str() else {
                continue;
            };
            match value {
                serde_yaml::Value::Mapping(nested) => {
                    section
                        .sections
                        .insert(key.to_string(), Self::from_mapping(nested));
                }
                other => {
                    section.values.insert(key.to_string(), other.clone());
                }
            }
        }
        section
    }

    /// Look up a nested section.
    pub fn section(&self, name: &str) -> Option<&ConfigSection> {
        self.sections.get(name)
    }

    /// Whether a scalar value exists under `key`.
    pub fn has(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(serde_yaml::Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(serde_yaml::Value::as_bool)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(serde_yaml::Value::as_i64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(serde_yaml::Value::as_f64)
    }

    pub fn get_str_or(&self, key: &str, default: &str) -> String {
        self.get_str(key).unwrap_or(default).to_string()
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get_bool(key).unwrap_or(default)
    }

    pub fn get_i64_or(&self, key: &str, default: i64) -> i64 {
        self.get_i64(key).unwrap_or(default)
    }

    pub fn get_f64_or(&self, key: &str, default: f64) -> f64 {
        self.get_f64(key).unwrap_or(default)
    }
}

/// Root configuration loaded from a YAML file.
#[derive(Debug, Clone, Default)]
pub struct Config {
    root: ConfigSection,
}

impl Config {
    /// Load configuration from a YAML file.
    ///
    /// A missing or unparseable file is a `Config`-category error and is
    /// fatal to kernel start.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|source| KernelError::ConfigOpen {
            path: path.to_path_buf(),
            source,
        })?;

        tracing::info!(path = %path.display(), "loading configuration");

        let value: serde_yaml::Value =
            serde_yaml::from_str(&raw).map_err(|source| KernelError::ConfigParse {
                path: path.to_path_buf(),
                source,
            })?;

        let root = match value {
            serde_yaml::Value::Mapping(mapping) => ConfigSection::from_mapping(&mapping),
            // An empty file parses to null; treat it as an empty config.
            serde_yaml::Value::Null => ConfigSection::default(),
            _ => {
                return Err(KernelError::ConfigNotAMapping {
                    path: path.to_path_buf(),
                })
            }
        };

        Ok(Self { root })
    }

    /// Parse configuration from an in-memory YAML string.
    pub fn from_str(raw: &str) -> Result<Self> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(raw).map_err(|source| KernelError::ConfigParse {
                path: "<inline>".into(),
                source,
            })?;
        let root = match value {
            serde_yaml::Value::Mapping(mapping) => ConfigSection::from_mapping(&mapping),
            serde_yaml::Value::Null => ConfigSection::default(),
            _ => {
                return Err(KernelError::ConfigNotAMapping {
                    path: "<inline>".into(),
                })
            }
        };
        Ok(Self { root })
    }

    /// The root section.
    pub fn root(&self) -> &ConfigSection {
        &self.root
    }

    /// A named top-level section.
    pub fn section(&self, name: &str) -> Option<&ConfigSection> {
        self.root.section(name)
    }
}
