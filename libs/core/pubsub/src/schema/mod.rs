//! Named JSON schemas for payload validation.
//!
//! Schemas are registered by name from an inline document, a file or a URL,
//! loaded on first use and cached for the life of the validator. A schema
//! that cannot be loaded is a configuration problem and surfaces as
//! [`PubSubError::Configuration`], never as a validation failure.

mod keywords;

use crate::error::{PubSubError, Result, ValidationErrors};
use keywords::CompiledSchema;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, instrument};

/// Where a schema document comes from.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchemaSource {
    Inline(Value),
    File(PathBuf),
    Url(String),
}

impl SchemaSource {
    fn describe(&self) -> String {
        match self {
            SchemaSource::Inline(_) => "inline definition".to_string(),
            SchemaSource::File(path) => format!("file '{}'", path.display()),
            SchemaSource::Url(url) => format!("url '{}'", url),
        }
    }
}

/// Validates payloads against named schemas.
pub struct SchemaValidator {
    strict_mode: bool,
    sources: RwLock<HashMap<String, SchemaSource>>,
    compiled: RwLock<HashMap<String, Arc<CompiledSchema>>>,
    http: reqwest::Client,
}

impl std::fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaValidator")
            .field("strict_mode", &self.strict_mode)
            .finish_non_exhaustive()
    }
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self::new(false)
    }
}

impl SchemaValidator {
    pub fn new(strict_mode: bool) -> Self {
        Self {
            strict_mode,
            sources: RwLock::new(HashMap::new()),
            compiled: RwLock::new(HashMap::new()),
            http: reqwest::Client::new(),
        }
    }

    /// Validator preloaded with the sources from configuration.
    pub fn from_config(config: &crate::config::SchemaConfig) -> Self {
        let validator = Self::new(config.strict_mode);
        for (name, source) in &config.schemas {
            validator.register_source(name.clone(), source.clone());
        }
        validator
    }

    pub fn strict_mode(&self) -> bool {
        self.strict_mode
    }

    /// Register a schema document directly. Replaces any earlier schema of
    /// the same name.
    pub fn register_schema(&self, name: impl Into<String>, definition: Value) -> Result<()> {
        let name = name.into();
        let compiled = CompiledSchema::compile(definition).map_err(|e| {
            PubSubError::configuration(format!("invalid schema '{}': {}", name, e))
        })?;
        write(&self.compiled).insert(name, Arc::new(compiled));
        Ok(())
    }

    /// Register a schema generated from a Rust type.
    pub fn register_type<T: JsonSchema>(&self, name: impl Into<String>) -> Result<()> {
        let schema = schemars::schema_for!(T);
        self.register_schema(name, serde_json::to_value(schema)?)
    }

    /// Register a lazily loaded source. Loading happens on first use.
    pub fn register_source(&self, name: impl Into<String>, source: SchemaSource) {
        let name = name.into();
        write(&self.compiled).remove(&name);
        write(&self.sources).insert(name, source);
    }

    pub fn has_schema(&self, name: &str) -> bool {
        read(&self.compiled).contains_key(name) || read(&self.sources).contains_key(name)
    }

    /// Fail with `SchemaValidation` when `data` violates the schema.
    #[instrument(skip(self, data))]
    pub async fn validate(&self, data: &Value, name: &str) -> Result<()> {
        match self.get_errors(data, name).await? {
            None => Ok(()),
            Some(errors) => Err(PubSubError::SchemaValidation {
                schema: name.to_string(),
                errors,
            }),
        }
    }

    pub async fn is_valid(&self, data: &Value, name: &str) -> Result<bool> {
        Ok(self.get_errors(data, name).await?.is_none())
    }

    /// Property-keyed violations, or `None` when the payload conforms (or the
    /// schema is unknown outside strict mode).
    pub async fn get_errors(&self, data: &Value, name: &str) -> Result<Option<ValidationErrors>> {
        let Some(schema) = self.resolve(name).await? else {
            if self.strict_mode {
                let mut errors = ValidationErrors::new();
                errors.add("$", format!("schema '{}' is not registered", name));
                return Ok(Some(errors));
            }
            debug!(schema = %name, "Schema not registered, skipping validation");
            return Ok(None);
        };

        let errors = schema.validate(data);
        Ok((!errors.is_empty()).then_some(errors))
    }

    /// Load (once) and return the compiled schema for `name`.
    async fn resolve(&self, name: &str) -> Result<Option<Arc<CompiledSchema>>> {
        if let Some(schema) = read(&self.compiled).get(name) {
            return Ok(Some(schema.clone()));
        }
        let Some(source) = read(&self.sources).get(name).cloned() else {
            return Ok(None);
        };

        let document = self.load(name, &source).await?;
        let compiled = CompiledSchema::compile(document).map_err(|e| {
            PubSubError::configuration(format!(
                "invalid schema '{}' from {}: {}",
                name,
                source.describe(),
                e
            ))
        })?;
        let compiled = Arc::new(compiled);
        write(&self.compiled).insert(name.to_string(), compiled.clone());
        info!(schema = %name, source = %source.describe(), "Schema loaded");
        Ok(Some(compiled))
    }

    async fn load(&self, name: &str, source: &SchemaSource) -> Result<Value> {
        let fail = |reason: String| {
            PubSubError::configuration(format!(
                "cannot load schema '{}' from {}: {}",
                name,
                source.describe(),
                reason
            ))
        };

        match source {
            SchemaSource::Inline(document) => Ok(document.clone()),
            SchemaSource::File(path) => {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| fail(e.to_string()))?;
                serde_json::from_str(&raw).map_err(|e| fail(e.to_string()))
            }
            SchemaSource::Url(url) => {
                let response = self
                    .http
                    .get(url)
                    .send()
                    .await
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| fail(e.to_string()))?;
                response.json::<Value>().await.map_err(|e| fail(e.to_string()))
            }
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
