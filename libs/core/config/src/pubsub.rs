use crate::{env_optional, ConfigError, FromEnv};
use std::path::PathBuf;

/// How the transport client obtains credentials.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CredentialsMethod {
    /// Ambient credentials (metadata server / `GOOGLE_OAUTH_ACCESS_TOKEN`).
    ApplicationDefault,
    /// Service account JSON key file.
    KeyFile(PathBuf),
}

/// Connection settings for the managed pub/sub service.
#[derive(Clone, Debug)]
pub struct PubSubConnectionConfig {
    pub project_id: String,
    pub credentials: CredentialsMethod,
    /// `host:port` of a local emulator; disables authentication when set.
    pub emulator_host: Option<String>,
}

impl PubSubConnectionConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            credentials: CredentialsMethod::ApplicationDefault,
            emulator_host: None,
        }
    }

    pub fn with_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials = CredentialsMethod::KeyFile(path.into());
        self
    }

    pub fn with_emulator(mut self, host: impl Into<String>) -> Self {
        self.emulator_host = Some(host.into());
        self
    }

    pub fn uses_emulator(&self) -> bool {
        self.emulator_host.is_some()
    }

    /// Check the settings that can be checked without talking to the service.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.project_id.trim().is_empty() {
            return Err(ConfigError::Invalid("project id must not be empty".into()));
        }

        if let CredentialsMethod::KeyFile(path) = &self.credentials
            && !self.uses_emulator()
            && !path.is_file()
        {
            return Err(ConfigError::Invalid(format!(
                "key file '{}' does not exist or is not readable",
                path.display()
            )));
        }

        Ok(())
    }
}

impl FromEnv for PubSubConnectionConfig {
    /// Project id comes from `PUBSUB_PROJECT_ID`, falling back to
    /// `GOOGLE_CLOUD_PROJECT`. `PUBSUB_AUTH_METHOD=key_file` selects the key
    /// file named by `PUBSUB_KEY_FILE` or `GOOGLE_APPLICATION_CREDENTIALS`.
    fn from_env() -> Result<Self, ConfigError> {
        let project_id = env_optional("PUBSUB_PROJECT_ID")
            .or_else(|| env_optional("GOOGLE_CLOUD_PROJECT"))
            .ok_or_else(|| ConfigError::MissingEnvVar("PUBSUB_PROJECT_ID".to_string()))?;

        let key_file =
            env_optional("PUBSUB_KEY_FILE").or_else(|| env_optional("GOOGLE_APPLICATION_CREDENTIALS"));

        let method = env_optional("PUBSUB_AUTH_METHOD").unwrap_or_else(|| {
            if key_file.is_some() {
                "key_file".to_string()
            } else {
                "application_default".to_string()
            }
        });

        let credentials = match method.to_ascii_lowercase().as_str() {
            "key_file" | "keyfile" | "service_account" => {
                let path = key_file
                    .ok_or_else(|| ConfigError::MissingEnvVar("PUBSUB_KEY_FILE".to_string()))?;
                CredentialsMethod::KeyFile(PathBuf::from(path))
            }
            "application_default" | "adc" => CredentialsMethod::ApplicationDefault,
            other => {
                return Err(ConfigError::ParseError {
                    key: "PUBSUB_AUTH_METHOD".to_string(),
                    details: format!("unknown auth method '{}'", other),
                });
            }
        };

        Ok(Self {
            project_id,
            credentials,
            emulator_host: env_optional("PUBSUB_EMULATOR_HOST"),
        })
    }
}
