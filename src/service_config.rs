use crate::error::{HarnessError, Result};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Where the service writes its configuration, relative to its working directory.
pub const CONFIG_RELATIVE_PATH: &str = "tshock/config.json";

const REST_ENABLED: &str = "RestApiEnabled";
const REST_PORT: &str = "RestApiPort";
const TOKEN_AUTH: &str = "EnableTokenEndpointAuthentication";
const REST_TOKENS: &str = "ApplicationRestTokens";

/// Credential the harness registers with the service's REST API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestToken {
    pub token: String,
    pub username: String,
    pub group: String,
}

impl Default for RestToken {
    fn default() -> Self {
        Self {
            token: "TESTTOKEN".to_string(),
            username: "Server".to_string(),
            group: "superadmin".to_string(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct TokenEntry<'a> {
    username: &'a str,
    user_group_name: &'a str,
}

/// The service's JSON configuration document.
///
/// Unknown fields are kept as-is; only the REST fields are touched.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    path: PathBuf,
    document: Map<String, Value>,
}

impl ServiceConfig {
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| HarnessError::file(&path, e))?;
        let document = match serde_json::from_str(&text)? {
            Value::Object(map) => map,
            other => {
                return Err(HarnessError::Precondition(format!(
                    "{} holds {} instead of an object",
                    path.display(),
                    json_kind(&other)
                )))
            }
        };
        debug!("loaded service config {}", path.display());
        Ok(Self { path, document })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.document.get(key)
    }

    /// Turns on the REST API and registers `token` with it.
    ///
    /// Fails fast if the document has no REST toggle at all; that means the
    /// service is not the version this harness understands.
    pub fn enable_rest_api(&mut self, token: &RestToken) -> Result<()> {
        if !self.document.contains_key(REST_ENABLED) {
            return Err(HarnessError::Precondition(format!(
                "{} has no {} field",
                self.path.display(),
                REST_ENABLED
            )));
        }

        self.document.insert(REST_ENABLED.to_string(), Value::Bool(true));
        self.document.insert(TOKEN_AUTH.to_string(), Value::Bool(true));

        let entry = TokenEntry {
            username: &token.username,
            user_group_name: &token.group,
        };
        let mut tokens = Map::new();
        tokens.insert(token.token.clone(), serde_json::to_value(entry)?);
        self.document.insert(REST_TOKENS.to_string(), Value::Object(tokens));
        Ok(())
    }

    pub fn set_rest_port(&mut self, port: u16) {
        self.document.insert(REST_PORT.to_string(), Value::from(port));
    }

    pub fn rest_port(&self) -> Result<u16> {
        self.document
            .get(REST_PORT)
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok())
            .ok_or_else(|| {
                HarnessError::Precondition(format!(
                    "{} has no usable {} field",
                    self.path.display(),
                    REST_PORT
                ))
            })
    }

    pub fn save(&self) -> Result<()> {
        let text = serde_json::to_string_pretty(&self.document)?;
        std::fs::write(&self.path, text).map_err(|e| HarnessError::file(&self.path, e))?;
        info!("wrote service config {}", self.path.display());
        Ok(())
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn write_config(dir: &Path, value: Value) -> PathBuf {
        let path = dir.join("config.json");
        std::fs::write(&path, value.to_string()).unwrap();
        path
    }

    #[test]
    fn test_enable_rest_api_patches_fields() {
        let dir = tempdir().unwrap();
        let path = write_config(
            dir.path(),
            json!({
                "RestApiEnabled": false,
                "RestApiPort": 7878,
                "ServerName": "kept"
            }),
        );

        let mut config = ServiceConfig::load(&path).unwrap();
        config.enable_rest_api(&RestToken::default()).unwrap();
        config.save().unwrap();

        let written: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["RestApiEnabled"], json!(true));
        assert_eq!(written["EnableTokenEndpointAuthentication"], json!(true));
        assert_eq!(
            written["ApplicationRestTokens"],
            json!({"TESTTOKEN": {"Username": "Server", "UserGroupName": "superadmin"}})
        );
        assert_eq!(written["ServerName"], json!("kept"));
    }

    #[test]
    fn test_missing_rest_toggle_is_a_precondition_failure() {
        let dir = tempdir().unwrap();
        let path = write_config(dir.path(), json!({"RestApiPort": 7878}));

        let mut config = ServiceConfig::load(&path).unwrap();
        let err = config.enable_rest_api(&RestToken::default()).unwrap_err();
        assert!(matches!(err, HarnessError::Precondition(_)));
    }

    #[test]
    fn test_rest_port_override() {
        let dir = tempdir().unwrap();
        let path = write_config(dir.path(), json!({"RestApiEnabled": false}));

        let mut config = ServiceConfig::load(&path).unwrap();
        assert!(config.rest_port().is_err());
        config.set_rest_port(18080);
        assert_eq!(config.rest_port().unwrap(), 18080);
    }

    #[test]
    fn test_non_object_document_is_rejected() {
        let dir = tempdir().unwrap();
        let path = write_config(dir.path(), json!([1, 2, 3]));
        assert!(matches!(
            ServiceConfig::load(&path),
            Err(HarnessError::Precondition(_))
        ));
    }
}
