//! Publishing recorded chains to a catalog server.

use super::metadata::ChainMetadata;
use crate::error::{ChainError, Result};
use reqwest::blocking::{multipart::Form, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use tracing::{info, warn};

/// Header carrying the upload key.
pub const API_KEY_HEADER: &str = "GERRYCHAIN-API-KEY";

/// Environment variable read by [`UploadConfig::from_env`].
pub const API_KEY_ENV: &str = "GERRYCHAIN_API_KEY";

/// Form part holding the archive.
const ARCHIVE_PART: &str = "pcompress";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Endpoint accepting multipart uploads.
    pub url: String,
    pub api_key: Option<String>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:5000".to_string(),
            api_key: None,
        }
    }
}

impl UploadConfig {
    /// Default endpoint with the key taken from the environment.
    pub fn from_env() -> Self {
        Self {
            api_key: std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty()),
            ..Self::default()
        }
    }
}

pub struct Uploader {
    config: UploadConfig,
    client: Client,
}

impl Uploader {
    pub fn new(config: UploadConfig) -> Result<Self> {
        let client = Client::builder().build()?;
        Ok(Self { config, client })
    }

    /// Upload `archive` with its metadata; returns the identifier the server
    /// assigned.
    pub fn upload(&self, archive: &Path, metadata: &ChainMetadata) -> Result<String> {
        let mut form = Form::new();
        for (name, value) in metadata_fields(metadata)? {
            form = form.text(name, value);
        }
        let form = form.file(ARCHIVE_PART, archive)?;

        let mut request = self.client.post(&self.config.url).multipart(form);
        if let Some(key) = &self.config.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send()?;
        let status = response.status().as_u16();
        let body = response.text()?;
        let identifier = interpret_upload_response(status, &body)?;
        info!(identifier = %identifier, archive = %archive.display(), "chain uploaded");
        Ok(identifier)
    }
}

/// Flatten metadata into form fields. Strings are sent as is, everything
/// else as JSON text.
pub fn metadata_fields(metadata: &ChainMetadata) -> Result<Vec<(String, String)>> {
    let Value::Object(fields) = serde_json::to_value(metadata)? else {
        return Err(ChainError::Serialization(
            "chain metadata did not serialize to an object".into(),
        ));
    };
    Ok(fields
        .into_iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(name, value)| match value {
            Value::String(s) => (name, s),
            other => (name, other.to_string()),
        })
        .collect())
}

/// Map an upload response to the assigned identifier.
pub fn interpret_upload_response(status: u16, body: &str) -> Result<String> {
    match status {
        200 => Ok(body.trim().to_string()),
        401 => {
            warn!("upload rejected: access denied");
            Err(ChainError::Unauthorized)
        }
        status => {
            warn!(status, "upload rejected by server");
            Err(ChainError::UploadRejected { status })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn test_response_mapping() {
        assert_eq!(interpret_upload_response(200, "77f48725\n").unwrap(), "77f48725");

        let denied = interpret_upload_response(401, "").unwrap_err();
        assert!(matches!(denied, ChainError::Unauthorized));

        let failed = interpret_upload_response(500, "boom").unwrap_err();
        assert!(matches!(failed, ChainError::UploadRejected { status: 500 }));
        assert_eq!(failed.kind(), ErrorKind::Io);
    }

    #[test]
    fn test_metadata_fields() {
        let metadata: ChainMetadata = serde_json::from_value(json!({
            "identifier": "run",
            "filename": "/data/run.chain",
            "start_timestamp": 10,
            "end_timestamp": 20,
            "graph_hash": "ab",
            "user": "mggg",
            "steps": 5
        }))
        .unwrap();

        let fields = metadata_fields(&metadata).unwrap();
        let lookup = |name: &str| {
            fields
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str())
        };
        assert_eq!(lookup("user"), Some("mggg"));
        assert_eq!(lookup("start_timestamp"), Some("10"));
        assert_eq!(lookup("steps"), Some("5"));
        assert_eq!(lookup("git_commit"), None);
    }

    #[test]
    fn test_default_endpoint() {
        let config = UploadConfig::default();
        assert_eq!(config.url, "http://127.0.0.1:5000");
        assert!(config.api_key.is_none());
        Uploader::new(config).unwrap();
    }
}
