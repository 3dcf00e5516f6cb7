//! Reference file-fixture driver.
//!
//! Resolves a request `{ "key": "INV-1" }` (or a bare string) to
//! `<connection>/<key>.json` and returns the parsed file. The tool's
//! `connection` is the fixture directory; when empty, the driver's default
//! root is used.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;

use crate::driver::ToolDriver;
use crate::error::TransportError;
use crate::tool::ToolConfig;

pub struct FileDriver {
    root: PathBuf,
}

impl FileDriver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn fixture_path(&self, tool: &ToolConfig, key: &str) -> Result<PathBuf, TransportError> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !key.contains("..");
        if !valid {
            return Err(TransportError::Rejected(format!("Invalid fixture key '{key}'")));
        }
        let root = if tool.connection.is_empty() {
            self.root.as_path()
        } else {
            Path::new(&tool.connection)
        };
        Ok(root.join(format!("{key}.json")))
    }
}

fn request_key(request: &Value) -> Option<String> {
    match request {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => match map.get("key") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        },
        _ => None,
    }
}

#[async_trait]
impl ToolDriver for FileDriver {
    async fn call(&self, tool: &ToolConfig, request: &Value) -> Result<Value, TransportError> {
        let key = request_key(request)
            .ok_or_else(|| TransportError::Rejected("File request needs a 'key'".to_string()))?;
        let path = self.fixture_path(tool, &key)?;

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(TransportError::Rejected(format!("No fixture for key '{key}'")));
            }
            Err(e) => return Err(TransportError::Unavailable(e.to_string())),
        };

        tracing::debug!(tool = %tool.name, path = %path.display(), "Fixture loaded");

        serde_json::from_slice(&bytes).map_err(|e| {
            TransportError::Rejected(format!("Fixture '{}' is not valid JSON: {e}", path.display()))
        })
    }
}
