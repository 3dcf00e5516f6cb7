//! Driver contract and registry.
//!
//! A [`ToolDriver`] performs one raw call against an external system. The
//! orchestrator treats every kind (http, sql, rpa, file, cache) through this
//! one shape; concrete drivers are supplied at configuration time.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::TransportError;
use crate::tool::{ToolConfig, ToolKind};

#[async_trait]
pub trait ToolDriver: Send + Sync {
    /// Perform a single attempt. Retries, timeouts and caching are the
    /// orchestrator's job.
    async fn call(&self, tool: &ToolConfig, request: &Value) -> Result<Value, TransportError>;
}

/// Drivers keyed by tool kind, with optional per-tool-name overrides.
#[derive(Default, Clone)]
pub struct DriverRegistry {
    by_kind: HashMap<ToolKind, Arc<dyn ToolDriver>>,
    by_name: HashMap<String, Arc<dyn ToolDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the driver used for every tool of `kind`.
    pub fn register_kind(&mut self, kind: ToolKind, driver: Arc<dyn ToolDriver>) -> &mut Self {
        self.by_kind.insert(kind, driver);
        self
    }

    /// Register a driver for one tool name, taking precedence over its kind.
    pub fn register_tool(&mut self, name: impl Into<String>, driver: Arc<dyn ToolDriver>) -> &mut Self {
        self.by_name.insert(name.into(), driver);
        self
    }

    pub fn resolve(&self, tool: &ToolConfig) -> Option<Arc<dyn ToolDriver>> {
        self.by_name
            .get(&tool.name)
            .or_else(|| self.by_kind.get(&tool.kind))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed(Value);

    #[async_trait]
    impl ToolDriver for Fixed {
        async fn call(&self, _tool: &ToolConfig, _request: &Value) -> Result<Value, TransportError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn name_override_wins_over_kind() {
        let mut registry = DriverRegistry::new();
        registry
            .register_kind(ToolKind::Http, Arc::new(Fixed(json!("kind"))))
            .register_tool("erp", Arc::new(Fixed(json!("name"))));

        let erp = ToolConfig::new("erp", ToolKind::Http);
        let crm = ToolConfig::new("crm", ToolKind::Http);
        let db = ToolConfig::new("db", ToolKind::Sql);

        let driver = registry.resolve(&erp).unwrap();
        assert_eq!(driver.call(&erp, &json!({})).await.unwrap(), json!("name"));
        let driver = registry.resolve(&crm).unwrap();
        assert_eq!(driver.call(&crm, &json!({})).await.unwrap(), json!("kind"));
        assert!(registry.resolve(&db).is_none());
    }
}
