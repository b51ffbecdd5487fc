//! Tools invokable through the structured tool-call envelope.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::{Error, Result};

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    async fn invoke(&self, args: Value) -> Result<Value>;
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<&'static str, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<T>(&mut self, tool: T)
    where
        T: Tool + 'static,
    {
        self.tools.insert(tool.name(), Arc::new(tool));
    }

    pub fn tool_names(&self) -> Vec<&'static str> {
        self.tools.keys().copied().collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub async fn dispatch(&self, name: &str, args: Value) -> Result<Value> {
        let tool = self
            .get(name)
            .ok_or_else(|| Error::Internal(format!("unknown tool: {name}")))?;
        tool.invoke(args).await
    }
}

/// Reports the current time.
pub struct TimeTool;

#[async_trait]
impl Tool for TimeTool {
    fn name(&self) -> &'static str {
        "time"
    }

    fn description(&self) -> &'static str {
        "Returns the current server time"
    }

    async fn invoke(&self, _args: Value) -> Result<Value> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| Error::Internal(format!("clock error: {e}")))?;
        Ok(json!({ "unix_seconds": now.as_secs() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn description(&self) -> &'static str {
            "Echoes its arguments"
        }

        async fn invoke(&self, args: Value) -> Result<Value> {
            Ok(args)
        }
    }

    #[tokio::test]
    async fn dispatch_routes_by_name() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool);
        registry.register(TimeTool);

        let out = registry
            .dispatch("echo", json!({"city": "北京"}))
            .await
            .expect("echo should run");
        assert_eq!(out["city"], "北京");
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let registry = ToolRegistry::new();
        assert!(registry.dispatch("weather", Value::Null).await.is_err());
    }
}
