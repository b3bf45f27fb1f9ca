//! Tool Registry: register, describe, validate, and invoke named tools with
//! timeouts and fallbacks (spec §4.D). Grounded on the teacher's `Tool`
//! trait (`tools/trait.rs`) and `AggregateToolSource`'s register/delegate
//! pattern (`tool_source/web_tools_source.rs`); `ToolCallContext` plays the
//! same per-call-context role as the teacher's.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use jsonschema::Validator;
use serde_json::Value;

use crate::error::ToolError;
use crate::model::{SideEffects, ToolDescriptor};

/// Per-call context threaded into a tool invocation (trace id, budget).
/// Mirrors the role of the teacher's `ToolCallContext`.
#[derive(Debug, Clone, Default)]
pub struct ToolCallContext {
    pub trace_id: String,
    pub query_id: String,
}

/// A registered tool implementation. `spec()` declares the immutable
/// descriptor used at registration and for planner docs; `call()` executes
/// with already-validated parameters.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn spec(&self) -> ToolDescriptor;
    async fn call(&self, params: Value, ctx: &ToolCallContext) -> Result<Value, ToolError>;
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    descriptor: ToolDescriptor,
    validator: Validator,
}

/// Aggregate registry: `Register`/`Describe`/`Invoke` surface from spec
/// §4.D. Every tool behaves as validate -> execute with timeout -> validate
/// result -> return structured result or typed error; the registry never
/// swallows errors.
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: DashMap::new() }
    }

    /// Rejects if a tool with this name already exists, or its declared
    /// schema does not compile.
    pub fn register(&self, tool: Arc<dyn Tool>) -> Result<(), ToolError> {
        let descriptor = tool.spec();
        if self.tools.contains_key(&descriptor.name) {
            return Err(ToolError::SchemaInvalid {
                tool: descriptor.name.clone(),
                reason: "duplicate tool name".to_string(),
            });
        }
        let validator = jsonschema::validator_for(&descriptor.parameter_schema).map_err(|e| ToolError::SchemaInvalid {
            tool: descriptor.name.clone(),
            reason: e.to_string(),
        })?;
        self.tools.insert(
            descriptor.name.clone(),
            RegisteredTool { tool, descriptor, validator },
        );
        Ok(())
    }

    pub fn describe(&self, name: &str) -> Result<ToolDescriptor, ToolError> {
        self.tools
            .get(name)
            .map(|entry| entry.descriptor.clone())
            .ok_or_else(|| ToolError::NotFound(name.to_string()))
    }

    pub fn list(&self) -> Vec<ToolDescriptor> {
        self.tools.iter().map(|entry| entry.descriptor.clone()).collect()
    }

    /// Validates params against the declared schema, enforces the declared
    /// timeout, and on timeout or error invokes the declared fallback tool
    /// if one is registered. Never swallows an error: every path returns
    /// `Ok` with a structured result or a typed [`ToolError`].
    pub async fn invoke(&self, name: &str, params: Value, ctx: &ToolCallContext) -> Result<Value, ToolError> {
        let entry = self.tools.get(name).ok_or_else(|| ToolError::NotFound(name.to_string()))?;
        if !entry.validator.is_valid(&params) {
            return Err(ToolError::SchemaInvalid {
                tool: name.to_string(),
                reason: "params do not satisfy declared schema".to_string(),
            });
        }
        let tool = entry.tool.clone();
        let descriptor = entry.descriptor.clone();
        drop(entry);

        let timeout = Duration::from_millis(descriptor.timeout_ms);
        let result = tokio::time::timeout(timeout, tool.call(params.clone(), ctx)).await;

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => self.fallback_or_err(&descriptor, params, ctx, err).await,
            Err(_) => {
                self.fallback_or_err(&descriptor, params, ctx, ToolError::Timeout(name.to_string())).await
            }
        }
    }

    async fn fallback_or_err(
        &self,
        descriptor: &ToolDescriptor,
        params: Value,
        ctx: &ToolCallContext,
        original: ToolError,
    ) -> Result<Value, ToolError> {
        if let Some(fallback_name) = &descriptor.fallback {
            if let Some(entry) = self.tools.get(fallback_name) {
                let fallback = entry.tool.clone();
                drop(entry);
                if let Ok(value) = fallback.call(params, ctx).await {
                    return Ok(value);
                }
            }
        }
        Err(original)
    }
}

/// Reference HTTP fetch tool: side-effect class `read`, not idempotent-by-
/// default assumption overridden per-instance. Grounded on the teacher's
/// `WebFetcherTool` (`tool_source/web_tools_source.rs`) minus MCP plumbing.
pub struct HttpFetchTool {
    client: reqwest::Client,
    timeout_ms: u64,
}

impl HttpFetchTool {
    pub fn new(timeout_ms: u64) -> Self {
        Self { client: reqwest::Client::new(), timeout_ms }
    }
}

#[async_trait]
impl Tool for HttpFetchTool {
    fn name(&self) -> &str {
        "web_fetcher"
    }

    fn spec(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: "web_fetcher".to_string(),
            description: "Fetches a URL over HTTP GET and returns the body text.".to_string(),
            parameter_schema: serde_json::json!({
                "type": "object",
                "properties": { "url": { "type": "string" } },
                "required": ["url"]
            }),
            timeout_ms: self.timeout_ms,
            fallback: None,
            idempotent: true,
            side_effects: SideEffects::Read,
        }
    }

    async fn call(&self, params: Value, _ctx: &ToolCallContext) -> Result<Value, ToolError> {
        let url = params
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ToolError::SchemaInvalid { tool: self.name().to_string(), reason: "missing url".into() })?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ToolError::Failed { tool: self.name().to_string(), reason: e.to_string() })?;
        let text = response
            .text()
            .await
            .map_err(|e| ToolError::Failed { tool: self.name().to_string(), reason: e.to_string() })?;
        Ok(serde_json::json!({ "body": text }))
    }
}

/// Reference in-process tool for registration tests and the planner's
/// deterministic `(domain, intent) -> tool` selection; returns its input
/// params unchanged as `output`.
pub struct EchoTool {
    name: String,
    timeout_ms: u64,
}

impl EchoTool {
    pub fn new(name: impl Into<String>, timeout_ms: u64) -> Self {
        Self { name: name.into(), timeout_ms }
    }
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name.clone(),
            description: "Echoes its input params back as output.".to_string(),
            parameter_schema: serde_json::json!({ "type": "object" }),
            timeout_ms: self.timeout_ms,
            fallback: None,
            idempotent: true,
            side_effects: SideEffects::None,
        }
    }

    async fn call(&self, params: Value, _ctx: &ToolCallContext) -> Result<Value, ToolError> {
        Ok(params)
    }
}

/// A tool that always sleeps past its declared timeout; used by tests
/// exercising the Plan Executor's timeout/retry path (spec §8 S3).
pub struct SlowTool {
    name: String,
    timeout_ms: u64,
    sleep_ms: u64,
}

impl SlowTool {
    pub fn new(name: impl Into<String>, timeout_ms: u64, sleep_ms: u64) -> Self {
        Self { name: name.into(), timeout_ms, sleep_ms }
    }
}

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn spec(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name.clone(),
            description: "Always exceeds its declared timeout (test fixture).".to_string(),
            parameter_schema: serde_json::json!({ "type": "object" }),
            timeout_ms: self.timeout_ms,
            fallback: None,
            idempotent: true,
            side_effects: SideEffects::None,
        }
    }

    async fn call(&self, _params: Value, _ctx: &ToolCallContext) -> Result<Value, ToolError> {
        tokio::time::sleep(Duration::from_millis(self.sleep_ms)).await;
        Ok(serde_json::json!({}))
    }
}
