use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use bifrost_common::{BifrostError, BifrostResult, ErrorKind};
use bifrost_provider_core::{RequestContext, ToolDefinition, ToolOptions};

/// In-process tool implementation. Receives the parsed argument object and
/// the request context (deadline, cancellation, trace ids).
pub type ToolHandler =
    Arc<dyn Fn(Value, RequestContext) -> BoxFuture<'static, BifrostResult<Value>> + Send + Sync>;

/// Global MCP settings. Allow-lists are `None` = everything, `Some` = only
/// the named tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools_to_execute: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools_to_auto_execute: Option<BTreeSet<String>>,
    #[serde(default = "defaults::tool_timeout", with = "duration_millis")]
    pub tool_execution_timeout: Duration,
    #[serde(default = "defaults::max_agent_depth")]
    pub max_agent_depth: u32,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            tools_to_execute: None,
            tools_to_auto_execute: None,
            tool_execution_timeout: defaults::tool_timeout(),
            max_agent_depth: defaults::max_agent_depth(),
        }
    }
}

mod defaults {
    use std::time::Duration;

    pub fn tool_timeout() -> Duration {
        Duration::from_secs(30)
    }

    pub fn max_agent_depth() -> u32 {
        10
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(de)?))
    }
}

/// Per-client settings; a client is one tool source (an MCP server
/// connection or an in-process registration batch).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpClientConfig {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools_to_execute: Option<BTreeSet<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools_to_auto_execute: Option<BTreeSet<String>>,
}

impl McpClientConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), tools_to_execute: None, tools_to_auto_execute: None }
    }
}

struct RegisteredTool {
    definition: ToolDefinition,
    handler: ToolHandler,
    client: String,
    enabled: bool,
    auto_execute: bool,
}

/// Registry of tools across clients. Lookups take atomic snapshots; admin
/// mutations clone-and-swap, never edit in place.
///
/// A tool is available iff all four levels allow it: the global allow-list,
/// its client's allow-list, the tool's own enabled flag, and the
/// per-request allow-list. Auto-execution is evaluated the same way over
/// the auto lists and the tool's `auto_execute` flag.
pub struct McpToolManager {
    config: McpConfig,
    clients: ArcSwap<HashMap<String, McpClientConfig>>,
    tools: ArcSwap<HashMap<String, Arc<RegisteredTool>>>,
}

impl McpToolManager {
    pub fn new(config: McpConfig) -> Self {
        Self {
            config,
            clients: ArcSwap::from_pointee(HashMap::new()),
            tools: ArcSwap::from_pointee(HashMap::new()),
        }
    }

    pub fn config(&self) -> &McpConfig {
        &self.config
    }

    pub fn add_client(&self, client: McpClientConfig) {
        let mut clients = self.clients.load().as_ref().clone();
        clients.insert(client.name.clone(), client);
        self.clients.store(Arc::new(clients));
    }

    /// Removes a client and every tool it registered.
    pub fn remove_client(&self, name: &str) {
        let mut clients = self.clients.load().as_ref().clone();
        if clients.remove(name).is_none() {
            return;
        }
        self.clients.store(Arc::new(clients));

        let mut tools = self.tools.load().as_ref().clone();
        tools.retain(|_, tool| tool.client != name);
        self.tools.store(Arc::new(tools));
    }

    pub fn register_tool(
        &self,
        client: &str,
        definition: ToolDefinition,
        handler: ToolHandler,
        auto_execute: bool,
    ) {
        let mut tools = self.tools.load().as_ref().clone();
        tools.insert(
            definition.name.clone(),
            Arc::new(RegisteredTool {
                definition,
                handler,
                client: client.to_string(),
                enabled: true,
                auto_execute,
            }),
        );
        self.tools.store(Arc::new(tools));
    }

    /// Tool-level allow switch (the third filter level).
    pub fn set_tool_enabled(&self, name: &str, enabled: bool) {
        let mut tools = self.tools.load().as_ref().clone();
        if let Some(existing) = tools.get(name) {
            tools.insert(
                name.to_string(),
                Arc::new(RegisteredTool {
                    definition: existing.definition.clone(),
                    handler: existing.handler.clone(),
                    client: existing.client.clone(),
                    enabled,
                    auto_execute: existing.auto_execute,
                }),
            );
            self.tools.store(Arc::new(tools));
        }
    }

    pub fn remove_tool(&self, name: &str) {
        let mut tools = self.tools.load().as_ref().clone();
        if tools.remove(name).is_some() {
            self.tools.store(Arc::new(tools));
        }
    }

    fn allows(list: Option<&BTreeSet<String>>, name: &str) -> bool {
        list.is_none_or(|set| set.contains(name))
    }

    fn is_available(&self, tool: &RegisteredTool, opts: Option<&ToolOptions>) -> bool {
        if !tool.enabled {
            return false;
        }
        if !Self::allows(self.config.tools_to_execute.as_ref(), &tool.definition.name) {
            return false;
        }
        let clients = self.clients.load();
        let client_allows = clients
            .get(&tool.client)
            .map(|c| Self::allows(c.tools_to_execute.as_ref(), &tool.definition.name))
            .unwrap_or(true);
        if !client_allows {
            return false;
        }
        Self::allows(
            opts.and_then(|o| o.allowed_tools.as_ref()),
            &tool.definition.name,
        )
    }

    pub fn is_auto_executable(&self, name: &str, opts: Option<&ToolOptions>) -> bool {
        let tools = self.tools.load();
        let Some(tool) = tools.get(name) else { return false };
        if !tool.auto_execute || !self.is_available(tool, opts) {
            return false;
        }
        if !Self::allows(self.config.tools_to_auto_execute.as_ref(), name) {
            return false;
        }
        let clients = self.clients.load();
        let client_allows = clients
            .get(&tool.client)
            .map(|c| Self::allows(c.tools_to_auto_execute.as_ref(), name))
            .unwrap_or(true);
        if !client_allows {
            return false;
        }
        Self::allows(opts.and_then(|o| o.auto_execute.as_ref()), name)
    }

    /// Definitions of every tool the request may see, for advertising to
    /// the model.
    pub fn available_tools(&self, opts: Option<&ToolOptions>) -> Vec<ToolDefinition> {
        let tools = self.tools.load();
        let mut out: Vec<ToolDefinition> = tools
            .values()
            .filter(|tool| self.is_available(tool, opts))
            .map(|tool| tool.definition.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Runs one tool. Bounded by `tool_execution_timeout`; handler errors
    /// surface as `tool_execution_failed`.
    pub async fn invoke(
        &self,
        name: &str,
        args: Value,
        ctx: &RequestContext,
    ) -> BifrostResult<Value> {
        let tool = {
            let tools = self.tools.load();
            match tools.get(name) {
                Some(tool) if self.is_available(tool, None) => tool.clone(),
                _ => {
                    return Err(BifrostError::new(
                        ErrorKind::ToolNotFound,
                        format!("tool {name} is not registered or not allowed"),
                    ));
                }
            }
        };

        let fut = (tool.handler)(args, ctx.clone());
        match tokio::time::timeout(self.config.tool_execution_timeout, fut).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(err)) => Err(BifrostError::new(
                ErrorKind::ToolExecutionFailed,
                format!("tool {name} failed"),
            )
            .with_cause(err)),
            Err(_) => Err(BifrostError::new(
                ErrorKind::ToolExecutionTimeout,
                format!(
                    "tool {name} exceeded {}ms",
                    self.config.tool_execution_timeout.as_millis()
                ),
            )),
        }
    }
}
