use anyhow::{anyhow, Result};
use reqwest::Client;
use std::sync::Arc;

use crate::config::ToolsConfig;
use crate::types::ToolSpec;

use super::builtins::{
    fs::FileSystemTool,
    system::{SystemCommandTool, SystemInfoTool},
    twitter::TwitterSearchTool,
    web::{WebScrapeTool, WebSearchTool},
};
use super::{Tool, ToolArgs, ToolInfo};

/// Ordered set of tools, unique by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The bundled tool set.
    pub fn with_defaults(config: &ToolsConfig, client: Client) -> Self {
        let mut registry = Self::new();
        registry.add(Arc::new(WebSearchTool::new(&config.search_url, client.clone())));
        registry.add(Arc::new(WebScrapeTool::new(client.clone())));
        registry.add(Arc::new(SystemCommandTool::new(config.command_timeout_secs)));
        registry.add(Arc::new(FileSystemTool::new(config.workspace_root.clone())));
        registry.add(Arc::new(TwitterSearchTool::from_env(
            &config.twitter_api_url,
            client,
        )));
        registry.add(Arc::new(SystemInfoTool::new()));
        registry
    }

    /// Add a tool, replacing any tool with the same name.
    pub fn add(&mut self, tool: Arc<dyn Tool>) {
        self.tools.retain(|t| t.name() != tool.name());
        self.tools.push(tool);
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.tools.len();
        self.tools.retain(|t| t.name() != name);
        self.tools.len() != before
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.iter().map(|t| t.name().to_string()).collect()
    }

    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    pub fn infos(&self) -> Vec<ToolInfo> {
        self.tools.iter().map(|t| t.info()).collect()
    }

    pub async fn execute(&self, name: &str, args: &ToolArgs) -> Result<String> {
        let tool = self
            .get(name)
            .ok_or_else(|| anyhow!("unknown tool: {}", name))?;
        tool.forward(args).await
    }
}
