use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub artifacts_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: std::env::var("AGENTX_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: std::env::var("AGENTX_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8000),
            artifacts_dir: PathBuf::from("artifacts"),
        }
    }
}

/// Agent loop settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_steps: usize,
    pub max_llm_retries: usize,
    pub max_tool_calls: usize,
    /// History kept per session, not counting the system prompt.
    pub max_context_messages: usize,
    pub verbose: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            max_steps: 10,
            max_llm_retries: 3,
            max_tool_calls: 5,
            max_context_messages: 100,
            verbose: false,
        }
    }
}

/// Provider endpoints. API keys never live in the file, only in the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub openai_base_url: String,
    pub anthropic_base_url: String,
    pub deepseek_base_url: String,
    pub ollama_base_url: String,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        ProvidersConfig {
            openai_base_url: std::env::var("OPENAI_BASE_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            anthropic_base_url: std::env::var("ANTHROPIC_BASE_URL")
                .unwrap_or_else(|_| "https://api.anthropic.com".to_string()),
            deepseek_base_url: std::env::var("DEEPSEEK_BASE_URL")
                .unwrap_or_else(|_| "https://api.deepseek.com/v1".to_string()),
            ollama_base_url: std::env::var("OLLAMA_URL")
                .unwrap_or_else(|_| "http://localhost:11434".to_string()),
        }
    }
}

/// Bundled tool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Root the `file_system` tool is confined to
    pub workspace_root: PathBuf,
    pub command_timeout_secs: u64,
    pub search_url: String,
    pub twitter_api_url: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        ToolsConfig {
            workspace_root: PathBuf::from("."),
            command_timeout_secs: 30,
            search_url: "https://html.duckduckgo.com/html".to_string(),
            twitter_api_url: "https://api.twitter.com/2".to_string(),
        }
    }
}

/// Unified configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub agent: AgentConfig,
    pub providers: ProvidersConfig,
    pub tools: ToolsConfig,
}

impl Config {
    /// Load from a file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// `AGENTX_CONFIG` if set, otherwise `~/.agentx/config.toml`
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("AGENTX_CONFIG") {
            return PathBuf::from(path);
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".agentx")
            .join("config.toml")
    }

    pub fn load_default() -> Result<Self> {
        Self::load(&Self::default_path())
    }

    pub fn ensure_artifacts(&self) -> Result<()> {
        fs::create_dir_all(&self.server.artifacts_dir).with_context(|| {
            format!(
                "failed to create artifacts dir: {}",
                self.server.artifacts_dir.display()
            )
        })
    }

    pub fn ensure_workspace(&self) -> Result<()> {
        fs::create_dir_all(&self.tools.workspace_root)?;
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.agent.max_steps, 10);
        assert_eq!(config.tools.command_timeout_secs, 30);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[agent]\nmax_steps = 4\n\n[server]\nport = 9100\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.agent.max_steps, 4);
        assert_eq!(config.agent.max_tool_calls, 5);
        assert_eq!(config.agent.max_context_messages, 100);
        assert_eq!(config.server.port, 9100);
    }

    #[test]
    fn save_then_load_preserves_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = Config::default();
        config.agent.verbose = true;
        config.tools.workspace_root = PathBuf::from("/tmp/ws");
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert!(loaded.agent.verbose);
        assert_eq!(loaded.tools.workspace_root, PathBuf::from("/tmp/ws"));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[agent\nmax_steps = ").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
