// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub compaction: CompactionConfig,
    /// Named provider configurations, referenced as `<key>/<model>` in
    /// prompt requests.
    ///
    /// ```yaml
    /// providers:
    ///   local:
    ///     provider: openai        # OpenAI-compatible wire format
    ///     base_url: http://localhost:11434/v1
    ///     name: llama3.2
    /// ```
    #[serde(default)]
    pub providers: HashMap<String, ModelConfig>,
    /// Named agents: a system-prompt style, a tool filter, a default model
    /// and an optional permission ruleset, selected per prompt request.
    #[serde(default)]
    pub agents: HashMap<String, AgentDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address for the HTTP API.
    #[serde(default = "default_addr")]
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

fn default_addr() -> String {
    "127.0.0.1:4096".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directory root.  Defaults to `$XDG_DATA_HOME/nils`.
    pub data_dir: Option<PathBuf>,
}

impl StorageConfig {
    /// Resolve the effective data directory.
    pub fn resolve_data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("nils")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Provider identifier: "openai" (OpenAI-compatible) | "mock"
    pub provider: String,
    /// Model name forwarded to the provider API
    pub name: String,
    /// Environment variable that holds the API key (read at runtime)
    pub api_key_env: Option<String>,
    /// Explicit API key; prefer api_key_env in config files to avoid secrets
    /// in version-controlled files
    pub api_key: Option<String>,
    /// Base URL override.  Useful for local proxies, LiteLLM, or Cloudflare.
    pub base_url: Option<String>,
    /// Context window override when the catalog does not know the model.
    pub context_window: Option<u32>,
    /// Maximum output tokens override.
    pub max_output_tokens: Option<u32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            name: "gpt-4o-mini".to_string(),
            api_key_env: Some("OPENAI_API_KEY".to_string()),
            api_key: None,
            base_url: None,
            context_window: None,
            max_output_tokens: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Permission rules evaluated first-match-wins against `<tool>:<key>`.
    /// Missing match defaults to `ask`.
    #[serde(default = "default_rules")]
    pub rules: Vec<PermissionRuleConfig>,
    /// Where spilled tool outputs go, relative to the data dir.
    #[serde(default = "default_spill_dir")]
    pub spill_dir: String,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            spill_dir: default_spill_dir(),
        }
    }
}

fn default_rules() -> Vec<PermissionRuleConfig> {
    vec![
        PermissionRuleConfig {
            pattern: "read:*".to_string(),
            action: "allow".to_string(),
        },
        PermissionRuleConfig {
            pattern: "todowrite:*".to_string(),
            action: "allow".to_string(),
        },
        PermissionRuleConfig {
            pattern: "todoread:*".to_string(),
            action: "allow".to_string(),
        },
    ]
}

fn default_spill_dir() -> String {
    "tool-output".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionRuleConfig {
    /// Glob pattern matched against `<tool>:<key>`; `*` and `?` supported.
    pub pattern: String,
    /// "allow" | "deny" | "ask"
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Disable automatic compaction entirely.  Overflow then surfaces as an
    /// `OverflowError` before the turn starts.
    #[serde(default)]
    pub disabled: bool,
    /// Provider key (from `providers`) used for summary generation.
    /// Falls back to the turn's own model when unset.
    pub summary_model: Option<String>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            disabled: false,
            summary_model: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentDef {
    /// Extra system prompt appended after the base prompt.
    pub prompt: Option<String>,
    /// Tool names available to this agent.  Empty means all registered tools.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Default model reference `<provider-key>/<model>` for this agent.
    pub model: Option<String>,
    /// Agent-level permission rules, evaluated between the session override
    /// and the project ruleset.
    #[serde(default)]
    pub rules: Vec<PermissionRuleConfig>,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_loopback_addr() {
        let cfg = Config::default();
        assert!(cfg.server.addr.starts_with("127.0.0.1"));
    }

    #[test]
    fn default_rules_allow_read() {
        let cfg = ToolsConfig::default();
        assert!(cfg
            .rules
            .iter()
            .any(|r| r.pattern == "read:*" && r.action == "allow"));
    }

    #[test]
    fn storage_config_explicit_dir_wins() {
        let cfg = StorageConfig {
            data_dir: Some(PathBuf::from("/tmp/x")),
        };
        assert_eq!(cfg.resolve_data_dir(), PathBuf::from("/tmp/x"));
    }

    #[test]
    fn config_roundtrips_through_yaml() {
        let cfg = Config::default();
        let text = serde_yaml::to_string(&cfg).unwrap();
        let back: Config = serde_yaml::from_str(&text).unwrap();
        assert_eq!(back.server.addr, cfg.server.addr);
    }

    #[test]
    fn agent_def_defaults_to_all_tools() {
        let a = AgentDef::default();
        assert!(a.tools.is_empty());
        assert!(a.model.is_none());
    }
}
