// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
mod loader;
mod schema;

pub use loader::load;
pub use schema::{
    AgentDef, CompactionConfig, Config, ModelConfig, PermissionRuleConfig, ServerConfig,
    StorageConfig, ToolsConfig,
};
