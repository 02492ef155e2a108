// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use nils_config::ModelConfig;

use crate::types::{CompletionRequest, ModelInfo, ProviderError, StreamEvent};

pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ProviderError>> + Send>>;

#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Stable provider id (`"openai"`, `"mock"`, ...).
    fn provider_id(&self) -> &str;

    /// Model identifier forwarded to the API and recorded on messages.
    fn model_id(&self) -> &str;

    /// Context window and output cap used by the overflow check.
    fn info(&self) -> ModelInfo;

    /// Send a completion request and return the streaming response.
    async fn complete(&self, req: CompletionRequest) -> Result<EventStream, ProviderError>;
}

/// Build a provider from its config entry.
pub fn from_config(cfg: &ModelConfig) -> anyhow::Result<Arc<dyn ModelProvider>> {
    let info = ModelInfo {
        context_window: cfg.context_window.map(u64::from).unwrap_or(128_000),
        max_output_tokens: cfg.max_output_tokens.map(u64::from).unwrap_or(4_096),
    };
    match cfg.provider.as_str() {
        "openai" => {
            let api_key = cfg.api_key.clone().or_else(|| {
                cfg.api_key_env
                    .as_deref()
                    .and_then(|var| std::env::var(var).ok())
            });
            let base_url = cfg
                .base_url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
            Ok(Arc::new(crate::OpenAICompatProvider::new(
                "openai",
                cfg.name.clone(),
                api_key,
                &base_url,
                info,
            )))
        }
        "mock" => Ok(Arc::new(crate::mock::MockProvider::default())),
        other => anyhow::bail!("unknown provider: {other}"),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
