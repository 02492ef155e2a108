// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: Apache-2.0
//! Provider adapters: a streaming abstraction over LLM APIs.
//!
//! The turn engine consumes a lazy, finite, non-restartable stream of
//! [`StreamEvent`]s; each provider driver produces one.  Shipped drivers:
//! the OpenAI-compatible SSE wire format (which covers most hosted and
//! local servers) and deterministic mocks for tests.
pub mod mock;
mod openai_compat;
mod provider;
mod retry;
mod types;

pub use openai_compat::OpenAICompatProvider;
pub use provider::{from_config, EventStream, ModelProvider};
pub use retry::{complete_with_retry, RetryPolicy};
pub use types::{
    ChatContent, ChatMessage, CompletionRequest, ModelInfo, ProviderError, Role, StreamEvent,
    StreamUsage, ToolSchema,
};
