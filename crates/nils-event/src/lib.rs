// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
//! Typed in-process event bus.
//!
//! Every state change in the engine is published here and fanned out to
//! subscribers (the SSE endpoint, tests, future frontends).  Fan-out is
//! backed by one bounded broadcast channel: a subscriber that falls behind
//! loses the oldest events queued *for it* and receives a single
//! [`Event::Dropped`] marker before resuming with newer events.  Publish
//! order is preserved per subscriber.
mod bus;
mod event;

pub use bus::{Bus, EventStream, DEFAULT_CAPACITY};
pub use event::{Event, PermissionAsk, PermissionReply, PermissionResponse};
