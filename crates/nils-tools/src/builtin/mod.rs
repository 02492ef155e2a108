// Copyright (c) 2024-2026 Nils Contributors
//
// SPDX-License-Identifier: MIT
//! Built-in tools.  Deliberately small: enough to make the registry,
//! truncator, and permission gate real.  Everything else arrives through
//! external registration.
mod bash;
mod batch;
mod read;
mod todo;
mod write;

pub use bash::BashTool;
pub use batch::BatchTool;
pub use read::ReadTool;
pub use todo::{TodoReadTool, TodoWriteTool};
pub use write::WriteTool;

use crate::ToolRegistry;

/// Register the default tool set.
pub fn register_builtins(reg: &mut ToolRegistry) {
    reg.register(ReadTool);
    reg.register(WriteTool);
    reg.register(BashTool);
    reg.register(TodoWriteTool);
    reg.register(TodoReadTool);
    reg.register(BatchTool);
}
