//! `neomagi-hooks` — pluggable event hooks for LLM observability and
//! extension points, gated behind the `hooks` feature in downstream crates.

pub mod engine;
pub mod error;
pub mod types;

pub use engine::HookEngine;
pub use error::{HookError, Result};
pub use types::{HookAction, HookContext, HookDefinition, HookEvent, HookHandler, HookResult, HookTiming};
