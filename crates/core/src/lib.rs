//! # toolweave Core
//!
//! Domain types, traits, and error definitions for the toolweave
//! orchestration engine. Every other crate depends inward on this one:
//! providers implement [`Provider`], plugins implement [`Plugin`], and the
//! agent loop drives both without knowing which implementation it holds.

pub mod error;
pub mod message;
pub mod provider;
pub mod token;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{ChunkError, Error, PluginError, ProviderError, Result};
pub use message::{Message, Role, ToolCallRequest};
pub use provider::{ChunkReceiver, Provider, ProviderRequest, StreamChunk, ToolCallDelta, Usage};
pub use tool::{Invocable, Plugin, ToolFunction, ToolHandler, ToolSchema, ToolTable};
