//! # conductor-core
//!
//! Core types, traits, and primitives for the Conductor backend daemon.
//! This crate defines the shared vocabulary used by every other crate in the
//! workspace: the framed wire protocol, the error taxonomy, and the model /
//! usage types that flow between the RPC layer, the provider pipeline, and
//! cost accounting.

pub mod chat;
pub mod error;
pub mod frame;
pub mod model;

pub use chat::{ChatMessage, ChatRole, FinishReason, ToolDefinition, ToolInvocation};
pub use error::{ConductorError, Result, sanitize_provider_message};
pub use frame::{ErrorBody, Frame, FrameType, PROTOCOL_VERSION};
pub use model::{Capabilities, ModelInfo, ModelTier, TokenUsage};
