//! Core abstractions for driving an external agent process.
//!
//! This crate provides the fundamental building blocks:
//! - `SessionEvent` - Tagged events produced by the agent
//! - `EventLog` - Append-only history + broadcast for late subscribers
//! - `EventDispatcher` - Ordered, fault-isolated fan-out to handlers
//! - Client and session configuration
//! - The `Error` taxonomy shared by every layer
//! - Handler seams (`SessionHandle`, `PermissionHandler`, `ToolHandler`,
//!   `UserInputHandler`)

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod event_log;
pub mod traits;

pub use config::{
    Attachment, ClientOptions, InfiniteSessionConfig, MessageMode, MessageOptions, ProviderConfig,
    ReasoningEffort, ResumeSessionConfig, SessionConfig, SystemMessageConfig, SystemMessageMode,
    Tool,
};
pub use dispatcher::{DispatchFault, EventDispatcher, Subscription, panic_message};
pub use error::{Error, Result, RpcError};
pub use event::{EventData, SessionEvent, SessionEventType};
pub use event_log::EventLog;
pub use traits::{
    AutoApprove, PermissionHandler, PermissionRequest, PermissionResult, SessionHandle, ToolHandler,
    ToolInvocation, ToolResult, UserInputHandler, UserInputRequest, UserInputResponse,
};

/// Protocol version this client speaks. Checked against the agent's `ping` reply.
pub const SDK_PROTOCOL_VERSION: u32 = 1;
