//! Transport layer for agent processes.
//!
//! Provides:
//! - `Content-Length` framing and JSON-RPC 2.0 frame types
//! - `RpcClient`, the request/response correlator
//! - Executable resolution and command building
//! - `Transport`: stdio child, spawned TCP child, external endpoint or custom I/O

pub mod codec;
pub mod frame;
pub mod launch;
pub mod rpc;
pub mod transport;

pub use codec::{FrameReader, write_frame};
pub use frame::Incoming;
pub use launch::{CommandBuilder, CommandParts, LaunchError, TransportFlag, resolve_executable_path};
pub use rpc::{Inbound, RpcClient};
pub use transport::{AgentProcess, ProcessExit, Transport, parse_cli_url};
