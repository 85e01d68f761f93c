//! Real-time voice commands for a personal-finance ledger.
//!
//! Microphone audio streams to a conversational service over a WebSocket,
//! synthesized speech streams back and plays gaplessly, and the service's
//! `createTransaction` tool calls are executed locally.

pub mod audio;
pub mod config;
pub mod error;
pub mod gui_bridge;
pub mod ledger;
pub mod net_link;
pub mod protocol;
pub mod session;
pub mod tools;

pub use error::{Result, VoiceError};
pub use session::{SessionHandle, SessionState, SessionStatus, start_session};
