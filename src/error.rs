use thiserror::Error;

/// Failures raised inside a voice session.
///
/// `MalformedAudio`, `InvalidToolArguments` and `UnknownTool` are answered
/// inside the component that raised them. `DeviceAccess` and `Channel` end the
/// session.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VoiceError {
    #[error("malformed audio chunk: {0}")]
    MalformedAudio(String),

    #[error("invalid tool arguments: {0}")]
    InvalidToolArguments(String),

    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("audio device unavailable: {0}")]
    DeviceAccess(String),

    #[error("channel failure: {0}")]
    Channel(String),
}

impl VoiceError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, VoiceError::DeviceAccess(_) | VoiceError::Channel(_))
    }
}

pub type Result<T> = std::result::Result<T, VoiceError>;
