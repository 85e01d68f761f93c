//! Session events and their JSON wire mapping.
//!
//! The service speaks a bidirectional JSON protocol: one `setup` message from
//! the client, then `realtimeInput` audio and `toolResponse` acknowledgements
//! upstream, and `setupComplete`, `serverContent` and `toolCall` messages
//! downstream.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::audio::EncodedChunk;
use crate::config::Config;

/// A function call the service wants executed locally.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolStatus {
    Ok,
    Failed(String),
}

/// Acknowledgement for exactly one [`ToolCallRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    pub id: String,
    pub name: String,
    pub status: ToolStatus,
}

impl ToolCallResult {
    pub fn ok(request: &ToolCallRequest) -> Self {
        Self {
            id: request.id.clone(),
            name: request.name.clone(),
            status: ToolStatus::Ok,
        }
    }

    pub fn failed(request: &ToolCallRequest, reason: impl Into<String>) -> Self {
        Self {
            id: request.id.clone(),
            name: request.name.clone(),
            status: ToolStatus::Failed(reason.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == ToolStatus::Ok
    }

    fn response_body(&self) -> Value {
        match &self.status {
            ToolStatus::Ok => json!({ "status": "ok" }),
            ToolStatus::Failed(reason) => json!({ "status": "error", "error": reason }),
        }
    }
}

/// Everything the channel can deliver to the session. Exactly one payload per event.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    SessionOpened,
    /// Base64 PCM speech, still encoded.
    AudioDelta {
        data: String,
        sample_rate: u32,
        channels: u16,
    },
    ToolCallRequest(ToolCallRequest),
    /// The service cut its own response short (user barge-in).
    Interrupted,
    SessionClosed,
    SessionError(String),
}

/// Everything the session sends to the channel.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    Audio(EncodedChunk),
    ToolResult(ToolCallResult),
    Close,
}

// ======================== Setup ========================

#[derive(Debug, Serialize)]
pub struct SetupMessage {
    pub setup: SetupPayload,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupPayload {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
    pub tools: Vec<ToolSet>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
pub struct TextPart {
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSet {
    pub function_declarations: Vec<Value>,
}

/// First message on a new connection: model, voice, instructions and the
/// declarations of every locally executable tool.
pub fn build_setup_message(config: &Config, function_declarations: Vec<Value>) -> SetupMessage {
    SetupMessage {
        setup: SetupPayload {
            model: config.model.clone(),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: config.voice_name.clone(),
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: vec![TextPart {
                    text: config.system_instruction.clone(),
                }],
            },
            tools: vec![ToolSet {
                function_declarations,
            }],
        },
    }
}

// ======================== Outbound ========================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputMessage<'a> {
    realtime_input: RealtimeInput<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput<'a> {
    media_chunks: [MediaChunk<'a>; 1],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct MediaChunk<'a> {
    mime_type: &'a str,
    data: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResponseMessage<'a> {
    tool_response: ToolResponse<'a>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResponse<'a> {
    function_responses: [FunctionResponse<'a>; 1],
}

#[derive(Debug, Serialize)]
struct FunctionResponse<'a> {
    id: &'a str,
    name: &'a str,
    response: Value,
}

/// Serialize an outbound event into a JSON text frame. `Close` has no JSON
/// form; the transport turns it into a close frame.
pub fn encode_outbound(event: &OutboundEvent) -> serde_json::Result<Option<String>> {
    match event {
        OutboundEvent::Audio(chunk) => serde_json::to_string(&RealtimeInputMessage {
            realtime_input: RealtimeInput {
                media_chunks: [MediaChunk {
                    mime_type: &chunk.mime_type,
                    data: &chunk.data,
                }],
            },
        })
        .map(Some),
        OutboundEvent::ToolResult(result) => serde_json::to_string(&ToolResponseMessage {
            tool_response: ToolResponse {
                function_responses: [FunctionResponse {
                    id: &result.id,
                    name: &result.name,
                    response: result.response_body(),
                }],
            },
        })
        .map(Some),
        OutboundEvent::Close => Ok(None),
    }
}

// ======================== Inbound ========================

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    pub setup_complete: Option<Value>,
    pub server_content: Option<ServerContent>,
    pub tool_call: Option<ToolCall>,
    pub error: Option<ServerError>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    pub model_turn: Option<ModelTurn>,
    pub interrupted: Option<bool>,
    pub turn_complete: Option<bool>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub inline_data: Option<InlineData>,
    pub text: Option<String>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: Option<String>,
    pub data: String,
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub function_calls: Vec<FunctionCall>,
}

#[derive(Deserialize, Debug)]
pub struct FunctionCall {
    pub id: Option<String>,
    pub name: String,
    pub args: Option<Value>,
}

#[derive(Deserialize, Debug)]
pub struct ServerError {
    pub message: Option<String>,
}

/// Read `rate=` and `channels=` parameters from a tag like `audio/pcm;rate=24000`.
pub fn parse_pcm_mime(mime_type: &str, default_rate: u32) -> (u32, u16) {
    let mut rate = default_rate;
    let mut channels = 1;
    for param in mime_type.split(';').skip(1) {
        match param.trim().split_once('=') {
            Some(("rate", v)) => rate = v.trim().parse().unwrap_or(default_rate),
            Some(("channels", v)) => channels = v.trim().parse().unwrap_or(1),
            _ => {}
        }
    }
    (rate, channels)
}

/// Translate one server message into session events, in the order tool calls,
/// interruption, then audio. Unparseable messages yield no events.
pub fn parse_server_message(text: &str, default_rate: u32) -> Vec<InboundEvent> {
    let msg: ServerMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            log::warn!("Ignoring unparseable server message: {}", e);
            return Vec::new();
        }
    };

    let mut events = Vec::new();

    if msg.setup_complete.is_some() {
        events.push(InboundEvent::SessionOpened);
    }

    if let Some(tool_call) = msg.tool_call {
        for call in tool_call.function_calls {
            let arguments = match call.args {
                Some(Value::Object(map)) => map,
                _ => Map::new(),
            };
            events.push(InboundEvent::ToolCallRequest(ToolCallRequest {
                id: call.id.unwrap_or_default(),
                name: call.name,
                arguments,
            }));
        }
    }

    if let Some(content) = msg.server_content {
        if content.interrupted == Some(true) {
            events.push(InboundEvent::Interrupted);
        }
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(inline) = part.inline_data {
                    let mime = inline.mime_type.as_deref().unwrap_or("audio/pcm");
                    if !mime.starts_with("audio/pcm") {
                        log::warn!("Ignoring non-PCM inline data: {}", mime);
                        continue;
                    }
                    let (sample_rate, channels) = parse_pcm_mime(mime, default_rate);
                    events.push(InboundEvent::AudioDelta {
                        data: inline.data,
                        sample_rate,
                        channels,
                    });
                }
                if let Some(text) = part.text {
                    log::debug!("Model text: {}", text);
                }
            }
        }
        if content.turn_complete == Some(true) {
            log::debug!("Model turn complete");
        }
    }

    if let Some(err) = msg.error {
        events.push(InboundEvent::SessionError(
            err.message.unwrap_or_else(|| "unknown server error".to_string()),
        ));
    }

    events
}
