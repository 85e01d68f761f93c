//! Local execution of function calls embedded in the service's stream.

pub mod transaction;

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::error::VoiceError;
use crate::protocol::{ToolCallRequest, ToolCallResult};

pub use transaction::CreateTransactionTool;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON schema of the argument object.
    fn parameters(&self) -> Value;
    async fn call(&self, arguments: &Map<String, Value>) -> Result<Value, VoiceError>;

    /// Declaration advertised to the service in the setup message.
    fn declaration(&self) -> Value {
        json!({
            "name": self.name(),
            "description": self.description(),
            "parameters": self.parameters()
        })
    }
}

/// Routes tool-call requests to registered tools and guarantees one result per id.
pub struct ToolDispatcher {
    tools: HashMap<String, Box<dyn Tool>>,
    answered: HashSet<String>,
}

impl ToolDispatcher {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            answered: HashSet::new(),
        }
    }

    pub fn register_tool(&mut self, tool: Box<dyn Tool>) {
        log::info!("Registered tool: {}", tool.name());
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Declarations of every registered tool, ordered by name.
    pub fn declarations(&self) -> Vec<Value> {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        names.into_iter().map(|n| self.tools[n].declaration()).collect()
    }

    /// Execute `request` and build its acknowledgement.
    ///
    /// Validation failures and unknown tool names produce a failure result
    /// rather than an error so the service is never left waiting. Returns
    /// `None` only for an id that has already been answered. Calls without an
    /// id cannot be told apart, so each one is executed and answered.
    pub async fn dispatch(&mut self, request: &ToolCallRequest) -> Option<ToolCallResult> {
        let tracked = !request.id.is_empty();
        if !tracked {
            log::warn!("Tool call ({}) has no id, it cannot be deduplicated", request.name);
        } else if self.answered.contains(&request.id) {
            log::error!(
                "Tool call {} ({}) was already answered, ignoring repeat",
                request.id,
                request.name
            );
            return None;
        }

        let result = match self.tools.get(&request.name) {
            None => {
                let err = VoiceError::UnknownTool(request.name.clone());
                log::warn!("Tool call {} rejected: {}", request.id, err);
                ToolCallResult::failed(request, err.to_string())
            }
            Some(tool) => match tool.call(&request.arguments).await {
                Ok(output) => {
                    log::info!("Tool call {} ({}) succeeded: {}", request.id, request.name, output);
                    ToolCallResult::ok(request)
                }
                Err(err) => {
                    log::warn!("Tool call {} ({}) failed: {}", request.id, request.name, err);
                    ToolCallResult::failed(request, err.to_string())
                }
            },
        };

        debug_assert_eq!(result.id, request.id);
        if tracked {
            let fresh = self.answered.insert(result.id.clone());
            debug_assert!(fresh, "tool call {} answered twice", result.id);
        }
        Some(result)
    }
}

impl Default for ToolDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
