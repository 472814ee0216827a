use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::BotFlow;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum FrameStatus {
    #[default]
    #[serde(rename = "", alias = "empty")]
    Idle,
    #[serde(rename = "waiting_input")]
    WaitingInput,
}

/// One persisted snapshot of where a conversation stands.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ConversationFrame {
    #[serde(rename = "key")]
    pub flow_key: String,
    #[serde(rename = "step", default)]
    pub step_index: usize,
    #[serde(default)]
    pub status: FrameStatus,
    #[serde(default)]
    pub user_input: String,
    #[serde(default)]
    pub collected_data: Map<String, Value>,
    /// Copy of the flow as it was when the frame was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow: Option<BotFlow>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ConversationFrame {
    pub fn new(flow_key: impl Into<String>, user_input: impl Into<String>) -> Self {
        Self {
            flow_key: flow_key.into(),
            step_index: 0,
            status: FrameStatus::Idle,
            user_input: user_input.into(),
            collected_data: Map::new(),
            flow: None,
            timestamp: Utc::now(),
        }
    }

    pub fn at_step(mut self, step_index: usize, status: FrameStatus) -> Self {
        self.step_index = step_index;
        self.status = status;
        self
    }

    pub fn with_data(mut self, collected_data: Map<String, Value>) -> Self {
        self.collected_data = collected_data;
        self
    }

    pub fn with_flow(mut self, flow: &BotFlow) -> Self {
        self.flow = Some(flow.clone());
        self
    }

    pub fn is_waiting(&self) -> bool {
        self.status == FrameStatus::WaitingInput
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn persisted_shape_uses_short_field_names() {
        let frame = ConversationFrame::new("order_form", "1")
            .at_step(0, FrameStatus::WaitingInput);
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["key"], "order_form");
        assert_eq!(value["step"], 0);
        assert_eq!(value["status"], "waiting_input");
        assert_eq!(value["user_input"], "1");
        assert!(value.get("flow").is_none());
    }

    #[test]
    fn empty_status_reads_back_as_idle() {
        let frame: ConversationFrame =
            serde_json::from_value(json!({"key": "main", "step": 0, "status": ""})).unwrap();
        assert_eq!(frame.status, FrameStatus::Idle);
        let frame: ConversationFrame =
            serde_json::from_value(json!({"key": "main", "status": "empty"})).unwrap();
        assert_eq!(frame.status, FrameStatus::Idle);
        assert!(frame.collected_data.is_empty());
    }
}
