use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TaskAssign,
    TaskComplete,
    TaskFailed,
    Escalate,
    QualityGateFailed,
    StatusRequest,
    StatusResponse,
    Guidance,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::TaskAssign => "task_assign",
            MessageKind::TaskComplete => "task_complete",
            MessageKind::TaskFailed => "task_failed",
            MessageKind::Escalate => "escalate",
            MessageKind::QualityGateFailed => "quality_gate_failed",
            MessageKind::StatusRequest => "status_request",
            MessageKind::StatusResponse => "status_response",
            MessageKind::Guidance => "guidance",
        }
    }
}

// ---------------------------------------------------------------------------
// AgentMessage
// ---------------------------------------------------------------------------

/// One envelope on the bus. The payload is free-form JSON whose shape is
/// agreed between sender and recipient per message kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub from: String,
    pub to: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl AgentMessage {
    pub fn new(
        kind: MessageKind,
        from: impl Into<String>,
        to: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            from: from.into(),
            to: to.into(),
            payload,
            timestamp: Utc::now(),
            run_id: None,
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&MessageKind::QualityGateFailed).unwrap();
        assert_eq!(json, "\"quality_gate_failed\"");
        assert_eq!(MessageKind::TaskAssign.as_str(), "task_assign");
    }

    #[test]
    fn message_wire_shape() {
        let msg = AgentMessage::new(
            MessageKind::TaskAssign,
            "manager-1",
            "worker-1",
            serde_json::json!({"subTaskId": "task-a-b-001"}),
        )
        .with_run_id("run-x-y");

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "task_assign");
        assert_eq!(json["from"], "manager-1");
        assert_eq!(json["to"], "worker-1");
        assert_eq!(json["run_id"], "run-x-y");
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn run_id_omitted_when_absent() {
        let msg = AgentMessage::new(
            MessageKind::StatusRequest,
            "a",
            "b",
            serde_json::Value::Null,
        );
        let json = serde_json::to_string(&msg).unwrap();
        assert!(!json.contains("run_id"));
    }

    #[test]
    fn round_trip() {
        let msg = AgentMessage::new(
            MessageKind::Guidance,
            "manager-1",
            "worker-2",
            serde_json::json!({"advice": "check the tests"}),
        );
        let json = serde_json::to_string(&msg).unwrap();
        let back: AgentMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, msg.id);
        assert_eq!(back.kind, MessageKind::Guidance);
        assert_eq!(back.payload["advice"], "check the tests");
    }
}
