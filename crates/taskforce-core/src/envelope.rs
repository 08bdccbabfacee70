use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discriminant for every message exchanged between the orchestrator and
/// workers. The set is closed; [`Payload`] carries the matching data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TaskAssignment,
    TaskDecompositionRequest,
    TaskDecompositionResponse,
    StatusUpdate,
    Feedback,
    DataRequest,
    DataResponse,
    ConflictDetected,
    NegotiationRequest,
    NegotiationResponse,
    ResolutionFound,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageKind::TaskAssignment => "task_assignment",
            MessageKind::TaskDecompositionRequest => "task_decomposition_request",
            MessageKind::TaskDecompositionResponse => "task_decomposition_response",
            MessageKind::StatusUpdate => "status_update",
            MessageKind::Feedback => "feedback",
            MessageKind::DataRequest => "data_request",
            MessageKind::DataResponse => "data_response",
            MessageKind::ConflictDetected => "conflict_detected",
            MessageKind::NegotiationRequest => "negotiation_request",
            MessageKind::NegotiationResponse => "negotiation_response",
            MessageKind::ResolutionFound => "resolution_found",
        };
        write!(f, "{s}")
    }
}

/// Kind-specific message body. One variant per [`MessageKind`], so a
/// `match` over a payload is checked for exhaustiveness at compile time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    TaskAssignment {
        task_id: Uuid,
        worker_id: String,
        title: String,
        description: String,
    },
    TaskDecompositionRequest {
        task_id: Uuid,
        description: String,
    },
    TaskDecompositionResponse {
        task_id: Uuid,
        subtask_titles: Vec<String>,
    },
    StatusUpdate {
        task_id: Uuid,
        status: String,
        details: Option<String>,
    },
    Feedback {
        task_id: Uuid,
        content: String,
    },
    DataRequest {
        query: String,
    },
    DataResponse {
        data: serde_json::Value,
    },
    ConflictDetected {
        resource_id: String,
        task_ids: Vec<Uuid>,
    },
    NegotiationRequest {
        negotiation_id: Uuid,
        resource_id: String,
        proposal: String,
    },
    NegotiationResponse {
        negotiation_id: Uuid,
        accept: bool,
        counter_proposal: Option<String>,
    },
    ResolutionFound {
        negotiation_id: Uuid,
        resolution: String,
    },
}

impl Payload {
    /// The [`MessageKind`] this payload belongs to.
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::TaskAssignment { .. } => MessageKind::TaskAssignment,
            Payload::TaskDecompositionRequest { .. } => MessageKind::TaskDecompositionRequest,
            Payload::TaskDecompositionResponse { .. } => MessageKind::TaskDecompositionResponse,
            Payload::StatusUpdate { .. } => MessageKind::StatusUpdate,
            Payload::Feedback { .. } => MessageKind::Feedback,
            Payload::DataRequest { .. } => MessageKind::DataRequest,
            Payload::DataResponse { .. } => MessageKind::DataResponse,
            Payload::ConflictDetected { .. } => MessageKind::ConflictDetected,
            Payload::NegotiationRequest { .. } => MessageKind::NegotiationRequest,
            Payload::NegotiationResponse { .. } => MessageKind::NegotiationResponse,
            Payload::ResolutionFound { .. } => MessageKind::ResolutionFound,
        }
    }
}

/// Routing header shared by every message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    /// Unique identifier for this message.
    pub message_id: Uuid,
    /// Identifier of the sending party.
    pub sender_id: String,
    /// Identifier of the receiving party.
    pub recipient_id: String,
    /// Discriminant matching the payload variant.
    pub kind: MessageKind,
    /// UTC timestamp of when the message was created.
    pub timestamp: DateTime<Utc>,
}

/// A header/payload pair — the unit exchanged between workers and the
/// orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Routing header.
    pub header: MessageHeader,
    /// Kind-specific body.
    pub payload: Payload,
}

impl Envelope {
    /// Creates an envelope; the header kind is derived from the payload so
    /// the two can never disagree.
    pub fn new(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            header: MessageHeader {
                message_id: Uuid::new_v4(),
                sender_id: sender_id.into(),
                recipient_id: recipient_id.into(),
                kind: payload.kind(),
                timestamp: Utc::now(),
            },
            payload,
        }
    }
}
