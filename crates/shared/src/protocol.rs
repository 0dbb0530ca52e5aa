use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ConversationId, EntryId, UserId},
    error::ApiError,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub entry_id: EntryId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub ciphertext_b64: String,
    pub nonce_b64: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    ClientClosed,
    IdleTimeout,
    SlowConsumer,
    ServerShutdown,
}

/// Frames the server writes to a connected client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerFrame {
    Message {
        message: MessagePayload,
    },
    SyncComplete {
        conversation_id: ConversationId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_message_id: Option<EntryId>,
        delivered: usize,
    },
    Typing {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    Pong,
    Closing {
        reason: CloseReason,
    },
    Error(ApiError),
}

/// Control frames a client may send on an open session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientFrame {
    Ack { entry_id: EntryId },
    Typing,
    Ping,
    Close,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    pub sender_id: UserId,
    pub ciphertext_b64: String,
    pub nonce_b64: String,
    /// Members the writer knows to be offline; each gets its offline counter bumped.
    #[serde(default)]
    pub offline_recipients: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishResponse {
    pub entry_id: EntryId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ConversationId;

    #[test]
    fn client_frames_use_tagged_layout() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"ack","payload":{"entry_id":"10-2"}}"#).expect("ack");
        assert_eq!(
            frame,
            ClientFrame::Ack {
                entry_id: EntryId::new(10, 2)
            }
        );
        let ping: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).expect("ping");
        assert_eq!(ping, ClientFrame::Ping);
    }

    #[test]
    fn sync_complete_omits_missing_cursor() {
        let frame = ServerFrame::SyncComplete {
            conversation_id: ConversationId::new_v4(),
            last_message_id: None,
            delivered: 0,
        };
        let json = serde_json::to_value(&frame).expect("json");
        assert_eq!(json["type"], "sync_complete");
        assert!(json["payload"].get("last_message_id").is_none());
    }
}
