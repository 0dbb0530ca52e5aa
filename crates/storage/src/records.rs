use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use thiserror::Error;

use shared::{
    domain::{ConversationId, EntryId, UserId},
    protocol::MessagePayload,
};

use crate::{Fields, StreamEntry};

/// The single log every instance consumes to learn about new messages.
pub const FANOUT_LOG_KEY: &str = "stream:fanout:all-conversations";

pub fn conversation_log_key(conversation_id: ConversationId) -> String {
    format!("stream:conversation:{conversation_id}")
}

const CONVERSATION_ID: &str = "conversation_id";
const SENDER_ID: &str = "sender_id";
const CIPHERTEXT: &str = "ciphertext";
const NONCE: &str = "nonce";
const CREATED_AT: &str = "created_at";
const STREAM_KEY: &str = "stream_key";
const ENTRY_ID: &str = "entry_id";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// A message as written by the sender, before the log assigns it an id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLogEntry {
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl NewLogEntry {
    pub fn into_fields(self) -> Fields {
        let mut fields = Fields::new();
        fields.insert(CONVERSATION_ID.into(), self.conversation_id.to_string());
        fields.insert(SENDER_ID.into(), self.sender_id.to_string());
        fields.insert(CIPHERTEXT.into(), STANDARD.encode(&self.ciphertext));
        fields.insert(NONCE.into(), STANDARD.encode(&self.nonce));
        fields.insert(CREATED_AT.into(), self.created_at.to_rfc3339());
        fields
    }
}

/// An immutable message record inside a conversation log. The body stays opaque.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub entry_id: EntryId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn from_stream_entry(entry: &StreamEntry) -> Result<Self, RecordError> {
        let fields = &entry.fields;
        Ok(Self {
            entry_id: entry.entry_id,
            conversation_id: parse_field(fields, CONVERSATION_ID)?,
            sender_id: parse_field(fields, SENDER_ID)?,
            ciphertext: decode_field(fields, CIPHERTEXT)?,
            nonce: decode_field(fields, NONCE)?,
            created_at: DateTime::parse_from_rfc3339(field(fields, CREATED_AT)?)
                .map(|ts| ts.with_timezone(&Utc))
                .map_err(|e| RecordError::InvalidField {
                    field: CREATED_AT,
                    reason: e.to_string(),
                })?,
        })
    }

    pub fn to_payload(&self) -> MessagePayload {
        MessagePayload {
            entry_id: self.entry_id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            ciphertext_b64: STANDARD.encode(&self.ciphertext),
            nonce_b64: STANDARD.encode(&self.nonce),
            created_at: self.created_at,
        }
    }
}

/// Entry of the fan-out log naming a message in a conversation log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutPointer {
    pub conversation_id: ConversationId,
    pub source_log_key: String,
    pub source_entry_id: EntryId,
}

impl FanoutPointer {
    pub fn new(conversation_id: ConversationId, source_entry_id: EntryId) -> Self {
        Self {
            conversation_id,
            source_log_key: conversation_log_key(conversation_id),
            source_entry_id,
        }
    }

    pub fn into_fields(self) -> Fields {
        let mut fields = Fields::new();
        fields.insert(CONVERSATION_ID.into(), self.conversation_id.to_string());
        fields.insert(STREAM_KEY.into(), self.source_log_key);
        fields.insert(ENTRY_ID.into(), self.source_entry_id.to_string());
        fields
    }

    pub fn from_fields(fields: &Fields) -> Result<Self, RecordError> {
        let source_log_key = field(fields, STREAM_KEY)?;
        if source_log_key.is_empty() {
            return Err(RecordError::InvalidField {
                field: STREAM_KEY,
                reason: "empty log key".into(),
            });
        }
        Ok(Self {
            conversation_id: parse_field(fields, CONVERSATION_ID)?,
            source_log_key: source_log_key.to_string(),
            source_entry_id: parse_field(fields, ENTRY_ID)?,
        })
    }
}

fn field<'a>(fields: &'a Fields, name: &'static str) -> Result<&'a str, RecordError> {
    fields
        .get(name)
        .map(String::as_str)
        .ok_or(RecordError::MissingField(name))
}

fn parse_field<T>(fields: &Fields, name: &'static str) -> Result<T, RecordError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    field(fields, name)?
        .parse()
        .map_err(|e: T::Err| RecordError::InvalidField {
            field: name,
            reason: e.to_string(),
        })
}

fn decode_field(fields: &Fields, name: &'static str) -> Result<Vec<u8>, RecordError> {
    STANDARD
        .decode(field(fields, name)?)
        .map_err(|e| RecordError::InvalidField {
            field: name,
            reason: e.to_string(),
        })
}
