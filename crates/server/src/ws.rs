//! Bridges an axum WebSocket to a fan-out session: JSON text frames in both directions.

use axum::extract::ws::{Message, WebSocket};
use fanout::{FanoutCore, SessionParams};
use futures::{future, SinkExt, StreamExt};
use shared::protocol::{ClientFrame, ServerFrame};
use tracing::{debug, error, info};

pub(crate) async fn serve_socket(core: FanoutCore, params: SessionParams, socket: WebSocket) {
    let (sender, receiver) = socket.split();
    let sink = sender.with(|frame: ServerFrame| future::ready(encode_frame(&frame)));
    let stream = receiver
        .take_while(|message| {
            future::ready(matches!(message, Ok(message) if !matches!(message, Message::Close(_))))
        })
        .filter_map(|message| future::ready(message.ok().and_then(|message| decode_frame(&message))));

    match core.open_session(params, sink, stream).await {
        Ok(report) => info!(
            user_id = %report.user_id,
            client_id = %report.client_id,
            conversation_id = %report.conversation_id,
            backlog = report.backlog_delivered,
            live = report.live_delivered,
            close_reason = ?report.close_reason,
            error = ?report.error,
            "websocket session finished"
        ),
        Err(join_error) => error!(%join_error, "websocket session task failed"),
    }
}

pub(crate) fn encode_frame(frame: &ServerFrame) -> Result<Message, axum::Error> {
    serde_json::to_string(frame)
        .map(Message::Text)
        .map_err(axum::Error::new)
}

/// `None` for control messages and for anything that is not a well-formed client frame.
pub(crate) fn decode_frame(message: &Message) -> Option<ClientFrame> {
    let parsed = match message {
        Message::Text(text) => serde_json::from_str(text),
        Message::Binary(bytes) => serde_json::from_slice(bytes),
        _ => return None,
    };
    match parsed {
        Ok(frame) => Some(frame),
        Err(error) => {
            debug!(%error, "ignoring malformed client frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::{domain::EntryId, protocol::CloseReason};

    #[test]
    fn client_frames_decode_from_text_and_binary() {
        let text = Message::Text(r#"{"type":"ping"}"#.into());
        assert_eq!(decode_frame(&text), Some(ClientFrame::Ping));

        let binary = Message::Binary(br#"{"type":"ack","payload":{"entry_id":"5-1"}}"#.to_vec());
        assert_eq!(
            decode_frame(&binary),
            Some(ClientFrame::Ack {
                entry_id: EntryId::new(5, 1)
            })
        );
    }

    #[test]
    fn junk_and_control_messages_are_skipped() {
        assert_eq!(decode_frame(&Message::Text("not json".into())), None);
        assert_eq!(decode_frame(&Message::Ping(Vec::new())), None);
    }

    #[test]
    fn server_frames_encode_as_tagged_json() {
        let frame = ServerFrame::Closing {
            reason: CloseReason::SlowConsumer,
        };
        let Message::Text(text) = encode_frame(&frame).expect("encode") else {
            panic!("expected a text message");
        };
        let json: serde_json::Value = serde_json::from_str(&text).expect("json");
        assert_eq!(json["type"], "closing");
        assert_eq!(json["payload"]["reason"], "slow_consumer");
    }
}
