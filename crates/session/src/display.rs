//! Rendering of inbound messages for the terminal
use std::borrow::Cow;
use std::collections::BTreeMap;

use tracing::debug;

use crate::client::InboundMessage;

/// Decode a payload as UTF-8, substituting U+FFFD for invalid sequences.
///
/// Never fails. A lossy decode is logged at debug level.
pub fn decode_payload(payload: &[u8]) -> Cow<'_, str> {
    let decoded = String::from_utf8_lossy(payload);
    if let Cow::Owned(_) = decoded {
        debug!(len = payload.len(), "payload is not valid UTF-8, replaced invalid bytes");
    }
    decoded
}

fn render_headers(headers: Option<&BTreeMap<String, String>>) -> String {
    match headers {
        Some(headers) if !headers.is_empty() => {
            let pairs: Vec<String> = headers
                .iter()
                .map(|(k, v)| format!("{k:?}: {v:?}"))
                .collect();
            format!("{{{}}}", pairs.join(", "))
        }
        _ => "{}".to_string(),
    }
}

/// `[subject] payload | headers={...}`, used for core subscriptions
pub fn render_core(msg: &InboundMessage) -> String {
    format!(
        "[{}] {} | headers={}",
        msg.subject,
        decode_payload(&msg.payload),
        render_headers(msg.headers.as_ref())
    )
}

/// `[subject] seq: payload`, used for JetStream pull consumers
pub fn render_sequenced(msg: &InboundMessage) -> String {
    match msg.sequence {
        Some(seq) => format!("[{}] {seq}: {}", msg.subject, decode_payload(&msg.payload)),
        None => format!("[{}] -: {}", msg.subject, decode_payload(&msg.payload)),
    }
}

/// `[subject] payload`, used for JetStream push consumers
pub fn render_plain(msg: &InboundMessage) -> String {
    format!("[{}] {}", msg.subject, decode_payload(&msg.payload))
}

#[cfg(test)]
mod test {
    use bytes::Bytes;

    use super::*;

    fn message(payload: &'static [u8]) -> InboundMessage {
        InboundMessage {
            subject: "basic.trade".into(),
            payload: Bytes::from_static(payload),
            sequence: None,
            headers: None,
        }
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        assert_eq!(decode_payload(b"\xff\xfe"), "\u{FFFD}\u{FFFD}");
        assert_eq!(decode_payload(b"ok"), "ok");
        assert_eq!(
            render_plain(&message(b"\xff\xfe")),
            "[basic.trade] \u{FFFD}\u{FFFD}"
        );
    }

    #[test]
    fn core_rendering_includes_headers() {
        let msg = message(b"hello");
        assert_eq!(render_core(&msg), "[basic.trade] hello | headers={}");

        let msg = InboundMessage {
            headers: Some(BTreeMap::from([("Nats-Msg-Id".to_string(), "42".to_string())])),
            ..msg
        };
        assert_eq!(
            render_core(&msg),
            r#"[basic.trade] hello | headers={"Nats-Msg-Id": "42"}"#
        );
    }

    #[test]
    fn sequenced_rendering() {
        let msg = InboundMessage {
            sequence: Some(7),
            ..message(b"order")
        };
        assert_eq!(render_sequenced(&msg), "[basic.trade] 7: order");
    }
}
