//! Chat frame parsing — gateway frames → normalized [`ChatEvent`]s.
//!
//! The gateway delivers one JSON envelope per frame: `{"type": ..., "payload":
//! {...}}`. Parsing is total: anything unrecognized — unknown type, missing
//! fields, or bytes that are not JSON at all — becomes an `Other` event
//! carrying the raw frame base64-encoded. A malformed frame must never take
//! the connection down.

use serde_json::Value;

use crate::events::{ChatEvent, ChatPayload, RankEntry};

/// `room_control.status` value the gateway uses for a closed room.
pub const ROOM_STATUS_CLOSED: i64 = 3;

/// Parse one frame. Never fails; unknown shapes land in `Other`.
pub fn parse_frame(raw: &[u8]) -> ChatEvent {
    let Ok(value) = serde_json::from_slice::<Value>(raw) else {
        return ChatEvent::other(raw);
    };
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return ChatEvent::other(raw);
    };
    let payload = value.get("payload").cloned().unwrap_or(Value::Null);

    let parsed = match kind {
        "chat" => Some(ChatPayload::Chat {
            user: str_field(&payload, "user"),
            content: str_field(&payload, "content"),
        }),
        "gift" => Some(ChatPayload::Gift {
            user: str_field(&payload, "user"),
            gift_name: str_field(&payload, "gift_name"),
            count: u64_field(&payload, "count").unwrap_or(1),
        }),
        "like" => Some(ChatPayload::Like {
            user: str_field(&payload, "user"),
            count: u64_field(&payload, "count").unwrap_or(1),
        }),
        "member" => Some(ChatPayload::Member {
            user: str_field(&payload, "user"),
        }),
        "follow" => Some(ChatPayload::Follow {
            user: str_field(&payload, "user"),
        }),
        "fansclub" => Some(ChatPayload::Fansclub {
            user: str_field(&payload, "user"),
            content: str_field(&payload, "content"),
        }),
        "emoji_chat" => Some(ChatPayload::EmojiChat {
            user: str_field(&payload, "user"),
            emoji: str_field(&payload, "emoji"),
        }),
        "room_info" => Some(ChatPayload::RoomInfo {
            title: str_field(&payload, "title"),
            anchor: str_field(&payload, "anchor"),
        }),
        "room_stats" => Some(ChatPayload::RoomStats {
            display: str_field(&payload, "display"),
        }),
        "room_user_stats" => Some(ChatPayload::RoomUserStats {
            total: u64_field(&payload, "total").unwrap_or(0),
        }),
        "room_rank" => Some(ChatPayload::RoomRank {
            ranks: rank_entries(&payload),
        }),
        "room_control" => Some(ChatPayload::RoomControl {
            status: payload.get("status").and_then(Value::as_i64).unwrap_or(0),
            message: str_field(&payload, "message"),
        }),
        "stream_adaptation" => Some(ChatPayload::StreamAdaptation {
            level: payload.get("level").and_then(Value::as_i64).unwrap_or(0),
        }),
        _ => None,
    };

    match parsed {
        Some(payload) => ChatEvent::new(payload),
        None => ChatEvent::other(raw),
    }
}

/// True when this event signals the room has been closed by the platform.
pub fn is_room_closed(event: &ChatEvent) -> bool {
    matches!(
        event.payload,
        ChatPayload::RoomControl { status, .. } if status == ROOM_STATUS_CLOSED
    )
}

fn str_field(payload: &Value, key: &str) -> String {
    payload
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn u64_field(payload: &Value, key: &str) -> Option<u64> {
    payload.get(key).and_then(Value::as_u64)
}

fn rank_entries(payload: &Value) -> Vec<RankEntry> {
    payload
        .get("ranks")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| {
                    Some(RankEntry {
                        user: item.get("user")?.as_str()?.to_string(),
                        rank: item.get("rank")?.as_u64()? as u32,
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};

    #[test]
    fn chat_frame_parses_to_typed_payload() {
        let raw = br#"{"type":"chat","payload":{"user":"viewer-9","content":"hello anchor"}}"#;
        let event = parse_frame(raw);
        match event.payload {
            ChatPayload::Chat { user, content } => {
                assert_eq!(user, "viewer-9");
                assert_eq!(content, "hello anchor");
            }
            other => panic!("expected chat payload, got {other:?}"),
        }
    }

    #[test]
    fn gift_count_defaults_to_one() {
        let raw = br#"{"type":"gift","payload":{"user":"u","gift_name":"rose"}}"#;
        match parse_frame(raw).payload {
            ChatPayload::Gift { count, .. } => assert_eq!(count, 1),
            other => panic!("expected gift, got {other:?}"),
        }
    }

    #[test]
    fn room_rank_collects_well_formed_entries_only() {
        let raw = br#"{"type":"room_rank","payload":{"ranks":[
            {"user":"first","rank":1},
            {"user":"broken"},
            {"user":"third","rank":3}
        ]}}"#;
        match parse_frame(raw).payload {
            ChatPayload::RoomRank { ranks } => {
                assert_eq!(ranks.len(), 2);
                assert_eq!(ranks[0].user, "first");
                assert_eq!(ranks[1].rank, 3);
            }
            other => panic!("expected room_rank, got {other:?}"),
        }
    }

    #[test]
    fn unknown_type_becomes_other_with_raw_bytes() {
        let raw = br#"{"type":"hologram","payload":{"x":1}}"#;
        match parse_frame(raw).payload {
            ChatPayload::Other { raw: encoded } => {
                assert_eq!(BASE64.decode(encoded).expect("decode"), raw);
            }
            other => panic!("expected other, got {other:?}"),
        }
    }

    #[test]
    fn non_json_bytes_become_other() {
        let raw: &[u8] = &[0x08, 0x96, 0x01, 0xff];
        assert!(matches!(
            parse_frame(raw).payload,
            ChatPayload::Other { .. }
        ));
    }

    #[test]
    fn missing_type_field_becomes_other() {
        let raw = br#"{"payload":{"user":"u"}}"#;
        assert!(matches!(
            parse_frame(raw).payload,
            ChatPayload::Other { .. }
        ));
    }

    #[test]
    fn room_control_closed_detection() {
        let closed = parse_frame(br#"{"type":"room_control","payload":{"status":3,"message":"ended"}}"#);
        assert!(is_room_closed(&closed));

        let pause = parse_frame(br#"{"type":"room_control","payload":{"status":1,"message":"pause"}}"#);
        assert!(!is_room_closed(&pause));

        let chat = parse_frame(br#"{"type":"chat","payload":{"user":"u","content":"c"}}"#);
        assert!(!is_room_closed(&chat));
    }
}
