use serde_json::Value;

use super::blocks::{ALT_TEXT_ACTION_ID, COLORING_ACTION_ID, RESIZE_ACTION_ID};
use crate::settings::SettingsUpdate;

/// One decoded socket-mode frame. `envelope_id` must be acked before the
/// event is handled; frames the service does not understand decode to
/// `InboundEvent::Unknown` rather than an error.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub envelope_id: Option<String>,
    pub event: InboundEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Hello {
        num_connections: Option<u64>,
    },
    Disconnect {
        reason: String,
    },
    ReactionAdded {
        reaction: String,
        channel: String,
        message_ts: String,
    },
    AppHomeOpened {
        user: String,
    },
    BlockAction {
        action_id: String,
        user: String,
        trigger_id: Option<String>,
        channel: Option<String>,
    },
    ViewSubmission {
        update: SettingsUpdate,
    },
    Unknown {
        envelope_type: String,
    },
}

pub fn parse_envelope(raw: &str) -> Envelope {
    let Ok(parsed) = serde_json::from_str::<Value>(raw) else {
        return Envelope {
            envelope_id: None,
            event: InboundEvent::Unknown {
                envelope_type: "unparsed".to_string(),
            },
        };
    };

    let envelope_id = non_empty_str(parsed.get("envelope_id"));
    let envelope_type = non_empty_str(parsed.get("type")).unwrap_or_default();

    let event = match envelope_type.as_str() {
        "hello" => InboundEvent::Hello {
            num_connections: parsed.get("num_connections").and_then(Value::as_u64),
        },
        "disconnect" => InboundEvent::Disconnect {
            reason: non_empty_str(parsed.get("reason")).unwrap_or_else(|| "unknown".to_string()),
        },
        "events_api" => parse_events_api(&parsed),
        "interactive" => parse_interactive(&parsed),
        other => InboundEvent::Unknown {
            envelope_type: if other.is_empty() {
                "missing".to_string()
            } else {
                other.to_string()
            },
        },
    };

    Envelope { envelope_id, event }
}

fn parse_events_api(parsed: &Value) -> InboundEvent {
    let event = parsed.pointer("/payload/event").cloned().unwrap_or(Value::Null);
    let event_type = non_empty_str(event.get("type")).unwrap_or_default();
    match event_type.as_str() {
        "reaction_added" => {
            let reaction = non_empty_str(event.get("reaction"));
            let channel = non_empty_str(event.pointer("/item/channel"));
            let message_ts = non_empty_str(event.pointer("/item/ts"));
            match (reaction, channel, message_ts) {
                (Some(reaction), Some(channel), Some(message_ts)) => {
                    InboundEvent::ReactionAdded {
                        reaction,
                        channel,
                        message_ts,
                    }
                }
                _ => InboundEvent::Unknown {
                    envelope_type: "events_api:reaction_added:incomplete".to_string(),
                },
            }
        }
        "app_home_opened" => match non_empty_str(event.get("user")) {
            Some(user) => InboundEvent::AppHomeOpened { user },
            None => InboundEvent::Unknown {
                envelope_type: "events_api:app_home_opened:incomplete".to_string(),
            },
        },
        other => InboundEvent::Unknown {
            envelope_type: format!("events_api:{other}"),
        },
    }
}

fn parse_interactive(parsed: &Value) -> InboundEvent {
    let payload = parsed.get("payload").cloned().unwrap_or(Value::Null);
    let payload_type = non_empty_str(payload.get("type")).unwrap_or_default();
    match payload_type.as_str() {
        "block_actions" => {
            let action_id = payload
                .pointer("/actions/0/action_id")
                .and_then(Value::as_str)
                .map(str::to_string);
            let Some(action_id) = action_id else {
                return InboundEvent::Unknown {
                    envelope_type: "interactive:block_actions:incomplete".to_string(),
                };
            };
            InboundEvent::BlockAction {
                action_id,
                user: non_empty_str(payload.pointer("/user/id")).unwrap_or_default(),
                trigger_id: non_empty_str(payload.get("trigger_id")),
                channel: non_empty_str(payload.pointer("/channel/id")),
            }
        }
        "view_submission" => InboundEvent::ViewSubmission {
            update: settings_update_from_view_state(&payload),
        },
        other => InboundEvent::Unknown {
            envelope_type: format!("interactive:{other}"),
        },
    }
}

/// Pulls the three settings selects out of a modal submission by action id,
/// so block ordering and block ids never matter.
fn settings_update_from_view_state(payload: &Value) -> SettingsUpdate {
    let mut update = SettingsUpdate::default();
    let Some(values) = payload
        .pointer("/view/state/values")
        .and_then(Value::as_object)
    else {
        return update;
    };

    for block in values.values() {
        let Some(actions) = block.as_object() else {
            continue;
        };
        for (action_id, state) in actions {
            let selected = non_empty_str(state.pointer("/selected_option/value"));
            match action_id.as_str() {
                COLORING_ACTION_ID => update.coloring = selected,
                ALT_TEXT_ACTION_ID => update.alt_text = selected,
                RESIZE_ACTION_ID => update.resize_percent = selected,
                _ => {}
            }
        }
    }
    update
}

fn non_empty_str(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{parse_envelope, InboundEvent};

    #[test]
    fn parse_hello_frame() {
        let envelope = parse_envelope(&json!({"type": "hello", "num_connections": 2}).to_string());
        assert_eq!(envelope.envelope_id, None);
        assert_eq!(
            envelope.event,
            InboundEvent::Hello {
                num_connections: Some(2)
            }
        );
    }

    #[test]
    fn parse_disconnect_frame() {
        let envelope =
            parse_envelope(&json!({"type": "disconnect", "reason": "refresh_requested"}).to_string());
        assert_eq!(
            envelope.event,
            InboundEvent::Disconnect {
                reason: "refresh_requested".to_string()
            }
        );
    }

    #[test]
    fn parse_reaction_added() {
        let raw = json!({
            "envelope_id": "env-1",
            "type": "events_api",
            "payload": {
                "event": {
                    "type": "reaction_added",
                    "reaction": "mag",
                    "item": {"channel": "C42", "ts": "1700000000.000100"},
                },
            },
        })
        .to_string();
        let envelope = parse_envelope(&raw);
        assert_eq!(envelope.envelope_id.as_deref(), Some("env-1"));
        assert_eq!(
            envelope.event,
            InboundEvent::ReactionAdded {
                reaction: "mag".to_string(),
                channel: "C42".to_string(),
                message_ts: "1700000000.000100".to_string(),
            }
        );
    }

    #[test]
    fn parse_app_home_opened() {
        let raw = json!({
            "envelope_id": "env-2",
            "type": "events_api",
            "payload": {"event": {"type": "app_home_opened", "user": "U7"}},
        })
        .to_string();
        assert_eq!(
            parse_envelope(&raw).event,
            InboundEvent::AppHomeOpened {
                user: "U7".to_string()
            }
        );
    }

    #[test]
    fn parse_block_action() {
        let raw = json!({
            "envelope_id": "env-3",
            "type": "interactive",
            "payload": {
                "type": "block_actions",
                "trigger_id": "trigger-9",
                "user": {"id": "U7"},
                "channel": {"id": "D100"},
                "actions": [{"action_id": "open_settings"}],
            },
        })
        .to_string();
        assert_eq!(
            parse_envelope(&raw).event,
            InboundEvent::BlockAction {
                action_id: "open_settings".to_string(),
                user: "U7".to_string(),
                trigger_id: Some("trigger-9".to_string()),
                channel: Some("D100".to_string()),
            }
        );
    }

    #[test]
    fn parse_view_submission_by_action_id_in_any_block_order() {
        let raw = json!({
            "envelope_id": "env-4",
            "type": "interactive",
            "payload": {
                "type": "view_submission",
                "view": {"state": {"values": {
                    "zz_block": {"resize_select": {"selected_option": {"value": "150%"}}},
                    "aa_block": {"coloring_select": {"selected_option": {"value": "Protanopia"}}},
                    "mm_block": {"alt_text_select": {"selected_option": {"value": "Disabled"}}},
                }}},
            },
        })
        .to_string();
        let InboundEvent::ViewSubmission { update } = parse_envelope(&raw).event else {
            panic!("expected view submission");
        };
        assert_eq!(update.coloring.as_deref(), Some("Protanopia"));
        assert_eq!(update.alt_text.as_deref(), Some("Disabled"));
        assert_eq!(update.resize_percent.as_deref(), Some("150%"));
    }

    #[test]
    fn partial_view_submission_leaves_missing_fields_empty() {
        let raw = json!({
            "type": "interactive",
            "payload": {
                "type": "view_submission",
                "view": {"state": {"values": {
                    "block": {"coloring_select": {"selected_option": {"value": "Tritanopia"}}},
                }}},
            },
        })
        .to_string();
        let InboundEvent::ViewSubmission { update } = parse_envelope(&raw).event else {
            panic!("expected view submission");
        };
        assert_eq!(update.coloring.as_deref(), Some("Tritanopia"));
        assert_eq!(update.alt_text, None);
        assert_eq!(update.resize_percent, None);
    }

    #[test]
    fn unknown_and_malformed_frames_do_not_error() {
        assert_eq!(
            parse_envelope("not json").event,
            InboundEvent::Unknown {
                envelope_type: "unparsed".to_string()
            }
        );
        assert_eq!(
            parse_envelope(&json!({"type": "slash_commands"}).to_string()).event,
            InboundEvent::Unknown {
                envelope_type: "slash_commands".to_string()
            }
        );
        assert_eq!(
            parse_envelope(&json!({"payload": {}}).to_string()).event,
            InboundEvent::Unknown {
                envelope_type: "missing".to_string()
            }
        );
    }
}
