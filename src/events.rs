//! Typed gateway events.
//!
//! The session deserialises each frame into this enum so it can
//! pattern-match on control opcodes and interaction dispatches instead of raw
//! `(op, t, serde_json::Value)` tuples.

use tracing::warn;

use crate::types::*;

/// Gateway opcodes this client sends or understands.
pub mod opcode {
    pub const DISPATCH: u8 = 0;
    pub const HEARTBEAT: u8 = 1;
    pub const IDENTIFY: u8 = 2;
    pub const RECONNECT: u8 = 7;
    pub const INVALID_SESSION: u8 = 9;
    pub const HELLO: u8 = 10;
    pub const HEARTBEAT_ACK: u8 = 11;
}

/// Dispatch name of the one event the session forwards.
pub const INTERACTION_CREATE: &str = "INTERACTION_CREATE";

// ---------------------------------------------------------------------------
// The top-level event enum
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum GatewayEvent {
    /// Handshake (op 10) with the heartbeat cadence in milliseconds.
    Hello { heartbeat_interval: u64 },

    /// A slash command (or component, autocomplete, modal) was invoked.
    InteractionCreate(Interaction),

    /// Any other op-0 dispatch. Dropped by the session.
    Dispatch { event_name: String },

    /// The gateway is asking us to heartbeat immediately (op 1).
    HeartbeatRequest,

    /// Heartbeat ACK (op 11).
    HeartbeatAck,

    /// Gateway told us to reconnect (op 7).
    Reconnect,

    /// Session has been invalidated (op 9). The flag says whether the server
    /// considers it resumable.
    InvalidSession(bool),

    /// Unrecognised opcode, or a known one with an unusable payload.
    Unknown { op: u8, event_name: Option<String> },
}

// ---------------------------------------------------------------------------
// Parsing from a raw GatewayPayload
// ---------------------------------------------------------------------------

impl GatewayEvent {
    /// Convert a raw [`GatewayPayload`] into a typed event.
    ///
    /// This never fails: anything unusable becomes [`GatewayEvent::Unknown`].
    pub fn from_payload(payload: GatewayPayload) -> Self {
        match payload.op {
            opcode::DISPATCH => Self::parse_dispatch(payload.t, payload.d),

            opcode::HEARTBEAT => GatewayEvent::HeartbeatRequest,

            opcode::RECONNECT => GatewayEvent::Reconnect,

            opcode::INVALID_SESSION => {
                let resumable = payload.d.as_ref().and_then(|v| v.as_bool()).unwrap_or(false);
                GatewayEvent::InvalidSession(resumable)
            }

            opcode::HELLO => match payload
                .d
                .as_ref()
                .and_then(|d| d.get("heartbeat_interval"))
                .and_then(|v| v.as_u64())
            {
                Some(heartbeat_interval) => GatewayEvent::Hello { heartbeat_interval },
                None => GatewayEvent::Unknown {
                    op: opcode::HELLO,
                    event_name: payload.t,
                },
            },

            opcode::HEARTBEAT_ACK => GatewayEvent::HeartbeatAck,

            op => GatewayEvent::Unknown {
                op,
                event_name: payload.t,
            },
        }
    }

    /// Parse an op-0 DISPATCH event by its `t` name.
    fn parse_dispatch(event_name: Option<String>, data: Option<serde_json::Value>) -> Self {
        let Some(name) = event_name else {
            return GatewayEvent::Unknown {
                op: opcode::DISPATCH,
                event_name: None,
            };
        };

        if name != INTERACTION_CREATE {
            return GatewayEvent::Dispatch { event_name: name };
        }

        let Some(d) = data else {
            warn!(event = %name, "dispatch without payload");
            return GatewayEvent::Unknown {
                op: opcode::DISPATCH,
                event_name: Some(name),
            };
        };

        match serde_json::from_value::<Interaction>(d) {
            Ok(interaction) => GatewayEvent::InteractionCreate(interaction),
            Err(e) => {
                warn!(event = %name, error = %e, "failed to parse INTERACTION_CREATE payload");
                GatewayEvent::Unknown {
                    op: opcode::DISPATCH,
                    event_name: Some(name),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(frame: serde_json::Value) -> GatewayEvent {
        GatewayEvent::from_payload(serde_json::from_value(frame).unwrap())
    }

    #[test]
    fn hello_carries_interval() {
        assert_eq!(
            parse(json!({"op": 10, "d": {"heartbeat_interval": 41250}})),
            GatewayEvent::Hello { heartbeat_interval: 41250 }
        );
        assert_eq!(
            parse(json!({"op": 10, "d": {}})),
            GatewayEvent::Unknown { op: 10, event_name: None }
        );
    }

    #[test]
    fn interaction_create_is_decoded() {
        let event = parse(json!({
            "op": 0, "s": 3, "t": "INTERACTION_CREATE",
            "d": {"id": "1", "type": 2, "token": "tok", "data": {"name": "test"}}
        }));
        match event {
            GatewayEvent::InteractionCreate(interaction) => {
                assert_eq!(interaction.id, "1");
                assert_eq!(interaction.command_name(), Some("test"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn other_dispatches_are_named_not_decoded() {
        assert_eq!(
            parse(json!({"op": 0, "t": "GUILD_CREATE", "d": {"id": "9"}})),
            GatewayEvent::Dispatch { event_name: "GUILD_CREATE".into() }
        );
    }

    #[test]
    fn malformed_interaction_is_unknown() {
        assert_eq!(
            parse(json!({"op": 0, "t": "INTERACTION_CREATE", "d": {"type": "nope"}})),
            GatewayEvent::Unknown { op: 0, event_name: Some("INTERACTION_CREATE".into()) }
        );
    }

    #[test]
    fn control_opcodes() {
        assert_eq!(parse(json!({"op": 1, "d": null})), GatewayEvent::HeartbeatRequest);
        assert_eq!(parse(json!({"op": 11})), GatewayEvent::HeartbeatAck);
        assert_eq!(parse(json!({"op": 7, "d": null})), GatewayEvent::Reconnect);
        assert_eq!(parse(json!({"op": 9, "d": true})), GatewayEvent::InvalidSession(true));
        assert_eq!(parse(json!({"op": 42})), GatewayEvent::Unknown { op: 42, event_name: None });
    }
}
