//! Typed gateway events.
//!
//! The gateway module deserialises dispatch payloads into [`GatewayEvent`]
//! so the client can pattern-match on strongly-typed data instead of raw
//! `(op, t, serde_json::Value)` tuples.

use serde::de::DeserializeOwned;
use tracing::warn;

use crate::types::*;

/// A fully-parsed event coming off the Discord gateway.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    /// IDENTIFY succeeded; a new gateway session exists.
    Ready(ReadyEvent),

    /// A RESUME succeeded; the previous session continues.
    Resumed,

    /// Full guild object. Sent lazily after READY, when an outage ends, and
    /// when the bot joins a new guild.
    GuildCreate(Guild),

    /// The bot left / was removed from a guild, or it became unavailable.
    GuildDelete(UnavailableGuild),

    /// Slash command, component, autocomplete or modal submit.
    InteractionCreate(Box<Interaction>),

    /// Heartbeat ACK from the gateway (op 11).
    HeartbeatAck,

    /// The gateway is asking us to heartbeat immediately (op 1).
    HeartbeatRequest,

    /// Gateway told us to reconnect (op 7).
    Reconnect,

    /// Session has been invalidated (op 9); `true` if resumable.
    InvalidSession(bool),

    /// Anything we don't have a typed variant for.
    Unknown {
        event_name: Option<String>,
        op: u8,
        data: Option<serde_json::Value>,
    },
}

impl GatewayEvent {
    /// Convert a raw [`GatewayPayload`] into a typed event.
    ///
    /// Never fails: unrecognised or malformed events become
    /// [`GatewayEvent::Unknown`].
    pub fn from_payload(payload: GatewayPayload) -> Self {
        match payload.op {
            0 => Self::parse_dispatch(payload.t, payload.d),
            1 => GatewayEvent::HeartbeatRequest,
            7 => GatewayEvent::Reconnect,
            9 => {
                let resumable = payload
                    .d
                    .as_ref()
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                GatewayEvent::InvalidSession(resumable)
            }
            11 => GatewayEvent::HeartbeatAck,
            op => GatewayEvent::Unknown {
                event_name: payload.t,
                op,
                data: payload.d,
            },
        }
    }

    /// Parse an op-0 DISPATCH event by its `t` name.
    fn parse_dispatch(event_name: Option<String>, data: Option<serde_json::Value>) -> Self {
        let (Some(name), Some(d)) = (event_name.as_deref(), data.as_ref()) else {
            return GatewayEvent::Unknown {
                event_name,
                op: 0,
                data,
            };
        };

        let parsed = match name {
            "READY" => typed(name, d, GatewayEvent::Ready),
            "RESUMED" => Some(GatewayEvent::Resumed),
            "GUILD_CREATE" => typed(name, d, GatewayEvent::GuildCreate),
            "GUILD_DELETE" => typed(name, d, GatewayEvent::GuildDelete),
            "INTERACTION_CREATE" => typed(name, d, |i: Interaction| {
                GatewayEvent::InteractionCreate(Box::new(i))
            }),
            _ => None,
        };

        parsed.unwrap_or(GatewayEvent::Unknown {
            event_name,
            op: 0,
            data,
        })
    }

    /// Short name for logging.
    pub fn name(&self) -> &str {
        match self {
            GatewayEvent::Ready(_) => "READY",
            GatewayEvent::Resumed => "RESUMED",
            GatewayEvent::GuildCreate(_) => "GUILD_CREATE",
            GatewayEvent::GuildDelete(_) => "GUILD_DELETE",
            GatewayEvent::InteractionCreate(_) => "INTERACTION_CREATE",
            GatewayEvent::HeartbeatAck => "HEARTBEAT_ACK",
            GatewayEvent::HeartbeatRequest => "HEARTBEAT",
            GatewayEvent::Reconnect => "RECONNECT",
            GatewayEvent::InvalidSession(_) => "INVALID_SESSION",
            GatewayEvent::Unknown { event_name, .. } => event_name.as_deref().unwrap_or("UNKNOWN"),
        }
    }
}

fn typed<T, F>(name: &str, d: &serde_json::Value, wrap: F) -> Option<GatewayEvent>
where
    T: DeserializeOwned,
    F: FnOnce(T) -> GatewayEvent,
{
    match serde_json::from_value::<T>(d.clone()) {
        Ok(value) => Some(wrap(value)),
        Err(e) => {
            warn!(event = name, error = %e, "failed to parse dispatch payload");
            None
        }
    }
}
