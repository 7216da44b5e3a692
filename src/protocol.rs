//! Control message shapes and builders.
//!
//! A control message is a frame with an empty channel prefix whose
//! payload is a JSON object carrying a mandatory `command` field and an
//! optional `channel` field selecting a target channel.

use bytes::Bytes;
use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::{json as opt, Error, Result};

/// Protocol version spoken by this agent.
pub const VERSION: i64 = 1;

/// A parsed control message.
#[derive(Debug, Clone)]
pub struct ControlMessage {
    /// The `command` field.
    pub command: String,
    /// The `channel` field, when the command targets a channel.
    pub channel: Option<String>,
    /// The whole message, for command-specific fields.
    pub options: Value,
}

/// Parse a control payload into its command, channel and options.
pub fn parse_control(payload: &[u8]) -> Result<ControlMessage> {
    let options: Value =
        serde_json::from_slice(payload).map_err(|e| Error::new_protocol().with(e))?;

    if !options.is_object() {
        return Err(Error::new_protocol());
    }

    let command = match opt::get_str(&options, "command")? {
        Some(command) if !command.is_empty() => command.to_string(),
        _ => return Err(Error::new_protocol()),
    };

    let channel = match opt::get_str(&options, "channel")? {
        Some(channel) if !channel.is_empty() => Some(channel.to_string()),
        Some(_) => return Err(Error::new_protocol()),
        None => None,
    };

    Ok(ControlMessage {
        command,
        channel,
        options,
    })
}

/// The `init` message sent by the agent immediately after startup.
#[derive(Debug, Default, Serialize)]
pub struct Init {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packages: Option<Map<String, Value>>,
    #[serde(rename = "os-release", skip_serializing_if = "Option::is_none")]
    pub os_release: Option<Map<String, Value>>,
    #[serde(rename = "session-id", skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub problem: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Init {
    /// Serialize with `command` and `version` filled in.
    pub fn to_value(&self) -> Value {
        let mut value = serde_json::to_value(self).expect("init serializes");
        let object = value.as_object_mut().expect("init is an object");
        object.insert("command".into(), "init".into());
        object.insert("version".into(), VERSION.into());
        value
    }
}

/// Build a `ready` message for a channel.
pub fn ready(channel: &str) -> Value {
    json!({"command": "ready", "channel": channel})
}

/// Build a `done` message for a channel.
pub fn done(channel: &str) -> Value {
    json!({"command": "done", "channel": channel})
}

/// Build a `close` message, with a problem when the close is not clean.
pub fn close(channel: &str, problem: Option<&str>) -> Value {
    match problem {
        Some(problem) => json!({"command": "close", "channel": channel, "problem": problem}),
        None => json!({"command": "close", "channel": channel}),
    }
}

/// Build the `pong` reply to a `ping`, echoing its fields.
pub fn pong(ping: &Value) -> Value {
    let mut reply = ping.clone();
    if let Some(object) = reply.as_object_mut() {
        object.insert("command".into(), "pong".into());
    }
    reply
}

/// Build an `authorize` challenge message.
pub fn authorize_challenge(cookie: &str, challenge: &str, prompt: Option<&str>) -> Value {
    match prompt {
        Some(prompt) => json!({
            "command": "authorize",
            "cookie": cookie,
            "challenge": challenge,
            "prompt": prompt,
        }),
        None => json!({
            "command": "authorize",
            "cookie": cookie,
            "challenge": challenge,
        }),
    }
}

/// Serialize a control message into a frame payload, with the empty
/// channel prefix included.
pub fn control_bytes(message: &Value) -> Bytes {
    let mut payload = vec![b'\n'];
    serde_json::to_writer(&mut payload, message).expect("control message serializes");
    Bytes::from(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_commands() {
        let msg = parse_control(b"{\"command\":\"open\",\"channel\":\"c7\",\"payload\":\"echo\"}")
            .unwrap();
        assert_eq!(msg.command, "open");
        assert_eq!(msg.channel.as_deref(), Some("c7"));
        assert_eq!(
            opt::get_str(&msg.options, "payload").unwrap(),
            Some("echo")
        );

        let msg = parse_control(b"{\"command\":\"ping\"}").unwrap();
        assert_eq!(msg.command, "ping");
        assert!(msg.channel.is_none());
    }

    #[test]
    fn parse_rejects_bad_shapes() {
        assert!(parse_control(b"[]").is_err());
        assert!(parse_control(b"{}").is_err());
        assert!(parse_control(b"{\"command\":5}").is_err());
        assert!(parse_control(b"{\"command\":\"open\",\"channel\":\"\"}").is_err());
        assert!(parse_control(b"not json").is_err());
    }

    #[test]
    fn init_shape() {
        let mut init = Init::default();
        init.checksum = Some("abc123".into());
        let value = init.to_value();
        assert_eq!(value["command"], "init");
        assert_eq!(value["version"], 1);
        assert_eq!(value["checksum"], "abc123");
        assert!(value.get("problem").is_none());
    }

    #[test]
    fn pong_echoes_fields() {
        let ping = serde_json::json!({"command": "ping", "sequence": 5});
        let reply = pong(&ping);
        assert_eq!(reply["command"], "pong");
        assert_eq!(reply["sequence"], 5);
    }
}
