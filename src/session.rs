//! The authorize challenge/response bootstrap.
//!
//! The askpass helper, the TLS client-certificate mapping and the
//! session spawner all share one pattern: a challenge is written as an
//! `authorize` control message over a socketpair on stdin, and the
//! local process answers with an `authorize` response echoing the
//! cookie. Responses carry credentials and are kept in [`Secret`]
//! buffers.

use std::io::{Read, Write};

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use serde_json::Value;
use zeroize::Zeroizing;

use crate::secret::{hex_decode, hex_encode, Secret};
use crate::{frame, json as opt, protocol, Error, Result};

/// Exit status used when the authorization phase fails.
pub const EXIT_AUTH_FAILURE: i32 = 5;

/// A parsed authorize challenge.
#[derive(Debug, Clone, PartialEq)]
pub enum Challenge {
    /// `*`: a generic credential prompt.
    Any,
    /// `plain1:<hex-user>:`: a bare password for a known user.
    Plain1 { user: String },
    /// `X-Conversation <id> <base64-prompt>`: a PAM-driven exchange.
    Conversation { id: String, prompt: String },
    /// `negotiate[ <base64-token>]`: a GSSAPI round.
    Negotiate { token: Option<Vec<u8>> },
}

impl Challenge {
    /// Parse a challenge string from an `authorize` message.
    pub fn parse(challenge: &str) -> Result<Challenge> {
        if challenge == "*" {
            return Ok(Challenge::Any);
        }

        if let Some(rest) = challenge.strip_prefix("plain1:") {
            let user_hex = rest.strip_suffix(':').ok_or_else(Error::new_protocol)?;
            let user = hex_decode(user_hex)
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .ok_or_else(Error::new_protocol)?;
            return Ok(Challenge::Plain1 { user });
        }

        if let Some(rest) = challenge.strip_prefix("X-Conversation ") {
            let (id, prompt_b64) = rest.split_once(' ').ok_or_else(Error::new_protocol)?;
            let prompt = BASE64_STANDARD
                .decode(prompt_b64)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .ok_or_else(Error::new_protocol)?;
            return Ok(Challenge::Conversation {
                id: id.to_string(),
                prompt,
            });
        }

        if challenge == "negotiate" {
            return Ok(Challenge::Negotiate { token: None });
        }
        if let Some(token_b64) = challenge.strip_prefix("negotiate ") {
            let token = BASE64_STANDARD
                .decode(token_b64)
                .map_err(|e| Error::new_protocol().with(e))?;
            return Ok(Challenge::Negotiate { token: Some(token) });
        }

        Err(Error::new(crate::error::Kind::AuthenticationNotSupported))
    }

    /// Format for the `challenge` field of an `authorize` message.
    pub fn format(&self) -> String {
        match self {
            Challenge::Any => "*".to_string(),
            Challenge::Plain1 { user } => format!("plain1:{}:", hex_encode(user.as_bytes())),
            Challenge::Conversation { id, prompt } => {
                format!("X-Conversation {} {}", id, BASE64_STANDARD.encode(prompt))
            }
            Challenge::Negotiate { token: None } => "negotiate".to_string(),
            Challenge::Negotiate { token: Some(token) } => {
                format!("negotiate {}", BASE64_STANDARD.encode(token))
            }
        }
    }

    /// Format a response matching this challenge.
    pub fn format_response(&self, answer: &Secret) -> Secret {
        match self {
            Challenge::Any | Challenge::Plain1 { .. } => {
                Secret::new(answer.as_bytes().to_vec())
            }
            Challenge::Conversation { id, .. } => Secret::new(
                format!(
                    "X-Conversation {} {}",
                    id,
                    BASE64_STANDARD.encode(answer.as_bytes())
                )
                .into_bytes(),
            ),
            Challenge::Negotiate { .. } => {
                Secret::new(BASE64_STANDARD.encode(answer.as_bytes()).into_bytes())
            }
        }
    }
}

/// Write an `authorize` challenge as a control frame.
pub fn write_challenge<W: Write>(
    writer: &mut W,
    cookie: &str,
    challenge: &Challenge,
    prompt: Option<&str>,
) -> Result<()> {
    let message = protocol::authorize_challenge(cookie, &challenge.format(), prompt);
    let payload = protocol::control_bytes(&message);
    frame::blocking::write_frame(writer, None, &payload)
}

/// Read the `authorize` reply to a challenge, verifying the echoed
/// cookie. The frame buffer and the parsed message both hold the
/// credential, so both are zeroed before returning.
pub fn read_response<R: Read>(reader: &mut R, cookie: &str) -> Result<Secret> {
    let body = match frame::blocking::read_frame(reader)? {
        Some(body) => Zeroizing::new(body),
        None => return Err(Error::new_terminated()),
    };

    // Control frames start with the empty channel prefix.
    let payload = match body.split_first() {
        Some((b'\n', payload)) => payload,
        _ => return Err(Error::new_protocol()),
    };

    let mut message: Value =
        serde_json::from_slice(payload).map_err(|e| Error::new_protocol().with(e))?;

    let result = (|| {
        let command = opt::get_str(&message, "command")?.unwrap_or("");
        let reply_cookie = opt::get_str(&message, "cookie")?.unwrap_or("");
        let response = opt::get_str(&message, "response")?.unwrap_or("");

        if command != "authorize" || reply_cookie != cookie {
            return Err(Error::new(crate::error::Kind::AuthenticationFailed));
        }

        Ok(Secret::new(response.as_bytes().to_vec()))
    })();

    // The parsed message still holds a copy of the response string.
    if let Some(Value::String(response)) = message.get_mut("response") {
        use zeroize::Zeroize;
        response.zeroize();
    }
    drop(message);

    result
}

/// The askpass exchange: challenge the peer on `stream` for the given
/// user's password and return the response. The cookie is derived from
/// the process id and a timestamp so retries do not collide.
pub fn askpass<S: Read + Write>(stream: &mut S, user: &str, prompt: &str) -> Result<Secret> {
    let cookie = format!(
        "askpass{}{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    );

    let challenge = Challenge::Plain1 {
        user: user.to_string(),
    };

    write_challenge(stream, &cookie, &challenge, Some(prompt))?;
    read_response(stream, &cookie)
}

/// Build the `init` message announcing an authorization failure.
pub fn failure_init(problem: &Error, message: &str) -> Value {
    let mut init = protocol::Init::default();
    init.problem = Some(problem.problem().to_string());
    init.message = Some(message.to_string());
    init.to_value()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_parse_roundtrip() {
        for challenge in [
            Challenge::Any,
            Challenge::Plain1 {
                user: "admin".into(),
            },
            Challenge::Conversation {
                id: "xyz".into(),
                prompt: "Password: ".into(),
            },
            Challenge::Negotiate { token: None },
            Challenge::Negotiate {
                token: Some(b"gss-token".to_vec()),
            },
        ] {
            assert_eq!(Challenge::parse(&challenge.format()).unwrap(), challenge);
        }
    }

    #[test]
    fn challenge_plain1_hex() {
        assert_eq!(
            Challenge::Plain1 { user: "me".into() }.format(),
            "plain1:6d65:"
        );
        assert_eq!(
            Challenge::parse("plain1:6d65:").unwrap(),
            Challenge::Plain1 { user: "me".into() }
        );
    }

    #[test]
    fn challenge_rejects_garbage() {
        assert!(Challenge::parse("plain1:zz:").is_err());
        assert!(Challenge::parse("X-Conversation onlyid").is_err());
        let err = Challenge::parse("kerberos-5").unwrap_err();
        assert_eq!(err.problem(), "authentication-not-supported");
    }

    #[test]
    fn response_formats() {
        let answer = Secret::from("secret".to_string());

        let plain = Challenge::Plain1 { user: "me".into() };
        assert_eq!(plain.format_response(&answer).as_str(), Some("secret"));

        let conv = Challenge::Conversation {
            id: "7".into(),
            prompt: String::new(),
        };
        assert_eq!(
            conv.format_response(&answer).as_str(),
            Some("X-Conversation 7 c2VjcmV0")
        );
    }

    #[test]
    fn exchange_over_pipe() {
        // The "peer" side scripted as raw bytes: one authorize reply.
        let reply = serde_json::json!({
            "command": "authorize",
            "cookie": "k",
            "response": "secret",
        });
        let payload = protocol::control_bytes(&reply);
        let encoded = frame::encode(None, &payload[1..]);

        let mut reader: &[u8] = &encoded;
        let secret = read_response(&mut reader, "k").unwrap();
        assert_eq!(secret.as_str(), Some("secret"));
    }

    #[test]
    fn exchange_rejects_wrong_cookie() {
        let reply = serde_json::json!({
            "command": "authorize",
            "cookie": "other",
            "response": "secret",
        });
        let payload = protocol::control_bytes(&reply);
        let encoded = frame::encode(None, &payload[1..]);

        let mut reader: &[u8] = &encoded;
        let err = read_response(&mut reader, "k").unwrap_err();
        assert_eq!(err.problem(), "authentication-failed");
    }
}
