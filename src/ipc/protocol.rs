//! Wire messages exchanged with the browser helper
//!
//! Every message is a single JSON object on one line, tagged by `type`. The
//! browser/channel identifier is always carried under `id`.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::{BridgeError, Result};
use crate::frame::codec;

/// Commands sent to the helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command<'a> {
    Handshake {
        client: &'a str,
    },
    Ping,
    InitBrowser {
        id: &'a str,
        url: &'a str,
        width: u32,
        height: u32,
        fps: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        css: Option<&'a str>,
    },
    UpdateBrowser {
        id: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<&'a str>,
        width: u32,
        height: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        css: Option<&'a str>,
    },
    DisposeBrowser {
        id: &'a str,
    },
    Shutdown,
}

impl Command<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Handshake { .. } => "handshake",
            Command::Ping => "ping",
            Command::InitBrowser { .. } => "initBrowser",
            Command::UpdateBrowser { .. } => "updateBrowser",
            Command::DisposeBrowser { .. } => "disposeBrowser",
            Command::Shutdown => "shutdown",
        }
    }
}

#[derive(Serialize)]
struct Authenticated<'a> {
    #[serde(flatten)]
    command: &'a Command<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
}

/// Serialize `command` as one line (without the terminator), adding `token`
/// whenever one is configured.
pub fn encode_command(command: &Command<'_>, token: Option<&str>) -> Result<String> {
    let line = serde_json::to_string(&Authenticated { command, token })?;
    debug_assert!(!line.contains('\n'));
    Ok(line)
}

/// Build a `frameReady` line carrying `bgra` for browser `id`.
///
/// `escape_slashes` writes `/` as `\/`, which some serializers on the helper
/// side do; receivers must accept both forms.
pub fn encode_frame_message(
    id: &str,
    width: u32,
    height: u32,
    bgra: &[u8],
    escape_slashes: bool,
) -> Result<String> {
    #[derive(Serialize)]
    #[serde(tag = "type", rename = "frameReady")]
    struct FrameReadyOut<'a> {
        id: &'a str,
        width: u32,
        height: u32,
        data: &'a RawValue,
    }

    let data = RawValue::from_string(format!(
        "\"{}\"",
        codec::encode_payload(bgra, escape_slashes)
    ))?;
    Ok(serde_json::to_string(&FrameReadyOut {
        id,
        width,
        height,
        data: &data,
    })?)
}

/// A `frameReady` message that has been validated structurally but whose
/// payload is still base64 text borrowed from the receive buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameReady<'a> {
    pub id: Cow<'a, str>,
    pub width: u32,
    pub height: u32,
    pub data: &'a str,
}

impl FrameReady<'_> {
    /// Decode the payload, requiring exactly `width*height*4` bytes.
    pub fn decode(&self) -> Result<Vec<u8>> {
        codec::decode_bgra(self.data.as_bytes(), self.width, self.height)
    }
}

/// Messages received from the helper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound<'a> {
    FrameReady(FrameReady<'a>),
    Error { message: String },
    HandshakeAck,
    Authenticated { status: String },
    HelperReady,
    BrowserReady { id: String },
    BrowserCreated { id: String },
    Pong,
    Unknown(String),
}

#[derive(Deserialize)]
struct Envelope<'a> {
    #[serde(rename = "type", borrow)]
    kind: Cow<'a, str>,
}

#[derive(Deserialize)]
struct FrameReadyIn<'a> {
    #[serde(borrow)]
    id: Cow<'a, str>,
    width: u32,
    height: u32,
    #[serde(borrow)]
    data: &'a RawValue,
}

#[derive(Deserialize)]
struct WithId {
    id: String,
}

#[derive(Deserialize)]
struct ErrorIn {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct AuthenticatedIn {
    #[serde(default)]
    status: String,
}

/// Parse one line. Missing or mistyped required fields are an error; unknown
/// message types are not.
pub fn parse_inbound(line: &str) -> Result<Inbound<'_>> {
    let envelope: Envelope<'_> = serde_json::from_str(line)
        .map_err(|e| BridgeError::MalformedMessage(format!("no message type: {e}")))?;

    let msg = match envelope.kind.as_ref() {
        "frameReady" => Inbound::FrameReady(parse_frame_ready(line)?),
        "error" => Inbound::Error {
            message: from_line::<ErrorIn>(line)?.message,
        },
        "handshake_ack" => Inbound::HandshakeAck,
        "authenticated" => Inbound::Authenticated {
            status: from_line::<AuthenticatedIn>(line)?.status,
        },
        "helper_ready" => Inbound::HelperReady,
        "browserReady" => Inbound::BrowserReady {
            id: from_line::<WithId>(line)?.id,
        },
        "browserCreated" => Inbound::BrowserCreated {
            id: from_line::<WithId>(line)?.id,
        },
        "pong" => Inbound::Pong,
        other => Inbound::Unknown(other.to_owned()),
    };
    Ok(msg)
}

fn from_line<'a, T: Deserialize<'a>>(line: &'a str) -> Result<T> {
    serde_json::from_str(line).map_err(|e| BridgeError::MalformedMessage(e.to_string()))
}

fn parse_frame_ready(line: &str) -> Result<FrameReady<'_>> {
    let raw: FrameReadyIn<'_> = from_line(line)?;

    if raw.id.is_empty() {
        return Err(BridgeError::MalformedMessage("frameReady without id".into()));
    }
    if raw.width == 0 || raw.height == 0 {
        return Err(BridgeError::MalformedMessage(format!(
            "frameReady with empty size {}x{}",
            raw.width, raw.height
        )));
    }

    let data = raw
        .data
        .get()
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .ok_or_else(|| BridgeError::MalformedMessage("frameReady data is not a string".into()))?;

    Ok(FrameReady {
        id: raw.id,
        width: raw.width,
        height: raw.height,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_attached_to_every_command() {
        let init = Command::InitBrowser {
            id: "browser_1",
            url: "https://example.com",
            width: 800,
            height: 600,
            fps: 30,
            css: None,
        };
        let line = encode_command(&init, Some("s3cret")).unwrap();
        let v: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(v["type"], "initBrowser");
        assert_eq!(v["id"], "browser_1");
        assert_eq!(v["token"], "s3cret");
        assert!(v.get("css").is_none());

        let line = encode_command(&Command::Shutdown, Some("s3cret")).unwrap();
        assert_eq!(line, r#"{"type":"shutdown","token":"s3cret"}"#);

        let line = encode_command(&Command::DisposeBrowser { id: "b" }, None).unwrap();
        assert_eq!(line, r#"{"type":"disposeBrowser","id":"b"}"#);
    }

    #[test]
    fn update_omits_unchanged_url() {
        let cmd = Command::UpdateBrowser {
            id: "b",
            url: None,
            width: 640,
            height: 480,
            css: None,
        };
        let v: serde_json::Value =
            serde_json::from_str(&encode_command(&cmd, None).unwrap()).unwrap();
        assert!(v.get("url").is_none());
        assert_eq!(v["width"], 640);
    }

    #[test]
    fn frame_ready_borrows_escaped_payload() {
        let line = r#"{"type":"frameReady","id":"b1","width":1,"height":1,"data":"\/\/\/\/\/w=="}"#;
        let Inbound::FrameReady(frame) = parse_inbound(line).unwrap() else {
            panic!("expected frameReady");
        };
        assert_eq!(frame.id, "b1");
        assert_eq!(frame.data, r"\/\/\/\/\/w==");
        assert_eq!(frame.decode().unwrap(), vec![0xFF; 4]);
    }

    #[test]
    fn frame_ready_requires_fields() {
        for line in [
            r#"{"type":"frameReady","width":2,"height":1,"data":"AAAA"}"#,
            r#"{"type":"frameReady","id":"b1","width":-2,"height":1,"data":"AAAA"}"#,
            r#"{"type":"frameReady","id":"b1","width":0,"height":1,"data":""}"#,
            r#"{"type":"frameReady","id":"b1","width":2,"height":1,"data":42}"#,
        ] {
            assert!(
                matches!(parse_inbound(line), Err(BridgeError::MalformedMessage(_))),
                "{line}"
            );
        }
    }

    #[test]
    fn encoded_frame_parses_back() {
        let px: Vec<u8> = (0..32).map(|i| i * 8 + 3).collect();
        for escape in [false, true] {
            let line = encode_frame_message("b9", 4, 2, &px, escape).unwrap();
            let Inbound::FrameReady(frame) = parse_inbound(&line).unwrap() else {
                panic!("expected frameReady");
            };
            assert_eq!((frame.width, frame.height), (4, 2));
            assert_eq!(frame.decode().unwrap(), px);
        }
    }

    #[test]
    fn status_messages() {
        assert_eq!(
            parse_inbound(r#"{"type":"error","message":"unauthorized"}"#).unwrap(),
            Inbound::Error {
                message: "unauthorized".into()
            }
        );
        assert_eq!(
            parse_inbound(r#"{"type":"browserReady","id":"b2"}"#).unwrap(),
            Inbound::BrowserReady { id: "b2".into() }
        );
        assert_eq!(
            parse_inbound(r#"{"type":"authenticated","status":"ok"}"#).unwrap(),
            Inbound::Authenticated { status: "ok".into() }
        );
        assert_eq!(
            parse_inbound(r#"{"type":"mystery"}"#).unwrap(),
            Inbound::Unknown("mystery".into())
        );
        assert!(parse_inbound("not json").is_err());
        assert!(parse_inbound(r#"{"type":"browserReady"}"#).is_err());
    }
}
