//! Push-gateway frame codec.
//!
//! The gateway speaks a text-over-binary framing: every message is UTF-8
//! text ending in a 4-byte trailer, `TUNE` during the initial tuning
//! exchange and `FABE` afterwards. `FABE` frames carry a fixed-width header
//! of space-separated hex fields, then channel-specific content. The
//! protocol is reverse engineered; field values in the outbound frames
//! (checksums, message ids, connection uuid) are replayed from a captured
//! session rather than computed.

use serde_json::Value;

use crate::error::{EchoError, Result};
use crate::types::{PushEvent, PushEventKind};

/// Channel carrying the gateway-handshake exchange and its ACK
const CHANNEL_GW_HANDSHAKE: u32 = 0x361;
/// Channel carrying device-directed gateway messages
const CHANNEL_GW_MESSAGE: u32 = 0x362;
/// Channel carrying keepalive pings and their replies
const CHANNEL_HEARTBEAT: u32 = 0x65;
/// Content channel for website-messaging payloads inside a gateway message
const CHANNEL_DEE_MESSAGE: u32 = 0xB479;

const HELLO: &str = "0x99d4f71a 0x0000001d A:HTUNE";

const CAPABILITIES: &str = "0xa6f6a951 0x0000009c \
    {\"protocolName\":\"A:H\",\"parameters\":\
    {\"AlphaProtocolHandler.receiveWindowSize\":\"16\",\"\
    AlphaProtocolHandler.maxFragmentSize\":\"16000\"}}TUNE";

const GW_HANDSHAKE: &str = "MSG 0x00000361 \
    0x360da09c f 0x00000001 \
    0x019f0778 \
    0x0000009b \
    INI 0x00000003 1.0 0x00000024 \
    01e09e62-f504-476c-85c8-9c97c8da26ed \
    0x0000016978ff598c \
    END FABE";

const GW_REGISTER: &str = "MSG 0x00000362 \
    0x33667875 f 0x00000001 \
    0xfd0a5afa \
    0x00000109 \
    GWM MSG 0x0000b479 0x0000003b \
    urn:tcomm-endpoint:device:deviceType:0:deviceSerialNumber:0 \
    0x00000041 \
    urn:tcomm-endpoint:service:serviceName:\
    DeeWebsiteMessagingService \
    {\"command\":\"REGISTER_CONNECTION\"}\
    FABE";

const PING: &str = "MSG 0x00000065 \
    0x0e414e47 f 0x00000001 \
    0xbc2fbb5f \
    0x00000062 \
    PIN30\
    FABE";

/// First frame after the socket opens
pub fn hello() -> Vec<u8> {
    HELLO.as_bytes().to_vec()
}

/// Protocol capability announcement, second frame of the tuning exchange
pub fn capabilities() -> Vec<u8> {
    CAPABILITIES.as_bytes().to_vec()
}

/// Gateway channel handshake
pub fn gateway_handshake() -> Vec<u8> {
    GW_HANDSHAKE.as_bytes().to_vec()
}

/// Register this connection for website-messaging pushes. The gateway
/// answers with an ACK on the handshake channel.
pub fn register_connection() -> Vec<u8> {
    GW_REGISTER.as_bytes().to_vec()
}

/// Keepalive ping
pub fn ping() -> Vec<u8> {
    PING.as_bytes().to_vec()
}

/// Gateway acknowledgment of [`register_connection`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationAck {
    pub protocol_version: String,
    pub connection_uuid: String,
    pub established: u64,
    pub timestamp_ini: u64,
    pub timestamp_ack: u64,
}

/// Device-directed message on the gateway channel
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayMessage {
    pub dest_urn: String,
    pub device_urn: String,
    /// Command name from the JSON document, e.g. `PUSH_VOLUME_CHANGE`
    pub command: String,
    /// Inner payload. The wire nests it as a string-encoded JSON document;
    /// it arrives here decoded. `Null` when the command carried none.
    pub payload: Value,
}

/// One decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Tuning-exchange frame, passed through undecoded
    Tune(String),
    /// Registration acknowledged; the channel is live
    RegistrationAck(RegistrationAck),
    /// A device event
    Gateway(GatewayMessage),
    /// Keepalive reply
    Heartbeat,
    /// Well-formed frame on a channel we do not decode
    Unhandled { channel: u32 },
}

/// Decode one inbound frame.
///
/// Errors mean the frame is malformed or truncated; the connection itself
/// is fine and the caller is expected to keep reading.
pub fn decode(data: &[u8]) -> Result<Frame> {
    let text = std::str::from_utf8(data)
        .map_err(|_| EchoError::Protocol("frame is not utf-8".to_string()))?;
    if text.len() < 4 {
        return Err(EchoError::Protocol(format!("frame too short: {:?}", text)));
    }
    if text.ends_with("TUNE") {
        return Ok(Frame::Tune(text.to_string()));
    }
    if !text.ends_with("FABE") {
        // The last four bytes may split a multi-byte character; fall back
        // to the whole frame
        let trailer = text.get(text.len() - 4..).unwrap_or(text);
        return Err(EchoError::Protocol(format!(
            "unknown frame trailer: {:?}",
            trailer
        )));
    }

    let mut cur = Cursor::new(text);
    let _frame_type = cur.field(3)?;
    let channel = cur.hex(10)? as u32;
    let _message_id = cur.hex(10)?;
    let _more_flag = cur.field(1)?;
    let _seq = cur.hex(10)?;
    let _checksum = cur.hex(10)?;
    let _content_length = cur.hex(10)?;
    let content_type = cur.field(3)?.to_string();

    match (channel, content_type.as_str()) {
        (CHANNEL_GW_HANDSHAKE, "ACK") => decode_ack(&mut cur),
        (CHANNEL_GW_MESSAGE, "GWM") => decode_gateway(&mut cur),
        (CHANNEL_HEARTBEAT, _) => Ok(Frame::Heartbeat),
        _ => Ok(Frame::Unhandled { channel }),
    }
}

fn decode_ack(cur: &mut Cursor<'_>) -> Result<Frame> {
    let len = cur.hex(10)? as usize;
    let protocol_version = cur.field(len)?.to_string();
    let len = cur.hex(10)? as usize;
    let connection_uuid = cur.field(len)?.to_string();
    let established = cur.hex(10)?;
    let timestamp_ini = cur.hex(18)?;
    let timestamp_ack = cur.hex(18)?;
    Ok(Frame::RegistrationAck(RegistrationAck {
        protocol_version,
        connection_uuid,
        established,
        timestamp_ini,
        timestamp_ack,
    }))
}

fn decode_gateway(cur: &mut Cursor<'_>) -> Result<Frame> {
    let _sub_type = cur.field(3)?;
    let content_channel = cur.hex(10)? as u32;
    if content_channel != CHANNEL_DEE_MESSAGE {
        return Ok(Frame::Unhandled {
            channel: content_channel,
        });
    }

    let len = cur.hex(10)? as usize;
    let dest_urn = cur.field(len)?.to_string();
    let len = cur.hex(10)? as usize;
    let id_data = cur.field(len)?;

    // The id field is "device-urn" or "device-urn payload"; a payload with
    // embedded spaces is instead carried after the field, up to the trailer.
    let mut parts = id_data.splitn(2, ' ');
    let device_urn = parts.next().unwrap_or("").to_string();
    let inline = parts.next().filter(|p| !p.is_empty() && !p.contains(' '));
    let payload_text = match inline {
        Some(p) => p,
        None => cur.rest_until_trailer()?,
    };

    let mut document: Value = serde_json::from_str(payload_text)?;
    let command = document
        .get("command")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    // The inner payload is itself a string-encoded JSON document
    let payload = match document.get_mut("payload") {
        Some(Value::String(inner)) => serde_json::from_str(inner)?,
        Some(other) => other.take(),
        None => Value::Null,
    };

    Ok(Frame::Gateway(GatewayMessage {
        dest_urn,
        device_urn,
        command,
        payload,
    }))
}

/// Map a decoded frame to the event subscribers receive. Frames that carry
/// no subscriber-facing information map to `None`.
pub fn decode_event(frame: &Frame) -> Option<PushEvent> {
    match frame {
        Frame::RegistrationAck(ack) => Some(PushEvent {
            kind: PushEventKind::CommandAcknowledged,
            command: "REGISTER_CONNECTION_ACK".to_string(),
            device_serial: None,
            payload: serde_json::json!({
                "connectionUuid": ack.connection_uuid,
                "established": ack.established,
            }),
        }),
        Frame::Gateway(message) => {
            let device_serial = message
                .payload
                .get("dopplerId")
                .and_then(|d| d.get("deviceSerialNumber"))
                .and_then(Value::as_str)
                .map(str::to_string);
            Some(PushEvent {
                kind: classify_command(&message.command),
                command: message.command.clone(),
                device_serial,
                payload: message.payload.clone(),
            })
        }
        Frame::Tune(_) | Frame::Heartbeat | Frame::Unhandled { .. } => None,
    }
}

fn classify_command(command: &str) -> PushEventKind {
    match command {
        "PUSH_ACTIVITY" => PushEventKind::PushActivity,
        c if c.starts_with("PUSH_") => PushEventKind::DeviceStateChanged,
        _ => PushEventKind::Unknown,
    }
}

/// Byte cursor over a frame. Width fields in the protocol count bytes of
/// ASCII text, each followed by a one-byte separator.
struct Cursor<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    /// Take exactly `width` bytes and step over the following separator
    fn field(&mut self, width: usize) -> Result<&'a str> {
        let field = self
            .text
            .get(self.pos..self.pos + width)
            .ok_or_else(|| EchoError::Protocol("truncated frame".to_string()))?;
        self.pos += width + 1;
        Ok(field)
    }

    /// Take a hex field of `width` bytes, tolerating the `0x` prefix
    fn hex(&mut self, width: usize) -> Result<u64> {
        let raw = self.field(width)?;
        let digits = raw.trim().trim_start_matches("0x");
        u64::from_str_radix(digits, 16)
            .map_err(|_| EchoError::Protocol(format!("bad hex field: {:?}", raw)))
    }

    /// Everything from the cursor to the 4-byte trailer
    fn rest_until_trailer(&self) -> Result<&'a str> {
        self.text
            .get(self.pos..self.text.len() - 4)
            .ok_or_else(|| EchoError::Protocol("truncated frame".to_string()))
    }
}
