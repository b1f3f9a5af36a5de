//! Binary layout of the application message catalog.
//!
//! Applications living in another process exchange bus messages as frames:
//! ```text
//! +--------+--------+--------+------------------+
//! | Magic  | Length | Type   |     Payload      |
//! | "CAMB" | u32 LE | u16 LE |    (variable)    |
//! +--------+--------+--------+------------------+
//! | 4 bytes| 4 bytes| 2 bytes|  Length bytes    |
//! ```
//!
//! Payload of a CA→application frame: `ca_name` (string), `dest` (u8), body.
//! Payload of an application→CA frame: target CA (optional string), body.
//!
//! Strings are a u16 LE byte length followed by UTF-8; blobs use a u32 LE
//! length. Bodies:
//!
//! | type                  | layout                                                  |
//! |-----------------------|---------------------------------------------------------|
//! | `appinfo`             | u8 app_type, u16 manufacturer, u16 code, string menu    |
//! | `cainfo`              | u16 count, count × u16 ca_system_id                     |
//! | `mmi_enq`             | u8 blind, u8 expected_length, string text               |
//! | `mmi_menu`/`mmi_list` | string title, subtitle, bottom, u16 n, n × string, blob |
//! | `mmi_close`           | u8 cmd_id, u8 delay                                     |
//! | `mmi_display_control` | u8 cmd_id, u8 mmi_mode                                  |
//! | `cam_state`           | u8 inserted                                             |
//! | `answer`              | u8 kind (0 cancel, 1 text), string text                 |
//! | `answer_menu`         | u8 choice                                               |
//! | `close_mmi`           | u8 cmd_id, u8 delay                                     |
//! | `set_pmt`             | u8 list_management, u8 cmd_id, blob pmt                 |
//! | `get_appinfo`, `get_cainfo`, `enter_menu` | empty                               |
//! | `raw`                 | string tag, blob data                                   |

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::types::*;

/// Frame header size: 4 (magic) + 4 (length) + 2 (type) = 10 bytes.
pub const HEADER_SIZE: usize = 10;

/// Encode the body of a CA→application message.
pub fn encode_ca_message(msg: &CaMessage) -> Result<Bytes, ProtocolError> {
    let mut payload = BytesMut::new();
    put_ca_body(&mut payload, msg)?;
    Ok(payload.freeze())
}

/// Encode the body of an application→CA message.
pub fn encode_app_message(msg: &AppMessage) -> Result<Bytes, ProtocolError> {
    let mut payload = BytesMut::new();
    put_app_body(&mut payload, msg)?;
    Ok(payload.freeze())
}

/// Encode a complete frame for a message leaving a CA plug-in.
pub fn encode_message(msg: &Message) -> Result<Bytes, ProtocolError> {
    let mut payload = BytesMut::new();
    put_string(&mut payload, &msg.ca_name)?;
    payload.put_u8(match msg.dest {
        Destination::Ca => 0,
        Destination::Manager => 1,
        Destination::App => 2,
    });
    put_ca_body(&mut payload, &msg.body)?;
    encode_frame(msg.message_type(), payload.freeze())
}

/// Encode a complete frame for an application request; `target` of `None`
/// broadcasts to every plug-in.
pub fn encode_app_request(target: Option<&str>, msg: &AppMessage) -> Result<Bytes, ProtocolError> {
    let mut payload = BytesMut::new();
    match target {
        Some(name) => put_string(&mut payload, name)?,
        None => payload.put_u16_le(0xFFFF),
    }
    put_app_body(&mut payload, msg)?;
    encode_frame(msg.message_type(), payload.freeze())
}

fn put_ca_body(payload: &mut BytesMut, msg: &CaMessage) -> Result<(), ProtocolError> {
    match msg {
        CaMessage::AppInfo(info) => {
            payload.put_u8(info.application_type);
            payload.put_u16_le(info.manufacturer);
            payload.put_u16_le(info.manufacturer_code);
            put_string(payload, &info.menu_string)?;
        }
        CaMessage::CaInfo { ca_system_ids } => {
            let count = u16::try_from(ca_system_ids.len())
                .map_err(|_| ProtocolError::EncodeError("too many CA system ids".into()))?;
            payload.put_u16_le(count);
            for id in ca_system_ids {
                payload.put_u16_le(*id);
            }
        }
        CaMessage::MmiEnq(enq) => {
            payload.put_u8(u8::from(enq.blind));
            payload.put_u8(enq.expected_length);
            put_string(payload, &enq.text)?;
        }
        CaMessage::MmiMenu(menu) | CaMessage::MmiList(menu) => {
            put_string(payload, &menu.title)?;
            put_string(payload, &menu.subtitle)?;
            put_string(payload, &menu.bottom)?;
            let count = u16::try_from(menu.items.len())
                .map_err(|_| ProtocolError::EncodeError("too many menu items".into()))?;
            payload.put_u16_le(count);
            for item in &menu.items {
                put_string(payload, item)?;
            }
            put_blob(payload, &menu.raw)?;
        }
        CaMessage::MmiClose(close) => {
            payload.put_u8(close.cmd_id);
            payload.put_u8(close.delay);
        }
        CaMessage::MmiDisplayControl(dc) => {
            payload.put_u8(dc.cmd_id);
            payload.put_u8(dc.mmi_mode);
        }
        CaMessage::CamState { inserted } => {
            payload.put_u8(u8::from(*inserted));
        }
        CaMessage::Raw { tag, data } => {
            put_string(payload, tag)?;
            put_blob(payload, data)?;
        }
    }
    Ok(())
}

fn put_app_body(payload: &mut BytesMut, msg: &AppMessage) -> Result<(), ProtocolError> {
    match msg {
        AppMessage::Answer(MmiAnswer::Cancel) => {
            payload.put_u8(0);
            put_string(payload, "")?;
        }
        AppMessage::Answer(MmiAnswer::Text(text)) => {
            payload.put_u8(1);
            put_string(payload, text)?;
        }
        AppMessage::AnswerMenu { choice } => {
            payload.put_u8(*choice);
        }
        AppMessage::CloseMmi(close) => {
            payload.put_u8(close.cmd_id);
            payload.put_u8(close.delay);
        }
        AppMessage::SetPmt {
            pmt,
            list_management,
            cmd_id,
        } => {
            payload.put_u8(*list_management as u8);
            payload.put_u8(*cmd_id as u8);
            put_blob(payload, pmt)?;
        }
        AppMessage::GetAppInfo | AppMessage::GetCaInfo | AppMessage::EnterMenu => {
            // Empty payload
        }
        AppMessage::Raw { tag, data } => {
            put_string(payload, tag)?;
            put_blob(payload, data)?;
        }
    }
    Ok(())
}

/// Encode a frame with magic, length, type, and payload.
fn encode_frame(msg_type: MessageType, payload: Bytes) -> Result<Bytes, ProtocolError> {
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| ProtocolError::FrameTooLarge(u32::MAX, MAX_FRAME_SIZE))?;
    if payload_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload_len, MAX_FRAME_SIZE));
    }

    let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    frame.put_slice(&MAGIC);
    frame.put_u32_le(payload_len);
    frame.put_u16_le(msg_type.into());
    frame.put_slice(&payload);

    Ok(frame.freeze())
}

fn put_string(buf: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    let bytes = s.as_bytes();
    // 0xFFFF is reserved as the "no target" marker
    if bytes.len() >= 0xFFFF {
        return Err(ProtocolError::EncodeError(format!(
            "string too long: {} bytes",
            bytes.len()
        )));
    }
    buf.put_u16_le(bytes.len() as u16);
    buf.put_slice(bytes);
    Ok(())
}

fn put_blob(buf: &mut BytesMut, data: &[u8]) -> Result<(), ProtocolError> {
    if data.len() > MAX_FRAME_SIZE as usize {
        return Err(ProtocolError::FrameTooLarge(data.len() as u32, MAX_FRAME_SIZE));
    }
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
    Ok(())
}

fn need(buf: &Bytes, expected: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < expected {
        return Err(ProtocolError::IncompleteFrame {
            expected,
            actual: buf.remaining(),
        });
    }
    Ok(())
}

fn get_u8(buf: &mut Bytes) -> Result<u8, ProtocolError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16, ProtocolError> {
    need(buf, 2)?;
    Ok(buf.get_u16_le())
}

fn decode_string(buf: &mut Bytes) -> Result<String, ProtocolError> {
    let len = get_u16(buf)? as usize;
    need(buf, len)?;
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec()).map_err(|e| ProtocolError::DecodeError(e.to_string()))
}

fn decode_optional_string(buf: &mut Bytes) -> Result<Option<String>, ProtocolError> {
    need(buf, 2)?;
    if buf.chunk()[..2] == [0xFF, 0xFF] {
        buf.advance(2);
        return Ok(None);
    }
    decode_string(buf).map(Some)
}

fn decode_blob(buf: &mut Bytes) -> Result<Vec<u8>, ProtocolError> {
    need(buf, 4)?;
    let len = buf.get_u32_le();
    if len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(len, MAX_FRAME_SIZE));
    }
    need(buf, len as usize)?;
    Ok(buf.copy_to_bytes(len as usize).to_vec())
}

fn finish<T>(buf: &Bytes, value: T) -> Result<T, ProtocolError> {
    if buf.has_remaining() {
        return Err(ProtocolError::DecodeError(format!(
            "{} trailing bytes",
            buf.remaining()
        )));
    }
    Ok(value)
}

/// Frame header information.
#[derive(Debug, Clone, Copy)]
pub struct FrameHeader {
    pub payload_len: u32,
    pub message_type: MessageType,
}

/// Try to decode a frame header from the buffer.
/// Returns None if there's not enough data yet.
pub fn decode_header(buf: &[u8]) -> Result<Option<FrameHeader>, ProtocolError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }

    let magic = [buf[0], buf[1], buf[2], buf[3]];
    if magic != MAGIC {
        return Err(ProtocolError::InvalidMagic(magic));
    }

    let payload_len = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    if payload_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge(payload_len, MAX_FRAME_SIZE));
    }

    let type_val = u16::from_le_bytes([buf[8], buf[9]]);
    let message_type =
        MessageType::try_from(type_val).map_err(ProtocolError::UnknownMessageType)?;

    Ok(Some(FrameHeader {
        payload_len,
        message_type,
    }))
}

/// Decode the body of a CA→application message.
pub fn decode_ca_message(msg_type: MessageType, mut payload: Bytes) -> Result<CaMessage, ProtocolError> {
    let msg = take_ca_body(msg_type, &mut payload)?;
    finish(&payload, msg)
}

fn take_ca_body(msg_type: MessageType, payload: &mut Bytes) -> Result<CaMessage, ProtocolError> {
    match msg_type {
        MessageType::AppInfo => {
            let application_type = get_u8(payload)?;
            let manufacturer = get_u16(payload)?;
            let manufacturer_code = get_u16(payload)?;
            let menu_string = decode_string(payload)?;
            Ok(CaMessage::AppInfo(AppInfo {
                application_type,
                manufacturer,
                manufacturer_code,
                menu_string,
            }))
        }
        MessageType::CaInfo => {
            let count = get_u16(payload)? as usize;
            need(payload, count * 2)?;
            let ca_system_ids = (0..count).map(|_| payload.get_u16_le()).collect();
            Ok(CaMessage::CaInfo { ca_system_ids })
        }
        MessageType::MmiEnq => {
            let blind = get_u8(payload)? != 0;
            let expected_length = get_u8(payload)?;
            let text = decode_string(payload)?;
            Ok(CaMessage::MmiEnq(MmiEnquiry {
                blind,
                expected_length,
                text,
            }))
        }
        MessageType::MmiMenu | MessageType::MmiList => {
            let title = decode_string(payload)?;
            let subtitle = decode_string(payload)?;
            let bottom = decode_string(payload)?;
            let count = get_u16(payload)? as usize;
            let mut items = Vec::new();
            for _ in 0..count {
                items.push(decode_string(payload)?);
            }
            let raw = decode_blob(payload)?;
            let menu = MmiMenu {
                title,
                subtitle,
                bottom,
                items,
                raw,
            };
            Ok(if msg_type == MessageType::MmiMenu {
                CaMessage::MmiMenu(menu)
            } else {
                CaMessage::MmiList(menu)
            })
        }
        MessageType::MmiClose => {
            let cmd_id = get_u8(payload)?;
            let delay = get_u8(payload)?;
            Ok(CaMessage::MmiClose(MmiClose { cmd_id, delay }))
        }
        MessageType::MmiDisplayControl => {
            let cmd_id = get_u8(payload)?;
            let mmi_mode = get_u8(payload)?;
            Ok(CaMessage::MmiDisplayControl(DisplayControl { cmd_id, mmi_mode }))
        }
        MessageType::CamState => {
            let inserted = get_u8(payload)? != 0;
            Ok(CaMessage::CamState { inserted })
        }
        MessageType::Raw => {
            let tag = decode_string(payload)?;
            let data = decode_blob(payload)?;
            Ok(CaMessage::Raw { tag, data })
        }
        other => Err(ProtocolError::WrongDirection(other.name())),
    }
}

/// Decode the body of an application→CA message.
pub fn decode_app_message(msg_type: MessageType, mut payload: Bytes) -> Result<AppMessage, ProtocolError> {
    let msg = take_app_body(msg_type, &mut payload)?;
    finish(&payload, msg)
}

fn take_app_body(msg_type: MessageType, payload: &mut Bytes) -> Result<AppMessage, ProtocolError> {
    match msg_type {
        MessageType::Answer => {
            let kind = get_u8(payload)?;
            let text = decode_string(payload)?;
            match kind {
                0 => Ok(AppMessage::Answer(MmiAnswer::Cancel)),
                1 => Ok(AppMessage::Answer(MmiAnswer::Text(text))),
                other => Err(ProtocolError::DecodeError(format!(
                    "invalid answer kind {other}"
                ))),
            }
        }
        MessageType::AnswerMenu => {
            let choice = get_u8(payload)?;
            Ok(AppMessage::AnswerMenu { choice })
        }
        MessageType::CloseMmi => {
            let cmd_id = get_u8(payload)?;
            let delay = get_u8(payload)?;
            Ok(AppMessage::CloseMmi(MmiClose { cmd_id, delay }))
        }
        MessageType::SetPmt => {
            let list_management = ListManagement::try_from(get_u8(payload)?)
                .map_err(|e| ProtocolError::DecodeError(e.to_string()))?;
            let cmd_id = CaPmtCmdId::try_from(get_u8(payload)?)
                .map_err(|e| ProtocolError::DecodeError(e.to_string()))?;
            let pmt = decode_blob(payload)?;
            Ok(AppMessage::SetPmt {
                pmt,
                list_management,
                cmd_id,
            })
        }
        MessageType::GetAppInfo => Ok(AppMessage::GetAppInfo),
        MessageType::GetCaInfo => Ok(AppMessage::GetCaInfo),
        MessageType::EnterMenu => Ok(AppMessage::EnterMenu),
        MessageType::Raw => {
            let tag = decode_string(payload)?;
            let data = decode_blob(payload)?;
            Ok(AppMessage::Raw { tag, data })
        }
        other => Err(ProtocolError::WrongDirection(other.name())),
    }
}

/// Decode the payload of a frame produced by [`encode_message`].
pub fn decode_message(msg_type: MessageType, mut payload: Bytes) -> Result<Message, ProtocolError> {
    let ca_name = decode_string(&mut payload)?;
    let dest = match get_u8(&mut payload)? {
        0 => Destination::Ca,
        1 => Destination::Manager,
        2 => Destination::App,
        other => {
            return Err(ProtocolError::DecodeError(format!(
                "invalid destination {other}"
            )))
        }
    };
    let body = take_ca_body(msg_type, &mut payload)?;
    finish(&payload, Message { ca_name, dest, body })
}

/// Decode the payload of a frame produced by [`encode_app_request`].
pub fn decode_app_request(
    msg_type: MessageType,
    mut payload: Bytes,
) -> Result<(Option<String>, AppMessage), ProtocolError> {
    let target = decode_optional_string(&mut payload)?;
    let body = take_app_body(msg_type, &mut payload)?;
    finish(&payload, (target, body))
}
