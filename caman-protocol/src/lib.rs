//! Data model and binary formats for the conditional access manager.
//!
//! This crate is I/O free. It defines:
//!
//! - the error taxonomy shared by the manager and every CA back-end,
//! - the message catalog exchanged between CA plug-ins and applications,
//!   and its binary codec,
//! - PSI table parsing (PAT, CAT, PMT and CA descriptors),
//! - the PMT to CA-PMT transform sent to a CAM.
//!
//! # Frame Format
//!
//! Applications living out of process exchange messages in frames:
//!
//! ```text
//! +--------+--------+--------+------------------+
//! | Magic  | Length | Type   |     Payload      |
//! | "CAMB" | u32 LE | u16 LE |    (variable)    |
//! +--------+--------+--------+------------------+
//! | 4 bytes| 4 bytes| 2 bytes|  Length bytes    |
//! ```
//!
//! # Example
//!
//! ```rust
//! use caman_protocol::{decode_ca_message, decode_header, encode_ca_message, CaMessage};
//! use bytes::Bytes;
//!
//! let msg = CaMessage::CaInfo { ca_system_ids: vec![0x0500, 0x1810] };
//! let encoded = encode_ca_message(&msg).unwrap();
//!
//! let header = decode_header(&encoded).unwrap().unwrap();
//! let payload = Bytes::copy_from_slice(&encoded[10..]);
//! let decoded = decode_ca_message(header.message_type, payload).unwrap();
//! assert_eq!(decoded, msg);
//! ```

pub mod capmt;
pub mod codec;
pub mod error;
pub mod psi;
pub mod types;

pub use capmt::{generate_ca_pmt, CaPmt, CaPmtStream};
pub use codec::{
    decode_app_message, decode_app_request, decode_ca_message, decode_header, decode_message,
    encode_app_message, encode_app_request, encode_ca_message, encode_message, FrameHeader,
    HEADER_SIZE,
};
pub use error::{CaError, ErrorCode, ProtocolError};
pub use types::{
    close_mmi, AppInfo, AppMessage, CaMessage, CaPmtCmdId, Destination, DisplayControl,
    ListManagement, Message, MessageType, MmiAnswer, MmiClose, MmiEnquiry, MmiMenu, MAGIC,
    MAX_FRAME_SIZE,
};
