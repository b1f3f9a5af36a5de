//! Message catalog exchanged between CA plug-ins, the manager and the application.

use serde::{Deserialize, Serialize};

use crate::error::CaError;

/// Magic bytes for the IPC frame header: "CAMB" (CA Manager Bus).
pub const MAGIC: [u8; 4] = *b"CAMB";

/// Maximum frame payload size (1 MB). A PMT section never exceeds 1024 bytes,
/// MMI menus stay well below this.
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

/// Logical endpoint a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Destination {
    /// A CA plug-in.
    Ca,
    /// The CA manager itself.
    Manager,
    /// The receiver application.
    App,
}

/// EN50221 `ca_pmt_list_management` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ListManagement {
    More = 0x00,
    First = 0x01,
    Last = 0x02,
    Only = 0x03,
    Add = 0x04,
    Update = 0x05,
}

impl TryFrom<u8> for ListManagement {
    type Error = CaError;

    fn try_from(value: u8) -> Result<Self, CaError> {
        match value {
            0x00 => Ok(ListManagement::More),
            0x01 => Ok(ListManagement::First),
            0x02 => Ok(ListManagement::Last),
            0x03 => Ok(ListManagement::Only),
            0x04 => Ok(ListManagement::Add),
            0x05 => Ok(ListManagement::Update),
            _ => Err(CaError::BadParam(format!(
                "invalid list management 0x{value:02X}"
            ))),
        }
    }
}

/// EN50221 `ca_pmt_cmd_id` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum CaPmtCmdId {
    OkDescrambling = 0x01,
    OkMmi = 0x02,
    Query = 0x03,
    NotSelected = 0x04,
}

impl TryFrom<u8> for CaPmtCmdId {
    type Error = CaError;

    fn try_from(value: u8) -> Result<Self, CaError> {
        match value {
            0x01 => Ok(CaPmtCmdId::OkDescrambling),
            0x02 => Ok(CaPmtCmdId::OkMmi),
            0x03 => Ok(CaPmtCmdId::Query),
            0x04 => Ok(CaPmtCmdId::NotSelected),
            _ => Err(CaError::BadParam(format!("invalid ca_pmt_cmd_id 0x{value:02X}"))),
        }
    }
}

/// Message type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    // CAM to application (0x01xx)
    /// Application information reported by the CAM.
    AppInfo = 0x0100,
    /// CA system ids supported by the CAM.
    CaInfo = 0x0101,
    /// MMI enquiry (text input request).
    MmiEnq = 0x0102,
    /// MMI menu.
    MmiMenu = 0x0103,
    /// MMI list.
    MmiList = 0x0104,
    /// MMI close request.
    MmiClose = 0x0105,
    /// MMI display control.
    MmiDisplayControl = 0x0106,
    /// Card inserted or removed.
    CamState = 0x0107,

    // Application to CAM (0x02xx)
    /// Reply to an MMI enquiry.
    Answer = 0x0200,
    /// Reply to an MMI menu or list.
    AnswerMenu = 0x0201,
    /// Close the MMI dialogue.
    CloseMmi = 0x0202,
    /// Send a CA-PMT generated from a raw PMT.
    SetPmt = 0x0203,
    /// Re-request application information.
    GetAppInfo = 0x0204,
    /// Re-request CA information.
    GetCaInfo = 0x0205,
    /// Open the CAM's top level menu.
    EnterMenu = 0x0206,

    // Back-end specific (0xFFxx)
    /// Opaque payload with a free-form tag.
    Raw = 0xFF00,
}

impl MessageType {
    /// Stable name of the message type, as used in logs and by applications.
    pub fn name(self) -> &'static str {
        match self {
            MessageType::AppInfo => "appinfo",
            MessageType::CaInfo => "cainfo",
            MessageType::MmiEnq => "mmi_enq",
            MessageType::MmiMenu => "mmi_menu",
            MessageType::MmiList => "mmi_list",
            MessageType::MmiClose => "mmi_close",
            MessageType::MmiDisplayControl => "mmi_display_control",
            MessageType::CamState => "cam_state",
            MessageType::Answer => "answer",
            MessageType::AnswerMenu => "answer_menu",
            MessageType::CloseMmi => "close_mmi",
            MessageType::SetPmt => "set_pmt",
            MessageType::GetAppInfo => "get_appinfo",
            MessageType::GetCaInfo => "get_cainfo",
            MessageType::EnterMenu => "enter_menu",
            MessageType::Raw => "raw",
        }
    }

    /// Look a message type up by its stable name.
    pub fn from_name(name: &str) -> Option<Self> {
        const ALL: [MessageType; 16] = [
            MessageType::AppInfo,
            MessageType::CaInfo,
            MessageType::MmiEnq,
            MessageType::MmiMenu,
            MessageType::MmiList,
            MessageType::MmiClose,
            MessageType::MmiDisplayControl,
            MessageType::CamState,
            MessageType::Answer,
            MessageType::AnswerMenu,
            MessageType::CloseMmi,
            MessageType::SetPmt,
            MessageType::GetAppInfo,
            MessageType::GetCaInfo,
            MessageType::EnterMenu,
            MessageType::Raw,
        ];
        ALL.into_iter().find(|t| t.name() == name)
    }
}

impl TryFrom<u16> for MessageType {
    type Error = u16;

    fn try_from(value: u16) -> Result<Self, u16> {
        match value {
            0x0100 => Ok(MessageType::AppInfo),
            0x0101 => Ok(MessageType::CaInfo),
            0x0102 => Ok(MessageType::MmiEnq),
            0x0103 => Ok(MessageType::MmiMenu),
            0x0104 => Ok(MessageType::MmiList),
            0x0105 => Ok(MessageType::MmiClose),
            0x0106 => Ok(MessageType::MmiDisplayControl),
            0x0107 => Ok(MessageType::CamState),
            0x0200 => Ok(MessageType::Answer),
            0x0201 => Ok(MessageType::AnswerMenu),
            0x0202 => Ok(MessageType::CloseMmi),
            0x0203 => Ok(MessageType::SetPmt),
            0x0204 => Ok(MessageType::GetAppInfo),
            0x0205 => Ok(MessageType::GetCaInfo),
            0x0206 => Ok(MessageType::EnterMenu),
            0xFF00 => Ok(MessageType::Raw),
            _ => Err(value),
        }
    }
}

impl From<MessageType> for u16 {
    fn from(value: MessageType) -> Self {
        value as u16
    }
}

/// Application information resource reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub application_type: u8,
    pub manufacturer: u16,
    pub manufacturer_code: u16,
    pub menu_string: String,
}

/// MMI enquiry: the CAM asks the subscriber to type something (usually a PIN).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmiEnquiry {
    /// Input should be masked on screen.
    pub blind: bool,
    /// Expected answer length, 0 if unknown.
    pub expected_length: u8,
    pub text: String,
}

/// MMI menu or list object.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MmiMenu {
    pub title: String,
    pub subtitle: String,
    pub bottom: String,
    pub items: Vec<String>,
    /// Undecoded trailing bytes of the APDU, passed through untouched.
    pub raw: Vec<u8>,
}

/// `close_mmi_cmd_id` values.
pub mod close_mmi {
    pub const IMMEDIATE: u8 = 0x00;
    pub const DELAY: u8 = 0x01;
}

/// MMI close request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmiClose {
    pub cmd_id: u8,
    /// Delay in seconds, meaningful only with [`close_mmi::DELAY`].
    pub delay: u8,
}

/// MMI display control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DisplayControl {
    pub cmd_id: u8,
    pub mmi_mode: u8,
}

/// Subscriber reply to an MMI enquiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MmiAnswer {
    /// The subscriber dismissed the enquiry.
    Cancel,
    /// The typed text.
    Text(String),
}

/// Messages sent from a CA plug-in to the application or manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaMessage {
    AppInfo(AppInfo),
    CaInfo { ca_system_ids: Vec<u16> },
    MmiEnq(MmiEnquiry),
    MmiMenu(MmiMenu),
    MmiList(MmiMenu),
    MmiClose(MmiClose),
    MmiDisplayControl(DisplayControl),
    CamState { inserted: bool },
    Raw { tag: String, data: Vec<u8> },
}

/// Messages sent from the application to a CA plug-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppMessage {
    Answer(MmiAnswer),
    /// Selected item, 1-based; 0 returns to the parent menu.
    AnswerMenu { choice: u8 },
    CloseMmi(MmiClose),
    SetPmt {
        pmt: Vec<u8>,
        list_management: ListManagement,
        cmd_id: CaPmtCmdId,
    },
    GetAppInfo,
    GetCaInfo,
    EnterMenu,
    Raw { tag: String, data: Vec<u8> },
}

impl CaMessage {
    /// Returns the message type for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            CaMessage::AppInfo(_) => MessageType::AppInfo,
            CaMessage::CaInfo { .. } => MessageType::CaInfo,
            CaMessage::MmiEnq(_) => MessageType::MmiEnq,
            CaMessage::MmiMenu(_) => MessageType::MmiMenu,
            CaMessage::MmiList(_) => MessageType::MmiList,
            CaMessage::MmiClose(_) => MessageType::MmiClose,
            CaMessage::MmiDisplayControl(_) => MessageType::MmiDisplayControl,
            CaMessage::CamState { .. } => MessageType::CamState,
            CaMessage::Raw { .. } => MessageType::Raw,
        }
    }
}

impl AppMessage {
    /// Returns the message type for this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            AppMessage::Answer(_) => MessageType::Answer,
            AppMessage::AnswerMenu { .. } => MessageType::AnswerMenu,
            AppMessage::CloseMmi(_) => MessageType::CloseMmi,
            AppMessage::SetPmt { .. } => MessageType::SetPmt,
            AppMessage::GetAppInfo => MessageType::GetAppInfo,
            AppMessage::GetCaInfo => MessageType::GetCaInfo,
            AppMessage::EnterMenu => MessageType::EnterMenu,
            AppMessage::Raw { .. } => MessageType::Raw,
        }
    }
}

/// An addressed message travelling from a CA plug-in.
///
/// The envelope is owned by exactly one party at a time: moving it into
/// `free_msg` (or dropping it) releases it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Name of the plug-in that produced the message.
    pub ca_name: String,
    pub dest: Destination,
    pub body: CaMessage,
}

impl Message {
    pub fn new(ca_name: impl Into<String>, dest: Destination, body: CaMessage) -> Self {
        Self {
            ca_name: ca_name.into(),
            dest,
            body,
        }
    }

    /// Returns the message type of the body.
    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }
}
