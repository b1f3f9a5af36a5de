//! Section builders and mocks shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use caman_protocol::psi::{crc32_mpeg2, PmtTable};
use caman_protocol::{
    AppMessage, CaError, CaPmt, Message, MessageType, MmiAnswer, MmiClose,
};

use crate::ci::{CiDriver, CiEvents};
use crate::manager::MsgSender;
use crate::plugin::{CaPlugin, CaResult, CaType, TsContext};
use crate::ts_analyzer::TS_PACKET_SIZE;

fn long_section(table_id: u8, extension: u16, version: u8, body: &[u8]) -> Vec<u8> {
    let section_length = (5 + body.len() + 4) as u16;
    let mut raw = vec![
        table_id,
        0xB0 | (section_length >> 8) as u8,
        section_length as u8,
        (extension >> 8) as u8,
        extension as u8,
        0xC1 | ((version & 0x1F) << 1),
        0x00,
        0x00,
    ];
    raw.extend_from_slice(body);
    let crc = crc32_mpeg2(&raw);
    raw.extend_from_slice(&crc.to_be_bytes());
    raw
}

fn ca_descriptor(ca_system_id: u16, ca_pid: u16) -> [u8; 6] {
    let id = ca_system_id.to_be_bytes();
    [0x09, 0x04, id[0], id[1], 0xE0 | (ca_pid >> 8) as u8, ca_pid as u8]
}

/// PAT with `(service_id, pmt_pid)` entries.
pub fn pat_section(transport_stream_id: u16, version: u8, programs: &[(u16, u16)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (sid, pid) in programs {
        body.extend_from_slice(&sid.to_be_bytes());
        body.extend_from_slice(&(0xE000 | pid).to_be_bytes());
    }
    long_section(0x00, transport_stream_id, version, &body)
}

/// CAT announcing EMM streams of `ca_system_ids`.
pub fn cat_section(version: u8, ca_system_ids: &[u16]) -> Vec<u8> {
    let mut body = Vec::new();
    for (i, id) in ca_system_ids.iter().enumerate() {
        body.extend_from_slice(&ca_descriptor(*id, 0x0050 + i as u16));
    }
    long_section(0x01, 0xFFFF, version, &body)
}

/// PMT with video 0x0111 and audio 0x0112, scrambled by `ca_system_ids` at
/// program level.
pub fn pmt_section(service_id: u16, version: u8, ca_system_ids: &[u16]) -> Vec<u8> {
    let mut program_info = Vec::new();
    for (i, id) in ca_system_ids.iter().enumerate() {
        program_info.extend_from_slice(&ca_descriptor(*id, 0x0100 + i as u16));
    }

    let mut body = vec![0xE1, 0x11];
    body.extend_from_slice(&(0xF000 | program_info.len() as u16).to_be_bytes());
    body.extend_from_slice(&program_info);
    body.extend_from_slice(&[0x1B, 0xE1, 0x11, 0xF0, 0x00]);
    body.extend_from_slice(&[0x0F, 0xE1, 0x12, 0xF0, 0x00]);
    long_section(0x02, service_id, version, &body)
}

/// Split a section into TS packets on `pid`, continuity counters from `cc`.
pub fn packetize(pid: u16, cc: u8, section: &[u8]) -> Vec<u8> {
    let mut payload = vec![0x00];
    payload.extend_from_slice(section);

    let mut out = Vec::new();
    for (i, chunk) in payload.chunks(TS_PACKET_SIZE - 4).enumerate() {
        let mut packet = vec![0xFFu8; TS_PACKET_SIZE];
        packet[0] = 0x47;
        packet[1] = (if i == 0 { 0x40 } else { 0x00 }) | (pid >> 8) as u8 & 0x1F;
        packet[2] = pid as u8;
        packet[3] = 0x10 | (cc.wrapping_add(i as u8) & 0x0F);
        packet[4..4 + chunk.len()].copy_from_slice(chunk);
        out.extend_from_slice(&packet);
    }
    out
}

/// A call made on [`MockPlugin`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginCall {
    Open,
    Close,
    TsChanged,
    NewCat,
    StartPmt { service_id: u16, version: u8 },
    StopPmt(u16),
    Enable(bool),
    Receive(MessageType),
}

/// Recording plug-in matching a fixed set of CA systems.
pub struct MockPlugin {
    ca_type: CaType,
    ca_system_ids: Vec<u16>,
    calls: Mutex<Vec<PluginCall>>,
    sender: Mutex<Option<MsgSender>>,
    reject_start: AtomicBool,
    freed: AtomicUsize,
}

impl MockPlugin {
    pub fn new(ca_system_ids: &[u16]) -> Arc<Self> {
        Self::with_type(CaType::Logical, ca_system_ids)
    }

    pub fn ci(ca_system_ids: &[u16]) -> Arc<Self> {
        Self::with_type(CaType::Ci, ca_system_ids)
    }

    fn with_type(ca_type: CaType, ca_system_ids: &[u16]) -> Arc<Self> {
        Arc::new(Self {
            ca_type,
            ca_system_ids: ca_system_ids.to_vec(),
            calls: Mutex::new(Vec::new()),
            sender: Mutex::new(None),
            reject_start: AtomicBool::new(false),
            freed: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> Vec<PluginCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    pub fn starts(&self) -> Vec<PluginCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, PluginCall::StartPmt { .. }))
            .collect()
    }

    pub fn stops(&self) -> Vec<u16> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                PluginCall::StopPmt(sid) => Some(sid),
                _ => None,
            })
            .collect()
    }

    pub fn sender(&self) -> MsgSender {
        self.sender.lock().clone().expect("plug-in was not opened")
    }

    pub fn reject_start(&self, reject: bool) {
        self.reject_start.store(reject, Ordering::SeqCst);
    }

    pub fn freed(&self) -> usize {
        self.freed.load(Ordering::SeqCst)
    }

    fn record(&self, call: PluginCall) {
        self.calls.lock().push(call);
    }
}

impl CaPlugin for MockPlugin {
    fn ca_type(&self) -> CaType {
        self.ca_type
    }

    fn open(&self, _ts: &TsContext) -> CaResult {
        self.record(PluginCall::Open);
        Ok(())
    }

    fn close(&self) -> CaResult {
        self.record(PluginCall::Close);
        Ok(())
    }

    fn camatch(&self, ca_system_id: u16) -> bool {
        self.ca_system_ids.contains(&ca_system_id)
    }

    fn ts_changed(&self) {
        self.record(PluginCall::TsChanged);
    }

    fn new_cat(&self, _cat: &[u8]) {
        self.record(PluginCall::NewCat);
    }

    fn start_pmt(&self, service_id: u16, pmt: &[u8]) -> CaResult {
        if self.reject_start.load(Ordering::SeqCst) {
            return Err(CaError::NotSupported);
        }
        let version = PmtTable::from_bytes(pmt)?.version_number;
        self.record(PluginCall::StartPmt {
            service_id,
            version,
        });
        Ok(())
    }

    fn stop_pmt(&self, service_id: u16) -> CaResult {
        self.record(PluginCall::StopPmt(service_id));
        Ok(())
    }

    fn enable(&self, enable: bool) -> CaResult {
        self.record(PluginCall::Enable(enable));
        Ok(())
    }

    fn register_msg_send(&self, _name: &str, sender: MsgSender) -> CaResult {
        *self.sender.lock() = Some(sender);
        Ok(())
    }

    fn free_msg(&self, msg: Message) {
        self.freed.fetch_add(1, Ordering::SeqCst);
        drop(msg);
    }

    fn msg_receive(&self, msg: AppMessage) -> CaResult {
        self.record(PluginCall::Receive(msg.message_type()));
        Ok(())
    }
}

/// A call made on [`MockDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    RegisterCallbacks,
    ClearCallbacks,
    OpenSession,
    CloseSession,
    AcquireSlot(String),
    ReleaseSlot(String),
    CaPmt(Vec<u8>),
    MmiAnswer(MmiAnswer),
    MmiMenuAnswer(u8),
    MmiClose(MmiClose),
    AppInfoEnquiry,
    CaInfoEnquiry,
    EnterMenu,
}

/// Recording CI driver. Tests fire CAM events through [`events`](Self::events).
#[derive(Default)]
pub struct MockDriver {
    calls: Mutex<Vec<DriverCall>>,
    events: Mutex<Option<Arc<dyn CiEvents>>>,
    slot_busy: AtomicBool,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().clone()
    }

    /// Every CA-PMT sent so far, parsed.
    pub fn ca_pmts(&self) -> Vec<CaPmt> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::CaPmt(raw) => Some(CaPmt::parse(&raw).expect("driver got a bad CA-PMT")),
                _ => None,
            })
            .collect()
    }

    pub fn events(&self) -> Arc<dyn CiEvents> {
        self.events.lock().clone().expect("callbacks not registered")
    }

    pub fn has_callbacks(&self) -> bool {
        self.events.lock().is_some()
    }

    pub fn set_slot_busy(&self, busy: bool) {
        self.slot_busy.store(busy, Ordering::SeqCst);
    }

    fn record(&self, call: DriverCall) {
        self.calls.lock().push(call);
    }
}

impl CiDriver for MockDriver {
    fn register_callbacks(&self, events: Arc<dyn CiEvents>) -> CaResult {
        self.record(DriverCall::RegisterCallbacks);
        *self.events.lock() = Some(events);
        Ok(())
    }

    fn clear_callbacks(&self) {
        self.record(DriverCall::ClearCallbacks);
        *self.events.lock() = None;
    }

    fn open_session(&self) -> CaResult {
        self.record(DriverCall::OpenSession);
        Ok(())
    }

    fn close_session(&self) -> CaResult {
        self.record(DriverCall::CloseSession);
        Ok(())
    }

    fn acquire_slot(&self, owner: &str) -> CaResult {
        if self.slot_busy.load(Ordering::SeqCst) {
            return Err(CaError::Unavailable("slot held by another application".into()));
        }
        self.record(DriverCall::AcquireSlot(owner.to_string()));
        Ok(())
    }

    fn release_slot(&self, owner: &str) {
        self.record(DriverCall::ReleaseSlot(owner.to_string()));
    }

    fn send_ca_pmt(&self, ca_pmt: &[u8]) -> CaResult {
        self.record(DriverCall::CaPmt(ca_pmt.to_vec()));
        Ok(())
    }

    fn mmi_answer(&self, answer: &MmiAnswer) -> CaResult {
        self.record(DriverCall::MmiAnswer(answer.clone()));
        Ok(())
    }

    fn mmi_menu_answer(&self, choice: u8) -> CaResult {
        self.record(DriverCall::MmiMenuAnswer(choice));
        Ok(())
    }

    fn mmi_close(&self, close: MmiClose) -> CaResult {
        self.record(DriverCall::MmiClose(close));
        Ok(())
    }

    fn app_info_enquiry(&self) -> CaResult {
        self.record(DriverCall::AppInfoEnquiry);
        Ok(())
    }

    fn ca_info_enquiry(&self) -> CaResult {
        self.record(DriverCall::CaInfoEnquiry);
        Ok(())
    }

    fn enter_menu(&self) -> CaResult {
        self.record(DriverCall::EnterMenu);
        Ok(())
    }
}
