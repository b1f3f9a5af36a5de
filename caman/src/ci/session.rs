//! Per-slot state shared between the bridge and the driver's session thread.

use log::{debug, info, warn};
use parking_lot::Mutex;

use caman_protocol::{
    AppInfo, CaMessage, Destination, DisplayControl, MmiClose, MmiEnquiry, MmiMenu,
};

use super::driver::CiEvents;
use crate::manager::MsgSender;

/// The MMI object the CAM is waiting for an answer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingMmi {
    Enquiry,
    Menu,
    List,
}

/// The last PMT sent for the slot's service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPmt {
    pub service_id: u16,
    pub pmt: Vec<u8>,
}

#[derive(Debug, Default)]
pub(crate) struct SlotState {
    pub opened: bool,
    /// A CA-PMT was already sent for the cached service.
    pub seen_pmt: bool,
    /// The CAM was told to descramble and has not been told to stop.
    pub descrambling: bool,
    pub cached_pmt: Option<CachedPmt>,
    pub enabled: bool,
    pub sender: Option<MsgSender>,
    pub sender_name: String,
    pub pending_mmi: Option<PendingMmi>,
    /// CA systems reported by the CAM.
    pub ca_system_ids: Vec<u16>,
    pub cam_inserted: bool,
}

impl SlotState {
    /// Forget the service (stream changed or slot closed).
    pub fn forget_service(&mut self) {
        self.seen_pmt = false;
        self.descrambling = false;
        self.cached_pmt = None;
    }
}

/// State of one CI slot.
#[derive(Debug, Default)]
pub struct CiSlotSession {
    pub(crate) state: Mutex<SlotState>,
}

impl CiSlotSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a message if delivery is enabled. The lock is released before
    /// the send.
    fn emit(&self, dest: Destination, body: CaMessage) {
        let sender = {
            let state = self.state.lock();
            match (&state.sender, state.enabled) {
                (Some(sender), true) => sender.clone(),
                _ => {
                    debug!(
                        "{}: delivery disabled, dropping {}",
                        state.sender_name,
                        body.message_type().name()
                    );
                    return;
                }
            }
        };

        if let Err(e) = sender.send(dest, body) {
            warn!("{}: message not delivered: {}", sender.name(), e);
        }
    }

    fn set_pending(&self, pending: PendingMmi) {
        let mut state = self.state.lock();
        if let Some(previous) = state.pending_mmi.replace(pending) {
            warn!(
                "{}: {:?} replaces unanswered {:?}",
                state.sender_name, pending, previous
            );
        }
    }

    pub fn pending_mmi(&self) -> Option<PendingMmi> {
        self.state.lock().pending_mmi
    }

    pub fn cached_pmt(&self) -> Option<CachedPmt> {
        self.state.lock().cached_pmt.clone()
    }

    pub fn seen_pmt(&self) -> bool {
        self.state.lock().seen_pmt
    }
}

impl CiEvents for CiSlotSession {
    fn on_app_info(&self, info: AppInfo) {
        info!(
            "CAM application \"{}\" (type {}, manufacturer 0x{:04X})",
            info.menu_string, info.application_type, info.manufacturer
        );
        self.emit(Destination::App, CaMessage::AppInfo(info));
    }

    fn on_ca_info(&self, ca_system_ids: Vec<u16>) {
        info!("CAM supports CA systems {:04X?}", ca_system_ids);
        self.state.lock().ca_system_ids = ca_system_ids.clone();
        self.emit(Destination::App, CaMessage::CaInfo { ca_system_ids });
    }

    fn on_mmi_enq(&self, enquiry: MmiEnquiry) {
        self.set_pending(PendingMmi::Enquiry);
        self.emit(Destination::App, CaMessage::MmiEnq(enquiry));
    }

    fn on_mmi_menu(&self, menu: MmiMenu) {
        self.set_pending(PendingMmi::Menu);
        self.emit(Destination::App, CaMessage::MmiMenu(menu));
    }

    fn on_mmi_list(&self, list: MmiMenu) {
        self.set_pending(PendingMmi::List);
        self.emit(Destination::App, CaMessage::MmiList(list));
    }

    fn on_mmi_close(&self, close: MmiClose) {
        self.state.lock().pending_mmi = None;
        self.emit(Destination::App, CaMessage::MmiClose(close));
    }

    fn on_display_control(&self, control: DisplayControl) {
        self.emit(Destination::App, CaMessage::MmiDisplayControl(control));
    }

    fn on_cam_state(&self, inserted: bool) {
        {
            let mut state = self.state.lock();
            state.cam_inserted = inserted;
            if !inserted {
                state.ca_system_ids.clear();
                state.pending_mmi = None;
                // a new card starts with a fresh ONLY; the cached PMT stays
                state.seen_pmt = false;
                state.descrambling = false;
            }
        }
        info!("CAM {}", if inserted { "inserted" } else { "removed" });
        self.emit(Destination::Manager, CaMessage::CamState { inserted });
    }
}
