//! Boundary to the CI/CAM driver.
//!
//! The driver owns the session and transport layers of a Common-Interface
//! slot. The bridge only needs the application-layer primitives below and a
//! callback table for what the CAM sends back.

use std::sync::Arc;

use caman_protocol::{AppInfo, CaError, DisplayControl, MmiAnswer, MmiClose, MmiEnquiry, MmiMenu};

use crate::plugin::CaResult;

/// Application-layer events raised by the driver, usually from its own
/// session thread.
pub trait CiEvents: Send + Sync {
    fn on_app_info(&self, info: AppInfo);
    fn on_ca_info(&self, ca_system_ids: Vec<u16>);
    fn on_mmi_enq(&self, enquiry: MmiEnquiry);
    fn on_mmi_menu(&self, menu: MmiMenu);
    fn on_mmi_list(&self, list: MmiMenu);
    fn on_mmi_close(&self, close: MmiClose);
    fn on_display_control(&self, control: DisplayControl);
    fn on_cam_state(&self, inserted: bool);
}

/// A Common-Interface slot driver.
pub trait CiDriver: Send + Sync {
    /// Install the callback table. Callbacks run on the driver's own thread,
    /// never from inside one of the command methods below.
    fn register_callbacks(&self, events: Arc<dyn CiEvents>) -> CaResult;

    fn clear_callbacks(&self);

    /// Start the session layer.
    fn open_session(&self) -> CaResult;

    /// Stop the session layer. No callback may be running or fire once this
    /// returns.
    fn close_session(&self) -> CaResult;

    /// Claim the slot for `owner`; fails with `Unavailable` if another
    /// application holds it or the slot is empty.
    fn acquire_slot(&self, owner: &str) -> CaResult;

    fn release_slot(&self, owner: &str);

    /// Send a `ca_pmt()` object; the driver adds the APDU header.
    fn send_ca_pmt(&self, ca_pmt: &[u8]) -> CaResult;

    fn mmi_answer(&self, answer: &MmiAnswer) -> CaResult;

    /// Answer a menu or list; 0 returns to the parent menu.
    fn mmi_menu_answer(&self, choice: u8) -> CaResult;

    fn mmi_close(&self, close: MmiClose) -> CaResult;

    fn app_info_enquiry(&self) -> CaResult;

    fn ca_info_enquiry(&self) -> CaResult;

    /// Open the CAM's top-level menu.
    fn enter_menu(&self) -> CaResult {
        Err(CaError::NotSupported)
    }
}
