//! CA plug-in over a Common-Interface slot.
//!
//! List management follows the slot's seen-PMT flag: the first CA-PMT for a
//! service is `ONLY`, later ones (new PMT versions, and the final
//! `NOT_SELECTED`) are `UPDATE`. The slot serves one service at a time; a
//! PMT for another service starts a fresh `ONLY` sequence.
//!
//! The last PMT is kept until the slot is closed or the stream changes,
//! because stopping needs the complete program map again.

use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use caman_protocol::{generate_ca_pmt, AppMessage, CaError, CaPmtCmdId, ListManagement};

use super::driver::{CiDriver, CiEvents};
use super::session::{CachedPmt, CiSlotSession, PendingMmi};
use crate::manager::MsgSender;
use crate::plugin::{CaPlugin, CaResult, CaType, TsContext};

/// Bridge options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CiBridgeOptions {
    /// Send CA-PMTs without CA descriptors.
    pub strip_ca_descriptors: bool,
}

/// A CI slot exposed as a CA plug-in.
pub struct CiBridge {
    /// Name used when claiming the slot.
    owner: String,
    driver: Arc<dyn CiDriver>,
    session: Arc<CiSlotSession>,
    options: CiBridgeOptions,
    /// Serializes commands to the CAM. Never taken by driver callbacks.
    commands: Mutex<()>,
}

impl CiBridge {
    pub fn new(owner: &str, driver: Arc<dyn CiDriver>, options: CiBridgeOptions) -> Self {
        Self {
            owner: owner.to_string(),
            driver,
            session: Arc::new(CiSlotSession::new()),
            options,
            commands: Mutex::new(()),
        }
    }

    pub fn session(&self) -> &Arc<CiSlotSession> {
        &self.session
    }

    fn ensure_open(&self) -> CaResult {
        if self.session.state.lock().opened {
            Ok(())
        } else {
            Err(CaError::NotOpen)
        }
    }

    fn send_ca_pmt(
        &self,
        pmt: &[u8],
        list_management: ListManagement,
        cmd_id: CaPmtCmdId,
    ) -> CaResult {
        let ca_pmt = generate_ca_pmt(
            pmt,
            list_management,
            cmd_id,
            self.options.strip_ca_descriptors,
        )?;
        self.driver.send_ca_pmt(&ca_pmt)?;
        debug!(
            "{}: CA-PMT {:?}/{:?} ({} bytes)",
            self.owner,
            list_management,
            cmd_id,
            ca_pmt.len()
        );
        Ok(())
    }

    /// Check an MMI reply against what the CAM is waiting for, forward it
    /// and clear the pending object.
    fn answer_mmi(
        &self,
        accepts: &[PendingMmi],
        reply: &str,
        forward: impl FnOnce(&dyn CiDriver) -> CaResult,
    ) -> CaResult {
        let pending = self.session.pending_mmi();
        match pending {
            Some(p) if accepts.contains(&p) => {}
            other => {
                warn!(
                    "{}: {} does not answer pending {:?}, ignored",
                    self.owner, reply, other
                );
                return Err(CaError::BadParam(format!(
                    "{reply} does not answer pending MMI {other:?}"
                )));
            }
        }

        forward(self.driver.as_ref())?;
        let mut state = self.session.state.lock();
        if state.pending_mmi == pending {
            state.pending_mmi = None;
        }
        Ok(())
    }
}

impl CaPlugin for CiBridge {
    fn ca_type(&self) -> CaType {
        CaType::Ci
    }

    fn open(&self, _ts: &TsContext) -> CaResult {
        let _commands = self.commands.lock();
        if self.session.state.lock().opened {
            return Err(CaError::AlreadyOpen);
        }

        let events: Arc<dyn CiEvents> = self.session.clone();
        self.driver.register_callbacks(events)?;
        if let Err(e) = self.driver.open_session() {
            self.driver.clear_callbacks();
            return Err(e);
        }
        if let Err(e) = self.driver.acquire_slot(&self.owner) {
            self.driver.clear_callbacks();
            let _ = self.driver.close_session();
            return Err(e);
        }

        let mut state = self.session.state.lock();
        state.opened = true;
        state.seen_pmt = false;
        state.descrambling = false;
        info!("{}: CI slot opened", self.owner);
        Ok(())
    }

    fn close(&self) -> CaResult {
        let _commands = self.commands.lock();
        if !self.session.state.lock().opened {
            return Ok(());
        }

        self.driver.clear_callbacks();
        self.driver.release_slot(&self.owner);
        let result = self.driver.close_session();

        let mut state = self.session.state.lock();
        state.opened = false;
        state.pending_mmi = None;
        state.forget_service();
        info!("{}: CI slot closed", self.owner);
        result
    }

    fn camatch(&self, ca_system_id: u16) -> bool {
        self.session
            .state
            .lock()
            .ca_system_ids
            .contains(&ca_system_id)
    }

    fn ts_changed(&self) {
        let mut state = self.session.state.lock();
        if state.cached_pmt.is_some() {
            debug!("{}: stream changed, dropping cached PMT", self.owner);
        }
        state.forget_service();
    }

    fn new_cat(&self, cat: &[u8]) {
        debug!("{}: CAT of {} bytes ignored", self.owner, cat.len());
    }

    fn start_pmt(&self, service_id: u16, pmt: &[u8]) -> CaResult {
        let _commands = self.commands.lock();
        let list_management = {
            let state = self.session.state.lock();
            if !state.opened {
                return Err(CaError::NotOpen);
            }
            let same_service = state
                .cached_pmt
                .as_ref()
                .is_some_and(|c| c.service_id == service_id);
            if same_service && state.seen_pmt {
                ListManagement::Update
            } else {
                ListManagement::Only
            }
        };

        let mut cached = Vec::new();
        cached.try_reserve_exact(pmt.len())?;
        cached.extend_from_slice(pmt);

        self.send_ca_pmt(pmt, list_management, CaPmtCmdId::OkDescrambling)?;

        let mut state = self.session.state.lock();
        state.cached_pmt = Some(CachedPmt {
            service_id,
            pmt: cached,
        });
        state.seen_pmt = true;
        state.descrambling = true;
        info!(
            "{}: descrambling service {} ({:?})",
            self.owner, service_id, list_management
        );
        Ok(())
    }

    fn stop_pmt(&self, service_id: u16) -> CaResult {
        let _commands = self.commands.lock();
        let (pmt, list_management) = {
            let state = self.session.state.lock();
            if !state.opened {
                return Err(CaError::NotOpen);
            }
            let Some(cached) = state
                .cached_pmt
                .as_ref()
                .filter(|c| c.service_id == service_id)
            else {
                debug!("{}: service {} is not on this slot", self.owner, service_id);
                return Ok(());
            };
            if !state.descrambling {
                debug!("{}: service {} already stopped", self.owner, service_id);
                return Ok(());
            }
            let list_management = if state.seen_pmt {
                ListManagement::Update
            } else {
                ListManagement::Only
            };
            (cached.pmt.clone(), list_management)
        };

        self.send_ca_pmt(&pmt, list_management, CaPmtCmdId::NotSelected)?;
        self.session.state.lock().descrambling = false;
        info!("{}: service {} deselected", self.owner, service_id);
        Ok(())
    }

    fn enable(&self, enable: bool) -> CaResult {
        self.session.state.lock().enabled = enable;
        Ok(())
    }

    fn register_msg_send(&self, name: &str, sender: MsgSender) -> CaResult {
        let mut state = self.session.state.lock();
        state.sender_name = name.to_string();
        state.sender = Some(sender);
        Ok(())
    }

    fn msg_receive(&self, msg: AppMessage) -> CaResult {
        let _commands = self.commands.lock();
        self.ensure_open()?;

        match msg {
            AppMessage::Answer(answer) => {
                self.answer_mmi(&[PendingMmi::Enquiry], "answer", |d| d.mmi_answer(&answer))
            }
            AppMessage::AnswerMenu { choice } => self.answer_mmi(
                &[PendingMmi::Menu, PendingMmi::List],
                "answer_menu",
                |d| d.mmi_menu_answer(choice),
            ),
            AppMessage::CloseMmi(close) => {
                self.driver.mmi_close(close)?;
                self.session.state.lock().pending_mmi = None;
                Ok(())
            }
            AppMessage::SetPmt {
                pmt,
                list_management,
                cmd_id,
            } => self.send_ca_pmt(&pmt, list_management, cmd_id),
            AppMessage::GetAppInfo => self.driver.app_info_enquiry(),
            AppMessage::GetCaInfo => self.driver.ca_info_enquiry(),
            AppMessage::EnterMenu => self.driver.enter_menu(),
            AppMessage::Raw { tag, .. } => {
                debug!("{}: raw message {} not handled", self.owner, tag);
                Err(CaError::NotSupported)
            }
        }
    }
}
