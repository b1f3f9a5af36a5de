//! Software CA plug-in.
//!
//! `SoftCa` accepts a configured set of CA systems and turns every PMT it is
//! given into a CA-PMT, which goes to a [`CaPmtSink`] and is reported to the
//! application as a `raw` message tagged `capmt`. Unlike a CI slot it keeps
//! one seen flag per service.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;

use caman_protocol::{
    generate_ca_pmt, AppMessage, CaError, CaMessage, CaPmtCmdId, Destination, ListManagement,
};

use crate::manager::MsgSender;
use crate::plugin::{CaPlugin, CaResult, TsContext};

/// Tag of the `raw` message carrying a generated CA-PMT.
pub const CAPMT_TAG: &str = "capmt";

/// Where generated CA-PMTs go.
pub trait CaPmtSink: Send + Sync {
    fn send(&self, service_id: u16, ca_pmt: &[u8]) -> CaResult;
}

/// Sink that only logs.
#[derive(Debug, Default)]
pub struct LogSink;

impl CaPmtSink for LogSink {
    fn send(&self, service_id: u16, ca_pmt: &[u8]) -> CaResult {
        debug!("CA-PMT for service {}: {:02X?}", service_id, ca_pmt);
        Ok(())
    }
}

#[derive(Debug)]
struct SoftService {
    pmt: Vec<u8>,
    active: bool,
}

#[derive(Debug, Default)]
struct SoftState {
    opened: bool,
    enabled: bool,
    sender: Option<MsgSender>,
    services: HashMap<u16, SoftService>,
}

/// A logical CA back-end for a fixed set of CA systems.
pub struct SoftCa {
    name: String,
    ca_system_ids: Vec<u16>,
    strip_ca_descriptors: bool,
    sink: Arc<dyn CaPmtSink>,
    state: Mutex<SoftState>,
}

impl SoftCa {
    pub fn new(name: &str, ca_system_ids: Vec<u16>) -> Self {
        Self::with_sink(name, ca_system_ids, Arc::new(LogSink))
    }

    pub fn with_sink(name: &str, ca_system_ids: Vec<u16>, sink: Arc<dyn CaPmtSink>) -> Self {
        Self {
            name: name.to_string(),
            ca_system_ids,
            strip_ca_descriptors: false,
            sink,
            state: Mutex::new(SoftState::default()),
        }
    }

    pub fn strip_ca_descriptors(mut self, strip: bool) -> Self {
        self.strip_ca_descriptors = strip;
        self
    }

    pub fn ca_system_ids(&self) -> &[u16] {
        &self.ca_system_ids
    }

    /// Services currently descrambled, ascending.
    pub fn active_services(&self) -> Vec<u16> {
        let state = self.state.lock();
        let mut sids: Vec<u16> = state
            .services
            .iter()
            .filter(|(_, s)| s.active)
            .map(|(sid, _)| *sid)
            .collect();
        sids.sort_unstable();
        sids
    }

    fn emit(&self, body: CaMessage) {
        let sender = {
            let state = self.state.lock();
            match (&state.sender, state.enabled) {
                (Some(sender), true) => sender.clone(),
                _ => return,
            }
        };
        if let Err(e) = sender.send(Destination::App, body) {
            warn!("{}: message not delivered: {}", self.name, e);
        }
    }

    fn deliver(
        &self,
        service_id: u16,
        pmt: &[u8],
        list_management: ListManagement,
        cmd_id: CaPmtCmdId,
    ) -> CaResult {
        let ca_pmt = generate_ca_pmt(pmt, list_management, cmd_id, self.strip_ca_descriptors)?;
        self.sink.send(service_id, &ca_pmt)?;
        debug!(
            "{}: service {} {:?}/{:?}",
            self.name, service_id, list_management, cmd_id
        );
        self.emit(CaMessage::Raw {
            tag: CAPMT_TAG.to_string(),
            data: ca_pmt,
        });
        Ok(())
    }
}

impl CaPlugin for SoftCa {
    fn open(&self, ts: &TsContext) -> CaResult {
        let mut state = self.state.lock();
        if state.opened {
            return Err(CaError::AlreadyOpen);
        }
        state.opened = true;
        info!("{}: opened on stream generation {}", self.name, ts.generation);
        Ok(())
    }

    fn close(&self) -> CaResult {
        let mut state = self.state.lock();
        state.opened = false;
        state.services.clear();
        Ok(())
    }

    fn camatch(&self, ca_system_id: u16) -> bool {
        self.ca_system_ids.contains(&ca_system_id)
    }

    fn ts_changed(&self) {
        self.state.lock().services.clear();
    }

    fn new_cat(&self, cat: &[u8]) {
        debug!("{}: CAT of {} bytes", self.name, cat.len());
    }

    fn start_pmt(&self, service_id: u16, pmt: &[u8]) -> CaResult {
        let list_management = {
            let state = self.state.lock();
            if !state.opened {
                return Err(CaError::NotOpen);
            }
            if state.services.contains_key(&service_id) {
                ListManagement::Update
            } else {
                ListManagement::Only
            }
        };

        self.deliver(service_id, pmt, list_management, CaPmtCmdId::OkDescrambling)?;

        let mut cached = Vec::new();
        cached.try_reserve_exact(pmt.len())?;
        cached.extend_from_slice(pmt);
        self.state.lock().services.insert(
            service_id,
            SoftService {
                pmt: cached,
                active: true,
            },
        );
        Ok(())
    }

    fn stop_pmt(&self, service_id: u16) -> CaResult {
        let pmt = {
            let state = self.state.lock();
            if !state.opened {
                return Err(CaError::NotOpen);
            }
            match state.services.get(&service_id) {
                Some(service) if service.active => service.pmt.clone(),
                _ => return Ok(()),
            }
        };

        self.deliver(service_id, &pmt, ListManagement::Update, CaPmtCmdId::NotSelected)?;
        if let Some(service) = self.state.lock().services.get_mut(&service_id) {
            service.active = false;
        }
        Ok(())
    }

    fn enable(&self, enable: bool) -> CaResult {
        self.state.lock().enabled = enable;
        Ok(())
    }

    fn register_msg_send(&self, _name: &str, sender: MsgSender) -> CaResult {
        self.state.lock().sender = Some(sender);
        Ok(())
    }

    fn msg_receive(&self, msg: AppMessage) -> CaResult {
        match msg {
            AppMessage::GetCaInfo => {
                self.emit(CaMessage::CaInfo {
                    ca_system_ids: self.ca_system_ids.clone(),
                });
                Ok(())
            }
            AppMessage::SetPmt {
                pmt,
                list_management,
                cmd_id,
            } => {
                let service_id = caman_protocol::psi::PmtTable::from_bytes(&pmt)?.program_number;
                self.deliver(service_id, &pmt, list_management, cmd_id)
            }
            _ => Err(CaError::NotSupported),
        }
    }
}
