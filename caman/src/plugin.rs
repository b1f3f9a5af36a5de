//! The contract every CA back-end implements.
//!
//! A back-end is registered with the [`CaManager`](crate::manager::CaManager)
//! under a unique name and is driven only through this trait. All methods
//! take `&self`: back-ends keep their own state behind a lock because the
//! manager and a driver thread may call into them concurrently.

use std::time::Duration;

use caman_protocol::{AppMessage, CaError, Message};

use crate::manager::MsgSender;

pub type CaResult<T = ()> = Result<T, CaError>;

/// Kind of back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaType {
    /// Software CA module.
    Logical,
    /// Common-Interface slot with a CAM.
    Ci,
}

impl std::fmt::Display for CaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaType::Logical => write!(f, "logical"),
            CaType::Ci => write!(f, "ci"),
        }
    }
}

/// Registration options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaOptions {
    /// Take part in automatic binding. A plug-in with this unset is only
    /// reachable by forced name.
    pub auto_match: bool,
}

impl Default for CaOptions {
    fn default() -> Self {
        Self { auto_match: true }
    }
}

/// How long to wait for a table and how often to look again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableTiming {
    pub timeout: Duration,
    pub poll: Duration,
}

impl TableTiming {
    pub const fn from_millis(timeout_ms: u64, poll_ms: u64) -> Self {
        Self {
            timeout: Duration::from_millis(timeout_ms),
            poll: Duration::from_millis(poll_ms),
        }
    }
}

impl Default for TableTiming {
    fn default() -> Self {
        Self::from_millis(3000, 100)
    }
}

/// Parameters of the tuned transport stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TsParams {
    /// Frontend device index.
    pub frontend: u32,
    /// Demux device index.
    pub demux: u32,
    pub pat: TableTiming,
    pub pmt: TableTiming,
    pub cat: TableTiming,
}

/// Per-stream context handed to plug-ins on `open`.
///
/// A new context (with a higher generation) replaces the old one whenever the
/// stream is retuned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsContext {
    pub params: TsParams,
    pub generation: u64,
}

/// A CA back-end.
pub trait CaPlugin: Send + Sync {
    fn ca_type(&self) -> CaType {
        CaType::Logical
    }

    /// Attach to the current transport stream.
    fn open(&self, ts: &TsContext) -> CaResult;

    /// Detach. Calling this on a plug-in that is not open must succeed.
    fn close(&self) -> CaResult;

    /// Whether this back-end can descramble `ca_system_id`. Must be free of
    /// side effects.
    fn camatch(&self, ca_system_id: u16) -> bool;

    /// The tuned stream changed; per-stream caches must be dropped.
    fn ts_changed(&self) {}

    /// A new CAT section (complete, CRC checked) was received.
    fn new_cat(&self, _cat: &[u8]) {}

    /// Start or update descrambling of `service_id` with a complete PMT
    /// section. A second call for the same service is an update.
    fn start_pmt(&self, service_id: u16, pmt: &[u8]) -> CaResult;

    /// Stop descrambling `service_id`.
    fn stop_pmt(&self, service_id: u16) -> CaResult;

    /// Allow or forbid message exchange.
    fn enable(&self, _enable: bool) -> CaResult {
        Ok(())
    }

    /// Hand over the sender used to push messages to the manager and
    /// application.
    fn register_msg_send(&self, _name: &str, _sender: MsgSender) -> CaResult {
        Err(CaError::NotSupported)
    }

    /// Release a message this plug-in produced.
    fn free_msg(&self, msg: Message) {
        drop(msg);
    }

    /// Handle a message from the application.
    fn msg_receive(&self, _msg: AppMessage) -> CaResult {
        Err(CaError::NotSupported)
    }
}
