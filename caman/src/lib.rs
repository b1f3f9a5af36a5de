//! Conditional access manager.
//!
//! Lets a receiver descramble services without knowing which CA system
//! protects them. CA back-ends implement [`CaPlugin`] and are registered with
//! a [`CaManager`], which watches the PAT, CAT and PMTs of the tuned stream,
//! binds each started service to the first back-end that can handle it, and
//! carries messages between back-ends and the application.
//!
//! Two back-ends ship with the crate: [`CiBridge`] drives a Common-Interface
//! slot through a [`CiDriver`], and [`SoftCa`] is a logical CA module.

pub mod ci;
pub mod config;
pub mod logging;
pub mod manager;
pub mod plugin;
pub mod soft;
pub mod ts_analyzer;

#[cfg(test)]
mod testutil;

pub use caman_protocol as protocol;
pub use ci::{CiBridge, CiBridgeOptions, CiDriver, CiEvents, CiSlotSession};
pub use config::{Config, ConfigError};
pub use manager::{CaManager, MsgCallback, MsgSender, PluginInfo, PluginState, ServiceBinding};
pub use plugin::{CaOptions, CaPlugin, CaResult, CaType, TableTiming, TsContext, TsParams};
pub use soft::{CaPmtSink, LogSink, SoftCa};
