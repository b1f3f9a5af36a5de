//! Common-Interface bridge.

mod bridge;
mod driver;
mod session;

pub use bridge::{CiBridge, CiBridgeOptions};
pub use driver::{CiDriver, CiEvents};
pub use session::{CachedPmt, CiSlotSession, PendingMmi};
