//! MPEG-TS input for the manager.
//!
//! Splits a byte stream into packets, reassembles PSI sections on the PAT,
//! CAT and PMT PIDs, and tracks table versions.

mod collector;
mod monitor;
mod packet;

pub use collector::SectionCollector;
pub use monitor::{TableEvent, TableMonitor};
pub use packet::{TsHeader, TsPacket, TsPacketIterator, SYNC_BYTE, TS_PACKET_SIZE};
