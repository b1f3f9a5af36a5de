//! PSI (Program Specific Information) tables used for CA selection.
//!
//! # Supported Tables
//! - PAT (Program Association Table) - PID 0x0000
//! - CAT (Conditional Access Table) - PID 0x0001
//! - PMT (Program Map Table) - Variable PIDs from PAT

mod cat;
mod descriptors;
mod pat;
mod pmt;
mod section;

pub use cat::CatTable;
pub use descriptors::{CaDescriptor, Descriptor, DescriptorIter};
pub use pat::PatTable;
pub use pmt::{PmtStream, PmtTable};
pub use section::{crc32_mpeg2, PsiHeader, PsiSection};

/// Well-known PIDs in MPEG-TS.
pub mod pid {
    /// Program Association Table PID.
    pub const PAT: u16 = 0x0000;
    /// Conditional Access Table PID.
    pub const CAT: u16 = 0x0001;
    /// Null packet PID (stuffing).
    pub const NULL: u16 = 0x1FFF;
}

/// Table IDs for PSI tables.
pub mod table_id {
    /// Program Association Section.
    pub const PAT: u8 = 0x00;
    /// Conditional Access Section.
    pub const CAT: u8 = 0x01;
    /// Program Map Section.
    pub const PMT: u8 = 0x02;
}

/// Descriptor tags used by the CA layer.
pub mod descriptor_tag {
    /// CA descriptor (ISO/IEC 13818-1).
    pub const CA: u8 = 0x09;
}
