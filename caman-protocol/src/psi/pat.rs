//! Program association table.

use std::collections::BTreeMap;

use crate::error::CaError;

use super::section::PsiSection;
use super::table_id;

/// A decoded PAT: which PID carries the PMT of each service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatTable {
    pub transport_stream_id: u16,
    pub version_number: u8,
    /// Service id to PMT PID, ascending by service id.
    pub services: BTreeMap<u16, u16>,
    /// PID announced for program number 0.
    pub network_pid: Option<u16>,
}

impl PatTable {
    pub fn parse(section: &PsiSection) -> Result<Self, CaError> {
        if section.header.table_id != table_id::PAT {
            return Err(CaError::BadParam(format!(
                "table 0x{:02X} is not a PAT",
                section.header.table_id
            )));
        }
        let loop_bytes = section.data.chunks_exact(4);
        if !loop_bytes.remainder().is_empty() {
            return Err(CaError::BadParam(format!(
                "PAT loop of {} bytes",
                section.data.len()
            )));
        }

        let mut pat = PatTable {
            transport_stream_id: section.header.table_id_extension,
            version_number: section.header.version_number,
            ..Default::default()
        };
        for entry in loop_bytes {
            let number = u16::from_be_bytes([entry[0], entry[1]]);
            let pid = u16::from_be_bytes([entry[2] & 0x1F, entry[3]]);
            match number {
                0 => pat.network_pid = Some(pid),
                sid => {
                    pat.services.insert(sid, pid);
                }
            }
        }
        Ok(pat)
    }

    /// PMT PID of `service_id`, if the PAT lists it.
    pub fn pmt_pid(&self, service_id: u16) -> Option<u16> {
        self.services.get(&service_id).copied()
    }
}
