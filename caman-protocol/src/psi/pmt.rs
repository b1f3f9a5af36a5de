//! PMT (Program Map Table) parsing.
//!
//! The PMT lists a service's elementary streams together with the CA
//! descriptors that tell which CA systems scramble them. PMTs come from the
//! broadcast network, so every length field is checked before use.

use crate::error::CaError;

use super::descriptors::CaDescriptor;
use super::section::PsiSection;
use super::table_id;

/// A single elementary stream entry in the PMT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PmtStream {
    /// Stream type.
    pub stream_type: u8,
    /// Elementary PID.
    pub elementary_pid: u16,
    /// ES info descriptors.
    pub descriptors: Vec<u8>,
}

/// Parsed PMT (Program Map Table).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PmtTable {
    /// Program number (service ID).
    pub program_number: u16,
    /// Version number.
    pub version_number: u8,
    /// Current/next indicator.
    pub current_next_indicator: bool,
    /// PCR PID.
    pub pcr_pid: u16,
    /// Program info descriptors.
    pub program_info: Vec<u8>,
    /// Elementary streams.
    pub streams: Vec<PmtStream>,
}

impl PmtTable {
    /// Parse a complete PMT section (table_id through CRC), checking the CRC.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, CaError> {
        let section = PsiSection::parse_checked(raw).map_err(|e| match e {
            CaError::BadParam(msg) => CaError::BadPmt(msg),
            other => other,
        })?;
        Self::parse(&section)
    }

    /// Parse a PMT from a PSI section.
    pub fn parse(section: &PsiSection) -> Result<Self, CaError> {
        if section.header.table_id != table_id::PMT {
            return Err(CaError::BadPmt(format!(
                "table_id 0x{:02X} is not a PMT",
                section.header.table_id
            )));
        }

        let data = section.data;
        if data.len() < 4 {
            return Err(CaError::BadPmt("PMT data too short".into()));
        }

        let pcr_pid = ((data[0] as u16 & 0x1F) << 8) | data[1] as u16;
        let program_info_length = ((data[2] as usize & 0x0F) << 8) | data[3] as usize;

        if data.len() < 4 + program_info_length {
            return Err(CaError::BadPmt(format!(
                "program_info_length {} exceeds section ({} left)",
                program_info_length,
                data.len() - 4
            )));
        }

        let mut pmt = PmtTable {
            program_number: section.header.table_id_extension,
            version_number: section.header.version_number,
            current_next_indicator: section.header.current_next_indicator,
            pcr_pid,
            program_info: data[4..4 + program_info_length].to_vec(),
            streams: Vec::new(),
        };

        let mut offset = 4 + program_info_length;
        while offset < data.len() {
            if offset + 5 > data.len() {
                return Err(CaError::BadPmt(format!(
                    "truncated stream entry at offset {offset}"
                )));
            }
            let stream_type = data[offset];
            let elementary_pid = ((data[offset + 1] as u16 & 0x1F) << 8) | data[offset + 2] as u16;
            let es_info_length = ((data[offset + 3] as usize & 0x0F) << 8) | data[offset + 4] as usize;

            offset += 5;

            if offset + es_info_length > data.len() {
                return Err(CaError::BadPmt(format!(
                    "ES_info_length {} of PID 0x{:04X} exceeds section",
                    es_info_length, elementary_pid
                )));
            }

            pmt.streams.push(PmtStream {
                stream_type,
                elementary_pid,
                descriptors: data[offset..offset + es_info_length].to_vec(),
            });
            offset += es_info_length;
        }

        Ok(pmt)
    }

    /// CA descriptors at program level followed by those of every stream.
    pub fn ca_descriptors(&self) -> Result<Vec<CaDescriptor>, CaError> {
        let bad = |e: CaError| CaError::BadPmt(e.to_string());
        let mut all = CaDescriptor::collect(&self.program_info).map_err(bad)?;
        for stream in &self.streams {
            all.extend(CaDescriptor::collect(&stream.descriptors).map_err(bad)?);
        }
        Ok(all)
    }

    /// CA system ids referenced anywhere in the PMT, first-seen order.
    pub fn ca_system_ids(&self) -> Result<Vec<u16>, CaError> {
        let mut ids = Vec::new();
        for desc in self.ca_descriptors()? {
            if !ids.contains(&desc.ca_system_id) {
                ids.push(desc.ca_system_id);
            }
        }
        Ok(ids)
    }

    /// Get all elementary PIDs.
    pub fn get_all_pids(&self) -> Vec<u16> {
        self.streams.iter().map(|s| s.elementary_pid).collect()
    }
}
