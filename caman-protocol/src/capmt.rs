//! PMT to CA-PMT transform.
//!
//! Layout of the produced `ca_pmt()` object (the APDU tag and length field
//! are prepended by the CI session layer):
//!
//! ```text
//! ca_pmt_list_management                          8
//! program_number                                 16
//! reserved 2 | version_number 5 | current_next 1  8
//! reserved 4 | program_info_length 12            16
//! [ca_pmt_cmd_id 8, CA_descriptor()...]           when program_info_length != 0
//! for each elementary stream:
//!   stream_type                                   8
//!   reserved 3 | elementary_PID 13               16
//!   reserved 4 | ES_info_length 12               16
//!   [ca_pmt_cmd_id 8, CA_descriptor()...]         when ES_info_length != 0
//! ```

use crate::error::CaError;
use crate::psi::{descriptor_tag, CaDescriptor, DescriptorIter, PmtTable};
use crate::types::{CaPmtCmdId, ListManagement};

/// Largest value a 12-bit info length field can carry.
const MAX_INFO_LENGTH: usize = 0x0FFF;

/// Build a CA-PMT from a complete broadcast PMT section.
///
/// Only CA descriptors are carried over; every other descriptor is dropped.
/// With `strip_ca_descriptors` the CA descriptors are dropped too and every
/// info loop is empty.
pub fn generate_ca_pmt(
    pmt: &[u8],
    list_management: ListManagement,
    cmd_id: CaPmtCmdId,
    strip_ca_descriptors: bool,
) -> Result<Vec<u8>, CaError> {
    let table = PmtTable::from_bytes(pmt)?;

    let program_ca = ca_loop(&table.program_info, strip_ca_descriptors)?;
    let mut streams = Vec::new();
    streams.try_reserve(table.streams.len())?;
    for stream in &table.streams {
        streams.push(ca_loop(&stream.descriptors, strip_ca_descriptors)?);
    }

    let needed = 4
        + info_size(&program_ca)
        + streams.iter().map(|ca| 3 + info_size(ca)).sum::<usize>();

    let mut out = Vec::new();
    out.try_reserve_exact(needed)?;

    out.push(list_management as u8);
    out.extend_from_slice(&table.program_number.to_be_bytes());
    out.push(
        0xC0 | ((table.version_number & 0x1F) << 1) | u8::from(table.current_next_indicator),
    );
    put_info(&mut out, &program_ca, cmd_id)?;

    for (stream, ca) in table.streams.iter().zip(&streams) {
        out.push(stream.stream_type);
        out.extend_from_slice(&(0xE000 | (stream.elementary_pid & 0x1FFF)).to_be_bytes());
        put_info(&mut out, ca, cmd_id)?;
    }

    Ok(out)
}

/// Raw CA descriptors (tag and length included) of a descriptor loop.
fn ca_loop<'a>(descriptors: &'a [u8], strip: bool) -> Result<Vec<&'a [u8]>, CaError> {
    let mut found = Vec::new();
    if strip {
        return Ok(found);
    }
    for desc in DescriptorIter::new(descriptors) {
        let desc = desc.map_err(|e| CaError::BadPmt(e.to_string()))?;
        if desc.tag == descriptor_tag::CA {
            found.push(desc.raw);
        }
    }
    Ok(found)
}

fn info_size(ca: &[&[u8]]) -> usize {
    let descriptors: usize = ca.iter().map(|d| d.len()).sum();
    2 + if descriptors == 0 { 0 } else { 1 + descriptors }
}

fn put_info(out: &mut Vec<u8>, ca: &[&[u8]], cmd_id: CaPmtCmdId) -> Result<(), CaError> {
    let descriptors: usize = ca.iter().map(|d| d.len()).sum();
    let length = if descriptors == 0 { 0 } else { 1 + descriptors };
    if length > MAX_INFO_LENGTH {
        return Err(CaError::BadPmt(format!(
            "CA descriptors need {length} bytes, info length field holds {MAX_INFO_LENGTH}"
        )));
    }

    out.extend_from_slice(&(0xF000 | length as u16).to_be_bytes());
    if length != 0 {
        out.push(cmd_id as u8);
        for desc in ca {
            out.extend_from_slice(desc);
        }
    }
    Ok(())
}

/// Elementary stream entry of a parsed CA-PMT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaPmtStream {
    pub stream_type: u8,
    pub elementary_pid: u16,
    pub cmd_id: Option<CaPmtCmdId>,
    pub ca_descriptors: Vec<CaDescriptor>,
}

/// A parsed CA-PMT object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaPmt {
    pub list_management: ListManagement,
    pub program_number: u16,
    pub version_number: u8,
    pub current_next_indicator: bool,
    pub cmd_id: Option<CaPmtCmdId>,
    pub ca_descriptors: Vec<CaDescriptor>,
    pub streams: Vec<CaPmtStream>,
}

impl CaPmt {
    /// Parse a CA-PMT object as produced by [`generate_ca_pmt`].
    pub fn parse(data: &[u8]) -> Result<Self, CaError> {
        if data.len() < 6 {
            return Err(CaError::BadPmt("CA-PMT too short".into()));
        }

        let list_management = ListManagement::try_from(data[0])?;
        let program_number = u16::from_be_bytes([data[1], data[2]]);
        let version_number = (data[3] >> 1) & 0x1F;
        let current_next_indicator = data[3] & 0x01 != 0;
        let (cmd_id, ca_descriptors, mut offset) = parse_info(data, 4)?;

        let mut streams = Vec::new();
        while offset < data.len() {
            if offset + 5 > data.len() {
                return Err(CaError::BadPmt(format!(
                    "truncated CA-PMT stream entry at offset {offset}"
                )));
            }
            let stream_type = data[offset];
            let elementary_pid = u16::from_be_bytes([data[offset + 1], data[offset + 2]]) & 0x1FFF;
            let (cmd_id, ca_descriptors, next) = parse_info(data, offset + 3)?;
            streams.push(CaPmtStream {
                stream_type,
                elementary_pid,
                cmd_id,
                ca_descriptors,
            });
            offset = next;
        }

        Ok(CaPmt {
            list_management,
            program_number,
            version_number,
            current_next_indicator,
            cmd_id,
            ca_descriptors,
            streams,
        })
    }

    /// Elementary PIDs in CA-PMT order.
    pub fn elementary_pids(&self) -> Vec<u16> {
        self.streams.iter().map(|s| s.elementary_pid).collect()
    }
}

/// Parse an info length field at `at` and the loop that follows it.
fn parse_info(
    data: &[u8],
    at: usize,
) -> Result<(Option<CaPmtCmdId>, Vec<CaDescriptor>, usize), CaError> {
    if at + 2 > data.len() {
        return Err(CaError::BadPmt("truncated info length".into()));
    }
    let length = (u16::from_be_bytes([data[at], data[at + 1]]) & 0x0FFF) as usize;
    let start = at + 2;
    if start + length > data.len() {
        return Err(CaError::BadPmt(format!(
            "info length {length} exceeds CA-PMT at offset {at}"
        )));
    }
    if length == 0 {
        return Ok((None, Vec::new(), start));
    }

    let cmd_id = CaPmtCmdId::try_from(data[start]).map_err(|e| CaError::BadPmt(e.to_string()))?;
    let ca = CaDescriptor::collect(&data[start + 1..start + length])
        .map_err(|e| CaError::BadPmt(e.to_string()))?;
    Ok((Some(cmd_id), ca, start + length))
}
