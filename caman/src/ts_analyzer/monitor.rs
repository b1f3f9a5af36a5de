//! PAT / CAT / PMT monitoring.
//!
//! The monitor keeps the latest version of each table and reports changes as
//! [`TableEvent`]s. It does no waiting of its own; the manager pairs it with a
//! condition variable.

use std::collections::HashMap;

use bytes::{Buf, BytesMut};
use log::{debug, info, warn};

use caman_protocol::psi::{pid, table_id, CatTable, PatTable, PmtTable, PsiSection};
use caman_protocol::CaError;

use super::collector::SectionCollector;
use super::packet::TsPacketIterator;

/// A table change seen by the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableEvent {
    /// A PAT with a new transport_stream_id was received. `previous` is
    /// `None` for the first PAT.
    PatChanged {
        transport_stream_id: u16,
        previous: Option<u16>,
    },
    /// A new CAT version was received.
    CatChanged { version: u8, section: Vec<u8> },
    /// A new PMT (first sight or new content) was received.
    PmtChanged {
        service_id: u16,
        version: u8,
        section: Vec<u8>,
    },
}

#[derive(Debug, Clone)]
struct CachedCat {
    table: CatTable,
    section: Vec<u8>,
}

#[derive(Debug, Clone)]
struct CachedPmt {
    version: u8,
    ca_system_ids: Vec<u16>,
    section: Vec<u8>,
}

/// Latest PAT, CAT and PMTs of the tuned stream.
#[derive(Debug, Default)]
pub struct TableMonitor {
    pending: BytesMut,
    collectors: HashMap<u16, SectionCollector>,
    pat: Option<PatTable>,
    cat: Option<CachedCat>,
    pmts: HashMap<u16, CachedPmt>,
    /// PMT PID to the service ids announced on it.
    pmt_pids: HashMap<u16, Vec<u16>>,
}

impl TableMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every table and any partial input.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.collectors.clear();
        self.pat = None;
        self.cat = None;
        self.pmts.clear();
        self.pmt_pids.clear();
    }

    /// Feed raw TS bytes. Packets may be split across calls.
    pub fn push_packets(&mut self, data: &[u8]) -> Vec<TableEvent> {
        self.pending.extend_from_slice(data);
        let mut pending = std::mem::take(&mut self.pending);

        let mut events = Vec::new();
        let mut iter = TsPacketIterator::new(&pending);
        for packet in iter.by_ref() {
            let header = packet.header;
            if header.transport_error || !header.has_payload || !self.is_psi_pid(header.pid) {
                continue;
            }
            let collector = self.collectors.entry(header.pid).or_default();
            let sections = collector.add_data(
                packet.payload,
                header.continuity_counter,
                header.payload_unit_start,
            );
            for section in sections {
                match self.accept_section(Some(header.pid), &section) {
                    Ok(mut found) => events.append(&mut found),
                    Err(e) => debug!("Dropping section on PID 0x{:04X}: {}", header.pid, e),
                }
            }
        }
        let consumed = iter.consumed();

        pending.advance(consumed);
        self.pending = pending;
        events
    }

    /// Feed one complete section (table_id through CRC).
    pub fn push_section(&mut self, section: &[u8]) -> Result<Vec<TableEvent>, CaError> {
        self.accept_section(None, section)
    }

    fn is_psi_pid(&self, pid: u16) -> bool {
        pid == pid::PAT || pid == pid::CAT || self.pmt_pids.contains_key(&pid)
    }

    fn accept_section(&mut self, pid: Option<u16>, raw: &[u8]) -> Result<Vec<TableEvent>, CaError> {
        let section = PsiSection::parse_checked(raw)?;
        if !section.header.current_next_indicator {
            return Ok(Vec::new());
        }

        match (section.header.table_id, pid) {
            (table_id::PAT, None | Some(pid::PAT)) => {
                let pat = PatTable::parse(&section)?;
                Ok(self.update_pat(pat))
            }
            (table_id::CAT, None | Some(pid::CAT)) => {
                let cat = CatTable::parse(&section)?;
                Ok(self.update_cat(cat, section.raw))
            }
            (table_id::PMT, _) => {
                let pmt = PmtTable::parse(&section)?;
                if let Some(pid) = pid {
                    let announced = self
                        .pmt_pids
                        .get(&pid)
                        .is_some_and(|sids| sids.contains(&pmt.program_number));
                    if !announced {
                        return Ok(Vec::new());
                    }
                }
                Ok(self.update_pmt(pmt, section.raw))
            }
            _ => Ok(Vec::new()),
        }
    }

    fn update_pat(&mut self, pat: PatTable) -> Vec<TableEvent> {
        let mut events = Vec::new();
        let previous = self.pat.as_ref().map(|p| p.transport_stream_id);

        if let Some(old) = &self.pat {
            if old.version_number == pat.version_number
                && old.transport_stream_id == pat.transport_stream_id
            {
                return events;
            }
        }

        if previous != Some(pat.transport_stream_id) {
            if let Some(old_tsid) = previous {
                info!(
                    "Transport stream changed: 0x{:04X} -> 0x{:04X}",
                    old_tsid, pat.transport_stream_id
                );
                self.cat = None;
                self.pmts.clear();
                self.collectors.retain(|pid, _| *pid == pid::PAT);
            }
            events.push(TableEvent::PatChanged {
                transport_stream_id: pat.transport_stream_id,
                previous,
            });
        }

        self.pmt_pids.clear();
        for (&sid, &pmt_pid) in &pat.services {
            self.pmt_pids.entry(pmt_pid).or_default().push(sid);
        }
        self.pmts.retain(|sid, _| pat.services.contains_key(sid));
        let pmt_pids = &self.pmt_pids;
        self.collectors
            .retain(|pid, _| *pid == pid::PAT || *pid == pid::CAT || pmt_pids.contains_key(pid));

        debug!(
            "PAT v{} tsid=0x{:04X}: {} services",
            pat.version_number,
            pat.transport_stream_id,
            pat.services.len()
        );
        self.pat = Some(pat);
        events
    }

    fn update_cat(&mut self, cat: CatTable, raw: &[u8]) -> Vec<TableEvent> {
        if let Some(old) = &self.cat {
            if old.table.version_number == cat.version_number {
                return Vec::new();
            }
        }

        debug!(
            "CAT v{}: CA systems {:04X?}",
            cat.version_number,
            cat.ca_system_ids()
        );
        let version = cat.version_number;
        self.cat = Some(CachedCat {
            table: cat,
            section: raw.to_vec(),
        });
        vec![TableEvent::CatChanged {
            version,
            section: raw.to_vec(),
        }]
    }

    fn update_pmt(&mut self, pmt: PmtTable, raw: &[u8]) -> Vec<TableEvent> {
        if let Some(old) = self.pmts.get(&pmt.program_number) {
            if old.section == raw {
                return Vec::new();
            }
        }

        let ca_system_ids = match pmt.ca_system_ids() {
            Ok(ids) => ids,
            Err(e) => {
                warn!("PMT of service {} has bad CA descriptors: {}", pmt.program_number, e);
                return Vec::new();
            }
        };

        debug!(
            "PMT v{} service {}: {} streams, CA systems {:04X?}",
            pmt.version_number,
            pmt.program_number,
            pmt.streams.len(),
            ca_system_ids
        );
        self.pmts.insert(
            pmt.program_number,
            CachedPmt {
                version: pmt.version_number,
                ca_system_ids,
                section: raw.to_vec(),
            },
        );
        vec![TableEvent::PmtChanged {
            service_id: pmt.program_number,
            version: pmt.version_number,
            section: raw.to_vec(),
        }]
    }

    pub fn pat(&self) -> Option<&PatTable> {
        self.pat.as_ref()
    }

    /// Whether the PAT is known and lists `service_id`. `None` when no PAT
    /// has been seen yet.
    pub fn pat_lists(&self, service_id: u16) -> Option<bool> {
        self.pat
            .as_ref()
            .map(|pat| pat.pmt_pid(service_id).is_some())
    }

    /// Latest complete PMT section of a service.
    pub fn pmt(&self, service_id: u16) -> Option<&[u8]> {
        self.pmts.get(&service_id).map(|p| p.section.as_slice())
    }

    pub fn pmt_version(&self, service_id: u16) -> Option<u8> {
        self.pmts.get(&service_id).map(|p| p.version)
    }

    /// CA system ids of a service's PMT.
    pub fn pmt_ca_system_ids(&self, service_id: u16) -> Option<&[u16]> {
        self.pmts
            .get(&service_id)
            .map(|p| p.ca_system_ids.as_slice())
    }

    /// Latest CAT section.
    pub fn cat(&self) -> Option<&[u8]> {
        self.cat.as_ref().map(|c| c.section.as_slice())
    }

    pub fn cat_ca_system_ids(&self) -> Vec<u16> {
        self.cat
            .as_ref()
            .map(|c| c.table.ca_system_ids())
            .unwrap_or_default()
    }

    /// Service ids with a known PMT, ascending.
    pub fn services(&self) -> Vec<u16> {
        let mut sids: Vec<u16> = self.pmts.keys().copied().collect();
        sids.sort_unstable();
        sids
    }
}
