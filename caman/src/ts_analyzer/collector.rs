//! Reassembly of PSI sections split across TS packets.

/// Largest private section (section_length is 12 bits).
const MAX_SECTION_SIZE: usize = 3 + 4093;

/// Collects one PSI section at a time from the packets of a single PID.
#[derive(Debug, Default)]
pub struct SectionCollector {
    buffer: Vec<u8>,
    expected_length: Option<usize>,
    last_cc: Option<u8>,
}

impl SectionCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.reset_section();
        self.last_cc = None;
    }

    fn reset_section(&mut self) {
        self.buffer.clear();
        self.expected_length = None;
    }

    /// Add the payload of a TS packet. When `payload_unit_start` is set the
    /// first byte is the pointer field: the bytes it skips finish the
    /// section already buffered, and new sections follow it.
    ///
    /// Returns every section the packet completed, in stream order.
    pub fn add_data(&mut self, payload: &[u8], cc: u8, payload_unit_start: bool) -> Vec<Vec<u8>> {
        let mut sections = Vec::new();
        if let Some(last) = self.last_cc {
            if cc == last && !payload_unit_start {
                // duplicate packet
                return sections;
            }
            if cc != (last + 1) & 0x0F && !payload_unit_start {
                self.clear();
            }
        }
        self.last_cc = Some(cc);

        if payload_unit_start {
            let Some((&pointer, rest)) = payload.split_first() else {
                return sections;
            };
            let pointer = usize::from(pointer);
            if pointer > rest.len() {
                self.reset_section();
                return sections;
            }
            let (tail, head) = rest.split_at(pointer);
            if !self.buffer.is_empty() {
                self.buffer.extend_from_slice(tail);
                sections.extend(self.take_complete());
            }
            self.reset_section();
            self.start_sections(head, &mut sections);
        } else if !self.buffer.is_empty() {
            self.buffer.extend_from_slice(payload);
            sections.extend(self.take_complete());
        }
        sections
    }

    /// Collect sections starting at `data` until stuffing or a section that
    /// continues in a later packet.
    fn start_sections(&mut self, mut data: &[u8], out: &mut Vec<Vec<u8>>) {
        while matches!(data.first(), Some(&table_id) if table_id != 0xFF) {
            self.buffer.extend_from_slice(data);
            let Some(section) = self.take_complete() else {
                break;
            };
            data = &data[section.len()..];
            out.push(section);
        }
    }

    /// Split off the buffered section once all of it has arrived.
    fn take_complete(&mut self) -> Option<Vec<u8>> {
        if self.expected_length.is_none() && self.buffer.len() >= 3 {
            let section_length = u16::from_be_bytes([self.buffer[1] & 0x0F, self.buffer[2]]);
            self.expected_length = Some(3 + usize::from(section_length));
        }

        let expected = self.expected_length?;
        if expected > MAX_SECTION_SIZE {
            self.reset_section();
            return None;
        }
        if self.buffer.len() < expected {
            return None;
        }
        let section = self.buffer[..expected].to_vec();
        self.reset_section();
        Some(section)
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
