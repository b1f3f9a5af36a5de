//! MPEG-TS packet framing.

/// TS packet size in bytes.
pub const TS_PACKET_SIZE: usize = 188;

/// TS sync byte.
pub const SYNC_BYTE: u8 = 0x47;

/// The fields of the 4-byte packet header the table monitor looks at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TsHeader {
    pub transport_error: bool,
    pub payload_unit_start: bool,
    /// 13-bit PID.
    pub pid: u16,
    pub has_adaptation: bool,
    pub has_payload: bool,
    /// 4-bit continuity counter.
    pub continuity_counter: u8,
}

impl TsHeader {
    /// Decode a header. The sync byte is not checked.
    pub fn decode(bytes: [u8; 4]) -> Self {
        let flags = bytes[3] >> 4;
        Self {
            transport_error: bytes[1] & 0x80 != 0,
            payload_unit_start: bytes[1] & 0x40 != 0,
            pid: u16::from_be_bytes([bytes[1] & 0x1F, bytes[2]]),
            has_adaptation: flags & 0x02 != 0,
            has_payload: flags & 0x01 != 0,
            continuity_counter: bytes[3] & 0x0F,
        }
    }
}

/// One TS packet borrowed from the input.
#[derive(Debug, Clone)]
pub struct TsPacket<'a> {
    pub header: TsHeader,
    /// Bytes after the adaptation field; empty when the packet carries none.
    pub payload: &'a [u8],
}

impl<'a> TsPacket<'a> {
    /// Frame a packet at the start of `data`. `None` unless `data` holds a
    /// full packet beginning with the sync byte.
    pub fn parse(data: &'a [u8]) -> Option<Self> {
        let packet = data.get(..TS_PACKET_SIZE)?;
        if packet[0] != SYNC_BYTE {
            return None;
        }

        let header = TsHeader::decode([packet[0], packet[1], packet[2], packet[3]]);
        let start = if header.has_adaptation {
            5 + usize::from(packet[4])
        } else {
            4
        };
        let payload = match packet.get(start..) {
            Some(payload) if header.has_payload => payload,
            _ => &[],
        };
        Some(Self { header, payload })
    }
}

/// Splits a byte stream into packets, skipping bytes until the next sync
/// byte whenever framing is lost.
///
/// [`consumed`](Self::consumed) reports how much input is done with, so a
/// caller can keep a trailing partial packet for the next chunk.
pub struct TsPacketIterator<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> TsPacketIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let mut iter = Self { data, offset: 0 };
        iter.skip_to_sync(0);
        iter
    }

    /// Bytes that will never be yielded again.
    pub fn consumed(&self) -> usize {
        self.offset
    }

    fn skip_to_sync(&mut self, from: usize) {
        self.offset = self.data[from.min(self.data.len())..]
            .iter()
            .position(|b| *b == SYNC_BYTE)
            .map_or(self.data.len(), |pos| from + pos);
    }
}

impl<'a> Iterator for TsPacketIterator<'a> {
    type Item = TsPacket<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.data.len() - self.offset >= TS_PACKET_SIZE {
            if let Some(packet) = TsPacket::parse(&self.data[self.offset..]) {
                self.offset += TS_PACKET_SIZE;
                return Some(packet);
            }
            self.skip_to_sync(self.offset + 1);
        }
        None
    }
}
