//! Long-form PSI sections and their CRC.

use crate::error::CaError;

/// The eight header bytes shared by every long-form section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PsiHeader {
    pub table_id: u8,
    pub section_syntax_indicator: bool,
    /// Bytes following the length field, CRC included.
    pub section_length: u16,
    /// Service id for a PMT, transport stream id for a PAT.
    pub table_id_extension: u16,
    pub version_number: u8,
    pub current_next_indicator: bool,
    pub section_number: u8,
    pub last_section_number: u8,
}

impl PsiHeader {
    fn decode(b: &[u8; 8]) -> Self {
        Self {
            table_id: b[0],
            section_syntax_indicator: b[1] & 0x80 != 0,
            section_length: u16::from_be_bytes([b[1] & 0x0F, b[2]]),
            table_id_extension: u16::from_be_bytes([b[3], b[4]]),
            version_number: (b[5] & 0x3E) >> 1,
            current_next_indicator: b[5] & 0x01 != 0,
            section_number: b[6],
            last_section_number: b[7],
        }
    }
}

/// A long-form section borrowed from a reassembly buffer.
#[derive(Debug, Clone)]
pub struct PsiSection<'a> {
    pub header: PsiHeader,
    /// Table body between the header and the CRC.
    pub data: &'a [u8],
    pub crc32: u32,
    /// Header through CRC.
    pub raw: &'a [u8],
}

impl<'a> PsiSection<'a> {
    /// Split a section starting at its `table_id` byte. Anything past the
    /// announced length is stuffing and ignored.
    pub fn parse(data: &'a [u8]) -> Result<Self, CaError> {
        let Some(fixed) = data.get(..8).and_then(|b| <&[u8; 8]>::try_from(b).ok()) else {
            return Err(CaError::BadParam(format!(
                "{} bytes cannot hold a section header",
                data.len()
            )));
        };
        let header = PsiHeader::decode(fixed);
        if !header.section_syntax_indicator {
            return Err(CaError::BadParam(format!(
                "table 0x{:02X} is not a long-form section",
                header.table_id
            )));
        }
        // extended header plus CRC
        if header.section_length < 9 {
            return Err(CaError::BadParam(format!(
                "section_length {} too small",
                header.section_length
            )));
        }

        let end = 3 + usize::from(header.section_length);
        let Some(raw) = data.get(..end) else {
            return Err(CaError::BadParam(format!(
                "incomplete section: {} of {} bytes",
                data.len(),
                end
            )));
        };
        let (body, crc) = raw[8..].split_at(raw.len() - 12);
        Ok(PsiSection {
            header,
            data: body,
            crc32: u32::from_be_bytes([crc[0], crc[1], crc[2], crc[3]]),
            raw,
        })
    }

    /// [`parse`](Self::parse), failing on a CRC-32 mismatch.
    pub fn parse_checked(data: &'a [u8]) -> Result<Self, CaError> {
        let section = Self::parse(data)?;
        if !section.verify_crc() {
            return Err(CaError::BadParam(format!(
                "CRC-32 mismatch in table 0x{:02X}",
                section.header.table_id
            )));
        }
        Ok(section)
    }

    pub fn verify_crc(&self) -> bool {
        crc32_mpeg2(&self.raw[..self.raw.len() - 4]) == self.crc32
    }

    pub fn total_length(&self) -> usize {
        self.raw.len()
    }
}

const CRC_POLY: u32 = 0x04C1_1DB7;

const CRC_TABLE: [u32; 256] = {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut v = (n as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            v = if v & 0x8000_0000 == 0 { v << 1 } else { (v << 1) ^ CRC_POLY };
            bit += 1;
        }
        table[n] = v;
        n += 1;
    }
    table
};

/// CRC-32/MPEG-2 as carried at the end of every long-form section.
pub fn crc32_mpeg2(data: &[u8]) -> u32 {
    data.iter().fold(u32::MAX, |crc, &byte| {
        (crc << 8) ^ CRC_TABLE[usize::from((crc >> 24) as u8 ^ byte)]
    })
}
