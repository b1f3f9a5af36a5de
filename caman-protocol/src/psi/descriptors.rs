//! Descriptor loops and the CA descriptor.

use crate::error::CaError;

use super::descriptor_tag;

/// One raw descriptor inside a descriptor loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor<'a> {
    pub tag: u8,
    /// Descriptor payload (after tag and length).
    pub data: &'a [u8],
    /// The whole descriptor, tag and length included.
    pub raw: &'a [u8],
}

/// Iterator over a descriptor loop.
///
/// Yields an error (and then stops) if a descriptor length runs past the
/// end of the loop.
pub struct DescriptorIter<'a> {
    data: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> DescriptorIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            failed: false,
        }
    }
}

impl<'a> Iterator for DescriptorIter<'a> {
    type Item = Result<Descriptor<'a>, CaError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.data.len() {
            return None;
        }

        let remaining = self.data.len() - self.offset;
        if remaining < 2 {
            self.failed = true;
            return Some(Err(CaError::BadParam(format!(
                "dangling byte at descriptor offset {}",
                self.offset
            ))));
        }

        let tag = self.data[self.offset];
        let length = self.data[self.offset + 1] as usize;
        if 2 + length > remaining {
            self.failed = true;
            return Some(Err(CaError::BadParam(format!(
                "descriptor 0x{tag:02X} length {length} exceeds loop ({} left)",
                remaining - 2
            ))));
        }

        let start = self.offset;
        self.offset += 2 + length;
        Some(Ok(Descriptor {
            tag,
            data: &self.data[start + 2..self.offset],
            raw: &self.data[start..self.offset],
        }))
    }
}

/// CA descriptor (0x09).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaDescriptor {
    /// CA system ID.
    pub ca_system_id: u16,
    /// ECM PID (in a PMT) or EMM PID (in the CAT).
    pub ca_pid: u16,
    /// CA system specific private data.
    pub private_data: Vec<u8>,
}

impl CaDescriptor {
    /// Parse a CA descriptor payload (after tag and length).
    pub fn parse(data: &[u8]) -> Result<Self, CaError> {
        if data.len() < 4 {
            return Err(CaError::BadParam("CA descriptor too short".into()));
        }

        Ok(CaDescriptor {
            ca_system_id: ((data[0] as u16) << 8) | data[1] as u16,
            ca_pid: ((data[2] as u16 & 0x1F) << 8) | data[3] as u16,
            private_data: data[4..].to_vec(),
        })
    }

    /// Collect every CA descriptor of a descriptor loop.
    pub fn collect(loop_data: &[u8]) -> Result<Vec<CaDescriptor>, CaError> {
        let mut found = Vec::new();
        for desc in DescriptorIter::new(loop_data) {
            let desc = desc?;
            if desc.tag == descriptor_tag::CA {
                found.push(CaDescriptor::parse(desc.data)?);
            }
        }
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_loop() {
        let data = [
            // CA descriptor: system 0x0500, PID 0x0123, private 0xAA
            0x09, 0x05, 0x05, 0x00, 0xE1, 0x23, 0xAA,
            // ISO 639 language descriptor
            0x0A, 0x04, b'e', b'n', b'g', 0x00,
        ];

        let descs: Vec<_> = DescriptorIter::new(&data).collect::<Result<_, _>>().unwrap();
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].tag, 0x09);
        assert_eq!(descs[0].raw.len(), 7);
        assert_eq!(descs[1].data, b"eng\x00");

        let cas = CaDescriptor::collect(&data).unwrap();
        assert_eq!(
            cas,
            vec![CaDescriptor {
                ca_system_id: 0x0500,
                ca_pid: 0x0123,
                private_data: vec![0xAA],
            }]
        );
    }

    #[test]
    fn test_overlong_descriptor_rejected() {
        let data = [0x09, 0x10, 0x05, 0x00];
        let mut iter = DescriptorIter::new(&data);
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
        assert!(CaDescriptor::collect(&data).is_err());
    }

    #[test]
    fn test_short_ca_descriptor_rejected() {
        let data = [0x09, 0x02, 0x05, 0x00];
        assert!(CaDescriptor::collect(&data).is_err());
    }
}
