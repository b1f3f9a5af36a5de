//! CAT (Conditional Access Table) parsing.

use crate::error::CaError;

use super::descriptors::CaDescriptor;
use super::section::PsiSection;
use super::table_id;

/// Parsed CAT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatTable {
    /// Version number.
    pub version_number: u8,
    /// CA descriptors announcing EMM streams.
    pub ca_descriptors: Vec<CaDescriptor>,
}

impl CatTable {
    /// Parse a CAT from a PSI section.
    pub fn parse(section: &PsiSection) -> Result<Self, CaError> {
        if section.header.table_id != table_id::CAT {
            return Err(CaError::BadParam("not a CAT section".into()));
        }

        Ok(CatTable {
            version_number: section.header.version_number,
            ca_descriptors: CaDescriptor::collect(section.data)?,
        })
    }

    /// CA system ids in the table, in order, without duplicates.
    pub fn ca_system_ids(&self) -> Vec<u16> {
        let mut ids = Vec::new();
        for desc in &self.ca_descriptors {
            if !ids.contains(&desc.ca_system_id) {
                ids.push(desc.ca_system_id);
            }
        }
        ids
    }
}
