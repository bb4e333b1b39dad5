//! # Header Page (page 0)
//!
//! Bootstrap page of the data file. Besides the common 32-byte page header
//! it carries, at fixed body offsets:
//!
//! ```text
//! Offset  Size   Field
//! ------  -----  -------------------------------------------------------
//! 32      27     info marker  "** This is a QUILLDB file **"[..27]
//! 59      1      file version (currently 1)
//! 60      4      free_empty_page_list  (head page id, MAX = none)
//! 64      4      last_page_id
//! 68      8      creation_time (unix ms)
//! 80      112    pragma block (see EnginePragmas)
//! 192     8000   collections map: u16 count, then
//!                (u8 name_len, name, u32 collection page id) entries
//! ```
//!
//! A brand-new file also reserves byte 0 semantics: for plain files the
//! first byte is the low byte of page id 0, i.e. zero; encrypted files
//! store a non-zero encryption marker there instead, which open detects
//! before ever parsing a page.

use std::time::{SystemTime, UNIX_EPOCH};

use hashbrown::HashMap;

use super::page::{BasePage, PageType, TypedPage};
use crate::collation::Collation;
use crate::config::{
    DEFAULT_CHECKPOINT_SIZE, DEFAULT_TIMEOUT, HEADER_COLLECTIONS_SIZE, PAGE_ID_NONE,
};
use crate::{Error, Result};

pub const HEADER_PAGE_ID: u32 = 0;

/// First file byte of an unencrypted database (low byte of page id 0).
pub const ENCRYPTION_NONE: u8 = 0;

const HEADER_INFO: &[u8; 27] = b"** This is a QUILLDB file *";
const FILE_VERSION: u8 = 1;

const P_HEADER_INFO: usize = 32;
const P_FILE_VERSION: usize = 59;
const P_FREE_EMPTY_PAGE_LIST: usize = 60;
const P_LAST_PAGE_ID: usize = 64;
const P_CREATION_TIME: usize = 68;
const P_PRAGMAS: usize = 80;
const P_COLLECTIONS: usize = 192;

/// Key/value configuration persisted inside the header page.
#[derive(Debug, Clone, PartialEq)]
pub struct EnginePragmas {
    /// Caller-owned schema version.
    pub user_version: u32,
    /// Collation applied to every string index key.
    pub collation: Collation,
    /// Lock-wait seconds.
    pub timeout: u32,
    /// Maximum data-file size in bytes.
    pub limit_size: u64,
    /// Return DateTime values as UTC.
    pub utc_date: bool,
    /// Log pages before auto-checkpoint (0 disables).
    pub checkpoint: u32,
}

impl Default for EnginePragmas {
    fn default() -> Self {
        Self {
            user_version: 0,
            collation: Collation::binary(),
            timeout: DEFAULT_TIMEOUT as u32,
            limit_size: u64::MAX,
            utc_date: false,
            checkpoint: DEFAULT_CHECKPOINT_SIZE,
        }
    }
}

impl EnginePragmas {
    const COLLATION_MAX: usize = 60;

    fn write_to(&self, body: &mut [u8]) {
        let p = &mut body[P_PRAGMAS..P_COLLECTIONS];
        p[0..4].copy_from_slice(&self.user_version.to_le_bytes());
        p[4..8].copy_from_slice(&self.timeout.to_le_bytes());
        p[8..16].copy_from_slice(&self.limit_size.to_le_bytes());
        p[16] = self.utc_date as u8;
        p[17..21].copy_from_slice(&self.checkpoint.to_le_bytes());

        let collation = self.collation.to_string();
        let bytes = collation.as_bytes();
        debug_assert!(bytes.len() <= Self::COLLATION_MAX);
        p[21] = bytes.len() as u8;
        p[22..22 + bytes.len()].copy_from_slice(bytes);
    }

    fn read_from(body: &[u8]) -> Result<Self> {
        let p = &body[P_PRAGMAS..P_COLLECTIONS];
        let collation_len = p[21] as usize;
        if collation_len > Self::COLLATION_MAX {
            return Err(Error::InvalidDatabase("oversized collation pragma".into()));
        }
        let collation = std::str::from_utf8(&p[22..22 + collation_len])
            .map_err(|_| Error::InvalidDatabase("collation pragma is not utf-8".into()))?;

        Ok(Self {
            user_version: u32::from_le_bytes(p[0..4].try_into().unwrap()),
            timeout: u32::from_le_bytes(p[4..8].try_into().unwrap()),
            limit_size: u64::from_le_bytes(p[8..16].try_into().unwrap()),
            utc_date: p[16] != 0,
            checkpoint: u32::from_le_bytes(p[17..21].try_into().unwrap()),
            collation: Collation::parse(collation),
        })
    }
}

/// The bootstrap page: global free list, page counter, collections map and
/// pragmas. A single instance lives for the whole engine, guarded by the
/// allocation mutex in the transaction layer.
pub struct HeaderPage {
    base: BasePage,
    pub free_empty_page_list: u32,
    pub last_page_id: u32,
    pub creation_time: u64,
    pub pragmas: EnginePragmas,
    collections: HashMap<String, u32>,
}

impl TypedPage for HeaderPage {
    const PAGE_TYPE: PageType = PageType::Header;

    fn new(base: BasePage) -> Self {
        let creation_time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        Self {
            base,
            free_empty_page_list: PAGE_ID_NONE,
            last_page_id: 0,
            creation_time,
            pragmas: EnginePragmas::default(),
            collections: HashMap::new(),
        }
    }

    fn load(base: BasePage) -> Result<Self> {
        let bytes = base.buffer().bytes();

        if &bytes[P_HEADER_INFO..P_HEADER_INFO + HEADER_INFO.len()] != HEADER_INFO {
            return Err(Error::InvalidDatabase("header marker mismatch".into()));
        }
        if bytes[P_FILE_VERSION] != FILE_VERSION {
            return Err(Error::InvalidDatabase(format!(
                "unsupported file version {} (expected {FILE_VERSION})",
                bytes[P_FILE_VERSION]
            )));
        }

        let free_empty_page_list =
            u32::from_le_bytes(bytes[P_FREE_EMPTY_PAGE_LIST..P_LAST_PAGE_ID].try_into().unwrap());
        let last_page_id =
            u32::from_le_bytes(bytes[P_LAST_PAGE_ID..P_CREATION_TIME].try_into().unwrap());
        let creation_time =
            u64::from_le_bytes(bytes[P_CREATION_TIME..P_CREATION_TIME + 8].try_into().unwrap());
        let pragmas = EnginePragmas::read_from(bytes.as_slice())?;
        let collections = read_collections(&bytes[P_COLLECTIONS..])?;

        Ok(Self {
            base,
            free_empty_page_list,
            last_page_id,
            creation_time,
            pragmas,
            collections,
        })
    }

    fn base(&self) -> &BasePage {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BasePage {
        &mut self.base
    }

    fn into_base(self) -> BasePage {
        self.base
    }
}

impl HeaderPage {
    pub fn collections(&self) -> impl Iterator<Item = (&str, u32)> {
        self.collections.iter().map(|(name, id)| (name.as_str(), *id))
    }

    pub fn get_collection_page_id(&self, name: &str) -> Option<u32> {
        self.collections.get(name).copied()
    }

    pub fn insert_collection(&mut self, name: &str, page_id: u32) -> Result<()> {
        if self.collections.contains_key(name) {
            return Err(Error::AlreadyExists(name.to_string()));
        }

        let used: usize = self
            .collections
            .keys()
            .map(|k| 1 + k.len() + 4)
            .sum::<usize>()
            + 2;
        if used + 1 + name.len() + 4 > HEADER_COLLECTIONS_SIZE {
            return Err(Error::DataSizeExceeded {
                limit: HEADER_COLLECTIONS_SIZE as u64,
            });
        }
        if name.len() > u8::MAX as usize {
            return Err(Error::InvalidDatabase(format!(
                "collection name `{name}` longer than 255 bytes"
            )));
        }

        self.collections.insert(name.to_string(), page_id);
        self.base.set_dirty();
        Ok(())
    }

    pub fn delete_collection(&mut self, name: &str) -> Result<u32> {
        let page_id = self
            .collections
            .remove(name)
            .ok_or_else(|| Error::NotFound(name.to_string()))?;
        self.base.set_dirty();
        Ok(page_id)
    }

    /// Serialises every cached field back into the buffer.
    pub fn update_buffer(&mut self) -> Result<()> {
        self.base.page_id = HEADER_PAGE_ID;
        self.base.page_type = PageType::Header;

        let collections = write_collections(&self.collections)?;

        let bytes = self.base.buffer().write_bytes();
        bytes[P_HEADER_INFO..P_HEADER_INFO + HEADER_INFO.len()].copy_from_slice(HEADER_INFO);
        bytes[P_FILE_VERSION] = FILE_VERSION;
        bytes[P_FREE_EMPTY_PAGE_LIST..P_LAST_PAGE_ID]
            .copy_from_slice(&self.free_empty_page_list.to_le_bytes());
        bytes[P_LAST_PAGE_ID..P_CREATION_TIME].copy_from_slice(&self.last_page_id.to_le_bytes());
        bytes[P_CREATION_TIME..P_CREATION_TIME + 8]
            .copy_from_slice(&self.creation_time.to_le_bytes());
        self.pragmas.write_to(bytes.as_mut_slice());
        bytes[P_COLLECTIONS..P_COLLECTIONS + collections.len()].copy_from_slice(&collections);

        self.base.update_buffer();
        Ok(())
    }
}

fn write_collections(collections: &HashMap<String, u32>) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(&(collections.len() as u16).to_le_bytes());
    for (name, page_id) in collections {
        out.push(name.len() as u8);
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(&page_id.to_le_bytes());
    }
    if out.len() > HEADER_COLLECTIONS_SIZE {
        return Err(Error::DataSizeExceeded {
            limit: HEADER_COLLECTIONS_SIZE as u64,
        });
    }
    Ok(out)
}

fn read_collections(body: &[u8]) -> Result<HashMap<String, u32>> {
    let count = u16::from_le_bytes(body[..2].try_into().unwrap()) as usize;
    let mut collections = HashMap::with_capacity(count);
    let mut pos = 2;

    for _ in 0..count {
        let corrupt = || Error::InvalidDatabase("corrupt collections map".into());
        let name_len = *body.get(pos).ok_or_else(corrupt)? as usize;
        pos += 1;
        let name = body.get(pos..pos + name_len).ok_or_else(corrupt)?;
        let name = std::str::from_utf8(name).map_err(|_| corrupt())?.to_string();
        pos += name_len;
        let page_id = body.get(pos..pos + 4).ok_or_else(corrupt)?;
        collections.insert(name, u32::from_le_bytes(page_id.try_into().unwrap()));
        pos += 4;
    }

    Ok(collections)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PageBuffer;
    use std::sync::Arc;

    fn fresh_header() -> HeaderPage {
        let buffer = Arc::new(PageBuffer::new());
        buffer.mark_writable();
        HeaderPage::new(BasePage::new(buffer, HEADER_PAGE_ID, PageType::Header))
    }

    #[test]
    fn header_round_trips_all_fields() {
        let mut header = fresh_header();
        header.last_page_id = 17;
        header.free_empty_page_list = 9;
        header.pragmas.user_version = 3;
        header.pragmas.checkpoint = 500;
        header.pragmas.collation = Collation::parse("en-US/IgnoreCase");
        header.insert_collection("users", 4).unwrap();
        header.insert_collection("orders", 11).unwrap();
        header.update_buffer().unwrap();

        let buffer = Arc::clone(header.base().buffer());
        let loaded = HeaderPage::load(BasePage::load(buffer).unwrap()).unwrap();

        assert_eq!(loaded.last_page_id, 17);
        assert_eq!(loaded.free_empty_page_list, 9);
        assert_eq!(loaded.pragmas, header.pragmas);
        assert_eq!(loaded.get_collection_page_id("users"), Some(4));
        assert_eq!(loaded.get_collection_page_id("orders"), Some(11));
        assert_eq!(loaded.creation_time, header.creation_time);
    }

    #[test]
    fn marker_mismatch_is_invalid_database() {
        let buffer = Arc::new(PageBuffer::new());
        buffer.mark_writable();
        buffer.write_bytes()[4] = PageType::Header as u8;

        match HeaderPage::load(BasePage::load(buffer).unwrap()) {
            Err(err) => assert!(matches!(err, Error::InvalidDatabase(_))),
            Ok(_) => panic!("expected InvalidDatabase"),
        }
    }

    #[test]
    fn duplicate_collection_is_rejected() {
        let mut header = fresh_header();
        header.insert_collection("c", 1).unwrap();
        assert!(matches!(
            header.insert_collection("c", 2),
            Err(Error::AlreadyExists(_))
        ));
    }

    #[test]
    fn delete_collection_returns_page_id() {
        let mut header = fresh_header();
        header.insert_collection("c", 42).unwrap();
        assert_eq!(header.delete_collection("c").unwrap(), 42);
        assert!(matches!(
            header.delete_collection("c"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn collections_map_is_bounded() {
        let mut header = fresh_header();
        let mut added = 0;
        for i in 0.. {
            let name = format!("collection_with_a_rather_long_name_{i:05}");
            match header.insert_collection(&name, i) {
                Ok(()) => added += 1,
                Err(Error::DataSizeExceeded { .. }) => break,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(added > 100, "budget should hold many collections");
        // serialization still fits the reserved region
        header.update_buffer().unwrap();
    }
}
