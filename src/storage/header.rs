//! Container file header.
//!
//! Page 0 of the file holds exactly one header, laid out at fixed byte
//! offsets so that files are interchangeable between hosts that agree on
//! the endianness tag:
//!
//! ```text
//! Offset  Size  Description
//! 0       6     Magic marker "btree+"
//! 6       1     Endianness tag (1 = big, 2 = little)
//! 7       1     Root level (0 = root is a leaf)
//! 8       8     Element count
//! 16      8     User signature
//! 24      4     Flags
//! 28      4     Key size in bytes
//! 32      4     Mapped size in bytes
//! 36      4     Node (page) size in bytes
//! 40      4     Root page id
//! 44      4     First leaf page id
//! 48      4     Last leaf page id
//! 52      4     Free-page list head id (0 = empty list)
//! 56      4     Total page count, including this header
//! 60      2     Major version
//! 62      2     Minor version
//! 64      32    Splash string, NUL filled
//! 96      32    User label, NUL filled
//! ```
//!
//! Multi-byte integers are stored in the order named by the endianness
//! tag and flipped on load/store when it differs from host order.

use std::path::Path;

use crate::error::{Error, Result};
use crate::types::{Endianness, Flags, PageId, MAJOR_VERSION, MINOR_VERSION};

/// Magic bytes identifying a container file
pub const MAGIC: &[u8; 6] = b"btree+";

/// Splash string recorded at creation
pub const SPLASH: &str = "btree-file container";

/// Extent of the header within page 0
pub const HEADER_SIZE: usize = 128;

/// In-memory form of the page-0 header
#[derive(Debug, Clone)]
pub struct HeaderPage {
    pub endianness: Endianness,
    pub root_level: u8,
    pub element_count: u64,
    pub signature: u64,
    pub flags: Flags,
    pub key_size: u32,
    pub mapped_size: u32,
    pub node_size: u32,
    pub root_id: PageId,
    pub first_leaf_id: PageId,
    pub last_leaf_id: PageId,
    pub free_list_head: PageId,
    pub page_count: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub splash: String,
    pub label: String,
}

impl HeaderPage {
    /// Header for a freshly created file; page count 1 accounts for the
    /// header page itself
    pub fn new(endianness: Endianness, node_size: u32, signature: u64, flags: Flags) -> Self {
        Self {
            endianness,
            root_level: 0,
            element_count: 0,
            signature,
            flags: flags.permanent(),
            key_size: 0,
            mapped_size: 0,
            node_size,
            root_id: PageId::NULL,
            first_leaf_id: PageId::NULL,
            last_leaf_id: PageId::NULL,
            free_list_head: PageId::NULL,
            page_count: 1,
            major_version: MAJOR_VERSION,
            minor_version: MINOR_VERSION,
            splash: SPLASH.to_string(),
            label: String::new(),
        }
    }

    /// Number of levels in the tree (a lone root leaf is one level)
    pub fn levels(&self) -> usize {
        self.root_level as usize + 1
    }

    /// Decode a header from the first bytes of page 0.
    ///
    /// Only the marker and the endianness tag are validated here; field
    /// checks against the opening container's expectations happen at the
    /// container layer, where the expectations live.
    pub fn read(bytes: &[u8], path: &Path) -> Result<Self> {
        if bytes.len() < HEADER_SIZE || &bytes[0..6] != MAGIC {
            return Err(Error::NotABtree {
                path: path.to_path_buf(),
            });
        }
        let e = Endianness::from_tag(bytes[6]).ok_or_else(|| Error::NotABtree {
            path: path.to_path_buf(),
        })?;

        Ok(Self {
            endianness: e,
            root_level: bytes[7],
            element_count: e.read_u64(&bytes[8..16]),
            signature: e.read_u64(&bytes[16..24]),
            flags: Flags(e.read_u32(&bytes[24..28])),
            key_size: e.read_u32(&bytes[28..32]),
            mapped_size: e.read_u32(&bytes[32..36]),
            node_size: e.read_u32(&bytes[36..40]),
            root_id: PageId::new(e.read_u32(&bytes[40..44])),
            first_leaf_id: PageId::new(e.read_u32(&bytes[44..48])),
            last_leaf_id: PageId::new(e.read_u32(&bytes[48..52])),
            free_list_head: PageId::new(e.read_u32(&bytes[52..56])),
            page_count: e.read_u32(&bytes[56..60]),
            major_version: e.read_u16(&bytes[60..62]),
            minor_version: e.read_u16(&bytes[62..64]),
            splash: read_c_str(&bytes[64..96]),
            label: read_c_str(&bytes[96..128]),
        })
    }

    /// Encode this header into the first bytes of page 0
    pub fn write(&self, bytes: &mut [u8]) {
        let e = self.endianness;
        bytes[..HEADER_SIZE].fill(0);
        bytes[0..6].copy_from_slice(MAGIC);
        bytes[6] = e.tag();
        bytes[7] = self.root_level;
        e.write_u64(&mut bytes[8..16], self.element_count);
        e.write_u64(&mut bytes[16..24], self.signature);
        e.write_u32(&mut bytes[24..28], self.flags.bits());
        e.write_u32(&mut bytes[28..32], self.key_size);
        e.write_u32(&mut bytes[32..36], self.mapped_size);
        e.write_u32(&mut bytes[36..40], self.node_size);
        e.write_u32(&mut bytes[40..44], self.root_id.value());
        e.write_u32(&mut bytes[44..48], self.first_leaf_id.value());
        e.write_u32(&mut bytes[48..52], self.last_leaf_id.value());
        e.write_u32(&mut bytes[52..56], self.free_list_head.value());
        e.write_u32(&mut bytes[56..60], self.page_count);
        e.write_u16(&mut bytes[60..62], self.major_version);
        e.write_u16(&mut bytes[62..64], self.minor_version);
        write_c_str(&mut bytes[64..96], &self.splash);
        write_c_str(&mut bytes[96..128], &self.label);
    }
}

fn read_c_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn write_c_str(bytes: &mut [u8], s: &str) {
    // always NUL terminated, so at most len-1 payload bytes
    let n = s.len().min(bytes.len() - 1);
    bytes[..n].copy_from_slice(&s.as_bytes()[..n]);
}
