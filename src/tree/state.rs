//! Meta and state pages.
//!
//! Page 0 is the immutable meta page, written once at creation. Pages 1 and
//! 2 alternate as checkpoint state; the one with the highest sequence and a
//! valid checksum wins on open, so a torn state write falls back to its
//! sibling. All integers are big-endian.

use std::ops::Range;

use crate::error::{FarolError, Result};
use crate::primitives::pager::PagedFile;
use crate::types::PageId;

pub const TREE_MAGIC: [u8; 4] = *b"FARO";
pub const TREE_FORMAT_VERSION: u16 = 1;

pub const META_PAGE: PageId = PageId(0);
const STATE_PAGES: [PageId; 2] = [PageId(1), PageId(2)];
/// First page available to tree nodes.
pub const FIRST_DATA_PAGE: u64 = 3;

pub const USER_HEADER_CAP: usize = 32;

const META_MAGIC: Range<usize> = 0..4;
const META_FORMAT: Range<usize> = 4..6;
const META_PAGE_SIZE: Range<usize> = 8..12;
const META_LAYOUT_ID: Range<usize> = 12..20;
const META_LAYOUT_VERSION: usize = 20;

/// Bytes to read when probing a file's meta before its page size is known.
pub const META_PROBE_LEN: usize = 64;

const STATE_SEQUENCE: Range<usize> = 0..8;
const STATE_ROOT: Range<usize> = 8..16;
const STATE_NEXT_PAGE: Range<usize> = 16..24;
const STATE_WRITER_GENERATION: Range<usize> = 24..32;
const STATE_CLEAN: usize = 32;
const STATE_HEADER_LEN: Range<usize> = 34..36;
const STATE_HEADER: Range<usize> = 36..36 + USER_HEADER_CAP;
const STATE_FREE_LEN: Range<usize> = 68..72;
const STATE_FREE_IDS: usize = 72;
const STATE_CRC_LEN: usize = 4;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Meta {
    pub page_size: u32,
    pub layout_id: u64,
    pub layout_version: u8,
}

/// Outcome of decoding the meta page. Unreadable metadata is reported, not
/// an error: the caller treats it as a dirty store.
pub enum MetaRead {
    Ok(Meta),
    Mismatch,
}

pub fn write_meta(file: &PagedFile, meta: &Meta) -> Result<()> {
    let mut buf = vec![0u8; file.page_size()];
    buf[META_MAGIC].copy_from_slice(&TREE_MAGIC);
    buf[META_FORMAT].copy_from_slice(&TREE_FORMAT_VERSION.to_be_bytes());
    buf[META_PAGE_SIZE].copy_from_slice(&meta.page_size.to_be_bytes());
    buf[META_LAYOUT_ID].copy_from_slice(&meta.layout_id.to_be_bytes());
    buf[META_LAYOUT_VERSION] = meta.layout_version;
    file.write_page_direct(META_PAGE, &buf)
}

pub fn meta_from_bytes(buf: &[u8]) -> MetaRead {
    if buf.len() <= META_LAYOUT_VERSION || buf[META_MAGIC] != TREE_MAGIC {
        return MetaRead::Mismatch;
    }
    let format = u16::from_be_bytes([buf[4], buf[5]]);
    if format != TREE_FORMAT_VERSION {
        return MetaRead::Mismatch;
    }
    let mut raw32 = [0u8; 4];
    raw32.copy_from_slice(&buf[META_PAGE_SIZE]);
    let mut raw64 = [0u8; 8];
    raw64.copy_from_slice(&buf[META_LAYOUT_ID]);
    MetaRead::Ok(Meta {
        page_size: u32::from_be_bytes(raw32),
        layout_id: u64::from_be_bytes(raw64),
        layout_version: buf[META_LAYOUT_VERSION],
    })
}

pub fn read_meta(file: &PagedFile) -> Result<MetaRead> {
    let buf = file.read_page_direct(META_PAGE)?;
    Ok(meta_from_bytes(&buf))
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeState {
    pub sequence: u64,
    pub root: PageId,
    pub next_page: u64,
    pub writer_generation: u64,
    /// False while un-checkpointed mutations may exist. The first mutation
    /// after a checkpoint stamps a `clean = false` copy of that checkpoint,
    /// so a crash is visible on the next open.
    pub clean: bool,
    pub user_header: Vec<u8>,
    pub free_list: Vec<PageId>,
}

/// Free-list ids one state page can persist. Overflow stays in memory and is
/// recovered by the cleanup scan if lost to a crash.
pub fn free_list_capacity(page_size: usize) -> usize {
    (page_size - STATE_FREE_IDS - STATE_CRC_LEN) / 8
}

fn state_crc(buf: &[u8]) -> u32 {
    let payload_end = buf.len() - STATE_CRC_LEN;
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[..payload_end]);
    hasher.finalize()
}

pub fn write_state(file: &PagedFile, state: &TreeState) -> Result<()> {
    debug_assert!(state.user_header.len() <= USER_HEADER_CAP);
    debug_assert!(state.free_list.len() <= free_list_capacity(file.page_size()));
    let mut buf = vec![0u8; file.page_size()];
    buf[STATE_SEQUENCE].copy_from_slice(&state.sequence.to_be_bytes());
    buf[STATE_ROOT].copy_from_slice(&state.root.0.to_be_bytes());
    buf[STATE_NEXT_PAGE].copy_from_slice(&state.next_page.to_be_bytes());
    buf[STATE_WRITER_GENERATION].copy_from_slice(&state.writer_generation.to_be_bytes());
    buf[STATE_CLEAN] = state.clean as u8;
    buf[STATE_HEADER_LEN].copy_from_slice(&(state.user_header.len() as u16).to_be_bytes());
    buf[STATE_HEADER.start..STATE_HEADER.start + state.user_header.len()]
        .copy_from_slice(&state.user_header);
    buf[STATE_FREE_LEN].copy_from_slice(&(state.free_list.len() as u32).to_be_bytes());
    for (idx, id) in state.free_list.iter().enumerate() {
        let off = STATE_FREE_IDS + idx * 8;
        buf[off..off + 8].copy_from_slice(&id.0.to_be_bytes());
    }
    let crc = state_crc(&buf);
    let crc_off = buf.len() - STATE_CRC_LEN;
    buf[crc_off..].copy_from_slice(&crc.to_be_bytes());
    let slot = STATE_PAGES[(state.sequence % 2) as usize];
    file.write_page_direct(slot, &buf)
}

fn decode_state(buf: &[u8]) -> Option<TreeState> {
    let crc_off = buf.len() - STATE_CRC_LEN;
    let mut stored = [0u8; 4];
    stored.copy_from_slice(&buf[crc_off..]);
    if u32::from_be_bytes(stored) != state_crc(buf) {
        return None;
    }
    let read_u64 = |range: Range<usize>| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[range]);
        u64::from_be_bytes(raw)
    };
    let sequence = read_u64(STATE_SEQUENCE);
    if sequence == 0 {
        // All-zero pages checksum to a valid zero state; never written.
        return None;
    }
    let header_len = u16::from_be_bytes([buf[STATE_HEADER_LEN.start], buf[STATE_HEADER_LEN.start + 1]]) as usize;
    if header_len > USER_HEADER_CAP {
        return None;
    }
    let free_len = {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&buf[STATE_FREE_LEN]);
        u32::from_be_bytes(raw) as usize
    };
    if free_len > free_list_capacity(buf.len()) {
        return None;
    }
    let mut free_list = Vec::with_capacity(free_len);
    for idx in 0..free_len {
        let off = STATE_FREE_IDS + idx * 8;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[off..off + 8]);
        free_list.push(PageId(u64::from_be_bytes(raw)));
    }
    Some(TreeState {
        sequence,
        root: PageId(read_u64(STATE_ROOT)),
        next_page: read_u64(STATE_NEXT_PAGE),
        writer_generation: read_u64(STATE_WRITER_GENERATION),
        clean: buf[STATE_CLEAN] != 0,
        user_header: buf[STATE_HEADER.start..STATE_HEADER.start + header_len].to_vec(),
        free_list,
    })
}

/// Newest valid state, or `None` when both slots are unreadable.
pub fn read_state(file: &PagedFile) -> Result<Option<TreeState>> {
    let mut newest: Option<TreeState> = None;
    for slot in STATE_PAGES {
        let buf = match file.read_page_direct(slot) {
            Ok(buf) => buf,
            // A file torn before the second slot was ever written.
            Err(FarolError::Io(_)) => continue,
            Err(err) => return Err(err),
        };
        if let Some(state) = decode_state(&buf) {
            match &newest {
                Some(best) if best.sequence >= state.sequence => {}
                _ => newest = Some(state),
            }
        }
    }
    Ok(newest)
}
