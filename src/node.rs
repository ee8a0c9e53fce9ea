//! In-memory node representation and its on-disk encoding.
//!
//! A file or directory is a node record (one page: parent, size, segment list) plus a name
//! page (its full canonical path). Grounded on `storage::page::Page`'s pattern of pairing a
//! fixed-size on-disk buffer with in-memory bookkeeping (dirty flag, pin/open count), adapted
//! from Page's single-buffer-per-frame shape to UNFS's two-page, segment-list record.

use parking_lot::RwLock;

use crate::error::{UnfsError, UnfsResult};
use crate::layout::*;

/// One contiguous data extent owned by a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub pageid: u64,
    pub pagecount: u32,
}

impl Segment {
    fn encode(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.pageid.to_le_bytes());
        buf[8..12].copy_from_slice(&self.pagecount.to_le_bytes());
    }

    fn decode(buf: &[u8]) -> Self {
        Segment {
            pageid: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            pagecount: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
        }
    }
}

/// The decoded node-record page: everything about a file/directory except its name.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    /// This node's own entry-slot address — the stable identifier used by the name index and
    /// by parent references.
    pub pageid: u64,
    /// The parent directory's entry-slot address, or `pageid` itself for the root.
    pub parentid: u64,
    /// Logical byte size (files) or child count (directories,  `dir_list`).
    pub size: u64,
    pub isdir: bool,
    pub segments: Vec<Segment>,
}

impl NodeRecord {
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(self.segments.len() <= MAXDS);
        buf[NODE_OFF_PAGEID..NODE_OFF_PAGEID + 8].copy_from_slice(&self.pageid.to_le_bytes());
        buf[NODE_OFF_PARENTID..NODE_OFF_PARENTID + 8].copy_from_slice(&self.parentid.to_le_bytes());
        buf[NODE_OFF_SIZE..NODE_OFF_SIZE + 8].copy_from_slice(&self.size.to_le_bytes());
        buf[NODE_OFF_ISDIR..NODE_OFF_ISDIR + 4]
            .copy_from_slice(&(self.isdir as u32).to_le_bytes());
        buf[NODE_OFF_SEGCOUNT..NODE_OFF_SEGCOUNT + 4]
            .copy_from_slice(&(self.segments.len() as u32).to_le_bytes());
        for (i, seg) in self.segments.iter().enumerate() {
            let off = NODE_OFF_SEGMENTS + i * SEGMENT_ENCODED_SIZE;
            seg.encode(&mut buf[off..off + SEGMENT_ENCODED_SIZE]);
        }
    }

    pub fn decode(buf: &[u8]) -> UnfsResult<Self> {
        if buf.len() < PAGE_SIZE {
            return Err(UnfsError::invalid_argument("node record buffer truncated"));
        }
        let u64_at = |off: usize| u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        let u32_at = |off: usize| u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        let segcount = u32_at(NODE_OFF_SEGCOUNT) as usize;
        if segcount > MAXDS {
            return Err(UnfsError::invalid_argument("corrupt segment count exceeds MAXDS"));
        }
        let mut segments = Vec::with_capacity(segcount);
        for i in 0..segcount {
            let off = NODE_OFF_SEGMENTS + i * SEGMENT_ENCODED_SIZE;
            segments.push(Segment::decode(&buf[off..off + SEGMENT_ENCODED_SIZE]));
        }
        Ok(NodeRecord {
            pageid: u64_at(NODE_OFF_PAGEID),
            parentid: u64_at(NODE_OFF_PARENTID),
            size: u64_at(NODE_OFF_SIZE),
            isdir: u32_at(NODE_OFF_ISDIR) != 0,
            segments,
        })
    }
}

/// Encodes `name` (the full canonical path) into a name page.
pub fn encode_name(name: &str, buf: &mut [u8]) -> UnfsResult<()> {
    let bytes = name.as_bytes();
    if bytes.len() >= NAME_MAX {
        return Err(UnfsError::invalid_argument("name too long"));
    }
    buf[..bytes.len()].copy_from_slice(bytes);
    buf[bytes.len()..].fill(0);
    Ok(())
}

pub fn decode_name(buf: &[u8]) -> UnfsResult<String> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8(buf[..end].to_vec())
        .map_err(|_| UnfsError::invalid_argument("name is not valid UTF-8"))
}

/// Mutable, lock-protected node state ("one `RwLock` per node").
#[derive(Debug)]
pub struct NodeState {
    pub record: NodeRecord,
    pub name: String,
    pub open_count: u32,
    pub dirty: bool,
}

/// A live in-memory node. Cheaply clonable via `Arc` so the name index and open file handles
/// can share ownership without holding the filesystem lock. The node's current entry-slot
/// address lives in `record.pageid` — it can change under relocation (the delete-stack
/// overflow), so callers must re-read it through the lock rather than caching it.
#[derive(Debug)]
pub struct Node {
    state: RwLock<NodeState>,
}

impl Node {
    pub fn new(record: NodeRecord, name: String) -> Self {
        Node {
            state: RwLock::new(NodeState {
                record,
                name,
                open_count: 0,
                dirty: false,
            }),
        }
    }

    pub fn slot(&self) -> u64 {
        self.state.read().record.pageid
    }

    pub fn read(&self) -> parking_lot::RwLockReadGuard<'_, NodeState> {
        self.state.read()
    }

    pub fn write(&self) -> parking_lot::RwLockWriteGuard<'_, NodeState> {
        self.state.write()
    }
}
