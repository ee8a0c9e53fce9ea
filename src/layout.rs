//! On-disk byte layout constants for the `UNFS-1.0` format.
/// Fixed page size in bytes. The format is defined in terms of this page size; block devices
/// with a smaller block size are addressed through [`crate::device`]'s page_multiplier.
pub const PAGE_SIZE: usize = 4096;

/// Number of header pages (page 0 and page 1).
pub const HEADPC: u64 = 2;

/// Pages per file/directory entry: one node-record page, one name page.
pub const FILEPC: u64 = 2;

/// Maximum label length, not counting the terminating NUL.
pub const LABEL_MAX: usize = 63;

/// On-disk version literal.
pub const VERSION: &[u8; 8] = b"UNFS-1.0";

/// Maximum canonical name length ("length < PAGESIZE - 2").
pub const NAME_MAX: usize = PAGE_SIZE - 2;

// --- header byte offsets (within the HEADPC * PAGE_SIZE header region) ---

pub(crate) const OFF_VERSION: usize = 0;
pub(crate) const OFF_LABEL: usize = 8;
pub(crate) const LABEL_FIELD_SIZE: usize = LABEL_MAX + 1;
pub(crate) const OFF_BLOCKCOUNT: usize = OFF_LABEL + LABEL_FIELD_SIZE;
pub(crate) const OFF_BLOCKSIZE: usize = OFF_BLOCKCOUNT + 8;
pub(crate) const OFF_PAGESIZE: usize = OFF_BLOCKSIZE + 4;
pub(crate) const OFF_PAGECOUNT: usize = OFF_PAGESIZE + 4;
pub(crate) const OFF_DATAPAGE: usize = OFF_PAGECOUNT + 8;
pub(crate) const OFF_PAGEFREE: usize = OFF_DATAPAGE + 8;
pub(crate) const OFF_FDNEXTPAGE: usize = OFF_PAGEFREE + 8;
pub(crate) const OFF_FDCOUNT: usize = OFF_FDNEXTPAGE + 8;
pub(crate) const OFF_DIRCOUNT: usize = OFF_FDCOUNT + 8;
pub(crate) const OFF_BITMAPWORDS: usize = OFF_DIRCOUNT + 8;
pub(crate) const OFF_DELMAX: usize = OFF_BITMAPWORDS + 8;
pub(crate) const OFF_DELCOUNT: usize = OFF_DELMAX + 8;
pub(crate) const OFF_DELSTACK: usize = OFF_DELCOUNT + 8;

pub(crate) const HEADER_BYTES: usize = HEADPC as usize * PAGE_SIZE;

/// Maximum delete-stack entries: `(sizeof(header) - offset(delstack)) / 8` (glossary).
pub const DELMAX_CAPACITY: usize = (HEADER_BYTES - OFF_DELSTACK) / 8;

// --- file entry (node record) byte offsets, within one PAGE_SIZE page ---

pub(crate) const NODE_OFF_PAGEID: usize = 0;
pub(crate) const NODE_OFF_PARENTID: usize = 8;
pub(crate) const NODE_OFF_SIZE: usize = 16;
pub(crate) const NODE_OFF_ISDIR: usize = 24;
pub(crate) const NODE_OFF_SEGCOUNT: usize = 28;
pub(crate) const NODE_OFF_SEGMENTS: usize = 32;

/// Encoded size of one on-disk segment entry: page address (8 bytes) + page count (4 bytes).
pub(crate) const SEGMENT_ENCODED_SIZE: usize = 12;

/// Maximum segments a file entry can hold in its node-record page.
pub const MAXDS: usize = (PAGE_SIZE - NODE_OFF_SEGMENTS) / SEGMENT_ENCODED_SIZE;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delstack_fits_in_header() {
        assert!(OFF_DELSTACK + DELMAX_CAPACITY * 8 <= HEADER_BYTES);
    }

    #[test]
    fn maxds_fits_in_one_page() {
        assert!(NODE_OFF_SEGMENTS + MAXDS * SEGMENT_ENCODED_SIZE <= PAGE_SIZE);
    }
}
