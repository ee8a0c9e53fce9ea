//! Header & Bitmap Manager.
//!
//! The on-disk header and free-page bitmap share one invariant:
//! `popcount(bitmap) + pagefree + datapage == pagecount`. This module keeps that invariant by
//! construction rather than by periodic recomputation: the bitmap is a single array covering
//! every page from `datapage` to `pagecount`, and it carries a bit for *every* page currently
//! spoken for — whether that page holds file data (upward allocation, grounded on
//! `storage::disk::DiskManager`'s page-oriented I/O) or belongs to the downward-growing
//! file-entry region (the two pages above `fdnextpage`). Growing or shrinking the entry region
//! sets or clears its bits exactly the way a data allocation would.

use crate::device::DeviceBackend;
use crate::error::{UnfsError, UnfsResult};
use crate::layout::*;

/// The decoded on-disk header.
#[derive(Debug, Clone)]
pub struct Header {
    pub label: String,
    pub blockcount: u64,
    pub blocksize: u32,
    pub pagesize: u32,
    pub pagecount: u64,
    pub datapage: u64,
    pub pagefree: u64,
    pub fdnextpage: u64,
    pub fdcount: u64,
    pub dircount: u64,
    pub bitmapwords: u64,
    pub delmax: u64,
    pub delstack: Vec<u64>,
}

impl Header {
    /// Builds the header for a freshly formatted device (format narrative: "format"):
    /// no entries yet, so `fdnextpage + (0 + 0 + 1) * FILEPC == pagecount`.
    pub fn new_formatted(label: &str, blockcount: u64, blocksize: u32, pagecount: u64) -> Self {
        let bitmap_bits = pagecount.saturating_sub(HEADPC);
        let bitmapwords = bitmap_bits.div_ceil(64);
        let bitmap_bytes = bitmapwords * 8;
        let bitmap_pages = (bitmap_bytes as usize).div_ceil(PAGE_SIZE) as u64;
        let datapage = HEADPC + bitmap_pages;
        let fdnextpage = pagecount - FILEPC;
        // No entries exist yet: the dense entry region [fdnextpage+FILEPC, pagecount) is empty
        // and every page in [datapage, pagecount) is free, matching a freshly zeroed bitmap.
        let pagefree = pagecount - datapage;
        Header {
            label: label.to_string(),
            blockcount,
            blocksize,
            pagesize: PAGE_SIZE as u32,
            pagecount,
            datapage,
            pagefree,
            fdnextpage,
            fdcount: 0,
            dircount: 0,
            bitmapwords,
            delmax: DELMAX_CAPACITY as u64,
            delstack: Vec::new(),
        }
    }

    /// Asserts the header accounting invariant, given the bitmap's popcount.
    pub fn check_invariant(&self, bitmap_popcount: u64) -> UnfsResult<()> {
        if self.fdnextpage + (self.fdcount + self.delstack.len() as u64 + 1) * FILEPC
            != self.pagecount
        {
            return Err(UnfsError::invalid_argument(
                "header invariant violated: fdnextpage + (fdcount + delcount + 1) * FILEPC != pagecount",
            ));
        }
        if bitmap_popcount + self.pagefree + self.datapage != self.pagecount {
            return Err(UnfsError::invalid_argument(
                "bitmap invariant violated: popcount(bitmap) + pagefree + datapage != pagecount",
            ));
        }
        Ok(())
    }

    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_BYTES);
        buf[OFF_VERSION..OFF_VERSION + 8].copy_from_slice(VERSION);
        let label_bytes = self.label.as_bytes();
        let n = label_bytes.len().min(LABEL_MAX);
        buf[OFF_LABEL..OFF_LABEL + n].copy_from_slice(&label_bytes[..n]);
        buf[OFF_LABEL + n..OFF_LABEL + LABEL_FIELD_SIZE].fill(0);
        buf[OFF_BLOCKCOUNT..OFF_BLOCKCOUNT + 8].copy_from_slice(&self.blockcount.to_le_bytes());
        buf[OFF_BLOCKSIZE..OFF_BLOCKSIZE + 4].copy_from_slice(&self.blocksize.to_le_bytes());
        buf[OFF_PAGESIZE..OFF_PAGESIZE + 4].copy_from_slice(&self.pagesize.to_le_bytes());
        buf[OFF_PAGECOUNT..OFF_PAGECOUNT + 8].copy_from_slice(&self.pagecount.to_le_bytes());
        buf[OFF_DATAPAGE..OFF_DATAPAGE + 8].copy_from_slice(&self.datapage.to_le_bytes());
        buf[OFF_PAGEFREE..OFF_PAGEFREE + 8].copy_from_slice(&self.pagefree.to_le_bytes());
        buf[OFF_FDNEXTPAGE..OFF_FDNEXTPAGE + 8].copy_from_slice(&self.fdnextpage.to_le_bytes());
        buf[OFF_FDCOUNT..OFF_FDCOUNT + 8].copy_from_slice(&self.fdcount.to_le_bytes());
        buf[OFF_DIRCOUNT..OFF_DIRCOUNT + 8].copy_from_slice(&self.dircount.to_le_bytes());
        buf[OFF_BITMAPWORDS..OFF_BITMAPWORDS + 8].copy_from_slice(&self.bitmapwords.to_le_bytes());
        buf[OFF_DELMAX..OFF_DELMAX + 8].copy_from_slice(&self.delmax.to_le_bytes());
        let delcount = self.delstack.len() as u64;
        buf[OFF_DELCOUNT..OFF_DELCOUNT + 8].copy_from_slice(&delcount.to_le_bytes());
        buf[OFF_DELSTACK..OFF_DELSTACK + DELMAX_CAPACITY * 8].fill(0);
        for (i, addr) in self.delstack.iter().enumerate() {
            let off = OFF_DELSTACK + i * 8;
            buf[off..off + 8].copy_from_slice(&addr.to_le_bytes());
        }
    }

    pub fn decode(buf: &[u8]) -> UnfsResult<Self> {
        if buf.len() < HEADER_BYTES {
            return Err(UnfsError::invalid_argument("header buffer truncated"));
        }
        if &buf[OFF_VERSION..OFF_VERSION + 8] != VERSION {
            return Err(UnfsError::invalid_argument("bad UNFS version literal"));
        }
        let label_end = buf[OFF_LABEL..OFF_LABEL + LABEL_FIELD_SIZE]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(LABEL_MAX);
        let label = String::from_utf8_lossy(&buf[OFF_LABEL..OFF_LABEL + label_end]).into_owned();
        let u64_at = |off: usize| u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
        let u32_at = |off: usize| u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        let delmax = u64_at(OFF_DELMAX);
        let delcount = u64_at(OFF_DELCOUNT) as usize;
        if delcount as u64 > delmax || delmax > DELMAX_CAPACITY as u64 {
            return Err(UnfsError::invalid_argument("corrupt delete stack bounds"));
        }
        let mut delstack = Vec::with_capacity(delcount);
        for i in 0..delcount {
            delstack.push(u64_at(OFF_DELSTACK + i * 8));
        }
        Ok(Header {
            label,
            blockcount: u64_at(OFF_BLOCKCOUNT),
            blocksize: u32_at(OFF_BLOCKSIZE),
            pagesize: u32_at(OFF_PAGESIZE),
            pagecount: u64_at(OFF_PAGECOUNT),
            datapage: u64_at(OFF_DATAPAGE),
            pagefree: u64_at(OFF_PAGEFREE),
            fdnextpage: u64_at(OFF_FDNEXTPAGE),
            fdcount: u64_at(OFF_FDCOUNT),
            dircount: u64_at(OFF_DIRCOUNT),
            bitmapwords: u64_at(OFF_BITMAPWORDS),
            delmax,
            delstack,
        })
    }
}

/// Outcome of freeing a file-entry slot: whether it went onto the delete stack, or the stack
/// was full and the dense region's bottom slot had to be relocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryFree {
    /// The slot address was pushed to the delete stack; no other entry moved.
    Pushed,
    /// The delete stack was full. The entry currently occupying `relocate_from` (the dense
    /// region's lowest-addressed slot) must be physically copied to `relocate_to` (the slot
    /// just freed) by the caller (`nodestore`), which also owns updating any in-memory
    /// references to the relocated node. `relocate_from == relocate_to` is a legal no-op.
    Overflowed { relocate_from: u64, relocate_to: u64 },
}

/// The free-page bitmap, MSB-first within each 64-bit word.
#[derive(Debug, Clone)]
pub struct Bitmap {
    words: Vec<u64>,
    dirty_lo: usize,
    dirty_hi: usize,
    hint: u64,
}

impl Bitmap {
    pub fn new_zeroed(bitmapwords: u64) -> Self {
        Bitmap {
            words: vec![0u64; bitmapwords as usize],
            dirty_lo: 0,
            dirty_hi: 0,
            hint: 0,
        }
    }

    pub fn from_words(words: Vec<u64>) -> Self {
        Bitmap {
            words,
            dirty_lo: 0,
            dirty_hi: 0,
            hint: 0,
        }
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    pub fn popcount(&self) -> u64 {
        self.words.iter().map(|w| w.count_ones() as u64).sum()
    }

    /// True if the page at absolute address `addr` is currently marked allocated, given the
    /// header's `datapage` base (used by [`crate::check`] to re-verify entry/segment coverage).
    pub fn is_allocated(&self, header: &Header, addr: u64) -> bool {
        if addr < header.datapage {
            return false;
        }
        let index = addr - header.datapage;
        let total_bits = self.words.len() as u64 * 64;
        index < total_bits && self.bit(index)
    }

    fn bit(&self, index: u64) -> bool {
        let word = (index / 64) as usize;
        let bit = 63 - (index % 64);
        (self.words[word] >> bit) & 1 == 1
    }

    fn set_bit(&mut self, index: u64) {
        let word = (index / 64) as usize;
        let bit = 63 - (index % 64);
        self.words[word] |= 1 << bit;
        self.mark_dirty(word);
    }

    fn clear_bit(&mut self, index: u64) {
        let word = (index / 64) as usize;
        let bit = 63 - (index % 64);
        self.words[word] &= !(1 << bit);
        self.mark_dirty(word);
    }

    fn mark_dirty(&mut self, word: usize) {
        if self.dirty_lo > self.dirty_hi {
            self.dirty_lo = word;
            self.dirty_hi = word + 1;
        } else {
            self.dirty_lo = self.dirty_lo.min(word);
            self.dirty_hi = self.dirty_hi.max(word + 1);
        }
    }

    /// Dirty word span as `[lo, hi)`, or `None` if nothing changed since the last [`Self::clear_dirty`].
    pub fn dirty_span(&self) -> Option<(usize, usize)> {
        if self.dirty_lo < self.dirty_hi {
            Some((self.dirty_lo, self.dirty_hi))
        } else {
            None
        }
    }

    pub fn clear_dirty(&mut self) {
        self.dirty_lo = 1;
        self.dirty_hi = 0;
    }

    fn set_run(&mut self, index: u64, count: u64) {
        for i in index..index + count {
            self.set_bit(i);
        }
    }

    fn clear_run(&mut self, index: u64, count: u64) {
        for i in index..index + count {
            self.clear_bit(i);
        }
    }

    /// Finds and marks a free run of `count` contiguous data pages, first-fit from the last
    /// allocation point . Runs shorter than a word are found with a bit-trick shift
    /// scan inside a word; longer runs scan whole zero words first, then verify the partial
    /// edges. Returns the page address (not bit index) of the run's first page.
    pub fn alloc_data(&mut self, header: &mut Header, count: u64) -> UnfsResult<u64> {
        if count == 0 {
            return Err(UnfsError::invalid_argument("cannot allocate zero pages"));
        }
        let data_bits = header.fdnextpage - header.datapage;
        let total_bits = (self.words.len() as u64) * 64;
        let limit = data_bits.min(total_bits);

        let found = if count < 64 {
            self.find_run_small(count, limit)
        } else {
            self.find_run_large(count, limit)
        };
        let index = found.ok_or(UnfsError::NoSpace)?;
        self.set_run(index, count);
        header.pagefree -= count;
        self.hint = index + count;
        Ok(header.datapage + index)
    }

    fn find_run_small(&self, count: u64, limit: u64) -> Option<u64> {
        let mut index = self.hint.min(limit);
        let mut scanned = 0u64;
        while scanned < limit {
            if index >= limit {
                index = 0;
            }
            let mut run = 0u64;
            while run < count && index + run < limit && !self.bit(index + run) {
                run += 1;
            }
            if run == count {
                return Some(index);
            }
            index += run + 1;
            scanned += run + 1;
        }
        None
    }

    fn find_run_large(&self, count: u64, limit: u64) -> Option<u64> {
        let mut run_start: Option<u64> = None;
        let mut run_len = 0u64;
        for i in 0..limit {
            if !self.bit(i) {
                if run_start.is_none() {
                    run_start = Some(i);
                }
                run_len += 1;
                if run_len == count {
                    return run_start;
                }
            } else {
                run_start = None;
                run_len = 0;
            }
        }
        None
    }

    /// Reserves `[addr, addr+count)` for data use if every page in that range is currently
    /// free and within the data region, returning true on success (the in-place grow
    /// fast path: extend a file's last segment instead of adding a new one).
    pub fn reserve_if_free(&mut self, header: &mut Header, addr: u64, count: u64) -> bool {
        if addr < header.datapage || addr + count > header.fdnextpage {
            return false;
        }
        let index = addr - header.datapage;
        for i in index..index + count {
            if self.bit(i) {
                return false;
            }
        }
        self.set_run(index, count);
        header.pagefree -= count;
        true
    }

    pub fn free_data(&mut self, header: &mut Header, addr: u64, count: u64) {
        let index = addr - header.datapage;
        self.clear_run(index, count);
        header.pagefree += count;
    }

    /// Clears bits without touching `pagefree`, deliberately desynchronizing the header/bitmap
    /// invariant. Used only by `check`'s own tests to exercise the detection path.
    #[doc(hidden)]
    pub fn corrupt_clear_for_test(&mut self, header: &Header, addr: u64, count: u64) {
        let index = addr - header.datapage;
        self.clear_run(index, count);
    }

    /// Allocates a new file-entry slot: pops the delete stack if non-empty, else carves one
    /// off the top of the dense region — takes slot `[fdnextpage, fdnextpage+FILEPC)` and
    /// decrements `fdnextpage`.
    pub fn alloc_entry_slot(&mut self, header: &mut Header) -> UnfsResult<u64> {
        if let Some(addr) = header.delstack.pop() {
            header.fdcount += 1;
            return Ok(addr);
        }
        if header.fdnextpage < header.datapage + FILEPC {
            return Err(UnfsError::NoSpace);
        }
        let addr = header.fdnextpage;
        let index = addr - header.datapage;
        self.set_run(index, FILEPC);
        header.fdnextpage -= FILEPC;
        header.pagefree -= FILEPC;
        header.fdcount += 1;
        Ok(addr)
    }

    /// Frees a file-entry slot at `addr`. See [`EntryFree`] for the overflow/relocation case.
    pub fn free_entry_slot(&mut self, header: &mut Header, addr: u64) -> EntryFree {
        header.fdcount -= 1;
        if (header.delstack.len() as u64) < header.delmax {
            header.delstack.push(addr);
            return EntryFree::Pushed;
        }
        let relocate_from = header.fdnextpage + FILEPC;
        let index = relocate_from - header.datapage;
        self.clear_run(index, FILEPC);
        header.fdnextpage = relocate_from;
        header.pagefree += FILEPC;
        EntryFree::Overflowed {
            relocate_from,
            relocate_to: addr,
        }
    }
}

/// Writes the header (always HEADPC pages) and any dirty bitmap word spans back to `device`,
/// then clears the dirty span (the `sync`).
pub fn sync(
    device: &dyn DeviceBackend,
    ctx: crate::device::IoContext,
    header: &Header,
    bitmap: &mut Bitmap,
) -> UnfsResult<()> {
    let mut header_buf = device.page_alloc(ctx, HEADPC as u32)?;
    header.encode(header_buf.as_mut_slice());
    device.write(ctx, &header_buf, 0, HEADPC as u32)?;
    device.page_free(ctx, header_buf);

    if let Some((lo, hi)) = bitmap.dirty_span() {
        let byte_lo = lo * 8;
        let byte_hi = hi * 8;
        let page_lo = byte_lo / PAGE_SIZE;
        let page_hi = byte_hi.div_ceil(PAGE_SIZE);
        let page_count = (page_hi - page_lo) as u32;
        let mut buf = device.page_alloc(ctx, page_count)?;
        let words_per_page = PAGE_SIZE / 8;
        for (i, page_slot) in (page_lo..page_hi).enumerate() {
            let word_base = page_slot * words_per_page;
            for w in 0..words_per_page {
                let word_index = word_base + w;
                let value = bitmap.words.get(word_index).copied().unwrap_or(0);
                let off = i * PAGE_SIZE + w * 8;
                buf.as_mut_slice()[off..off + 8].copy_from_slice(&value.to_le_bytes());
            }
        }
        device.write(ctx, &buf, HEADPC + page_lo as u64, page_count)?;
        device.page_free(ctx, buf);
        bitmap.clear_dirty();
    }
    Ok(())
}

/// Reads the header and full bitmap off `device`, as `open` and `check` both need.
pub fn load(device: &dyn DeviceBackend, ctx: crate::device::IoContext) -> UnfsResult<(Header, Bitmap)> {
    let mut header_buf = device.page_alloc(ctx, HEADPC as u32)?;
    device.read(ctx, &mut header_buf, 0, HEADPC as u32)?;
    let header = Header::decode(header_buf.as_slice())?;
    device.page_free(ctx, header_buf);

    let bitmap_bytes = header.bitmapwords as usize * 8;
    let bitmap_pages = bitmap_bytes.div_ceil(PAGE_SIZE) as u32;
    let mut buf = device.page_alloc(ctx, bitmap_pages)?;
    device.read(ctx, &mut buf, HEADPC, bitmap_pages)?;
    let mut words = Vec::with_capacity(header.bitmapwords as usize);
    for w in 0..header.bitmapwords as usize {
        let off = w * 8;
        words.push(u64::from_le_bytes(buf.as_slice()[off..off + 8].try_into().unwrap()));
    }
    device.page_free(ctx, buf);
    Ok((header, Bitmap::from_words(words)))
}
