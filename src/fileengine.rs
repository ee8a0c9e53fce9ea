//! File Engine: resize, read, write and checksum over a node's segment list.
//!
//! Grounded on `storage::disk::DiskManager`'s page read/write pair, generalized to operate over
//! a *list* of extents instead of one page at a time, and on `storage::page::Page`'s
//! read_bytes/write_bytes sub-page copy helpers, generalized to read-modify-write across a
//! logical byte range that may span several physical pages.

use crate::bitmap::{Bitmap, Header};
use crate::device::{DeviceBackend, IoContext};
use crate::error::UnfsResult;
use crate::layout::{MAXDS, PAGE_SIZE};
use crate::node::{Node, Segment};

/// Fill byte used to pad newly grown pages.
const FILL_BYTE: u8 = 0;

fn pages_for_size(size: u64) -> u64 {
    (size as usize).div_ceil(PAGE_SIZE) as u64
}

/// Total pages currently held by `segments`.
fn total_pages(segments: &[Segment]) -> u64 {
    segments.iter().map(|s| s.pagecount as u64).sum()
}

/// Maps a logical page index to its physical page address, walking segments in order.
fn physical_page(segments: &[Segment], logical: u64) -> u64 {
    let mut remaining = logical;
    for seg in segments {
        if remaining < seg.pagecount as u64 {
            return seg.pageid + remaining;
        }
        remaining -= seg.pagecount as u64;
    }
    unreachable!("logical page {logical} outside segment list")
}

/// Grows `node` to `new_size` bytes, allocating new pages as needed. New whole pages are
/// zero-filled; a newly extended partial tail page has its tail zero-filled too.
///
/// When the segment list is already at `MAXDS` and a new segment would be required, every
/// existing segment is merged into one contiguous extent instead: their data is copied in order
/// into a fresh allocation sized to also cover the growth, and the old extents are freed.
pub fn grow(
    device: &dyn DeviceBackend,
    ctx: IoContext,
    header: &mut Header,
    bitmap: &mut Bitmap,
    node: &Node,
    new_size: u64,
) -> UnfsResult<()> {
    let mut state = node.write();
    let old_size = state.record.size;
    if new_size <= old_size {
        return Ok(());
    }
    let old_pages = total_pages(&state.record.segments);
    let new_pages = pages_for_size(new_size);
    let delta = new_pages.saturating_sub(old_pages);

    if delta > 0 {
        if state.record.segments.len() < MAXDS {
            match state.record.segments.last().copied() {
                Some(last) if try_extend_in_place(bitmap, header, last, delta) => {
                    let idx = state.record.segments.len() - 1;
                    state.record.segments[idx].pagecount += delta as u32;
                }
                _ => {
                    let addr = bitmap.alloc_data(header, delta)?;
                    state.record.segments.push(Segment { pageid: addr, pagecount: delta as u32 });
                }
            }
        } else {
            merge_all_segments(device, ctx, header, bitmap, &mut state.record.segments, new_pages)?;
        }
    }

    zero_fill_growth(device, ctx, &state.record.segments, old_size, new_size)?;
    state.record.size = new_size;
    state.dirty = true;
    Ok(())
}

/// Best-effort in-place extension: true if the page run immediately following `last` is free.
fn try_extend_in_place(bitmap: &mut Bitmap, header: &mut Header, last: Segment, delta: u64) -> bool {
    let candidate = last.pageid + last.pagecount as u64;
    if bitmap.reserve_if_free(header, candidate, delta) {
        return true;
    }
    false
}

/// Merges every segment in `segments` into one contiguous extent of `new_pages` pages: the old
/// segments' data is copied forward in order, the old extents are freed, and `segments` is left
/// holding exactly the one merged entry.
fn merge_all_segments(
    device: &dyn DeviceBackend,
    ctx: IoContext,
    header: &mut Header,
    bitmap: &mut Bitmap,
    segments: &mut Vec<Segment>,
    new_pages: u64,
) -> UnfsResult<()> {
    let new_addr = bitmap.alloc_data(header, new_pages)?;

    let mut offset = 0u64;
    for seg in segments.iter() {
        if seg.pagecount == 0 {
            continue;
        }
        let mut buf = device.page_alloc(ctx, seg.pagecount)?;
        device.read(ctx, &mut buf, seg.pageid, seg.pagecount)?;
        device.write(ctx, &buf, new_addr + offset, seg.pagecount)?;
        device.page_free(ctx, buf);
        offset += seg.pagecount as u64;
    }
    for seg in segments.iter() {
        if seg.pagecount > 0 {
            bitmap.free_data(header, seg.pageid, seg.pagecount as u64);
        }
    }

    segments.clear();
    segments.push(Segment { pageid: new_addr, pagecount: new_pages as u32 });
    Ok(())
}

fn zero_fill_growth(
    device: &dyn DeviceBackend,
    ctx: IoContext,
    segments: &[Segment],
    old_size: u64,
    new_size: u64,
) -> UnfsResult<()> {
    let old_page = old_size / PAGE_SIZE as u64;
    let old_off = (old_size % PAGE_SIZE as u64) as usize;
    let new_last_page = (new_size.saturating_sub(1)) / PAGE_SIZE as u64;

    if old_off != 0 {
        let addr = physical_page(segments, old_page);
        let mut buf = device.page_alloc(ctx, 1)?;
        device.read(ctx, &mut buf, addr, 1)?;
        buf.as_mut_slice()[old_off..].fill(FILL_BYTE);
        device.write(ctx, &buf, addr, 1)?;
        device.page_free(ctx, buf);
    }
    let first_new_page = if old_off != 0 { old_page + 1 } else { old_page };
    if first_new_page <= new_last_page {
        let count = (new_last_page - first_new_page + 1) as u32;
        let mut addr = physical_page(segments, first_new_page);
        let mut remaining = count;
        let mut buf = device.page_alloc(ctx, remaining.min(64))?;
        while remaining > 0 {
            let chunk = remaining.min(buf.page_count());
            buf.as_mut_slice()[..chunk as usize * PAGE_SIZE].fill(FILL_BYTE);
            device.write(ctx, &buf, addr, chunk)?;
            addr += chunk as u64;
            remaining -= chunk;
        }
        device.page_free(ctx, buf);
    }
    Ok(())
}

/// Shrinks `node` to `new_size` bytes, freeing and trimming tail segments.
pub fn shrink(header: &mut Header, bitmap: &mut Bitmap, node: &Node, new_size: u64) -> UnfsResult<()> {
    let mut state = node.write();
    if new_size >= state.record.size {
        return Ok(());
    }
    let keep_pages = pages_for_size(new_size);
    let mut kept_so_far = 0u64;
    let mut new_segments = Vec::new();
    for seg in &state.record.segments {
        if kept_so_far >= keep_pages {
            bitmap.free_data(header, seg.pageid, seg.pagecount as u64);
            continue;
        }
        let remaining_to_keep = keep_pages - kept_so_far;
        if (seg.pagecount as u64) <= remaining_to_keep {
            kept_so_far += seg.pagecount as u64;
            new_segments.push(*seg);
        } else {
            let keep = remaining_to_keep;
            let free_count = seg.pagecount as u64 - keep;
            bitmap.free_data(header, seg.pageid + keep, free_count);
            new_segments.push(Segment { pageid: seg.pageid, pagecount: keep as u32 });
            kept_so_far += keep;
        }
    }
    if new_segments.is_empty() {
        if let Some(first) = state.record.segments.first() {
            new_segments.push(Segment { pageid: first.pageid, pagecount: 0 });
        }
    }
    state.record.segments = new_segments;
    state.record.size = new_size;
    state.dirty = true;
    Ok(())
}

/// Reads `len` bytes starting at `offset` into `out`.
pub fn read(device: &dyn DeviceBackend, ctx: IoContext, node: &Node, offset: u64, out: &mut [u8]) -> UnfsResult<usize> {
    let state = node.read();
    let size = state.record.size;
    if offset >= size {
        return Ok(0);
    }
    let len = out.len().min((size - offset) as usize);
    let mut done = 0usize;
    let mut pos = offset;
    while done < len {
        let page_index = pos / PAGE_SIZE as u64;
        let page_off = (pos % PAGE_SIZE as u64) as usize;
        let addr = physical_page(&state.record.segments, page_index);
        let mut buf = device.page_alloc(ctx, 1)?;
        device.read(ctx, &mut buf, addr, 1)?;
        let take = (PAGE_SIZE - page_off).min(len - done);
        out[done..done + take].copy_from_slice(&buf.as_slice()[page_off..page_off + take]);
        device.page_free(ctx, buf);
        done += take;
        pos += take as u64;
    }
    Ok(done)
}

/// Writes `data` at `offset`, growing the node first if the write extends past its current
/// size. Partial first/last pages are read-modify-written.
pub fn write(
    device: &dyn DeviceBackend,
    ctx: IoContext,
    header: &mut Header,
    bitmap: &mut Bitmap,
    node: &Node,
    offset: u64,
    data: &[u8],
) -> UnfsResult<()> {
    let end = offset + data.len() as u64;
    if end > node.read().record.size {
        grow(device, ctx, header, bitmap, node, end)?;
    }
    let state = node.read();
    let mut done = 0usize;
    let mut pos = offset;
    while done < data.len() {
        let page_index = pos / PAGE_SIZE as u64;
        let page_off = (pos % PAGE_SIZE as u64) as usize;
        let addr = physical_page(&state.record.segments, page_index);
        let take = (PAGE_SIZE - page_off).min(data.len() - done);
        let mut buf = device.page_alloc(ctx, 1)?;
        if take < PAGE_SIZE {
            device.read(ctx, &mut buf, addr, 1)?;
        }
        buf.as_mut_slice()[page_off..page_off + take].copy_from_slice(&data[done..done + take]);
        device.write(ctx, &buf, addr, 1)?;
        device.page_free(ctx, buf);
        done += take;
        pos += take as u64;
    }
    drop(state);
    let mut state = node.write();
    state.dirty = true;
    Ok(())
}

/// Computes the rolling checksum over a file's current content: for each byte in segment
/// order, `sum = sum.wrapping_add((remaining_size << 32) | byte)`, where `remaining_size`
/// counts down from the file's size to one.
pub fn checksum(device: &dyn DeviceBackend, ctx: IoContext, node: &Node) -> UnfsResult<u64> {
    let state = node.read();
    let size = state.record.size;
    let mut sum: u64 = 0;
    let mut remaining = size;
    let mut pos = 0u64;
    while pos < size {
        let page_index = pos / PAGE_SIZE as u64;
        let addr = physical_page(&state.record.segments, page_index);
        let mut buf = device.page_alloc(ctx, 1)?;
        device.read(ctx, &mut buf, addr, 1)?;
        let page_off = (pos % PAGE_SIZE as u64) as usize;
        let take = (PAGE_SIZE - page_off).min((size - pos) as usize);
        for &byte in &buf.as_slice()[page_off..page_off + take] {
            sum = sum.wrapping_add((remaining << 32) | byte as u64);
            remaining -= 1;
        }
        device.page_free(ctx, buf);
        pos += take as u64;
    }
    Ok(sum)
}
