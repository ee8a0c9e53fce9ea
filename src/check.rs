//! Destructive-free consistency verifier.
//!
//! Re-derives every testable consistency property without mutating anything: the header/bitmap
//! accounting equation, that every live entry's slot and segment pages are actually marked
//! allocated, that every entry's name is an immediate child of its parent's name under
//! [`crate::nameindex::unfs_child_of`], and that every directory's recorded size matches its
//! live child count. Every inconsistency is logged at `warn!` as it is found (an operator
//! running `check` against a log sink sees the full list, not just the first failure), and the
//! function still returns a single `Err` summarizing the count.

use crate::bitmap::{Bitmap, Header};
use crate::device::DeviceBackend;
use crate::error::{UnfsError, UnfsResult};
use crate::layout::FILEPC;
use crate::nameindex::{NameIndex, unfs_child_of};

fn parent_of(path: &str) -> &str {
    if path == "/" {
        return "/";
    }
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => "/",
    }
}

/// Runs the full consistency check against the live, in-memory `index` and the on-disk header
/// and bitmap . Returns `Ok(())` iff zero inconsistencies were found.
pub fn check(device: &dyn DeviceBackend, header: &Header, bitmap: &Bitmap, index: &NameIndex) -> UnfsResult<()> {
    let mut problems = Vec::new();

    if let Err(e) = header.check_invariant(bitmap.popcount()) {
        problems.push(e.to_string());
    }

    let ctx = device.ioc_alloc()?;
    let disk_nodes = crate::nodestore::scan_all(device, ctx, header);
    device.ioc_free(ctx);
    let disk_nodes = match disk_nodes {
        Ok(n) => n,
        Err(e) => {
            problems.push(format!("entry region scan failed: {e}"));
            log::warn!("unfs check: entry region scan failed: {e}");
            return Err(UnfsError::invalid_argument(format!("{} consistency problems found", problems.len())));
        }
    };

    if disk_nodes.len() != index.len() {
        problems.push(format!(
            "in-memory index has {} entries, on-disk scan found {}",
            index.len(),
            disk_nodes.len()
        ));
    }

    for node in &disk_nodes {
        let r = node.read();
        let slot = r.record.pageid;

        for p in slot..slot + FILEPC {
            if !bitmap.is_allocated(header, p) {
                problems.push(format!("entry '{}' slot page {p} is not marked allocated", r.name));
            }
        }
        for seg in &r.record.segments {
            for p in seg.pageid..seg.pageid + seg.pagecount as u64 {
                if !bitmap.is_allocated(header, p) {
                    problems.push(format!("entry '{}' segment page {p} is not marked allocated", r.name));
                }
            }
        }
        if r.name != "/" {
            let parent_path = parent_of(&r.name);
            if !unfs_child_of(&r.name, parent_path) {
                problems.push(format!("entry '{}' is not an immediate child of '{parent_path}'", r.name));
            } else if !disk_nodes.iter().any(|n| n.read().name == parent_path) {
                problems.push(format!("entry '{}' has no parent entry '{parent_path}'", r.name));
            }
        }
        if r.record.isdir {
            let child_count = disk_nodes.iter().filter(|n| parent_of(&n.read().name) == r.name && n.read().name != r.name).count();
            if r.record.size != child_count as u64 {
                problems.push(format!(
                    "directory '{}' size {} does not match live child count {child_count}",
                    r.name, r.record.size
                ));
            }
        }
    }

    for problem in &problems {
        log::warn!("unfs check: {problem}");
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(UnfsError::invalid_argument(format!("{} consistency problems found", problems.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitmap::Header as BHeader;
    use crate::device::FileBackend;
    use crate::layout::PAGE_SIZE;
    use crate::node::NodeRecord;

    #[test]
    fn freshly_formatted_device_is_consistent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let backend = FileBackend::open(&path, 64).unwrap();
        let mut header = BHeader::new_formatted("t", 64, PAGE_SIZE as u32, 64);
        let mut bitmap = Bitmap::new_zeroed(header.bitmapwords);
        let ctx = backend.ioc_alloc().unwrap();
        let record = NodeRecord { pageid: 0, parentid: 0, size: 0, isdir: true, segments: vec![] };
        let root = crate::nodestore::create_entry(&backend, ctx, &mut header, &mut bitmap, record, "/".into()).unwrap();
        {
            let mut w = root.write();
            w.record.parentid = w.record.pageid;
        }
        crate::nodestore::sync_node(&backend, ctx, &root).unwrap();

        let mut index = NameIndex::new();
        index.insert("/".into(), root);
        check(&backend, &header, &bitmap, &index).unwrap();
    }

    #[test]
    fn missing_bitmap_bit_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let backend = FileBackend::open(&path, 64).unwrap();
        let mut header = BHeader::new_formatted("t", 64, PAGE_SIZE as u32, 64);
        let mut bitmap = Bitmap::new_zeroed(header.bitmapwords);
        let ctx = backend.ioc_alloc().unwrap();
        let record = NodeRecord { pageid: 0, parentid: 0, size: 0, isdir: true, segments: vec![] };
        let root = crate::nodestore::create_entry(&backend, ctx, &mut header, &mut bitmap, record, "/".into()).unwrap();
        {
            let mut w = root.write();
            w.record.parentid = w.record.pageid;
        }
        crate::nodestore::sync_node(&backend, ctx, &root).unwrap();

        // corrupt: clear the root's slot bits without telling the header
        let slot = root.slot();
        bitmap.corrupt_clear_for_test(&header, slot, FILEPC);

        let mut index = NameIndex::new();
        index.insert("/".into(), root);
        assert!(check(&backend, &header, &bitmap, &index).is_err());
    }
}
