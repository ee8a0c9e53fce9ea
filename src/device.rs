//! Device I/O contract.
//!
//! This is the one genuinely external collaborator this crate has an in-scope dependency on:
//! a user-space NVMe polling driver or a raw direct-I/O file. Grounded directly on
//! `storage::disk::DiskManager`'s `read_page`/`write_page` (positioned reads/writes over a
//! plain `File`, no page cache), generalized from DiskManager's fixed single-page,
//! monotonic-allocator shape to a page-range, multi-context shape.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Mutex;

use crate::error::{UnfsError, UnfsResult};
use crate::layout::PAGE_SIZE;

/// An opaque token bound to a backend queue and its scratch buffer (glossary: I/O context).
pub type IoContext = usize;

/// A DMA-capable (here: plain heap) buffer sized for up to some number of pages.
pub struct PageBuffer {
    bytes: Vec<u8>,
    page_count: u32,
}

impl PageBuffer {
    fn new(page_count: u32) -> Self {
        PageBuffer {
            bytes: vec![0u8; page_count as usize * PAGE_SIZE],
            page_count,
        }
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn page(&self, index: u32) -> &[u8] {
        let start = index as usize * PAGE_SIZE;
        &self.bytes[start..start + PAGE_SIZE]
    }

    pub fn page_mut(&mut self, index: u32) -> &mut [u8] {
        let start = index as usize * PAGE_SIZE;
        &mut self.bytes[start..start + PAGE_SIZE]
    }
}

/// The Device I/O contract : page-granular read/write, buffer allocation bound to
/// an I/O context, and context allocation for concurrent issue.
pub trait DeviceBackend: Send + Sync {
    /// Total pages addressable on this device, derived from its raw size.
    fn page_count(&self) -> u64;

    /// Allocates a concurrency token (queue/channel index).
    fn ioc_alloc(&self) -> UnfsResult<IoContext>;

    /// Releases a concurrency token.
    fn ioc_free(&self, ctx: IoContext);

    /// Returns a scratch buffer for up to `page_count` pages, bound to `ctx`. At most one
    /// outstanding allocation per context ("Shared resources").
    fn page_alloc(&self, ctx: IoContext, page_count: u32) -> UnfsResult<PageBuffer>;

    /// Releases a buffer obtained from `page_alloc`.
    fn page_free(&self, ctx: IoContext, buf: PageBuffer);

    /// Synchronous page-aligned read of `page_count` pages starting at `page_addr` into `buf`.
    fn read(&self, ctx: IoContext, buf: &mut PageBuffer, page_addr: u64, page_count: u32)
    -> UnfsResult<()>;

    /// Synchronous page-aligned write of `page_count` pages starting at `page_addr` from `buf`.
    fn write(&self, ctx: IoContext, buf: &PageBuffer, page_addr: u64, page_count: u32)
    -> UnfsResult<()>;

    /// Releases all backend resources.
    fn close(&self);
}

/// Raw direct-I/O-shaped backend over a regular file, using positioned reads/writes and no
/// page cache — grounded on `storage::disk::DiskManager::{read_page,write_page}`.
pub struct FileBackend {
    file: File,
    page_count: u64,
    contexts: Mutex<Vec<bool>>,
}

impl FileBackend {
    /// Opens (creating if absent) `path` as a raw page-addressable backend. The file is grown
    /// to `min_pages` pages if smaller, matching `format`'s need for a backing store before a
    /// header exists.
    pub fn open(path: impl AsRef<Path>, min_pages: u64) -> UnfsResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let min_len = min_pages * PAGE_SIZE as u64;
        let current_len = file.metadata()?.len();
        if current_len < min_len {
            file.set_len(min_len)?;
        }
        let page_count = file.metadata()?.len() / PAGE_SIZE as u64;
        Ok(FileBackend {
            file,
            page_count,
            contexts: Mutex::new(Vec::new()),
        })
    }

    fn check_range(&self, page_addr: u64, page_count: u32) -> UnfsResult<()> {
        let end = page_addr
            .checked_add(page_count as u64)
            .ok_or_else(|| UnfsError::invalid_argument("page range overflow"))?;
        if end > self.page_count {
            return Err(UnfsError::invalid_argument(format!(
                "page range [{page_addr}, {end}) exceeds device page count {}",
                self.page_count
            )));
        }
        Ok(())
    }
}

impl DeviceBackend for FileBackend {
    fn page_count(&self) -> u64 {
        self.page_count
    }

    fn ioc_alloc(&self) -> UnfsResult<IoContext> {
        let mut contexts = self.contexts.lock().unwrap();
        if let Some(idx) = contexts.iter().position(|busy| !busy) {
            contexts[idx] = true;
            return Ok(idx);
        }
        contexts.push(true);
        Ok(contexts.len() - 1)
    }

    fn ioc_free(&self, ctx: IoContext) {
        let mut contexts = self.contexts.lock().unwrap();
        if let Some(busy) = contexts.get_mut(ctx) {
            *busy = false;
        }
    }

    fn page_alloc(&self, _ctx: IoContext, page_count: u32) -> UnfsResult<PageBuffer> {
        Ok(PageBuffer::new(page_count))
    }

    fn page_free(&self, _ctx: IoContext, _buf: PageBuffer) {}

    fn read(
        &self,
        _ctx: IoContext,
        buf: &mut PageBuffer,
        page_addr: u64,
        page_count: u32,
    ) -> UnfsResult<()> {
        self.check_range(page_addr, page_count)?;
        if buf.page_count() < page_count {
            return Err(UnfsError::invalid_argument("page buffer too small for read"));
        }
        let offset = page_addr * PAGE_SIZE as u64;
        let len = page_count as usize * PAGE_SIZE;
        let n = self.file.read_at(&mut buf.as_mut_slice()[..len], offset)?;
        if n != len {
            return Err(UnfsError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("short read: got {n} of {len} bytes at page {page_addr}"),
            )));
        }
        Ok(())
    }

    fn write(
        &self,
        _ctx: IoContext,
        buf: &PageBuffer,
        page_addr: u64,
        page_count: u32,
    ) -> UnfsResult<()> {
        self.check_range(page_addr, page_count)?;
        if buf.page_count() < page_count {
            return Err(UnfsError::invalid_argument("page buffer too small for write"));
        }
        let offset = page_addr * PAGE_SIZE as u64;
        let len = page_count as usize * PAGE_SIZE;
        let n = self.file.write_at(&buf.as_slice()[..len], offset)?;
        if n != len {
            return Err(UnfsError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("short write: wrote {n} of {len} bytes at page {page_addr}"),
            )));
        }
        Ok(())
    }

    fn close(&self) {
        let _ = self.file.sync_all();
    }
}

/// Selects a backend from a device name: a numeric `XX:XX.X` PCI address routes to the polled
/// user-space NVMe backend — out of scope here, this crate never fabricates a hardware driver
/// for it — while a `/dev/...` path or a plain file path routes to [`FileBackend`].
pub fn open(device: &str, min_pages: u64) -> UnfsResult<Box<dyn DeviceBackend>> {
    if is_pci_address(device) {
        return Err(UnfsError::Io(std::io::Error::other(format!(
            "no polled NVMe backend compiled in for PCI device {device}; \
             the user-space NVMe driver is an external collaborator "
        ))));
    }
    Ok(Box::new(FileBackend::open(device, min_pages)?))
}

fn is_pci_address(device: &str) -> bool {
    let parts: Vec<&str> = device.split(':').collect();
    if parts.len() != 2 {
        return false;
    }
    let func_parts: Vec<&str> = parts[1].split('.').collect();
    if func_parts.len() != 2 {
        return false;
    }
    parts[0].len() == 2
        && u8::from_str_radix(parts[0], 16).is_ok()
        && u8::from_str_radix(func_parts[0], 16).is_ok()
        && func_parts[1].parse::<u8>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pci_address_detection() {
        assert!(is_pci_address("01:00.0"));
        assert!(!is_pci_address("/dev/nvme0n1"));
        assert!(!is_pci_address("test.img"));
    }

    #[test]
    fn file_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let backend = FileBackend::open(&path, 16).unwrap();
        assert_eq!(backend.page_count(), 16);

        let ctx = backend.ioc_alloc().unwrap();
        let mut buf = backend.page_alloc(ctx, 1).unwrap();
        buf.as_mut_slice().fill(0xAB);
        backend.write(ctx, &buf, 3, 1).unwrap();

        let mut readback = backend.page_alloc(ctx, 1).unwrap();
        backend.read(ctx, &mut readback, 3, 1).unwrap();
        assert_eq!(readback.as_slice(), buf.as_slice());
        backend.ioc_free(ctx);
    }

    #[test]
    fn read_past_end_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        let backend = FileBackend::open(&path, 4).unwrap();
        let ctx = backend.ioc_alloc().unwrap();
        let mut buf = backend.page_alloc(ctx, 1).unwrap();
        assert!(backend.read(ctx, &mut buf, 10, 1).is_err());
    }
}
