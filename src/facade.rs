//! `Filesystem` and `FileHandle`: the top-level façade operations.
//!
//! Grounded on `db::engine::Engine`'s shape — one struct composing the lower-level managers,
//! `Result`-returning methods for every user-visible operation — generalized from `Engine`'s
//! `anyhow`-based application errors to `UnfsError`, since this is a library boundary rather
//! than an application. Locking follows : the filesystem-wide lock is always taken
//! before any per-node lock, never the reverse.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::bitmap::{self, Bitmap, Header};
use crate::check;
use crate::device::{self, DeviceBackend};
use crate::error::{UnfsError, UnfsResult};
use crate::fileengine;
use crate::layout::{FILEPC, HEADPC, PAGE_SIZE};
use crate::nameindex::NameIndex;
use crate::node::{Node, NodeRecord};

/// Minimum device size, in pages, this crate will format: room for the header, at least one
/// bitmap page, the root entry, and one data page.
const MIN_FORMAT_PAGES: u64 = HEADPC + 1 + FILEPC + 1;

struct FsState {
    header: Header,
    bitmap: Bitmap,
    index: NameIndex,
}

/// The mounted filesystem. One filesystem-wide lock over the header, bitmap and name index;
/// each [`Node`] carries its own lock for segment/size mutation.
pub struct Filesystem {
    device: Box<dyn DeviceBackend>,
    state: RwLock<FsState>,
}

/// Mode flags for [`Filesystem::file_open`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Fails if the file does not already exist.
    ReadOnly,
    /// Creates the file if it does not exist; opens it otherwise.
    Create,
    /// Creates the file; fails if it already exists.
    CreateExclusive,
}

/// An open file : read/write/resize/checksum, a stat snapshot and a close.
pub struct FileHandle {
    fs: Arc<Filesystem>,
    node: Arc<Node>,
}

/// A `stat`-style snapshot of a node.
#[derive(Debug, Clone)]
pub struct Stat {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

fn canonicalize(path: &str) -> UnfsResult<String> {
    if !path.starts_with('/') {
        return Err(UnfsError::invalid_argument("path must be absolute"));
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err(UnfsError::invalid_argument("path must not end with '/'"));
    }
    if path.contains("//") {
        return Err(UnfsError::invalid_argument("path must not contain empty components"));
    }
    Ok(path.to_string())
}

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

impl Filesystem {
    /// Formats `device` as a fresh `UNFS-1.0` volume and mounts it (`format`).
    pub fn format(device_name: &str, label: &str) -> UnfsResult<Arc<Filesystem>> {
        let device = device::open(device_name, MIN_FORMAT_PAGES)?;
        let pagecount = device.page_count();
        if pagecount < MIN_FORMAT_PAGES {
            return Err(UnfsError::invalid_argument("device too small to format"));
        }
        let mut header = Header::new_formatted(label, pagecount, PAGE_SIZE as u32, pagecount);
        let mut bitmap = Bitmap::new_zeroed(header.bitmapwords);

        let ctx = device.ioc_alloc()?;
        let root_record = NodeRecord { pageid: 0, parentid: 0, size: 0, isdir: true, segments: vec![] };
        let root = crate::nodestore::create_entry(
            device.as_ref(),
            ctx,
            &mut header,
            &mut bitmap,
            root_record,
            "/".to_string(),
        )?;
        header.dircount = 1;
        // root is its own parent
        {
            let mut w = root.write();
            w.record.parentid = w.record.pageid;
            w.dirty = true;
        }
        crate::nodestore::sync_node(device.as_ref(), ctx, &root)?;
        bitmap::sync(device.as_ref(), ctx, &header, &mut bitmap)?;
        device.ioc_free(ctx);

        let mut index = NameIndex::new();
        index.insert("/".to_string(), root);
        Ok(Arc::new(Filesystem { device, state: RwLock::new(FsState { header, bitmap, index }) }))
    }

    /// Opens an already-formatted `device` (`open`): reads the header and bitmap,
    /// then scans the entry region to rebuild the in-memory name index.
    pub fn open(device_name: &str) -> UnfsResult<Arc<Filesystem>> {
        let device = device::open(device_name, 0)?;
        let ctx = device.ioc_alloc()?;
        let (header, bitmap) = bitmap::load(device.as_ref(), ctx)?;
        let nodes = crate::nodestore::scan_all(device.as_ref(), ctx, &header)?;
        device.ioc_free(ctx);

        let mut index = NameIndex::new();
        for node in nodes {
            let path = node.read().name.clone();
            index.insert(path, node);
        }
        Ok(Arc::new(Filesystem { device, state: RwLock::new(FsState { header, bitmap, index }) }))
    }

    /// Flushes the header and any dirty bitmap words (`sync`). Dirty nodes are synced
    /// individually as they are mutated, not batched here.
    pub fn sync(&self) -> UnfsResult<()> {
        let mut state = self.state.write();
        let ctx = self.device.ioc_alloc()?;
        let result = bitmap::sync(self.device.as_ref(), ctx, &state.header, &mut state.bitmap);
        self.device.ioc_free(ctx);
        result
    }

    /// Re-derives every testable invariant without mutating anything (`check`).
    pub fn check(&self) -> UnfsResult<()> {
        let state = self.state.read();
        check::check(self.device.as_ref(), &state.header, &state.bitmap, &state.index)
    }

    /// Creates a directory at `path` (`create`). Idempotent: re-creating an already-existing
    /// directory succeeds. If `pflag` is set, missing intermediate directories along `path` are
    /// created first, the way `mkdir -p` does.
    pub fn create_dir(self: &Arc<Self>, path: &str, pflag: bool) -> UnfsResult<()> {
        self.create_node(path, true, pflag)?;
        Ok(())
    }

    /// Creates missing ancestor directories of `path`, innermost-last, stopping at the first
    /// ancestor that already exists.
    fn ensure_parent_dirs(self: &Arc<Self>, path: &str) -> UnfsResult<()> {
        let parent = parent_of(path);
        if parent == "/" || self.exists(parent) {
            return Ok(());
        }
        self.ensure_parent_dirs(parent)?;
        self.create_node(parent, true, false)?;
        Ok(())
    }

    fn create_node(self: &Arc<Self>, path: &str, isdir: bool, pflag: bool) -> UnfsResult<Arc<Node>> {
        let path = canonicalize(path)?;
        if pflag && path != "/" {
            self.ensure_parent_dirs(&path)?;
        }
        let parent_path = parent_of(&path).to_string();
        let mut state = self.state.write();
        if let Some(existing) = state.index.get(&path) {
            if existing.read().record.isdir == isdir {
                return Ok(existing);
            }
            return Err(UnfsError::exists(path));
        }
        let parent = state
            .index
            .get(&parent_path)
            .ok_or_else(|| UnfsError::not_found(parent_path.clone()))?;
        if !parent.read().record.isdir {
            return Err(UnfsError::invalid_argument(format!("{parent_path} is not a directory")));
        }
        let parent_slot = parent.slot();

        let ctx = self.device.ioc_alloc()?;
        let record = NodeRecord { pageid: 0, parentid: parent_slot, size: 0, isdir, segments: vec![] };
        let node = crate::nodestore::create_entry(
            self.device.as_ref(),
            ctx,
            &mut state.header,
            &mut state.bitmap,
            record,
            path.clone(),
        );
        self.device.ioc_free(ctx);
        let node = node?;
        if isdir {
            state.header.dircount += 1;
        }
        {
            let mut parent_state = parent.write();
            parent_state.record.size += 1;
            parent_state.dirty = true;
        }
        let ctx = self.device.ioc_alloc()?;
        let synced = crate::nodestore::sync_node(self.device.as_ref(), ctx, &parent);
        self.device.ioc_free(ctx);
        synced?;
        state.index.insert(path, node.clone());
        Ok(node)
    }

    /// Removes an empty file or empty directory at `path` (`remove`). `isdir` must match the
    /// entry's actual type.
    pub fn remove(&self, path: &str, isdir: bool) -> UnfsResult<()> {
        let path = canonicalize(path)?;
        if path == "/" {
            return Err(UnfsError::invalid_argument("cannot remove the root directory"));
        }
        let mut state = self.state.write();
        let node = state.index.get(&path).ok_or_else(|| UnfsError::not_found(path.clone()))?;
        if node.read().record.isdir != isdir {
            return Err(UnfsError::invalid_argument(format!(
                "{path} is {}a directory",
                if node.read().record.isdir { "" } else { "not " }
            )));
        }
        if node.read().open_count > 0 {
            return Err(UnfsError::busy(path));
        }
        if node.read().record.isdir && !state.index.children_of(&path).is_empty() {
            return Err(UnfsError::invalid_argument("directory not empty"));
        }
        self.remove_locked(&mut state, &path, &node)
    }

    /// Frees `node`'s slot and segments, drops it from `path`, and updates its parent's child
    /// count, all under an already-held write lock. Shared by [`Filesystem::remove`] and
    /// [`Filesystem::rename`]'s destination-overwrite path.
    fn remove_locked(&self, state: &mut FsState, path: &str, node: &Arc<Node>) -> UnfsResult<()> {
        let was_dir = node.read().record.isdir;
        let segments = node.read().record.segments.clone();
        let parent_path = parent_of(path).to_string();
        let parent = state.index.get(&parent_path);

        let ctx = self.device.ioc_alloc()?;
        for seg in &segments {
            state.bitmap.free_data(&mut state.header, seg.pageid, seg.pagecount as u64);
        }
        let result =
            crate::nodestore::remove_entry(self.device.as_ref(), ctx, &mut state.header, &mut state.bitmap, &state.index, node);
        self.device.ioc_free(ctx);
        result?;

        state.index.remove(path);
        if was_dir {
            state.header.dircount -= 1;
        }
        if let Some(parent) = parent {
            {
                let mut parent_state = parent.write();
                parent_state.record.size = parent_state.record.size.saturating_sub(1);
                parent_state.dirty = true;
            }
            let ctx = self.device.ioc_alloc()?;
            let synced = crate::nodestore::sync_node(self.device.as_ref(), ctx, &parent);
            self.device.ioc_free(ctx);
            synced?;
        }
        Ok(())
    }

    /// Renames `from` to `to`, moving its whole subtree if it is a directory (`rename`). If
    /// `overwrite` is set and `to` already exists, it is removed first (subject to the same
    /// busy/non-empty checks as [`Filesystem::remove`]); otherwise an existing `to` is an error.
    pub fn rename(&self, from: &str, to: &str, overwrite: bool) -> UnfsResult<()> {
        let from = canonicalize(from)?;
        let to = canonicalize(to)?;
        if from == "/" {
            return Err(UnfsError::invalid_argument("cannot rename the root directory"));
        }
        if from == to {
            return Ok(());
        }
        let mut state = self.state.write();
        if !state.index.contains(&from) {
            return Err(UnfsError::not_found(from));
        }
        if let Some(existing) = state.index.get(&to) {
            if !overwrite {
                return Err(UnfsError::exists(to));
            }
            if existing.read().open_count > 0 {
                return Err(UnfsError::busy(to));
            }
            if existing.read().record.isdir && !state.index.children_of(&to).is_empty() {
                return Err(UnfsError::invalid_argument("destination directory not empty"));
            }
            self.remove_locked(&mut state, &to, &existing)?;
        }
        let new_parent = parent_of(&to).to_string();
        let new_parent_node = state
            .index
            .get(&new_parent)
            .ok_or_else(|| UnfsError::not_found(new_parent.clone()))?;
        let new_parent_slot = new_parent_node.slot();

        let old_parent = parent_of(&from).to_string();
        let old_parent_node = state.index.get(&old_parent);

        let node = state.index.get(&from).expect("checked above");
        let is_dir = node.read().record.isdir;
        {
            let mut w = node.write();
            w.record.parentid = new_parent_slot;
            w.name = to.clone();
            w.dirty = true;
        }
        let ctx = self.device.ioc_alloc()?;
        let result = crate::nodestore::sync_node(self.device.as_ref(), ctx, &node);
        self.device.ioc_free(ctx);
        result?;

        if is_dir {
            let prefix = format!("{from}/");
            let descendants: Vec<Arc<Node>> =
                state.index.iter().filter(|(key, _)| key.starts_with(&prefix)).map(|(_, n)| n.clone()).collect();
            let ctx = self.device.ioc_alloc()?;
            for descendant in &descendants {
                let new_name = format!("{to}{}", &descendant.read().name[from.len()..]);
                {
                    let mut w = descendant.write();
                    w.name = new_name;
                    w.dirty = true;
                }
                if let Err(e) = crate::nodestore::sync_node(self.device.as_ref(), ctx, descendant) {
                    self.device.ioc_free(ctx);
                    return Err(e);
                }
            }
            self.device.ioc_free(ctx);
        }

        if old_parent != new_parent {
            {
                let mut w = new_parent_node.write();
                w.record.size += 1;
                w.dirty = true;
            }
            let ctx = self.device.ioc_alloc()?;
            let synced = crate::nodestore::sync_node(self.device.as_ref(), ctx, &new_parent_node);
            self.device.ioc_free(ctx);
            synced?;

            if let Some(old_parent_node) = old_parent_node {
                {
                    let mut w = old_parent_node.write();
                    w.record.size = w.record.size.saturating_sub(1);
                    w.dirty = true;
                }
                let ctx = self.device.ioc_alloc()?;
                let synced = crate::nodestore::sync_node(self.device.as_ref(), ctx, &old_parent_node);
                self.device.ioc_free(ctx);
                synced?;
            }
        }

        state.index.rename_subtree(&from, &to);
        Ok(())
    }

    pub fn exists(&self, path: &str) -> bool {
        match canonicalize(path) {
            Ok(p) => self.state.read().index.contains(&p),
            Err(_) => false,
        }
    }

    pub fn stat(&self, path: &str) -> UnfsResult<Stat> {
        let path = canonicalize(path)?;
        let state = self.state.read();
        let node = state.index.get(&path).ok_or_else(|| UnfsError::not_found(path.clone()))?;
        let r = node.read();
        Ok(Stat { path, is_dir: r.record.isdir, size: r.record.size })
    }

    /// Immediate children of the directory at `path`, in path order (`dir_list`).
    pub fn dir_list(&self, path: &str) -> UnfsResult<Vec<String>> {
        let path = canonicalize(path)?;
        let state = self.state.read();
        let node = state.index.get(&path).ok_or_else(|| UnfsError::not_found(path.clone()))?;
        if !node.read().record.isdir {
            return Err(UnfsError::invalid_argument(format!("{path} is not a directory")));
        }
        Ok(state.index.children_of(&path).into_iter().map(|(p, _)| p).collect())
    }

    /// Opens a file for I/O, creating it first if `mode` requests that (`file_open`).
    pub fn file_open(self: &Arc<Self>, path: &str, mode: OpenMode) -> UnfsResult<FileHandle> {
        let canon = canonicalize(path)?;
        let node = {
            let state = self.state.read();
            state.index.get(&canon)
        };
        let node = match (node, mode) {
            (Some(n), OpenMode::CreateExclusive) => return Err(UnfsError::exists(path_for_err(&n))),
            (Some(n), _) => n,
            (None, OpenMode::ReadOnly) => return Err(UnfsError::not_found(canon)),
            (None, OpenMode::Create | OpenMode::CreateExclusive) => self.create_node(&canon, false, false)?,
        };
        if node.read().record.isdir {
            return Err(UnfsError::invalid_argument(format!("{canon} is a directory")));
        }
        node.write().open_count += 1;
        Ok(FileHandle { fs: self.clone(), node })
    }
}

fn path_for_err(node: &Arc<Node>) -> String {
    node.read().name.clone()
}

impl FileHandle {
    pub fn stat(&self) -> Stat {
        let r = self.node.read();
        Stat { path: r.name.clone(), is_dir: false, size: r.record.size }
    }

    pub fn name(&self) -> String {
        self.node.read().name.clone()
    }

    pub fn resize(&self, new_size: u64) -> UnfsResult<()> {
        let mut state = self.fs.state.write();
        let current = self.node.read().record.size;
        let ctx = self.fs.device.ioc_alloc()?;
        let result = if new_size > current {
            fileengine::grow(self.fs.device.as_ref(), ctx, &mut state.header, &mut state.bitmap, &self.node, new_size)
        } else {
            fileengine::shrink(&mut state.header, &mut state.bitmap, &self.node, new_size)
        };
        let synced = result.and_then(|_| crate::nodestore::sync_node(self.fs.device.as_ref(), ctx, &self.node));
        self.fs.device.ioc_free(ctx);
        synced
    }

    pub fn read(&self, offset: u64, out: &mut [u8]) -> UnfsResult<usize> {
        let _state = self.fs.state.read();
        let ctx = self.fs.device.ioc_alloc()?;
        let result = fileengine::read(self.fs.device.as_ref(), ctx, &self.node, offset, out);
        self.fs.device.ioc_free(ctx);
        result
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> UnfsResult<()> {
        let mut state = self.fs.state.write();
        let ctx = self.fs.device.ioc_alloc()?;
        let result = fileengine::write(self.fs.device.as_ref(), ctx, &mut state.header, &mut state.bitmap, &self.node, offset, data);
        let synced = result.and_then(|_| crate::nodestore::sync_node(self.fs.device.as_ref(), ctx, &self.node));
        self.fs.device.ioc_free(ctx);
        synced
    }

    pub fn checksum(&self) -> UnfsResult<u64> {
        let _state = self.fs.state.read();
        let ctx = self.fs.device.ioc_alloc()?;
        let result = fileengine::checksum(self.fs.device.as_ref(), ctx, &self.node);
        self.fs.device.ioc_free(ctx);
        result
    }

    pub fn close(self) -> UnfsResult<()> {
        let mut w = self.node.write();
        w.open_count = w.open_count.saturating_sub(1);
        Ok(())
    }
}
