//! Shared scenario-test helpers: a tempdir-backed device that cleans itself up on drop, plus a
//! post-mutation invariant check reused after every call.

use std::sync::Arc;

use unfs::Filesystem;

pub struct TestDevice {
    _dir: tempfile::TempDir,
    pub path: std::path::PathBuf,
}

impl TestDevice {
    pub fn new(pages: u64) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("unfs.img");
        {
            let file = std::fs::File::create(&path).unwrap();
            file.set_len(pages * unfs::PAGE_SIZE as u64).unwrap();
        }
        TestDevice { _dir: dir, path }
    }

    pub fn path_str(&self) -> &str {
        self.path.to_str().unwrap()
    }
}

/// Formats a fresh `pages`-page device and mounts it.
pub fn format_fresh(pages: u64) -> (TestDevice, Arc<Filesystem>) {
    let dev = TestDevice::new(pages);
    let fs = Filesystem::format(dev.path_str(), "test").expect("format");
    (dev, fs)
}

/// Re-derives every testable consistency property via `check()`. Scenario tests call this after
/// every mutating façade call rather than asserting everything once at the end.
pub fn assert_consistent(fs: &Filesystem) {
    fs.check().expect("filesystem must remain internally consistent");
}
