//! UNFS — a user-space, flat-namespace filesystem on a raw page-addressable block device.
//!
//! The crate is a library: it implements the on-disk format, the allocator, and the POSIX-like
//! operation table (`create`, `remove`, `rename`, `file_open`/`read`/`write`/`resize`, `check`,
//! ...) in-process, against a pluggable [`device::DeviceBackend`]. It does not provide a shell,
//! a `format`/`check`/`test` command-line front-end, or the user-space NVMe driver itself —
//! those are separate, out-of-scope collaborators.
pub mod bitmap;
pub mod check;
pub mod config;
pub mod device;
pub mod error;
pub mod facade;
pub mod fileengine;
pub mod layout;
pub mod nameindex;
pub mod node;
pub mod nodestore;

pub use config::Config;
pub use device::{DeviceBackend, FileBackend};
pub use error::{UnfsError, UnfsResult};
pub use facade::{FileHandle, Filesystem, OpenMode, Stat};
pub use layout::{FILEPC, HEADPC, MAXDS, PAGE_SIZE};
