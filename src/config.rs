//! Environment-variable configuration surface.
//!
//! Shaped like `mdbutil::config::Config` (a plain struct with a parse entry point) but without
//! forced CLI parsing: UNFS's own command-line front-ends are out of scope for this crate, so
//! it only needs a constructor an in-process caller or its own binary can use.

use crate::error::{UnfsError, UnfsResult};

const ENV_DEVICE: &str = "DEVICE";
const ENV_NSID: &str = "NSID";
const ENV_QCOUNT: &str = "QCOUNT";
const ENV_QDEPTH: &str = "QDEPTH";
const ENV_IOMEMPC: &str = "IOMEMPC";
const ENV_QPAC: &str = "QPAC";

const DEFAULT_NSID: u32 = 1;
const DEFAULT_QCOUNT: u32 = 1;
const DEFAULT_QDEPTH: u32 = 128;
const DEFAULT_IO_MEM_PAGES: u32 = 32;

/// Backend selection and sizing knobs.
#[derive(Debug, Clone)]
pub struct Config {
    /// Device selector: a `/dev/...` path or a `XX:XX.X` PCI address.
    pub device: String,
    /// Namespace id for the user-driver backend.
    pub nsid: u32,
    /// Backend queue count.
    pub qcount: u32,
    /// Backend queue depth.
    pub qdepth: u32,
    /// Per-context scratch pages (`IOMEMPC` / `QPAC`).
    pub io_mem_pages: u32,
}

impl Config {
    /// Builds a config for `device` using the stated defaults, without touching the
    /// environment. Used by in-process callers (including tests) that already know the device.
    pub fn new(device: impl Into<String>) -> Self {
        Config {
            device: device.into(),
            nsid: DEFAULT_NSID,
            qcount: DEFAULT_QCOUNT,
            qdepth: DEFAULT_QDEPTH,
            io_mem_pages: DEFAULT_IO_MEM_PAGES,
        }
    }

    /// Reads configuration from environment variables. `DEVICE` is mandatory.
    pub fn from_env() -> UnfsResult<Self> {
        let device = std::env::var(ENV_DEVICE).map_err(|_| {
            UnfsError::invalid_argument(format!("{ENV_DEVICE} environment variable not set"))
        })?;
        let mut config = Config::new(device);
        config.nsid = env_u32(ENV_NSID).unwrap_or(config.nsid);
        config.qcount = env_u32(ENV_QCOUNT).unwrap_or(config.qcount);
        config.qdepth = env_u32(ENV_QDEPTH).unwrap_or(config.qdepth);
        config.io_mem_pages = env_u32(ENV_IOMEMPC)
            .or_else(|| env_u32(ENV_QPAC))
            .unwrap_or(config.io_mem_pages);
        Ok(config)
    }
}

fn env_u32(name: &str) -> Option<u32> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_applies_defaults() {
        let config = Config::new("/dev/nvme0");
        assert_eq!(config.nsid, DEFAULT_NSID);
        assert_eq!(config.qdepth, DEFAULT_QDEPTH);
        assert_eq!(config.io_mem_pages, DEFAULT_IO_MEM_PAGES);
    }
}
