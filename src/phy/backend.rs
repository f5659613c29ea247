//! Filesystem access behind the device registry.
//!
//! The registry talks to devices through the [`DeviceBackend`] trait so the
//! reconciliation and event plumbing can be exercised against an in-memory
//! backend in tests. The real implementation maps a PHY name onto the kernel
//! debugfs layout: rate-control files live under `<root>/<phy>/rc/`, generic
//! debug files directly under `<root>/<phy>/`.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;

use tokio::io::AsyncRead;

/// Default debugfs root for wireless PHY devices.
pub const DEFAULT_DEVICE_ROOT: &str = "/sys/kernel/debug/ieee80211";

/// Byte-oriented reader for a device's event stream.
pub type EventStream = Box<dyn AsyncRead + Send + Unpin>;

/// Access to the per-device control, event, info and debug files.
///
/// All methods take the PHY name; path construction is an implementation
/// detail. Implementations must not cache open handles, the registry owns
/// handle lifetime.
pub trait DeviceBackend: Send + Sync {
    /// Enumerates candidate device names, in stable discovery order.
    fn enumerate(&self) -> io::Result<Vec<String>>;

    /// Opens the write-only control channel of a device.
    fn open_control(&self, phy: &str) -> io::Result<File>;

    /// Opens the read-only event stream of a device.
    fn open_event(&self, phy: &str) -> io::Result<EventStream>;

    /// Reads the device's full state snapshot, used for initial dumps.
    fn read_info(&self, phy: &str) -> io::Result<String>;

    /// Reads a debug file to end-of-file.
    fn debug_read(&self, phy: &str, file: &str) -> io::Result<String>;

    /// Writes a value to a debug file.
    fn debug_write(&self, phy: &str, file: &str, value: &str) -> io::Result<()>;
}

/// Debugfs-backed implementation of [`DeviceBackend`].
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn rc_path(&self, phy: &str, file: &str) -> PathBuf {
        self.root.join(phy).join("rc").join(file)
    }

    fn debug_path(&self, phy: &str, file: &str) -> PathBuf {
        self.root.join(phy).join(file)
    }
}

impl DeviceBackend for FsBackend {
    fn enumerate(&self) -> io::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_owned());
            }
        }
        // read_dir order is filesystem dependent; sort for a stable
        // discovery order across scans
        names.sort();
        Ok(names)
    }

    fn open_control(&self, phy: &str) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .open(self.rc_path(phy, "api_control"))
    }

    fn open_event(&self, phy: &str) -> io::Result<EventStream> {
        let file = File::open(self.rc_path(phy, "api_event"))?;
        Ok(Box::new(tokio::fs::File::from_std(file)))
    }

    fn read_info(&self, phy: &str) -> io::Result<String> {
        std::fs::read_to_string(self.rc_path(phy, "api_info"))
    }

    fn debug_read(&self, phy: &str, file: &str) -> io::Result<String> {
        std::fs::read_to_string(self.debug_path(phy, file))
    }

    fn debug_write(&self, phy: &str, file: &str, value: &str) -> io::Result<()> {
        use std::io::Write;

        let mut f = OpenOptions::new()
            .write(true)
            .open(self.debug_path(phy, file))?;
        write_retrying(&mut f, value.as_bytes())
    }
}

/// Writes `data`, retrying on interrupt and would-block, surfacing any other
/// failure. Control and debug files consume a command in one write, so no
/// partial-write bookkeeping is done here.
pub fn write_retrying(file: &mut File, data: &[u8]) -> io::Result<()> {
    use std::io::Write;

    loop {
        match file.write(data) {
            Ok(_) => return Ok(()),
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                ) =>
            {
                continue
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend_with_phy(name: &str) -> (tempfile::TempDir, FsBackend) {
        let dir = tempfile::tempdir().unwrap();
        let rc = dir.path().join(name).join("rc");
        std::fs::create_dir_all(&rc).unwrap();
        std::fs::write(rc.join("api_control"), b"").unwrap();
        std::fs::write(rc.join("api_event"), b"").unwrap();
        std::fs::write(rc.join("api_info"), b"#version;1\ngroup;0;rates\n").unwrap();
        let backend = FsBackend::new(dir.path());
        (dir, backend)
    }

    #[test]
    fn enumerates_device_directories() {
        let (dir, backend) = backend_with_phy("phy1");
        std::fs::create_dir_all(dir.path().join("phy0").join("rc")).unwrap();
        std::fs::write(dir.path().join("stray"), b"not a dir").unwrap();

        assert_eq!(backend.enumerate().unwrap(), vec!["phy0", "phy1"]);
    }

    #[test]
    fn reads_info_snapshot() {
        let (_dir, backend) = backend_with_phy("phy0");
        let info = backend.read_info("phy0").unwrap();
        assert!(info.starts_with("#version;1\n"));
    }

    #[test]
    fn missing_device_files_error_out() {
        let (_dir, backend) = backend_with_phy("phy0");
        assert!(backend.open_control("phy9").is_err());
        assert!(backend.open_event("phy9").is_err());
    }
}
