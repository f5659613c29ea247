//! Device registry for rate-control capable PHYs.
//!
//! Discovers devices by periodic scan, reconciles the discovered name set
//! against the registered set and owns every device's control and event
//! handles. Devices are keyed by their unique name; all other components
//! refer to a device by name only.

pub mod backend;
pub mod debugfs;
pub mod events;

use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::daemon::CoreEvent;
use backend::DeviceBackend;

/// Errors answered to the originating client as a `#error` record.
///
/// The display strings are part of the client protocol.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("Syntax error")]
    Syntax,

    #[error("PHY not found")]
    PhyNotFound,

    #[error("Invalid argument")]
    InvalidDebugFile,

    #[error("{0}")]
    Io(#[from] io::Error),
}

/// A registered device: open control handle plus the cancellation token of
/// its event reader task.
struct Phy {
    name: String,
    control: File,
    reader_cancel: CancellationToken,
}

/// Owns the device set. Mutated only from the core loop.
pub struct PhyRegistry {
    backend: Arc<dyn DeviceBackend>,
    phys: Vec<Phy>,
    events: mpsc::Sender<CoreEvent>,
    cancel: CancellationToken,
}

/// Outcome of one reconciliation pass: names to announce as added and
/// removed. A name whose identity is unchanged across scans appears in
/// neither list.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

/// Splits discovered names against the previously registered set.
pub fn diff(registered: &[String], discovered: &[String]) -> ScanChanges {
    let before: HashSet<&str> = registered.iter().map(String::as_str).collect();
    let after: HashSet<&str> = discovered.iter().map(String::as_str).collect();

    ScanChanges {
        added: discovered
            .iter()
            .filter(|name| !before.contains(name.as_str()))
            .cloned()
            .collect(),
        removed: registered
            .iter()
            .filter(|name| !after.contains(name.as_str()))
            .cloned()
            .collect(),
    }
}

impl PhyRegistry {
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        events: mpsc::Sender<CoreEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            backend,
            phys: Vec::new(),
            events,
            cancel,
        }
    }

    /// Device names in discovery order.
    pub fn names(&self) -> Vec<String> {
        self.phys.iter().map(|p| p.name.clone()).collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.phys.iter().any(|p| p.name == name)
    }

    /// Runs one discovery pass and reconciles the device set.
    ///
    /// New names get both handles opened; if either open fails the device is
    /// discarded without side effects and retried on the next pass. Names no
    /// longer discovered are torn down. The returned changes only contain
    /// devices that were actually registered or deregistered.
    pub fn scan(&mut self) -> ScanChanges {
        let discovered = match self.backend.enumerate() {
            Ok(names) => names,
            Err(e) => {
                warn!("device scan failed: {e}");
                Vec::new()
            }
        };

        let changes = diff(&self.names(), &discovered);
        let mut registered = ScanChanges::default();

        for name in &changes.removed {
            self.teardown(name);
            registered.removed.push(name.clone());
        }

        for name in &changes.added {
            if self.add(name) {
                registered.added.push(name.clone());
            }
        }

        registered
    }

    fn add(&mut self, name: &str) -> bool {
        let control = match self.backend.open_control(name) {
            Ok(f) => f,
            Err(_) => return false,
        };
        let event = match self.backend.open_event(name) {
            Ok(s) => s,
            Err(_) => return false,
        };

        let reader_cancel = self.cancel.child_token();
        tokio::spawn(events::run_event_reader(
            name.to_owned(),
            event,
            self.events.clone(),
            reader_cancel.clone(),
        ));

        info!("registered device {name}");
        self.phys.push(Phy {
            name: name.to_owned(),
            control,
            reader_cancel,
        });
        true
    }

    /// Removes a device, cancelling its event reader before the handles are
    /// dropped. Returns false when the name is not registered (e.g. a hangup
    /// racing a scan removal).
    pub fn teardown(&mut self, name: &str) -> bool {
        let Some(idx) = self.phys.iter().position(|p| p.name == name) else {
            return false;
        };
        let phy = self.phys.remove(idx);
        phy.reader_cancel.cancel();
        info!("removed device {name}");
        debug!("{} devices remain", self.phys.len());
        true
    }

    /// Returns the device's state snapshot line by line; a device whose info
    /// source cannot be opened dumps nothing.
    pub fn dump(&self, name: &str) -> Vec<String> {
        match self.backend.read_info(name) {
            Ok(info) => info.lines().map(str::to_owned).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Writes raw command bytes to the device's control handle.
    pub fn control(&mut self, name: &str, command: &str) -> Result<(), ControlError> {
        let phy = self
            .phys
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or(ControlError::PhyNotFound)?;
        backend::write_retrying(&mut phy.control, command.as_bytes())?;
        Ok(())
    }

    /// Constrained debug-file passthrough; see [`debugfs`].
    pub fn debug_access(
        &self,
        name: &str,
        file: &str,
        value: Option<&str>,
    ) -> Result<Option<String>, ControlError> {
        if !self.contains(name) {
            return Err(ControlError::PhyNotFound);
        }
        debugfs::access(&self.backend, name, file, value)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory device backend. Event streams stay open until the test
    /// drops the paired write half.
    pub(crate) struct MockBackend {
        pub names: Mutex<Vec<String>>,
        pub broken: Mutex<HashSet<String>>,
        pub info: Mutex<HashMap<String, String>>,
        pub debug_files: Mutex<HashMap<(String, String), String>>,
        event_peers: Mutex<Vec<tokio::io::DuplexStream>>,
    }

    impl MockBackend {
        pub fn with_names(names: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                names: Mutex::new(names.iter().map(|s| s.to_string()).collect()),
                broken: Mutex::new(HashSet::new()),
                info: Mutex::new(HashMap::new()),
                debug_files: Mutex::new(HashMap::new()),
                event_peers: Mutex::new(Vec::new()),
            })
        }

        pub fn set_names(&self, names: &[&str]) {
            *self.names.lock().unwrap() = names.iter().map(|s| s.to_string()).collect();
        }
    }

    impl DeviceBackend for MockBackend {
        fn enumerate(&self) -> io::Result<Vec<String>> {
            Ok(self.names.lock().unwrap().clone())
        }

        fn open_control(&self, phy: &str) -> io::Result<File> {
            if self.broken.lock().unwrap().contains(phy) {
                return Err(io::Error::from(io::ErrorKind::NotFound));
            }
            // command bytes end up in the void, which is all these tests need
            tempfile::tempfile()
        }

        fn open_event(&self, phy: &str) -> io::Result<backend::EventStream> {
            if self.broken.lock().unwrap().contains(phy) {
                return Err(io::Error::from(io::ErrorKind::NotFound));
            }
            let (reader, writer) = tokio::io::duplex(1024);
            self.event_peers.lock().unwrap().push(writer);
            Ok(Box::new(reader))
        }

        fn read_info(&self, phy: &str) -> io::Result<String> {
            self.info
                .lock()
                .unwrap()
                .get(phy)
                .cloned()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }

        fn debug_read(&self, phy: &str, file: &str) -> io::Result<String> {
            self.debug_files
                .lock()
                .unwrap()
                .get(&(phy.to_owned(), file.to_owned()))
                .cloned()
                .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
        }

        fn debug_write(&self, phy: &str, file: &str, value: &str) -> io::Result<()> {
            self.debug_files
                .lock()
                .unwrap()
                .insert((phy.to_owned(), file.to_owned()), value.to_owned());
            Ok(())
        }
    }

    fn registry(backend: Arc<MockBackend>) -> (PhyRegistry, mpsc::Receiver<CoreEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (PhyRegistry::new(backend, tx, CancellationToken::new()), rx)
    }

    #[test]
    fn diff_is_the_symmetric_difference() {
        let before = vec!["phy0".to_string(), "phy1".to_string()];
        let after = vec!["phy1".to_string(), "phy2".to_string()];
        let changes = diff(&before, &after);
        assert_eq!(changes.added, vec!["phy2"]);
        assert_eq!(changes.removed, vec!["phy0"]);
    }

    #[test]
    fn diff_of_identical_sets_is_empty() {
        let names = vec!["phy0".to_string()];
        assert_eq!(diff(&names, &names), ScanChanges::default());
    }

    #[tokio::test]
    async fn scan_announces_adds_once_and_removes_once() {
        let backend = MockBackend::with_names(&["phy0", "phy1"]);
        let (mut reg, _rx) = registry(backend.clone());

        let first = reg.scan();
        assert_eq!(first.added, vec!["phy0", "phy1"]);
        assert!(first.removed.is_empty());

        // unchanged set: no events at all
        assert_eq!(reg.scan(), ScanChanges::default());

        backend.set_names(&["phy1"]);
        let third = reg.scan();
        assert!(third.added.is_empty());
        assert_eq!(third.removed, vec!["phy0"]);
        assert_eq!(reg.names(), vec!["phy1"]);
    }

    #[tokio::test]
    async fn failed_open_discards_device_without_announcement() {
        let backend = MockBackend::with_names(&["phy0", "phy1"]);
        backend.broken.lock().unwrap().insert("phy0".to_string());
        let (mut reg, _rx) = registry(backend.clone());

        let changes = reg.scan();
        assert_eq!(changes.added, vec!["phy1"]);
        assert!(!reg.contains("phy0"));

        // device comes back healthy on a later pass
        backend.broken.lock().unwrap().clear();
        let changes = reg.scan();
        assert_eq!(changes.added, vec!["phy0"]);
    }

    #[tokio::test]
    async fn control_on_unknown_device_is_not_found() {
        let backend = MockBackend::with_names(&[]);
        let (mut reg, _rx) = registry(backend);
        let err = reg.control("phy9", "rates;aa").unwrap_err();
        assert_eq!(err.to_string(), "PHY not found");
    }

    #[tokio::test]
    async fn dump_of_unreadable_info_is_empty() {
        let backend = MockBackend::with_names(&["phy0"]);
        let (mut reg, _rx) = registry(backend.clone());
        reg.scan();
        assert!(reg.dump("phy0").is_empty());

        backend
            .info
            .lock()
            .unwrap()
            .insert("phy0".to_string(), "#version;1\ngroup;0\n".to_string());
        assert_eq!(reg.dump("phy0"), vec!["#version;1", "group;0"]);
    }
}
