//! Host-provided stream devices, addressed as `scheme://path`.
//!
//! The engine ships no concrete device. Hosts register one per scheme and
//! both `include` and host functions reach it through [`DeviceTable`].

use std::collections::HashMap;
use std::io::{self, SeekFrom};

use bitflags::bitflags;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenMode: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const APPEND = 1 << 2;
        const CREATE = 1 << 3;
        const TRUNCATE = 1 << 4;
    }
}

/// Device-assigned stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamHandle(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamStat {
    pub size: u64,
    pub is_dir: bool,
    /// Seconds since the Unix epoch, when the device knows it.
    pub modified: Option<u64>,
}

pub trait StreamDevice {
    /// Scheme this device answers for, without `://`.
    fn scheme(&self) -> &str;
    fn open(&mut self, path: &str, mode: OpenMode) -> io::Result<StreamHandle>;
    fn read(&mut self, handle: StreamHandle, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, handle: StreamHandle, data: &[u8]) -> io::Result<usize>;
    fn seek(&mut self, handle: StreamHandle, pos: SeekFrom) -> io::Result<u64>;
    fn stat(&mut self, path: &str) -> io::Result<StreamStat>;
    fn close(&mut self, handle: StreamHandle) -> io::Result<()>;
}

/// Splits `scheme://rest`. Plain paths have no scheme.
pub fn split_scheme(path: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = path.split_once("://")?;
    let valid = !scheme.is_empty()
        && scheme.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some((scheme, rest))
}

#[derive(Default)]
pub struct DeviceTable {
    devices: HashMap<String, Box<dyn StreamDevice>>,
}

impl DeviceTable {
    /// Registers a device, replacing any previous one for its scheme.
    pub fn register(&mut self, device: Box<dyn StreamDevice>) {
        self.devices.insert(device.scheme().to_ascii_lowercase(), device);
    }

    pub fn get(&mut self, scheme: &str) -> Option<&mut (dyn StreamDevice + 'static)> {
        match self.devices.get_mut(&scheme.to_ascii_lowercase()) {
            Some(device) => Some(device.as_mut()),
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Reads a whole `scheme://path` through its device. `None` when the
    /// path has no scheme or no device is registered for it.
    pub fn read_to_string(&mut self, path: &str) -> Option<io::Result<String>> {
        let (scheme, rest) = split_scheme(path)?;
        let device = self.get(scheme)?;
        Some(read_all(device, rest))
    }
}

fn read_all(device: &mut dyn StreamDevice, path: &str) -> io::Result<String> {
    let handle = device.open(path, OpenMode::READ)?;
    let mut bytes = Vec::new();
    let mut buf = [0u8; 4096];
    let outcome = loop {
        match device.read(handle, &mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => bytes.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => break Err(e),
        }
    };
    device.close(handle)?;
    outcome?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// In-memory device serving fixed files, for tests.
    pub(crate) struct MemoryDevice {
        pub files: HashMap<String, Vec<u8>>,
        open: HashMap<u64, (String, usize)>,
        next: u64,
    }

    impl MemoryDevice {
        pub(crate) fn new(files: &[(&str, &str)]) -> Self {
            MemoryDevice {
                files: files.iter().map(|(k, v)| (k.to_string(), v.as_bytes().to_vec())).collect(),
                open: HashMap::new(),
                next: 1,
            }
        }
    }

    impl StreamDevice for MemoryDevice {
        fn scheme(&self) -> &str {
            "mem"
        }

        fn open(&mut self, path: &str, mode: OpenMode) -> io::Result<StreamHandle> {
            if !self.files.contains_key(path) {
                if !mode.contains(OpenMode::CREATE) {
                    return Err(io::Error::from(io::ErrorKind::NotFound));
                }
                self.files.insert(path.to_string(), Vec::new());
            }
            if mode.contains(OpenMode::TRUNCATE) {
                self.files.insert(path.to_string(), Vec::new());
            }
            let id = self.next;
            self.next += 1;
            let pos = if mode.contains(OpenMode::APPEND) { self.files[path].len() } else { 0 };
            self.open.insert(id, (path.to_string(), pos));
            Ok(StreamHandle(id))
        }

        fn read(&mut self, handle: StreamHandle, buf: &mut [u8]) -> io::Result<usize> {
            let (path, pos) = self.open.get_mut(&handle.0).ok_or(io::ErrorKind::InvalidInput)?;
            let data = &self.files[path.as_str()];
            let n = buf.len().min(data.len().saturating_sub(*pos));
            buf[..n].copy_from_slice(&data[*pos..*pos + n]);
            *pos += n;
            Ok(n)
        }

        fn write(&mut self, handle: StreamHandle, data: &[u8]) -> io::Result<usize> {
            let (path, pos) = self.open.get_mut(&handle.0).ok_or(io::ErrorKind::InvalidInput)?;
            let file = self.files.entry(path.clone()).or_default();
            file.truncate(*pos);
            file.extend_from_slice(data);
            *pos += data.len();
            Ok(data.len())
        }

        fn seek(&mut self, handle: StreamHandle, pos: SeekFrom) -> io::Result<u64> {
            let (_, at) = self.open.get_mut(&handle.0).ok_or(io::ErrorKind::InvalidInput)?;
            if let SeekFrom::Start(n) = pos {
                *at = n as usize;
            }
            Ok(*at as u64)
        }

        fn stat(&mut self, path: &str) -> io::Result<StreamStat> {
            let data = self.files.get(path).ok_or(io::ErrorKind::NotFound)?;
            Ok(StreamStat { size: data.len() as u64, ..StreamStat::default() })
        }

        fn close(&mut self, handle: StreamHandle) -> io::Result<()> {
            self.open.remove(&handle.0);
            Ok(())
        }
    }

    #[test]
    fn scheme_split() {
        assert_eq!(split_scheme("mem://a/b.emb"), Some(("mem", "a/b.emb")));
        assert_eq!(split_scheme("lib/a.emb"), None);
        assert_eq!(split_scheme("://x"), None);
        assert_eq!(split_scheme("c:/x://y"), None);
    }

    #[test]
    fn reads_through_registered_device() {
        let mut table = DeviceTable::default();
        table.register(Box::new(MemoryDevice::new(&[("greet.emb", "print 'hi';")])));
        assert_eq!(table.len(), 1);
        assert_eq!(table.read_to_string("MEM://greet.emb").unwrap().unwrap(), "print 'hi';");
        let missing = table.read_to_string("mem://nope").unwrap().unwrap_err();
        assert_eq!(missing.kind(), io::ErrorKind::NotFound);
        assert!(table.read_to_string("ftp://greet.emb").is_none());
    }

    #[test]
    fn open_modes_combine() {
        let mode = OpenMode::WRITE | OpenMode::CREATE;
        assert!(mode.contains(OpenMode::CREATE));
        assert!(!mode.contains(OpenMode::READ));
    }
}
