//! Local neighbor-discovery (ARP) table lookups.

use std::net::Ipv4Addr;
use std::str::FromStr;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;

/// Kernel ARP table on Linux.
pub const PROC_ARP_PATH: &str = "/proc/net/arp";

const INCOMPLETE_FLAGS: &str = "0x0";
const ZERO_HARDWARE_ADDRESS: &str = "00:00:00:00:00:00";

/// Errors raised while reading the neighbor table.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum NeighborError {
    /// The table could not be read.
    #[error("failed to read neighbor table {path}: {message}")]
    Io {
        /// Table location.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
}

/// Source of address-to-hardware-address mappings.
pub trait NeighborTable: Send + Sync {
    /// Returns the hardware address text recorded for `address`, or `None`
    /// when the table has no complete entry.
    ///
    /// # Errors
    ///
    /// Returns [`NeighborError`] when the table itself cannot be read.
    fn lookup(&self, address: Ipv4Addr) -> Result<Option<String>, NeighborError>;
}

/// Reads the `/proc/net/arp` format.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcNeighborTable {
    path: Utf8PathBuf,
}

impl ProcNeighborTable {
    /// Reads a table in `/proc/net/arp` format from `path`.
    #[must_use]
    pub fn new(path: impl Into<Utf8PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> Result<String, NeighborError> {
        let parent = self.path.parent().unwrap_or_else(|| Utf8Path::new("/"));
        let file_name = self.path.file_name().ok_or_else(|| NeighborError::Io {
            path: self.path.clone(),
            message: String::from("path is missing a file name"),
        })?;
        let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| {
            NeighborError::Io {
                path: self.path.clone(),
                message: err.to_string(),
            }
        })?;
        dir.read_to_string(file_name)
            .map_err(|err| NeighborError::Io {
                path: self.path.clone(),
                message: err.to_string(),
            })
    }
}

impl Default for ProcNeighborTable {
    fn default() -> Self {
        Self::new(PROC_ARP_PATH)
    }
}

impl NeighborTable for ProcNeighborTable {
    fn lookup(&self, address: Ipv4Addr) -> Result<Option<String>, NeighborError> {
        let contents = self.read()?;
        Ok(parse_arp_table(&contents, address))
    }
}

/// Finds `address` in `/proc/net/arp` text.
///
/// Columns: IP address, HW type, Flags, HW address, Mask, Device.
fn parse_arp_table(contents: &str, address: Ipv4Addr) -> Option<String> {
    contents.lines().skip(1).find_map(|line| {
        let mut columns = line.split_whitespace();
        let ip = columns.next()?;
        if Ipv4Addr::from_str(ip).ok()? != address {
            return None;
        }
        let _hw_type = columns.next()?;
        let flags = columns.next()?;
        let hardware = columns.next()?;
        if flags == INCOMPLETE_FLAGS || hardware == ZERO_HARDWARE_ADDRESS {
            return None;
        }
        Some(hardware.to_owned())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TABLE: &str = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.1      0x1         0x2         00:1e:42:12:34:56     *        enp3s0
192.168.1.7      0x1         0x0         00:00:00:00:00:00     *        enp3s0
192.168.1.9      0x1         0x2         garbage               *        enp3s0
";

    #[test]
    fn finds_complete_entries() {
        assert_eq!(
            parse_arp_table(TABLE, Ipv4Addr::new(192, 168, 1, 1)),
            Some(String::from("00:1e:42:12:34:56"))
        );
    }

    #[test]
    fn incomplete_entries_resolve_to_none() {
        assert_eq!(parse_arp_table(TABLE, Ipv4Addr::new(192, 168, 1, 7)), None);
    }

    #[test]
    fn absent_entries_resolve_to_none() {
        assert_eq!(parse_arp_table(TABLE, Ipv4Addr::new(192, 168, 1, 50)), None);
    }

    #[test]
    fn malformed_hardware_text_is_returned_verbatim() {
        assert_eq!(
            parse_arp_table(TABLE, Ipv4Addr::new(192, 168, 1, 9)),
            Some(String::from("garbage"))
        );
    }

    #[test]
    fn proc_table_reads_from_disk() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let path = Utf8PathBuf::from_path_buf(tmp.path().join("arp"))
            .unwrap_or_else(|path| panic!("utf8 path: {}", path.display()));
        std::fs::write(&path, TABLE).unwrap_or_else(|err| panic!("write table: {err}"));

        let table = ProcNeighborTable::new(path);
        let found = table
            .lookup(Ipv4Addr::new(192, 168, 1, 1))
            .unwrap_or_else(|err| panic!("lookup: {err}"));
        assert_eq!(found.as_deref(), Some("00:1e:42:12:34:56"));
    }

    #[test]
    fn missing_table_is_an_error() {
        let table = ProcNeighborTable::new("/nonexistent-bringup/arp");
        assert!(table.lookup(Ipv4Addr::LOCALHOST).is_err());
    }
}
