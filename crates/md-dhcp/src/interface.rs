use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::hwaddr::MacAddr;

const SYSFS_NET: &str = "/sys/class/net";

#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("interface {name} not found: {source}")]
    NotFound {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("interface {name} has unreadable index {value:?}")]
    BadIndex { name: String, value: String },
}

/// Link the server listens on and, for the raw path, transmits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub index: i32,
    /// `None` when the link reports no usable hardware address.
    pub hw_addr: Option<MacAddr>,
}

impl Interface {
    pub fn lookup(name: &str) -> Result<Self, InterfaceError> {
        Self::lookup_in(Path::new(SYSFS_NET), name)
    }

    fn lookup_in(root: &Path, name: &str) -> Result<Self, InterfaceError> {
        let dir: PathBuf = root.join(name);

        let raw_index = std::fs::read_to_string(dir.join("ifindex")).map_err(|source| {
            InterfaceError::NotFound {
                name: name.to_string(),
                source,
            }
        })?;
        let index = raw_index
            .trim()
            .parse()
            .map_err(|_| InterfaceError::BadIndex {
                name: name.to_string(),
                value: raw_index.trim().to_string(),
            })?;

        let hw_addr = std::fs::read_to_string(dir.join("address"))
            .ok()
            .and_then(|s| s.trim().parse::<MacAddr>().ok())
            .filter(|mac| !mac.is_zero());

        Ok(Self {
            name: name.to_string(),
            index,
            hw_addr,
        })
    }
}
