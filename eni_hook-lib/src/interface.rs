use thiserror::Error;
use tokio::fs;

use std::fmt::{self, Display};
use std::io;
use std::path::Path;

use crate::config;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Interface '{0}' does not exist")]
    NotFound(String),
    #[error("Interface '{0}' has no numeric suffix to derive a routing table from")]
    NoOrdinal(String),
    #[error("Routing table for interface '{0}' overflows")]
    TableOverflow(String),
    #[error("Interface '{0}' has no hardware address")]
    NoMac(String),
    #[error("IO error: {0}")]
    IO(#[from] io::Error),
}

/// Routing table used for traffic sourced from an interface's addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RouteTable {
    /// The primary interface lives in the system's default table.
    Main,
    Id(u32),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Interface {
    pub name: String,
    /// Lowercase colon separated hardware address, as the metadata service keys it.
    pub mac: String,
    pub table: RouteTable,
}

impl Interface {
    /// Resolves an interface against the system's sysfs network tree.
    pub async fn from_system(sysfs_net: &Path, name: &str, routing: &config::Routing) -> Result<Self, Error> {
        let table = route_table(name, routing)?;
        let address_file = sysfs_net.join(name).join("address");
        let mac = fs::read_to_string(&address_file).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound(name.to_string())
            } else {
                Error::IO(e)
            }
        })?;
        let mac = mac.trim().to_lowercase();
        if mac.is_empty() {
            return Err(Error::NoMac(name.to_string()));
        }
        Ok(Interface {
            name: name.to_string(),
            mac,
            table,
        })
    }

    pub fn is_primary(&self) -> bool {
        self.table == RouteTable::Main
    }
}

/// Derives the routing table from the interface name.
///
/// `eth1` with the default offset maps to table 1001; the primary interface
/// maps to the main table.
pub fn route_table(name: &str, routing: &config::Routing) -> Result<RouteTable, Error> {
    if name == routing.primary_interface {
        return Ok(RouteTable::Main);
    }
    let prefix_len = name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    let ordinal = name[prefix_len..]
        .parse::<u32>()
        .map_err(|_| Error::NoOrdinal(name.to_string()))?;
    ordinal
        .checked_add(routing.table_offset)
        .map(RouteTable::Id)
        .ok_or_else(|| Error::TableOverflow(name.to_string()))
}

impl RouteTable {
    pub fn id(&self) -> Option<u32> {
        match self {
            RouteTable::Main => None,
            RouteTable::Id(id) => Some(*id),
        }
    }
}

impl Display for RouteTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RouteTable::Main => write!(f, "main"),
            RouteTable::Id(id) => write!(f, "{id}"),
        }
    }
}

impl Display for Interface {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({}, table {})", self.name, self.mac, self.table)
    }
}
