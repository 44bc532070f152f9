use std::collections::BTreeSet;
use std::fmt::{self, Display};
use std::net::IpAddr;

/// IPv6 addresses are assigned individually by EC2, never as ranges.
pub const IPV6_PREFIX_LEN: u8 = 128;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    /// Family selector understood by `ip`.
    pub fn flag(&self) -> &'static str {
        match self {
            Family::V4 => "-4",
            Family::V6 => "-6",
        }
    }

    pub fn matches(&self, addr: &IpAddr) -> bool {
        matches!((self, addr), (Family::V4, IpAddr::V4(_)) | (Family::V6, IpAddr::V6(_)))
    }

    /// Prefix length used when binding an address of this family.
    pub fn prefix_len(&self, mask_bits: u8) -> u8 {
        match self {
            Family::V4 => mask_bits,
            Family::V6 => IPV6_PREFIX_LEN,
        }
    }
}

impl Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "IPv4"),
            Family::V6 => write!(f, "IPv6"),
        }
    }
}

/// Unordered set of addresses of a single family.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AddressSet {
    addrs: BTreeSet<IpAddr>,
}

/// Minimal edit turning one address set into another.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Changes {
    pub remove: Vec<IpAddr>,
    pub add: Vec<IpAddr>,
}

impl AddressSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.addrs.contains(addr)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpAddr> {
        self.addrs.iter()
    }

    pub fn insert(&mut self, addr: IpAddr) -> bool {
        self.addrs.insert(addr)
    }

    pub fn remove(&mut self, addr: &IpAddr) -> bool {
        self.addrs.remove(addr)
    }

    /// Edit that converges `self` (actual) onto `desired`.
    pub fn changes(&self, desired: &AddressSet) -> Changes {
        Changes {
            remove: self.addrs.difference(&desired.addrs).copied().collect(),
            add: desired.addrs.difference(&self.addrs).copied().collect(),
        }
    }
}

impl Changes {
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.add.is_empty()
    }
}

impl FromIterator<IpAddr> for AddressSet {
    fn from_iter<T: IntoIterator<Item = IpAddr>>(iter: T) -> Self {
        AddressSet {
            addrs: iter.into_iter().collect(),
        }
    }
}

impl Display for AddressSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let addrs = self.addrs.iter().map(ToString::to_string).collect::<Vec<_>>();
        write!(f, "[{}]", addrs.join(", "))
    }
}
