//! Inputs handed over by the DHCP client when it runs the hook.
//!
//! udhcpc exports the interface as `IFACE` and the lease netmask as `mask`,
//! and passes the hook kind as the first argument. All of them are validated
//! here before anything touches the network.

use thiserror::Error;

use std::fmt::{self, Display};
use std::str::FromStr;

pub const ENV_VAR_INTERFACE: &str = "IFACE";
pub const ENV_VAR_MASK: &str = "mask";

#[derive(Debug, Error, PartialEq)]
pub enum Error {
    #[error("Missing interface name (IFACE)")]
    MissingInterface,
    #[error("Missing subnet mask (mask)")]
    MissingMask,
    #[error("Invalid subnet mask '{0}': expected an IPv4 prefix length between 0 and 32")]
    InvalidMask(String),
    #[error("Unknown hook kind '{0}'")]
    UnknownHook(String),
}

/// DHCP client events this hook reacts to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookKind {
    PostBound,
    PostRenew,
}

/// Validated trigger inputs for one reconciliation pass.
#[derive(Clone, Debug, PartialEq)]
pub struct Trigger {
    pub hook: HookKind,
    pub interface: String,
    pub mask_bits: u8,
}

impl Trigger {
    /// Validates raw trigger inputs.
    ///
    /// The hook kind is checked first so an unexpected event is reported as
    /// such even when the DHCP client did not export any lease data for it.
    pub fn from_raw(hook: &str, interface: Option<&str>, mask: Option<&str>) -> Result<Self, Error> {
        let hook = hook.parse::<HookKind>()?;
        let interface = interface
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(Error::MissingInterface)?
            .to_string();
        let mask = mask.map(str::trim).filter(|s| !s.is_empty()).ok_or(Error::MissingMask)?;
        let mask_bits = parse_mask(mask)?;
        Ok(Trigger {
            hook,
            interface,
            mask_bits,
        })
    }
}

fn parse_mask(mask: &str) -> Result<u8, Error> {
    match mask.parse::<u8>() {
        Ok(bits) if bits <= 32 => Ok(bits),
        _ => Err(Error::InvalidMask(mask.to_string())),
    }
}

impl FromStr for HookKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "post-bound" => Ok(HookKind::PostBound),
            "post-renew" => Ok(HookKind::PostRenew),
            other => Err(Error::UnknownHook(other.to_string())),
        }
    }
}

impl Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            HookKind::PostBound => "post-bound",
            HookKind::PostRenew => "post-renew",
        };
        write!(f, "{s}")
    }
}
