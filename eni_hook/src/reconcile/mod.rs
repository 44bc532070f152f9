//! Converges an interface's addresses, policy rules and routing table onto
//! what the metadata service reports for it.
//!
//! Network state is touched only through [`NetOps`], so the whole pass runs
//! against stateful mocks in tests.

use thiserror::Error;

use std::fmt::{self, Display};

use eni_hook_lib::{imds, shell_command_ext};

pub mod net_ops;
mod reconciler;

mod mocks;

pub use net_ops::{NetOps, RealNetOps};
pub use reconciler::Reconciler;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Shell command error: {0}")]
    ShellCommand(#[from] shell_command_ext::Error),
    #[error("Unexpected output from ip: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IPv4 addresses of {interface} unavailable from metadata: {source}")]
    Ipv4Unavailable { interface: String, source: imds::Error },
    #[error("General error: {0}")]
    General(String),
}

/// Outcome of one address family's pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FamilyReport {
    pub desired: usize,
    pub actual: usize,
    pub added: usize,
    pub removed: usize,
    /// Policy rules added or deleted, repairs included.
    pub rules_changed: usize,
    pub failed: usize,
    pub table_provisioned: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Report {
    pub ipv4: FamilyReport,
    pub ipv6: FamilyReport,
}

impl FamilyReport {
    /// Address bindings changed in this pass.
    pub fn mutations(&self) -> usize {
        self.added + self.removed
    }
}

impl Report {
    pub fn mutations(&self) -> usize {
        self.ipv4.mutations() + self.ipv6.mutations()
    }

    pub fn failures(&self) -> usize {
        self.ipv4.failed + self.ipv6.failed
    }
}

impl Display for FamilyReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "desired {}, actual {}, +{} -{}, {} failed",
            self.desired, self.actual, self.added, self.removed, self.failed
        )?;
        if self.rules_changed > 0 {
            write!(f, ", {} rule edits", self.rules_changed)?;
        }
        if self.table_provisioned {
            write!(f, ", table provisioned")?;
        }
        Ok(())
    }
}
