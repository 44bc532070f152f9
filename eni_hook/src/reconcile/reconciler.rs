use cidr::IpCidr;

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};

use eni_hook_lib::address::{AddressSet, Family};
use eni_hook_lib::config;
use eni_hook_lib::imds::{self, MetadataSource};
use eni_hook_lib::interface::{Interface, RouteTable};
use eni_hook_lib::polling;

use super::net_ops::{Destination, NetOps, RouteSpec, RuleSpec};
use super::{Error, FamilyReport, Report};

pub struct Reconciler<N: NetOps, M: MetadataSource> {
    net: N,
    metadata: M,
    polling: config::Polling,
}

impl<N: NetOps, M: MetadataSource> Reconciler<N, M> {
    pub fn new(net: N, metadata: M, polling: config::Polling) -> Self {
        Reconciler { net, metadata, polling }
    }

    /// Runs one convergence pass: IPv4 first, then IPv6.
    ///
    /// Only a missing IPv4 address list is fatal, and it ends the pass before
    /// IPv6 is looked at. Every other failure is logged and counted in the
    /// returned [`Report`].
    pub async fn reconcile(&self, iface: &Interface, mask_bits: u8) -> Result<Report, Error> {
        tracing::info!(interface = %iface, mask_bits, "reconciling interface addresses");

        let (primary, desired) = self.desired_ipv4(iface).await?;
        tracing::debug!(%primary, %desired, "IPv4 addresses from metadata");
        let mut ipv4 = self.converge(iface, Family::V4, mask_bits, &desired).await;
        if self.needs_table(iface, Family::V4, &desired, &mut ipv4).await {
            ipv4.table_provisioned = self.provision_ipv4(iface, primary, &mut ipv4).await;
        }
        tracing::info!(interface = %iface.name, report = %ipv4, "IPv4 converged");

        let desired = self.desired_ipv6(iface).await;
        tracing::debug!(%desired, "IPv6 addresses from metadata");
        let mut ipv6 = self.converge(iface, Family::V6, mask_bits, &desired).await;
        if self.needs_table(iface, Family::V6, &desired, &mut ipv6).await {
            ipv6.table_provisioned = self.provision_ipv6(iface, &mut ipv6).await;
        }
        tracing::info!(interface = %iface.name, report = %ipv6, "IPv6 converged");

        Ok(Report { ipv4, ipv6 })
    }

    /// Primary address and the secondary addresses the interface should carry.
    async fn desired_ipv4(&self, iface: &Interface) -> Result<(Ipv4Addr, AddressSet), Error> {
        let mac = iface.mac.as_str();
        let addrs = polling::poll(&self.polling.ipv4, "IPv4 metadata", || async move {
            let addrs = self.metadata.local_ipv4s(mac).await?;
            if addrs.is_empty() {
                Err(imds::Error::Empty(format!("{mac}/local-ipv4s")))
            } else {
                Ok(addrs)
            }
        })
        .await
        .map_err(|source| Error::Ipv4Unavailable {
            interface: iface.name.clone(),
            source,
        })?;

        match addrs.split_first() {
            Some((primary, secondary)) => Ok((*primary, secondary.iter().copied().map(IpAddr::V4).collect())),
            None => Err(Error::Ipv4Unavailable {
                interface: iface.name.clone(),
                source: imds::Error::Empty(format!("{mac}/local-ipv4s")),
            }),
        }
    }

    /// IPv6 addresses the interface should carry; empty when metadata never had any.
    async fn desired_ipv6(&self, iface: &Interface) -> AddressSet {
        let mac = iface.mac.as_str();
        let res = polling::poll(&self.polling.ipv6, "IPv6 metadata", || async move {
            let addrs = self.metadata.ipv6s(mac).await?;
            if addrs.is_empty() {
                Err(imds::Error::Empty(format!("{mac}/ipv6s")))
            } else {
                Ok(addrs)
            }
        })
        .await;

        match res {
            Ok(addrs) => imds::into_ips(addrs).into_iter().collect(),
            Err(error) if error.is_missing() => {
                tracing::info!(interface = %iface.name, "no IPv6 addresses assigned");
                AddressSet::new()
            }
            Err(error) => {
                tracing::warn!(interface = %iface.name, %error, "IPv6 metadata unavailable, assuming none");
                AddressSet::new()
            }
        }
    }

    async fn converge(&self, iface: &Interface, family: Family, mask_bits: u8, desired: &AddressSet) -> FamilyReport {
        let mut report = FamilyReport {
            desired: desired.len(),
            ..FamilyReport::default()
        };
        let actual = match self.net.addr_list(family, &iface.name).await {
            Ok(actual) => actual,
            Err(error) => {
                tracing::error!(interface = %iface.name, %family, %error, "unable to read configured addresses");
                report.failed += 1;
                return report;
            }
        };
        report.actual = actual.len();

        let changes = actual.changes(desired);
        let mut present = actual;
        if changes.is_empty() {
            tracing::debug!(interface = %iface.name, %family, "addresses already converged");
        }

        let prefix_len = family.prefix_len(mask_bits);
        let dev = iface.name.as_str();
        for addr in changes.remove {
            let removed = best_effort(
                &format!("ip addr del {addr}/{prefix_len} dev {dev}"),
                self.net.addr_del(dev, addr, prefix_len),
            )
            .await;
            if removed {
                report.removed += 1;
                present.remove(&addr);
            } else {
                report.failed += 1;
            }
        }
        for addr in changes.add {
            let added = best_effort(
                &format!("ip addr add {addr}/{prefix_len} dev {dev}"),
                self.net.addr_add(dev, addr, prefix_len),
            )
            .await;
            if added {
                report.added += 1;
                present.insert(addr);
            } else {
                report.failed += 1;
            }
        }

        if let Some(table_id) = iface.table.id() {
            self.converge_rules(iface, family, table_id, &present, &mut report).await;
        }
        report
    }

    /// Leaves exactly one `from <addr> lookup <table_id>` rule per address in
    /// `present`, and none for anything else.
    ///
    /// Works from the rules actually installed, so a rule edit that failed in
    /// an earlier pass is repaired by the next one.
    async fn converge_rules(
        &self,
        iface: &Interface,
        family: Family,
        table_id: u32,
        present: &AddressSet,
        report: &mut FamilyReport,
    ) {
        let installed = match self.net.rule_list(family, table_id).await {
            Ok(rules) => rules,
            Err(error) => {
                tracing::error!(interface = %iface.name, %family, %error, "unable to read policy rules");
                report.failed += 1;
                return;
            }
        };

        let mut covered = AddressSet::new();
        let mut stale = Vec::new();
        for rule in installed {
            if !present.contains(&rule.source) || !covered.insert(rule.source) {
                stale.push(rule);
            }
        }
        let missing: Vec<RuleSpec> = present
            .iter()
            .filter(|addr| !covered.contains(addr))
            .map(|&source| RuleSpec { source, table_id })
            .collect();

        for rule in stale {
            if best_effort(&format!("ip rule del {rule}"), self.net.rule_del(&rule)).await {
                report.rules_changed += 1;
            } else {
                report.failed += 1;
            }
        }
        for rule in missing {
            if best_effort(&format!("ip rule add {rule}"), self.net.rule_add(&rule)).await {
                report.rules_changed += 1;
            } else {
                report.failed += 1;
            }
        }
    }

    /// Whether the interface's table still lacks a default route for `family`.
    async fn needs_table(
        &self,
        iface: &Interface,
        family: Family,
        desired: &AddressSet,
        report: &mut FamilyReport,
    ) -> bool {
        if iface.is_primary() || desired.is_empty() {
            return false;
        }
        match self.net.default_routes(family, iface.table, None).await {
            Ok(routes) if routes.is_empty() => true,
            Ok(_) => {
                tracing::debug!(interface = %iface.name, %family, table = %iface.table, "routing table already provisioned");
                false
            }
            Err(error) => {
                tracing::error!(interface = %iface.name, %family, %error, "unable to inspect routing table");
                report.failed += 1;
                false
            }
        }
    }

    async fn provision_ipv4(&self, iface: &Interface, primary: Ipv4Addr, report: &mut FamilyReport) -> bool {
        let cidr = match self.metadata.subnet_ipv4_cidr(&iface.mac).await {
            Ok(cidr) => cidr,
            Err(error) => {
                tracing::error!(interface = %iface.name, %error, "subnet unavailable, skipping IPv4 routing table");
                report.failed += 1;
                return false;
            }
        };
        let Some(gateway) = cidr.iter().addresses().nth(1) else {
            tracing::error!(interface = %iface.name, %cidr, "subnet has no gateway address, skipping IPv4 routing table");
            report.failed += 1;
            return false;
        };

        let default = RouteSpec {
            family: Family::V4,
            destination: Destination::Default,
            gateway: Some(IpAddr::V4(gateway)),
            device: iface.name.clone(),
            source: None,
            table: iface.table,
        };
        let link = RouteSpec {
            family: Family::V4,
            destination: Destination::Subnet(IpCidr::V4(cidr)),
            gateway: None,
            device: iface.name.clone(),
            source: Some(IpAddr::V4(primary)),
            table: iface.table,
        };

        let mut provisioned = true;
        for route in [default, link] {
            if !best_effort(&format!("ip route add {route}"), self.net.route_add(&route)).await {
                report.failed += 1;
                provisioned = false;
            }
        }
        provisioned
    }

    async fn provision_ipv6(&self, iface: &Interface, report: &mut FamilyReport) -> bool {
        let dev = iface.name.as_str();
        let gateway = polling::poll(&self.polling.gateway, "IPv6 default gateway", || async move {
            self.net
                .default_routes(Family::V6, RouteTable::Main, Some(dev))
                .await?
                .into_iter()
                .find_map(|route| route.gateway)
                .ok_or_else(|| Error::General(format!("no router advertised default route on {dev}")))
        })
        .await;

        let gateway = match gateway {
            Ok(gateway) => gateway,
            Err(error) => {
                tracing::warn!(interface = %dev, %error, "no IPv6 gateway discovered, skipping IPv6 routing table");
                return false;
            }
        };

        let default = RouteSpec {
            family: Family::V6,
            destination: Destination::Default,
            gateway: Some(gateway),
            device: iface.name.clone(),
            source: None,
            table: iface.table,
        };
        let provisioned = best_effort(&format!("ip route add {default}"), self.net.route_add(&default)).await;
        if !provisioned {
            report.failed += 1;
        }
        provisioned
    }
}

async fn best_effort<Fut>(op: &str, fut: Fut) -> bool
where
    Fut: Future<Output = Result<(), Error>>,
{
    match fut.await {
        Ok(()) => {
            tracing::info!("{op}");
            true
        }
        Err(error) => {
            tracing::error!(%error, "{op} failed, continuing anyway");
            false
        }
    }
}
