//! Stateful mocks for the reconciler's trait abstractions.
//!
//! The mocks track the resulting network state (addresses, rules, routes)
//! along with a log of every mutation, so tests can assert both on where the
//! interface ended up and on how many edits it took to get there.

#![cfg(test)]

use async_trait::async_trait;
use cidr::Ipv4Cidr;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};

use eni_hook_lib::address::{AddressSet, Family};
use eni_hook_lib::imds::{self, MetadataSource};
use eni_hook_lib::interface::RouteTable;

use super::Error;
use super::net_ops::{NetOps, RouteSpec, RuleSpec};

// ============================================================================
// MockNetOps
// ============================================================================

#[derive(Clone, Debug, PartialEq)]
pub struct AddrEntry {
    pub device: String,
    pub addr: IpAddr,
    pub prefix_len: u8,
}

#[derive(Debug, Default)]
pub struct NetState {
    pub addrs: Vec<AddrEntry>,
    pub rules: Vec<RuleSpec>,
    pub routes: Vec<RouteSpec>,
    /// Every mutation in `ip` syntax, in order.
    pub ops: Vec<String>,
    /// Route queries, in order.
    pub route_queries: Vec<String>,
    /// Map of operation name -> error message. If set, the operation will fail.
    pub fail_on: HashMap<String, String>,
}

impl NetState {
    fn check_fail(&self, op: &str) -> Result<(), Error> {
        if let Some(msg) = self.fail_on.get(op) {
            Err(Error::General(msg.clone()))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone)]
pub struct MockNetOps {
    pub state: Arc<Mutex<NetState>>,
}

impl MockNetOps {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(NetState::default())),
        }
    }

    pub fn with_addrs(device: &str, addrs: &[(&str, u8)]) -> Self {
        let ops = Self::new();
        {
            let mut s = ops.state.lock().unwrap();
            for (addr, prefix_len) in addrs {
                s.addrs.push(AddrEntry {
                    device: device.to_string(),
                    addr: addr.parse().unwrap(),
                    prefix_len: *prefix_len,
                });
            }
        }
        ops
    }

    pub fn fail_on(&self, op: &str) {
        self.state.lock().unwrap().fail_on.insert(op.into(), format!("{op} failed"));
    }

    pub fn clear_fail(&self, op: &str) {
        self.state.lock().unwrap().fail_on.remove(op);
    }

    pub fn prefix_len(&self, device: &str, addr: IpAddr) -> Option<u8> {
        let s = self.state.lock().unwrap();
        s.addrs
            .iter()
            .find(|e| e.device == device && e.addr == addr)
            .map(|e| e.prefix_len)
    }

    pub fn addrs(&self, device: &str, family: Family) -> Vec<IpAddr> {
        let s = self.state.lock().unwrap();
        let mut addrs: Vec<IpAddr> = s
            .addrs
            .iter()
            .filter(|e| e.device == device && family.matches(&e.addr))
            .map(|e| e.addr)
            .collect();
        addrs.sort();
        addrs
    }

    pub fn ops(&self) -> Vec<String> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn clear_ops(&self) {
        let mut s = self.state.lock().unwrap();
        s.ops.clear();
        s.route_queries.clear();
    }

    pub fn route_queries(&self) -> Vec<String> {
        self.state.lock().unwrap().route_queries.clone()
    }

    pub fn rules(&self) -> Vec<RuleSpec> {
        self.state.lock().unwrap().rules.clone()
    }

    pub fn routes(&self) -> Vec<RouteSpec> {
        self.state.lock().unwrap().routes.clone()
    }

    pub fn add_rule(&self, rule: RuleSpec) {
        self.state.lock().unwrap().rules.push(rule);
    }

    pub fn add_route(&self, route: RouteSpec) {
        self.state.lock().unwrap().routes.push(route);
    }
}

#[async_trait]
impl NetOps for MockNetOps {
    async fn addr_list(&self, family: Family, device: &str) -> Result<AddressSet, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("addr_list")?;
        Ok(s.addrs
            .iter()
            .filter(|e| e.device == device && family.matches(&e.addr))
            .map(|e| e.addr)
            .collect())
    }

    async fn addr_add(&self, device: &str, addr: IpAddr, prefix_len: u8) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("addr_add")?;
        if s.addrs.iter().any(|e| e.device == device && e.addr == addr) {
            return Err(Error::General(format!("address already assigned: {addr}")));
        }
        s.addrs.push(AddrEntry {
            device: device.to_string(),
            addr,
            prefix_len,
        });
        s.ops.push(format!("addr add {addr}/{prefix_len} dev {device}"));
        Ok(())
    }

    async fn addr_del(&self, device: &str, addr: IpAddr, prefix_len: u8) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("addr_del")?;
        let before = s.addrs.len();
        s.addrs.retain(|e| !(e.device == device && e.addr == addr));
        if s.addrs.len() == before {
            return Err(Error::General(format!("address not assigned: {addr}")));
        }
        s.ops.push(format!("addr del {addr}/{prefix_len} dev {device}"));
        Ok(())
    }

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("rule_add")?;
        s.rules.push(rule.clone());
        s.ops.push(format!("rule add {rule}"));
        Ok(())
    }

    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("rule_del")?;
        // like `ip rule del`, only the first matching rule goes
        let Some(pos) = s.rules.iter().position(|r| r == rule) else {
            return Err(Error::General(format!("rule not found: {rule}")));
        };
        s.rules.remove(pos);
        s.ops.push(format!("rule del {rule}"));
        Ok(())
    }

    async fn rule_list(&self, family: Family, table_id: u32) -> Result<Vec<RuleSpec>, Error> {
        let s = self.state.lock().unwrap();
        s.check_fail("rule_list")?;
        Ok(s.rules
            .iter()
            .filter(|r| r.table_id == table_id && family.matches(&r.source))
            .cloned()
            .collect())
    }

    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("route_add")?;
        let exists = s
            .routes
            .iter()
            .any(|r| r.destination == route.destination && r.table == route.table && r.family == route.family);
        if exists {
            return Err(Error::General(format!("route already exists: {route}")));
        }
        s.routes.push(route.clone());
        s.ops.push(format!("route add {route}"));
        Ok(())
    }

    async fn default_routes(
        &self,
        family: Family,
        table: RouteTable,
        device: Option<&str>,
    ) -> Result<Vec<RouteSpec>, Error> {
        let mut s = self.state.lock().unwrap();
        s.check_fail("default_routes")?;
        let query = match device {
            Some(dev) => format!("route show {family} table {table} dev {dev}"),
            None => format!("route show {family} table {table}"),
        };
        s.route_queries.push(query);
        Ok(s.routes
            .iter()
            .filter(|r| r.family == family && r.table == table)
            .filter(|r| r.destination == super::net_ops::Destination::Default)
            .filter(|r| device.is_none_or(|d| r.device == d))
            .cloned()
            .collect())
    }
}

// ============================================================================
// MockMetadata
// ============================================================================

#[derive(Debug, Default)]
pub struct MetadataState {
    pub ipv4s: HashMap<String, Vec<Ipv4Addr>>,
    pub cidrs: HashMap<String, Ipv4Cidr>,
    pub ipv6s: HashMap<String, Vec<Ipv6Addr>>,
    /// Number of calls per operation name.
    pub calls: HashMap<String, usize>,
    /// Map of operation name -> error message. If set, the operation will fail.
    pub fail_on: HashMap<String, String>,
}

impl MetadataState {
    fn record(&mut self, op: &str) -> Result<(), imds::Error> {
        *self.calls.entry(op.to_string()).or_default() += 1;
        if let Some(msg) = self.fail_on.get(op) {
            Err(imds::Error::NotFound(msg.clone()))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone)]
pub struct MockMetadata {
    pub state: Arc<Mutex<MetadataState>>,
}

impl MockMetadata {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MetadataState::default())),
        }
    }

    pub fn with_ipv4s(mac: &str, addrs: &[&str]) -> Self {
        let metadata = Self::new();
        metadata.state.lock().unwrap().ipv4s.insert(
            mac.to_string(),
            addrs.iter().map(|a| a.parse().unwrap()).collect(),
        );
        metadata
    }

    pub fn set_ipv4s(&self, mac: &str, addrs: &[&str]) {
        self.state.lock().unwrap().ipv4s.insert(
            mac.to_string(),
            addrs.iter().map(|a| a.parse().unwrap()).collect(),
        );
    }

    pub fn set_cidr(&self, mac: &str, cidr: &str) {
        self.state
            .lock()
            .unwrap()
            .cidrs
            .insert(mac.to_string(), cidr.parse().unwrap());
    }

    pub fn set_ipv6s(&self, mac: &str, addrs: &[&str]) {
        self.state.lock().unwrap().ipv6s.insert(
            mac.to_string(),
            addrs.iter().map(|a| a.parse().unwrap()).collect(),
        );
    }

    pub fn calls(&self, op: &str) -> usize {
        self.state.lock().unwrap().calls.get(op).copied().unwrap_or_default()
    }
}

#[async_trait]
impl MetadataSource for MockMetadata {
    async fn local_ipv4s(&self, mac: &str) -> Result<Vec<Ipv4Addr>, imds::Error> {
        let mut s = self.state.lock().unwrap();
        s.record("local_ipv4s")?;
        s.ipv4s
            .get(mac)
            .cloned()
            .ok_or_else(|| imds::Error::NotFound(format!("{mac}/local-ipv4s")))
    }

    async fn subnet_ipv4_cidr(&self, mac: &str) -> Result<Ipv4Cidr, imds::Error> {
        let mut s = self.state.lock().unwrap();
        s.record("subnet_ipv4_cidr")?;
        s.cidrs
            .get(mac)
            .copied()
            .ok_or_else(|| imds::Error::NotFound(format!("{mac}/subnet-ipv4-cidr-block")))
    }

    async fn ipv6s(&self, mac: &str) -> Result<Vec<Ipv6Addr>, imds::Error> {
        let mut s = self.state.lock().unwrap();
        s.record("ipv6s")?;
        s.ipv6s
            .get(mac)
            .cloned()
            .ok_or_else(|| imds::Error::NotFound(format!("{mac}/ipv6s")))
    }
}
