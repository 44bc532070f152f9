//! Abstraction over the OS network configuration used by the reconciler.
//!
//! Defines [`NetOps`] covering:
//! - `ip addr add/del` and listing of secondary / global addresses
//! - `ip rule add/del` binding a source address to a table, and listing the
//!   rules that point at a table
//! - `ip route add` and listing of default routes
//!
//! Production code uses [`RealNetOps`] which drives iproute2 and reads its
//! JSON output. Tests use stateful mocks (see `mocks` module).

use async_trait::async_trait;
use cidr::IpCidr;
use serde::Deserialize;
use tokio::process::Command;

use std::fmt::{self, Display};
use std::net::IpAddr;

use eni_hook_lib::address::{AddressSet, Family};
use eni_hook_lib::interface::RouteTable;
use eni_hook_lib::shell_command_ext::{self, Logs, ShellCommandExt};

use super::Error;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    Default,
    Subnet(IpCidr),
}

/// Route specification, rendered as `ip route` arguments.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RouteSpec {
    pub family: Family,
    pub destination: Destination,
    pub gateway: Option<IpAddr>,
    pub device: String,
    /// Preferred source of a kernel link-scope route.
    pub source: Option<IpAddr>,
    pub table: RouteTable,
}

/// Policy rule sending traffic from `source` to a routing table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleSpec {
    pub source: IpAddr,
    pub table_id: u32,
}

/// Abstraction over network configuration commands.
///
/// Implementors must be cheaply cloneable.
#[async_trait]
pub trait NetOps: Send + Sync + Clone {
    /// Addresses the reconciler manages on `device`: IPv4 secondary addresses
    /// or IPv6 global-scope addresses.
    async fn addr_list(&self, family: Family, device: &str) -> Result<AddressSet, Error>;

    /// `ip addr add <addr>/<prefix_len> dev <device>`.
    async fn addr_add(&self, device: &str, addr: IpAddr, prefix_len: u8) -> Result<(), Error>;

    /// `ip addr del <addr>/<prefix_len> dev <device>`.
    async fn addr_del(&self, device: &str, addr: IpAddr, prefix_len: u8) -> Result<(), Error>;

    /// `ip rule add from <source> lookup <table>`.
    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error>;

    /// `ip rule del from <source> lookup <table>`.
    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error>;

    /// Source-address rules of `family` looking up `table_id`, duplicates included.
    async fn rule_list(&self, family: Family, table_id: u32) -> Result<Vec<RuleSpec>, Error>;

    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error>;

    /// Default routes in `table`, optionally restricted to one device.
    async fn default_routes(
        &self,
        family: Family,
        table: RouteTable,
        device: Option<&str>,
    ) -> Result<Vec<RouteSpec>, Error>;
}

/// Production [`NetOps`] running iproute2.
#[derive(Clone, Debug, Default)]
pub struct RealNetOps;

#[async_trait]
impl NetOps for RealNetOps {
    async fn addr_list(&self, family: Family, device: &str) -> Result<AddressSet, Error> {
        let output = Command::new("ip")
            .args(addr_list_args(family, device))
            .run_stdout(Logs::Print)
            .await?;
        parse_addr_list(family, &output)
    }

    async fn addr_add(&self, device: &str, addr: IpAddr, prefix_len: u8) -> Result<(), Error> {
        Command::new("ip")
            .args(addr_args("add", device, addr, prefix_len))
            .run(Logs::Print)
            .await?;
        Ok(())
    }

    async fn addr_del(&self, device: &str, addr: IpAddr, prefix_len: u8) -> Result<(), Error> {
        Command::new("ip")
            .args(addr_args("del", device, addr, prefix_len))
            .run(Logs::Print)
            .await?;
        Ok(())
    }

    async fn rule_add(&self, rule: &RuleSpec) -> Result<(), Error> {
        Command::new("ip").args(rule_args("add", rule)).run(Logs::Print).await?;
        Ok(())
    }

    async fn rule_del(&self, rule: &RuleSpec) -> Result<(), Error> {
        Command::new("ip").args(rule_args("del", rule)).run(Logs::Print).await?;
        Ok(())
    }

    async fn rule_list(&self, family: Family, table_id: u32) -> Result<Vec<RuleSpec>, Error> {
        let output = Command::new("ip")
            .args(rule_list_args(family, table_id))
            .run_stdout(Logs::Suppress)
            .await?;
        parse_rule_list(table_id, &output)
    }

    async fn route_add(&self, route: &RouteSpec) -> Result<(), Error> {
        Command::new("ip").args(route_add_args(route)).run(Logs::Print).await?;
        Ok(())
    }

    async fn default_routes(
        &self,
        family: Family,
        table: RouteTable,
        device: Option<&str>,
    ) -> Result<Vec<RouteSpec>, Error> {
        let res = Command::new("ip")
            .args(route_show_args(family, table, device))
            .run_stdout(Logs::Suppress)
            .await;
        match res {
            Ok(output) => parse_default_routes(family, table, &output),
            // older iproute2 refuses to list a table that was never populated
            Err(shell_command_ext::Error::CommandFailed { stderr, .. }) if stderr.contains("does not exist") => {
                Ok(Vec::new())
            }
            Err(e) => Err(e.into()),
        }
    }
}

pub fn addr_list_args(family: Family, device: &str) -> Vec<String> {
    let scope = match family {
        Family::V4 => "secondary",
        Family::V6 => "global",
    };
    let mut args = vec!["-j", family.flag(), "addr", "show", "dev", device];
    if family == Family::V6 {
        args.push("scope");
    }
    args.push(scope);
    args.into_iter().map(String::from).collect()
}

pub fn addr_args(action: &str, device: &str, addr: IpAddr, prefix_len: u8) -> Vec<String> {
    vec![
        Family::of(&addr).flag().to_string(),
        "addr".into(),
        action.into(),
        format!("{addr}/{prefix_len}"),
        "dev".into(),
        device.into(),
    ]
}

pub fn rule_args(action: &str, rule: &RuleSpec) -> Vec<String> {
    vec![
        Family::of(&rule.source).flag().to_string(),
        "rule".into(),
        action.into(),
        "from".into(),
        rule.source.to_string(),
        "lookup".into(),
        rule.table_id.to_string(),
    ]
}

pub fn rule_list_args(family: Family, table_id: u32) -> Vec<String> {
    vec![
        "-j".to_string(),
        family.flag().to_string(),
        "rule".into(),
        "show".into(),
        "table".into(),
        table_id.to_string(),
    ]
}

pub fn route_add_args(route: &RouteSpec) -> Vec<String> {
    let mut args = vec![route.family.flag().to_string(), "route".into(), "add".into()];
    args.extend(route.to_string().split_whitespace().map(String::from));
    args
}

pub fn route_show_args(family: Family, table: RouteTable, device: Option<&str>) -> Vec<String> {
    let mut args = vec!["-j".to_string(), family.flag().to_string(), "route".into(), "show".into()];
    if let Some(id) = table.id() {
        args.extend(["table".to_string(), id.to_string()]);
    }
    if let Some(dev) = device {
        args.extend(["dev".to_string(), dev.to_string()]);
    }
    args.push("default".into());
    args
}

#[derive(Debug, Deserialize)]
struct IpLink {
    #[serde(default)]
    addr_info: Vec<IpAddrInfo>,
}

#[derive(Debug, Deserialize)]
struct IpAddrInfo {
    local: Option<IpAddr>,
}

#[derive(Debug, Deserialize)]
struct IpRule {
    src: Option<String>,
    table: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IpRoute {
    dst: String,
    gateway: Option<IpAddr>,
    dev: Option<String>,
    prefsrc: Option<IpAddr>,
}

pub fn parse_addr_list(family: Family, output: &str) -> Result<AddressSet, Error> {
    if output.trim().is_empty() {
        return Ok(AddressSet::new());
    }
    let links: Vec<IpLink> = serde_json::from_str(output)?;
    Ok(links
        .into_iter()
        .flat_map(|link| link.addr_info)
        .filter_map(|info| info.local)
        .filter(|addr| family.matches(addr))
        .collect())
}

pub fn parse_rule_list(table_id: u32, output: &str) -> Result<Vec<RuleSpec>, Error> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }
    let rules: Vec<IpRule> = serde_json::from_str(output)?;
    let table = table_id.to_string();
    Ok(rules
        .into_iter()
        .filter(|r| r.table.as_deref() == Some(table.as_str()))
        // `from all` rules carry no source address
        .filter_map(|r| r.src.and_then(|src| src.parse().ok()))
        .map(|source| RuleSpec { source, table_id })
        .collect())
}

pub fn parse_default_routes(family: Family, table: RouteTable, output: &str) -> Result<Vec<RouteSpec>, Error> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }
    let routes: Vec<IpRoute> = serde_json::from_str(output)?;
    Ok(routes
        .into_iter()
        .filter(|r| r.dst == "default")
        .map(|r| RouteSpec {
            family,
            destination: Destination::Default,
            gateway: r.gateway,
            device: r.dev.unwrap_or_default(),
            source: r.prefsrc,
            table,
        })
        .collect())
}

impl Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Destination::Default => write!(f, "default"),
            Destination::Subnet(cidr) => write!(f, "{}/{}", cidr.first_address(), cidr.network_length()),
        }
    }
}

impl Display for RouteSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(gw) = self.gateway {
            write!(f, " via {gw}")?;
        }
        write!(f, " dev {}", self.device)?;
        if let Some(src) = self.source {
            write!(f, " proto kernel scope link src {src}")?;
        }
        if let Some(id) = self.table.id() {
            write!(f, " table {id}")?;
        }
        Ok(())
    }
}

impl Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "from {} lookup {}", self.source, self.table_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    use std::net::Ipv4Addr;
    use std::str::FromStr;

    fn subnet(raw: &str) -> anyhow::Result<IpCidr> {
        let cidr = cidr::parsers::parse_cidr_ignore_hostbits::<cidr::Ipv4Cidr, _>(raw, Ipv4Addr::from_str)?;
        Ok(IpCidr::V4(cidr))
    }

    #[rstest]
    #[case(Family::V4, "-j -4 addr show dev eth1 secondary")]
    #[case(Family::V6, "-j -6 addr show dev eth1 scope global")]
    fn lists_managed_addresses(#[case] family: Family, #[case] expected: &str) {
        assert_eq!(addr_list_args(family, "eth1").join(" "), expected);
    }

    #[test]
    fn renders_address_and_rule_commands() -> anyhow::Result<()> {
        let addr: IpAddr = "10.0.2.9".parse()?;
        assert_eq!(addr_args("add", "eth1", addr, 24).join(" "), "-4 addr add 10.0.2.9/24 dev eth1");

        let v6: IpAddr = "2600:1f18::9".parse()?;
        assert_eq!(addr_args("del", "eth1", v6, 128).join(" "), "-6 addr del 2600:1f18::9/128 dev eth1");

        let rule = RuleSpec {
            source: addr,
            table_id: 1001,
        };
        assert_eq!(rule_args("add", &rule).join(" "), "-4 rule add from 10.0.2.9 lookup 1001");
        Ok(())
    }

    #[test]
    fn renders_table_routes() -> anyhow::Result<()> {
        let default = RouteSpec {
            family: Family::V4,
            destination: Destination::Default,
            gateway: Some("10.0.2.1".parse()?),
            device: "eth1".into(),
            source: None,
            table: RouteTable::Id(1001),
        };
        assert_eq!(
            route_add_args(&default).join(" "),
            "-4 route add default via 10.0.2.1 dev eth1 table 1001"
        );

        let link = RouteSpec {
            family: Family::V4,
            destination: Destination::Subnet(subnet("10.0.2.0/24")?),
            gateway: None,
            device: "eth1".into(),
            source: Some("10.0.2.5".parse()?),
            table: RouteTable::Id(1001),
        };
        assert_eq!(
            route_add_args(&link).join(" "),
            "-4 route add 10.0.2.0/24 dev eth1 proto kernel scope link src 10.0.2.5 table 1001"
        );
        Ok(())
    }

    #[rstest]
    #[case(Family::V4, "-j -4 rule show table 1001")]
    #[case(Family::V6, "-j -6 rule show table 1001")]
    fn lists_table_rules(#[case] family: Family, #[case] expected: &str) {
        assert_eq!(rule_list_args(family, 1001).join(" "), expected);
    }

    #[test]
    fn parses_source_rules_of_a_table() -> anyhow::Result<()> {
        let output = r#"[{"priority":32764,"src":"10.0.2.9","table":"1001"},{"priority":32765,"src":"10.0.2.9","table":"1001"},{"priority":32766,"src":"all","table":"1001"},{"priority":32767,"src":"10.0.2.7","table":"main"}]"#;

        let rules = parse_rule_list(1001, output)?;

        let expected = RuleSpec {
            source: "10.0.2.9".parse()?,
            table_id: 1001,
        };
        assert_eq!(rules, vec![expected.clone(), expected]);
        Ok(())
    }

    #[rstest]
    #[case(RouteTable::Id(1001), None, "-j -4 route show table 1001 default")]
    #[case(RouteTable::Main, Some("eth1"), "-j -4 route show dev eth1 default")]
    fn shows_default_routes(#[case] table: RouteTable, #[case] device: Option<&str>, #[case] expected: &str) {
        assert_eq!(route_show_args(Family::V4, table, device).join(" "), expected);
    }

    #[test]
    fn parses_secondary_addresses() -> anyhow::Result<()> {
        let output = r#"[{"ifindex":3,"ifname":"eth1","flags":["BROADCAST","MULTICAST","UP","LOWER_UP"],"mtu":9001,"addr_info":[{"family":"inet","local":"10.0.2.6","prefixlen":24,"scope":"global","secondary":true,"label":"eth1","valid_life_time":4294967295,"preferred_life_time":4294967295},{"family":"inet","local":"10.0.2.7","prefixlen":24,"scope":"global","secondary":true,"label":"eth1"}]}]"#;

        let addrs = parse_addr_list(Family::V4, output)?;

        assert_eq!(addrs.to_string(), "[10.0.2.6, 10.0.2.7]");
        Ok(())
    }

    #[rstest]
    #[case("")]
    #[case("[]")]
    #[case("[{}]")]
    fn parses_empty_address_listings(#[case] output: &str) -> anyhow::Result<()> {
        assert!(parse_addr_list(Family::V6, output)?.is_empty());
        Ok(())
    }

    #[test]
    fn parses_router_advertised_default_route() -> anyhow::Result<()> {
        let output = r#"[{"dst":"default","gateway":"fe80::4a2:9eff:fe1c:5b3d","dev":"eth1","protocol":"ra","metric":1024,"flags":[],"pref":"medium"}]"#;

        let routes = parse_default_routes(Family::V6, RouteTable::Main, output)?;

        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].gateway, Some("fe80::4a2:9eff:fe1c:5b3d".parse()?));
        assert_eq!(routes[0].device, "eth1");
        assert_eq!(routes[0].destination, Destination::Default);
        Ok(())
    }

    #[test]
    fn rejects_malformed_output() {
        let res = parse_default_routes(Family::V4, RouteTable::Id(1001), "Error: garbage");
        assert!(matches!(res, Err(Error::Json(_))));
    }
}
