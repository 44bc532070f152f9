//! Client for the EC2 instance metadata service (IMDSv2).
//!
//! Every data request carries a session token obtained with a `PUT` to the
//! token endpoint. The token is cached until shortly before it expires and
//! dropped whenever the service answers `401`.

use async_trait::async_trait;
use cidr::Ipv4Cidr;
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::time::{Duration, Instant};

use crate::config;

pub const TOKEN_PATH: &str = "latest/api/token";
pub const INTERFACES_PATH: &str = "latest/meta-data/network/interfaces/macs";
pub const HEADER_TOKEN: &str = "X-aws-ec2-metadata-token";
pub const HEADER_TOKEN_TTL: &str = "X-aws-ec2-metadata-token-ttl-seconds";

const KEY_LOCAL_IPV4S: &str = "local-ipv4s";
const KEY_SUBNET_IPV4_CIDR: &str = "subnet-ipv4-cidr-block";
const KEY_IPV6S: &str = "ipv6s";

/// Margin before expiry after which a cached token is no longer handed out.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum Error {
    #[error("Error parsing url: {0}")]
    Url(#[from] url::ParseError),
    #[error("Error making http request: {0:?}")]
    Request(#[from] reqwest::Error),
    #[error("Metadata not found: {0}")]
    NotFound(String),
    #[error("Metadata token rejected")]
    Unauthorized,
    #[error("Metadata returned no addresses: {0}")]
    Empty(String),
    #[error("Invalid address '{value}' in {key}")]
    InvalidAddress { key: &'static str, value: String },
    #[error("Invalid CIDR block '{0}'")]
    InvalidCidr(String),
}

/// Source of the authoritative per-interface network facts.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    /// IPv4 addresses assigned to the interface, primary first.
    async fn local_ipv4s(&self, mac: &str) -> Result<Vec<Ipv4Addr>, Error>;
    async fn subnet_ipv4_cidr(&self, mac: &str) -> Result<Ipv4Cidr, Error>;
    async fn ipv6s(&self, mac: &str) -> Result<Vec<Ipv6Addr>, Error>;
}

#[derive(Debug)]
struct Token {
    value: String,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct ImdsClient {
    client: Client,
    endpoint: Url,
    token_ttl: Duration,
    token: Mutex<Option<Token>>,
}

impl ImdsClient {
    pub fn new(client: Client, endpoint: Url, token_ttl: Duration) -> Self {
        ImdsClient {
            client,
            endpoint,
            token_ttl,
            token: Mutex::new(None),
        }
    }

    pub fn from_config(metadata: &config::Metadata) -> Result<Self, Error> {
        let client = Client::builder().timeout(metadata.request_timeout).build()?;
        Ok(Self::new(client, metadata.endpoint_url()?, metadata.token_ttl))
    }

    async fn token(&self) -> Result<String, Error> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref().filter(|t| Instant::now() < t.expires_at) {
            return Ok(token.value.clone());
        }

        let url = self.endpoint.join(TOKEN_PATH)?;
        tracing::debug!(%url, ttl = ?self.token_ttl, "requesting metadata token");
        let started = Instant::now();
        let value = self
            .client
            .put(url)
            .header(HEADER_TOKEN_TTL, self.token_ttl.as_secs().to_string())
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        let value = value.trim().to_string();

        let lifetime = self.token_ttl.saturating_sub(TOKEN_REFRESH_MARGIN);
        *cached = Some(Token {
            value: value.clone(),
            expires_at: started + lifetime,
        });
        Ok(value)
    }

    async fn invalidate_token(&self) {
        self.token.lock().await.take();
    }

    async fn get(&self, mac: &str, key: &str) -> Result<String, Error> {
        let path = format!("{INTERFACES_PATH}/{mac}/{key}");
        let url = self.endpoint.join(&path)?;
        let token = self.token().await?;
        tracing::debug!(%url, "get metadata");
        let resp = self.client.get(url).header(HEADER_TOKEN, token).send().await?;

        match resp.status() {
            StatusCode::NOT_FOUND => Err(Error::NotFound(path)),
            StatusCode::UNAUTHORIZED => {
                self.invalidate_token().await;
                Err(Error::Unauthorized)
            }
            _ => Ok(resp.error_for_status()?.text().await?),
        }
    }
}

#[async_trait]
impl MetadataSource for ImdsClient {
    async fn local_ipv4s(&self, mac: &str) -> Result<Vec<Ipv4Addr>, Error> {
        let body = self.get(mac, KEY_LOCAL_IPV4S).await?;
        parse_lines(KEY_LOCAL_IPV4S, &body)
    }

    async fn subnet_ipv4_cidr(&self, mac: &str) -> Result<Ipv4Cidr, Error> {
        let body = self.get(mac, KEY_SUBNET_IPV4_CIDR).await?;
        parse_cidr(&body)
    }

    async fn ipv6s(&self, mac: &str) -> Result<Vec<Ipv6Addr>, Error> {
        let body = self.get(mac, KEY_IPV6S).await?;
        parse_lines(KEY_IPV6S, &body)
    }
}

/// Parses a newline separated address list, keeping the service's order.
pub fn parse_lines<A: FromStr>(key: &'static str, body: &str) -> Result<Vec<A>, Error> {
    body.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<A>().map_err(|_| Error::InvalidAddress {
                key,
                value: line.to_string(),
            })
        })
        .collect()
}

/// Parses the advertised subnet block, tolerating host bits.
pub fn parse_cidr(body: &str) -> Result<Ipv4Cidr, Error> {
    let raw = body.trim();
    cidr::parsers::parse_cidr_ignore_hostbits::<Ipv4Cidr, _>(raw, Ipv4Addr::from_str)
        .map_err(|_| Error::InvalidCidr(raw.to_string()))
}

/// Ordered list of addresses as generic IPs.
pub fn into_ips<A: Into<IpAddr>>(addrs: Vec<A>) -> Vec<IpAddr> {
    addrs.into_iter().map(Into::into).collect()
}

impl Error {
    /// Metadata is not there yet, as opposed to the service misbehaving.
    pub fn is_missing(&self) -> bool {
        matches!(self, Error::NotFound(_) | Error::Empty(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn parses_address_lines_in_order() -> anyhow::Result<()> {
        let addrs: Vec<Ipv4Addr> = parse_lines(KEY_LOCAL_IPV4S, "10.0.1.5\n10.0.1.6\n10.0.1.7")?;
        assert_eq!(
            addrs,
            vec![
                Ipv4Addr::new(10, 0, 1, 5),
                Ipv4Addr::new(10, 0, 1, 6),
                Ipv4Addr::new(10, 0, 1, 7)
            ]
        );
        Ok(())
    }

    #[test]
    fn skips_blank_lines() -> anyhow::Result<()> {
        let addrs: Vec<Ipv6Addr> = parse_lines(KEY_IPV6S, "\n2600:1f18::1\n\n")?;
        assert_eq!(addrs, vec!["2600:1f18::1".parse::<Ipv6Addr>()?]);
        Ok(())
    }

    #[test]
    fn rejects_garbage_address() {
        let res: Result<Vec<Ipv4Addr>, _> = parse_lines(KEY_LOCAL_IPV4S, "10.0.1.5\nnope");
        assert!(matches!(res, Err(Error::InvalidAddress { value, .. }) if value == "nope"));
    }

    #[rstest]
    #[case("10.0.1.0/24", "10.0.1.0/24")]
    #[case("10.0.16.0/20\n", "10.0.16.0/20")]
    #[case("10.0.1.7/24", "10.0.1.0/24")]
    fn parses_subnet_block(#[case] body: &str, #[case] expected: &str) -> anyhow::Result<()> {
        assert_eq!(parse_cidr(body)?, expected.parse::<Ipv4Cidr>()?);
        Ok(())
    }

    #[rstest]
    #[case("2600:1f18::/64")]
    #[case("not a cidr")]
    fn rejects_non_ipv4_subnet(#[case] body: &str) {
        assert!(matches!(parse_cidr(body), Err(Error::InvalidCidr(_))));
    }

    #[test]
    fn missing_data_is_distinguished() {
        assert!(Error::NotFound("x".into()).is_missing());
        assert!(Error::Empty("x".into()).is_missing());
        assert!(!Error::Unauthorized.is_missing());
    }
}
