use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, put};
use reqwest::Client;
use tokio::net::TcpListener;
use url::Url;

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eni_hook_lib::imds::{self, HEADER_TOKEN, HEADER_TOKEN_TTL, ImdsClient, MetadataSource};

const MAC: &str = "0a:1b:2c:3d:4e:5f";

#[derive(Default)]
struct FakeImds {
    data: Mutex<HashMap<(String, String), String>>,
    tokens_issued: AtomicUsize,
    last_ttl: Mutex<Option<String>>,
    reject_next: AtomicBool,
}

impl FakeImds {
    fn set(&self, key: &str, value: &str) {
        if let Ok(mut data) = self.data.lock() {
            data.insert((MAC.to_string(), key.to_string()), value.to_string());
        }
    }

    fn token(n: usize) -> String {
        format!("token-{n}")
    }
}

async fn issue_token(State(fake): State<Arc<FakeImds>>, headers: HeaderMap) -> (StatusCode, String) {
    let Some(ttl) = headers.get(HEADER_TOKEN_TTL).and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, String::new());
    };
    if let Ok(mut last) = fake.last_ttl.lock() {
        *last = Some(ttl.to_string());
    }
    let n = fake.tokens_issued.fetch_add(1, Ordering::SeqCst) + 1;
    (StatusCode::OK, FakeImds::token(n))
}

async fn interface_data(
    State(fake): State<Arc<FakeImds>>,
    Path((mac, key)): Path<(String, String)>,
    headers: HeaderMap,
) -> (StatusCode, String) {
    let current = FakeImds::token(fake.tokens_issued.load(Ordering::SeqCst));
    let presented = headers.get(HEADER_TOKEN).and_then(|v| v.to_str().ok());
    if presented != Some(current.as_str()) || fake.reject_next.swap(false, Ordering::SeqCst) {
        return (StatusCode::UNAUTHORIZED, String::new());
    }
    let value = fake.data.lock().ok().and_then(|data| data.get(&(mac, key)).cloned());
    match value {
        Some(value) => (StatusCode::OK, value),
        None => (StatusCode::NOT_FOUND, String::new()),
    }
}

async fn serve(fake: Arc<FakeImds>) -> anyhow::Result<Url> {
    let app = Router::new()
        .route("/latest/api/token", put(issue_token))
        .route("/latest/meta-data/network/interfaces/macs/{mac}/{key}", get(interface_data))
        .with_state(fake);
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok(Url::parse(&format!("http://{addr}"))?)
}

fn client(endpoint: Url) -> ImdsClient {
    ImdsClient::new(Client::new(), endpoint, Duration::from_secs(60))
}

#[tokio::test]
async fn fetches_interface_addresses_with_a_token() -> anyhow::Result<()> {
    let fake = Arc::new(FakeImds::default());
    fake.set("local-ipv4s", "10.0.1.5\n10.0.1.6\n10.0.1.7\n");
    fake.set("subnet-ipv4-cidr-block", "10.0.1.0/24");
    fake.set("ipv6s", "2600:1f18::1");
    let imds = client(serve(fake.clone()).await?);

    let v4 = imds.local_ipv4s(MAC).await?;
    let cidr = imds.subnet_ipv4_cidr(MAC).await?;
    let v6 = imds.ipv6s(MAC).await?;

    assert_eq!(
        v4,
        vec![
            Ipv4Addr::new(10, 0, 1, 5),
            Ipv4Addr::new(10, 0, 1, 6),
            Ipv4Addr::new(10, 0, 1, 7)
        ]
    );
    assert_eq!(cidr.to_string(), "10.0.1.0/24");
    assert_eq!(v6, vec!["2600:1f18::1".parse::<Ipv6Addr>()?]);
    assert_eq!(fake.last_ttl.lock().ok().and_then(|t| t.clone()).as_deref(), Some("60"));
    Ok(())
}

#[tokio::test]
async fn reuses_cached_token() -> anyhow::Result<()> {
    let fake = Arc::new(FakeImds::default());
    fake.set("local-ipv4s", "10.0.1.5");
    let imds = client(serve(fake.clone()).await?);

    imds.local_ipv4s(MAC).await?;
    imds.local_ipv4s(MAC).await?;
    imds.local_ipv4s(MAC).await?;

    assert_eq!(fake.tokens_issued.load(Ordering::SeqCst), 1);
    Ok(())
}

#[tokio::test]
async fn missing_key_is_not_found() -> anyhow::Result<()> {
    let fake = Arc::new(FakeImds::default());
    let imds = client(serve(fake).await?);

    let err = imds.ipv6s(MAC).await.expect_err("no ipv6 data");

    assert!(matches!(err, imds::Error::NotFound(_)));
    assert!(err.is_missing());
    Ok(())
}

#[tokio::test]
async fn rejected_token_is_renewed_on_next_request() -> anyhow::Result<()> {
    let fake = Arc::new(FakeImds::default());
    fake.set("local-ipv4s", "10.0.1.5");
    let imds = client(serve(fake.clone()).await?);

    imds.local_ipv4s(MAC).await?;
    fake.reject_next.store(true, Ordering::SeqCst);
    let err = imds.local_ipv4s(MAC).await.expect_err("token rejected");
    assert!(matches!(err, imds::Error::Unauthorized));

    let addrs = imds.local_ipv4s(MAC).await?;
    assert_eq!(addrs, vec![Ipv4Addr::new(10, 0, 1, 5)]);
    assert_eq!(fake.tokens_issued.load(Ordering::SeqCst), 2);
    Ok(())
}

#[tokio::test]
async fn unreachable_service_is_a_request_error() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    let imds = client(Url::parse(&format!("http://{addr}"))?);

    let err = imds.local_ipv4s(MAC).await.expect_err("nothing listening");

    assert!(matches!(err, imds::Error::Request(_)));
    assert!(!err.is_missing());
    Ok(())
}
