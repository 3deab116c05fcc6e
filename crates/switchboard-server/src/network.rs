//! Network helper routes.
//!
//! - `GET /ip` - the host's non-loopback IPv4 addresses and the caller's address
//! - `GET /ping/:address` - one reachability probe against an IP address
//!
//! Both are stateless and never touch the registry.

use crate::handlers::AppState;
use async_trait::async_trait;
use axum::{
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, StatusCode},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

/// Reachability probe errors.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The probe command could not be run.
    #[error("Failed to run ping: {0}")]
    Spawn(#[from] std::io::Error),

    /// The probe did not finish in time.
    #[error("Probe timed out")]
    TimedOut,
}

/// Checks whether an address answers.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Probe `address` once.
    async fn probe(&self, address: IpAddr) -> Result<bool, ProbeError>;
}

/// Probe using the platform `ping` command.
#[derive(Debug, Clone)]
pub struct SystemPing {
    timeout: Duration,
}

impl SystemPing {
    /// Create a probe that gives up after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn command(&self, address: IpAddr) -> Command {
        let mut cmd = Command::new("ping");
        let secs = self.timeout.as_secs().max(1).to_string();
        if cfg!(windows) {
            cmd.args(["-n", "1", "-w", &self.timeout.as_millis().to_string()]);
        } else if cfg!(target_os = "macos") {
            cmd.args(["-c", "1", "-t", &secs]);
        } else {
            cmd.args(["-c", "1", "-W", &secs]);
        }
        cmd.arg(address.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl ReachabilityProbe for SystemPing {
    async fn probe(&self, address: IpAddr) -> Result<bool, ProbeError> {
        let mut cmd = self.command(address);
        // Leave the command its own deadline plus a little slack.
        let limit = self.timeout + Duration::from_secs(1);
        let status = tokio::time::timeout(limit, cmd.status())
            .await
            .map_err(|_| ProbeError::TimedOut)??;
        debug!(address = %address, success = status.success(), "Ping finished");
        Ok(status.success())
    }
}

/// Response of `GET /ip`.
#[derive(Debug, Clone, Serialize)]
pub struct IpResponse {
    /// Non-loopback IPv4 addresses of this host.
    pub addresses: Vec<Ipv4Addr>,
    /// Address the request appears to come from.
    pub client: IpAddr,
}

/// Response of `GET /ping/:address`.
#[derive(Debug, Clone, Serialize)]
pub struct PingResponse {
    /// Address that was probed.
    pub address: IpAddr,
    /// Whether it answered before the timeout.
    pub reachable: bool,
}

/// Error body for the helper routes.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    /// Human-readable description.
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorBody {
            error: error.into(),
        }),
    )
}

/// Build the helper routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ip", get(ip_handler))
        .route("/ping/:address", get(ping_handler))
}

/// Report host addresses and the caller's apparent address.
pub async fn ip_handler(
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Json<IpResponse> {
    let addresses = match tokio::task::spawn_blocking(local_ipv4_addresses).await {
        Ok(addresses) => addresses,
        Err(e) => {
            warn!(error = %e, "Address discovery task failed");
            Vec::new()
        }
    };
    Json(IpResponse {
        addresses,
        client: client_address(&headers, remote),
    })
}

/// Probe a caller-supplied IP address.
pub async fn ping_handler(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> Result<Json<PingResponse>, ApiError> {
    let ip: IpAddr = address
        .trim()
        .parse()
        .map_err(|_| api_error(StatusCode::BAD_REQUEST, format!("Invalid IP address: {}", address)))?;

    match state.prober.probe(ip).await {
        Ok(reachable) => Ok(Json(PingResponse {
            address: ip,
            reachable,
        })),
        Err(ProbeError::TimedOut) => Ok(Json(PingResponse {
            address: ip,
            reachable: false,
        })),
        Err(e) => {
            warn!(address = %ip, error = %e, "Reachability probe failed");
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

/// The caller's address: first `X-Forwarded-For` hop if present and valid,
/// else the socket peer.
#[must_use]
pub fn client_address(headers: &HeaderMap, remote: SocketAddr) -> IpAddr {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
        .unwrap_or_else(|| remote.ip())
        .to_canonical()
}

/// Non-loopback IPv4 addresses of every interface on this host.
#[must_use]
pub fn local_ipv4_addresses() -> Vec<Ipv4Addr> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => external_ipv4(interfaces.iter().map(if_addrs::Interface::ip)),
        Err(e) => {
            warn!(error = %e, "Failed to list network interfaces");
            Vec::new()
        }
    }
}

/// Keep non-loopback, specified IPv4 addresses, first occurrence only.
fn external_ipv4(addresses: impl IntoIterator<Item = IpAddr>) -> Vec<Ipv4Addr> {
    let mut seen = HashSet::new();
    addresses
        .into_iter()
        .filter_map(|ip| match ip {
            IpAddr::V4(v4) if !v4.is_loopback() && !v4.is_unspecified() => Some(v4),
            _ => None,
        })
        .filter(|ip| seen.insert(*ip))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::http::HeaderValue;

    struct FixedProbe(Result<bool, fn() -> ProbeError>);

    #[async_trait]
    impl ReachabilityProbe for FixedProbe {
        async fn probe(&self, _address: IpAddr) -> Result<bool, ProbeError> {
            match &self.0 {
                Ok(reachable) => Ok(*reachable),
                Err(make) => Err(make()),
            }
        }
    }

    fn state_with(probe: FixedProbe) -> Arc<AppState> {
        Arc::new(AppState::with_prober(Config::default(), Arc::new(probe)))
    }

    #[test]
    fn test_client_address_prefers_forwarded_for() {
        let remote: SocketAddr = "10.0.0.5:4000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_address(&headers, remote), "10.0.0.5".parse::<IpAddr>().unwrap());

        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        assert_eq!(client_address(&headers, remote), "203.0.113.9".parse::<IpAddr>().unwrap());

        headers.insert("x-forwarded-for", HeaderValue::from_static("garbage"));
        assert_eq!(client_address(&headers, remote), "10.0.0.5".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_client_address_unmaps_ipv4() {
        let remote: SocketAddr = "[::ffff:192.0.2.1]:80".parse().unwrap();
        assert_eq!(
            client_address(&HeaderMap::new(), remote),
            "192.0.2.1".parse::<IpAddr>().unwrap()
        );
    }

    #[test]
    fn test_external_ipv4_keeps_every_interface() {
        let ips: Vec<IpAddr> = [
            "127.0.0.1",
            "192.168.1.20",
            "::1",
            "fe80::1",
            "100.101.102.103",
            "0.0.0.0",
            "10.8.0.2",
            "192.168.1.20",
        ]
        .iter()
        .map(|s| s.parse().unwrap())
        .collect();

        let expected: Vec<Ipv4Addr> = ["192.168.1.20", "100.101.102.103", "10.8.0.2"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        assert_eq!(external_ipv4(ips), expected);
    }

    #[test]
    fn test_local_addresses_match_interfaces() {
        let interfaces = if_addrs::get_if_addrs().unwrap();
        let expected = external_ipv4(interfaces.iter().map(if_addrs::Interface::ip));

        let found = local_ipv4_addresses();
        assert!(found.iter().all(|ip| !ip.is_loopback()));
        assert_eq!(found, expected);
    }

    #[tokio::test]
    async fn test_ping_reachable() {
        let state = state_with(FixedProbe(Ok(true)));
        let Json(body) = ping_handler(State(state), Path("100.64.0.1".into()))
            .await
            .unwrap();
        assert!(body.reachable);
        assert_eq!(body.address, "100.64.0.1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_ping_rejects_non_ip() {
        let state = state_with(FixedProbe(Ok(true)));
        let (status, Json(body)) = ping_handler(State(state), Path("-f 127.0.0.1".into()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.error.contains("Invalid IP address"));
    }

    #[tokio::test]
    async fn test_ping_timeout_is_unreachable() {
        let state = state_with(FixedProbe(Err(|| ProbeError::TimedOut)));
        let Json(body) = ping_handler(State(state), Path("192.0.2.10".into()))
            .await
            .unwrap();
        assert!(!body.reachable);
    }

    #[tokio::test]
    async fn test_ping_spawn_failure() {
        let state = state_with(FixedProbe(Err(|| {
            ProbeError::Spawn(std::io::Error::new(std::io::ErrorKind::NotFound, "no ping"))
        })));
        let (status, _) = ping_handler(State(state), Path("192.0.2.10".into()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_ip_handler_reports_client() {
        let remote: SocketAddr = "198.51.100.7:5555".parse().unwrap();
        let Json(body) = ip_handler(ConnectInfo(remote), HeaderMap::new()).await;
        assert_eq!(body.client, "198.51.100.7".parse::<IpAddr>().unwrap());
        assert!(body.addresses.iter().all(|ip| !ip.is_loopback()));
    }
}
