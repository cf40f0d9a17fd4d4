//! Worker trust bootstrap
//!
//! A joining worker has no CA to verify the cluster with. It fetches the
//! certificate a cluster member presents, checks it against the fingerprint
//! in the join token, and then talks to that member over a TLS connection
//! that trusts exactly that certificate and nothing else.

use crate::error::{Error, Result};
use async_trait::async_trait;
use k8sd_api::{
    GetWorkerJoinInfoRequest, GetWorkerJoinInfoResponse, Response, WORKER_INFO_PATH,
    WORKER_NAME_HEADER, WORKER_TOKEN_HEADER,
};
use k8sd_config::JoinToken;
use k8sd_crypto::der_fingerprint;
use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use rustls::client::{ServerCertVerified, ServerCertVerifier};
use rustls::{Certificate, ClientConfig, ServerName};
use std::net::{IpAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

/// Connections to other cluster members during a worker join
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// DER certificate presented by `address`, without verifying it
    async fn fetch_certificate(&self, address: &str) -> Result<Vec<u8>>;

    /// Ask `address` for worker join information over a connection pinned to
    /// `pinned_der`
    async fn request_join_info(
        &self,
        address: &str,
        pinned_der: &[u8],
        request: &GetWorkerJoinInfoRequest,
        worker_name: &str,
        secret: &str,
    ) -> Result<GetWorkerJoinInfoResponse>;
}

/// Find a reachable member, verify it against the token fingerprint and
/// retrieve the join information from it.
///
/// Addresses are tried in token order; the first member that presents a
/// certificate is used. A fingerprint mismatch is fatal.
pub async fn trust_bootstrap(
    transport: &dyn PeerTransport,
    token: &JoinToken,
    node_name: &str,
    node_ip: IpAddr,
) -> Result<GetWorkerJoinInfoResponse> {
    if token.join_addresses.is_empty() {
        return Err(Error::InvalidToken(
            "empty list of control plane addresses".to_string(),
        ));
    }

    let mut failures = Vec::new();
    let mut peer = None;
    for address in &token.join_addresses {
        match transport.fetch_certificate(address).await {
            Ok(der) => {
                peer = Some((address, der));
                break;
            }
            Err(e) => {
                warn!(%address, error = %e, "Cluster member unreachable");
                failures.push(format!("{address}: {e}"));
            }
        }
    }
    let Some((address, der)) = peer else {
        return Err(Error::NoReachablePeer(failures.join("; ")));
    };

    let actual = der_fingerprint(&der);
    if actual != token.fingerprint {
        return Err(Error::FingerprintMismatch {
            address: address.clone(),
            expected: token.fingerprint.clone(),
            actual,
        });
    }
    info!(%address, "Verified cluster member certificate");

    let request = GetWorkerJoinInfoRequest {
        address: node_ip.to_string(),
    };
    transport
        .request_join_info(address, &der, &request, node_name, &token.secret)
        .await
}

/// Accepts the server only if it presents exactly the pinned certificate
struct PinnedCertVerifier {
    pinned: Vec<u8>,
}

impl ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        if end_entity.0 == self.pinned {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "server certificate does not match the pinned certificate".to_string(),
            ))
        }
    }
}

fn pinned_tls_config(pinned_der: &[u8]) -> ClientConfig {
    ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier {
            pinned: pinned_der.to_vec(),
        }))
        .with_no_client_auth()
}

/// HTTPS transport to other cluster members
pub struct HttpsPeerTransport {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl HttpsPeerTransport {
    /// Create a transport with the given TCP connect and HTTP request timeouts
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }
}

impl Default for HttpsPeerTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(30))
    }
}

fn host_of(address: &str) -> &str {
    let host = address.rsplit_once(':').map_or(address, |(host, _)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}

fn fetch_peer_certificate(address: &str, timeout: Duration) -> Result<Vec<u8>> {
    let socket_addr = address
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::NoReachablePeer(format!("{address} did not resolve")))?;
    let stream = TcpStream::connect_timeout(&socket_addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let crypto = |e: openssl::error::ErrorStack| Error::Crypto(e.to_string());
    let mut builder = SslConnector::builder(SslMethod::tls_client()).map_err(crypto)?;
    builder.set_verify(SslVerifyMode::NONE);
    let mut config = builder.build().configure().map_err(crypto)?;
    config.set_verify_hostname(false);

    let tls = config
        .connect(host_of(address), stream)
        .map_err(|e| Error::NoReachablePeer(format!("TLS handshake with {address} failed: {e}")))?;
    let cert = tls
        .ssl()
        .peer_certificate()
        .ok_or_else(|| Error::NoReachablePeer(format!("{address} presented no certificate")))?;
    cert.to_der().map_err(crypto)
}

#[async_trait]
impl PeerTransport for HttpsPeerTransport {
    async fn fetch_certificate(&self, address: &str) -> Result<Vec<u8>> {
        let address = address.to_string();
        let timeout = self.connect_timeout;
        tokio::task::spawn_blocking(move || fetch_peer_certificate(&address, timeout))
            .await
            .map_err(|e| Error::Task(e.to_string()))?
    }

    async fn request_join_info(
        &self,
        address: &str,
        pinned_der: &[u8],
        request: &GetWorkerJoinInfoRequest,
        worker_name: &str,
        secret: &str,
    ) -> Result<GetWorkerJoinInfoResponse> {
        let failed = |e: reqwest::Error| Error::JoinRequestFailed(e.to_string());
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(pinned_tls_config(pinned_der))
            .timeout(self.request_timeout)
            .build()
            .map_err(failed)?;

        let response = client
            .post(format!("https://{address}{WORKER_INFO_PATH}"))
            .header(WORKER_NAME_HEADER, worker_name)
            .header(WORKER_TOKEN_HEADER, secret)
            .json(request)
            .send()
            .await
            .map_err(failed)?;

        let status = response.status();
        let body = response.bytes().await.map_err(failed)?;
        let envelope = serde_json::from_slice::<Response<GetWorkerJoinInfoResponse>>(&body);

        match envelope {
            Ok(envelope) if status == reqwest::StatusCode::OK && envelope.error.is_empty() => {
                Ok(envelope.metadata)
            }
            Ok(envelope) => Err(Error::JoinRequestFailed(format!(
                "{address} responded with {status}: {}",
                envelope.error
            ))),
            Err(e) => Err(Error::JoinRequestFailed(format!(
                "{address} responded with {status} and an undecodable body: {e}"
            ))),
        }
    }
}
