//! In-memory stand-ins for the host, the cluster and its members

use crate::error::{Error, Result};
use crate::join::PeerTransport;
use crate::kube_client::{ClusterApi, CsrUpdateFn};
use crate::snap::{KubeconfigKind, NodeRole, Snap, SnapPaths};
use crate::store::ClusterStore;
use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition, CertificateSigningRequestStatus,
};
use k8s_openapi::ByteString;
use k8sd_api::{GetWorkerJoinInfoRequest, GetWorkerJoinInfoResponse};
use k8sd_config::ClusterConfig;
use k8sd_crypto::CertificateAuthority;
use openssl::asn1::Asn1Time;
use openssl::bn::BigNum;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::x509::{X509Req, X509};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::TempDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrOutcome {
    Approve,
    Deny,
    Fail,
    /// Never reaches a terminal state
    Hang,
    /// Approved with bytes that are not a certificate
    Garbage,
    AlreadyExists,
}

/// API server with a built-in signer that decides per CSR name
pub struct FakeClusterApi {
    ca_cert: String,
    ca_key: String,
    serial: AtomicU32,
    outcomes: Mutex<HashMap<String, CsrOutcome>>,
    created: Mutex<Vec<CertificateSigningRequest>>,
    endpoints: Mutex<Vec<String>>,
}

impl FakeClusterApi {
    pub const VALIDITY_DAYS: u64 = 365;

    pub fn new() -> Self {
        let ca = CertificateAuthority::generate_root_ca("fake-cluster-ca", 3650).unwrap();
        Self {
            ca_cert: ca.ca_cert_pem().to_string(),
            ca_key: ca.ca_key_pem(),
            serial: AtomicU32::new(1),
            outcomes: Mutex::new(HashMap::new()),
            created: Mutex::new(Vec::new()),
            endpoints: Mutex::new(Vec::new()),
        }
    }

    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert
    }

    pub fn set_outcome(&self, name: &str, outcome: CsrOutcome) {
        self.outcomes.lock().unwrap().insert(name.to_string(), outcome);
    }

    pub fn set_endpoints(&self, endpoints: Vec<String>) {
        *self.endpoints.lock().unwrap() = endpoints;
    }

    pub fn created(&self) -> Vec<CertificateSigningRequest> {
        self.created.lock().unwrap().clone()
    }

    fn outcome(&self, name: &str) -> CsrOutcome {
        self.outcomes
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(CsrOutcome::Approve)
    }

    fn sign(&self, request: &[u8]) -> String {
        let req = X509Req::from_pem(request).unwrap();
        let ca_cert = X509::from_pem(self.ca_cert.as_bytes()).unwrap();
        let ca_key = PKey::private_key_from_pem(self.ca_key.as_bytes()).unwrap();
        let now = i64::try_from(SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()).unwrap();
        let validity = i64::try_from(Self::VALIDITY_DAYS * 86400).unwrap();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        let serial = BigNum::from_u32(self.serial.fetch_add(1, Ordering::SeqCst))
            .unwrap()
            .to_asn1_integer()
            .unwrap();
        builder.set_serial_number(&serial).unwrap();
        builder.set_subject_name(req.subject_name()).unwrap();
        builder.set_issuer_name(ca_cert.subject_name()).unwrap();
        builder.set_pubkey(&req.public_key().unwrap()).unwrap();
        builder.set_not_before(&Asn1Time::from_unix(now).unwrap()).unwrap();
        builder.set_not_after(&Asn1Time::from_unix(now + validity).unwrap()).unwrap();
        builder.sign(&ca_key, MessageDigest::sha256()).unwrap();
        String::from_utf8(builder.build().to_pem().unwrap()).unwrap()
    }
}

fn condition(type_: &str, reason: &str) -> CertificateSigningRequestCondition {
    CertificateSigningRequestCondition {
        type_: type_.to_string(),
        status: "True".to_string(),
        reason: Some(reason.to_string()),
        ..Default::default()
    }
}

fn with_status(
    csr: &CertificateSigningRequest,
    condition: CertificateSigningRequestCondition,
    certificate: Option<Vec<u8>>,
) -> CertificateSigningRequest {
    let mut updated = csr.clone();
    updated.status = Some(CertificateSigningRequestStatus {
        conditions: Some(vec![condition]),
        certificate: certificate.map(ByteString),
    });
    updated
}

#[async_trait]
impl ClusterApi for FakeClusterApi {
    async fn list_endpoints(&self) -> Result<Vec<String>> {
        let endpoints = self.endpoints.lock().unwrap().clone();
        if endpoints.is_empty() {
            return Err(Error::NoEndpoints);
        }
        Ok(endpoints)
    }

    async fn create_csr(&self, csr: &CertificateSigningRequest) -> Result<()> {
        let name = csr.metadata.name.clone().unwrap_or_default();
        let mut created = self.created.lock().unwrap();
        let exists = created.iter().any(|c| c.metadata.name.as_deref() == Some(name.as_str()));
        if exists || self.outcome(&name) == CsrOutcome::AlreadyExists {
            return Err(Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: format!("certificatesigningrequests {name:?} already exists"),
                reason: "AlreadyExists".to_string(),
                code: 409,
            })));
        }
        created.push(csr.clone());
        Ok(())
    }

    async fn watch_csr(&self, name: &str, on_update: &mut CsrUpdateFn<'_>) -> Result<()> {
        let csr = self
            .created
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.metadata.name.as_deref() == Some(name))
            .cloned()
            .ok_or_else(|| Error::Watch(format!("CSR {name} not found")))?;

        if on_update(&csr)? {
            return Ok(());
        }

        let updates = match self.outcome(name) {
            CsrOutcome::Approve => vec![
                with_status(&csr, condition("Approved", "AutoApproved"), None),
                with_status(
                    &csr,
                    condition("Approved", "AutoApproved"),
                    Some(self.sign(&csr.spec.request.0).into_bytes()),
                ),
            ],
            CsrOutcome::Garbage => vec![with_status(
                &csr,
                condition("Approved", "AutoApproved"),
                Some(b"garbage".to_vec()),
            )],
            CsrOutcome::Deny => vec![with_status(&csr, condition("Denied", "NotAllowed"), None)],
            CsrOutcome::Fail => vec![with_status(&csr, condition("Failed", "SignerError"), None)],
            CsrOutcome::Hang | CsrOutcome::AlreadyExists => {
                std::future::pending::<()>().await;
                Vec::new()
            }
        };

        for update in updates {
            if on_update(&update)? {
                return Ok(());
            }
        }
        Err(Error::Watch(format!("watch of CSR {name} ended")))
    }
}

/// Snap rooted in a temporary directory that records service calls
pub struct FakeSnap {
    _dir: TempDir,
    paths: SnapPaths,
    api: Arc<FakeClusterApi>,
    started: Mutex<Vec<String>>,
    restarted: Mutex<Vec<String>>,
    settings: Mutex<BTreeMap<String, String>>,
}

impl FakeSnap {
    pub fn new(api: Arc<FakeClusterApi>) -> Self {
        let dir = TempDir::new().unwrap();
        let paths = SnapPaths::new(dir.path().join("snap"), dir.path().join("common"));
        Self {
            _dir: dir,
            paths,
            api,
            started: Mutex::new(Vec::new()),
            restarted: Mutex::new(Vec::new()),
            settings: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn restarted(&self) -> Vec<String> {
        self.restarted.lock().unwrap().clone()
    }

    pub fn snap_settings(&self) -> BTreeMap<String, String> {
        self.settings.lock().unwrap().clone()
    }
}

#[async_trait]
impl Snap for FakeSnap {
    fn paths(&self) -> &SnapPaths {
        &self.paths
    }

    fn hostname(&self) -> &str {
        "worker-1"
    }

    async fn start_service(&self, name: &str) -> Result<()> {
        self.started.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn restart_service(&self, name: &str) -> Result<()> {
        self.restarted.lock().unwrap().push(name.to_string());
        Ok(())
    }

    async fn snapctl_set(&self, settings: &BTreeMap<String, String>) -> Result<()> {
        self.settings.lock().unwrap().extend(settings.clone());
        Ok(())
    }

    async fn pre_init_checks(&self, _config: &ClusterConfig, _role: NodeRole) -> Result<()> {
        Ok(())
    }

    async fn kubernetes_client(&self, _kind: KubeconfigKind) -> Result<Arc<dyn ClusterApi>> {
        Ok(self.api.clone())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    config: Mutex<ClusterConfig>,
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn get_cluster_config(&self) -> Result<ClusterConfig> {
        Ok(self.config.lock().unwrap().clone())
    }

    async fn set_cluster_config(&self, config: &ClusterConfig) -> Result<ClusterConfig> {
        let mut stored = self.config.lock().unwrap();
        *stored = stored.merge(config)?;
        Ok(stored.clone())
    }
}

/// A join request as the cluster member saw it
#[derive(Debug, Clone)]
pub struct JoinRecord {
    pub address: String,
    pub pinned: Vec<u8>,
    pub worker_name: String,
    pub secret: String,
    pub node_address: String,
}

/// Cluster members keyed by address, each presenting a fixed certificate
pub struct FakeTransport {
    peers: Mutex<HashMap<String, Vec<u8>>>,
    response: Mutex<GetWorkerJoinInfoResponse>,
    hang: AtomicBool,
    calls: AtomicUsize,
    joins: Mutex<Vec<JoinRecord>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            response: Mutex::new(GetWorkerJoinInfoResponse {
                ca_cert: "CA".to_string(),
                ..Default::default()
            }),
            hang: AtomicBool::new(false),
            calls: AtomicUsize::new(0),
            joins: Mutex::new(Vec::new()),
        }
    }

    pub fn add_peer(&self, address: &str, der: &[u8]) {
        self.peers.lock().unwrap().insert(address.to_string(), der.to_vec());
    }

    pub fn set_response(&self, response: GetWorkerJoinInfoResponse) {
        *self.response.lock().unwrap() = response;
    }

    /// Make every certificate fetch block forever
    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn join_requests(&self) -> Vec<JoinRecord> {
        self.joins.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn fetch_certificate(&self, address: &str) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.peers
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .ok_or_else(|| Error::NoReachablePeer(format!("{address} refused the connection")))
    }

    async fn request_join_info(
        &self,
        address: &str,
        pinned_der: &[u8],
        request: &GetWorkerJoinInfoRequest,
        worker_name: &str,
        secret: &str,
    ) -> Result<GetWorkerJoinInfoResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.joins.lock().unwrap().push(JoinRecord {
            address: address.to_string(),
            pinned: pinned_der.to_vec(),
            worker_name: worker_name.to_string(),
            secret: secret.to_string(),
            node_address: request.address.clone(),
        });
        Ok(self.response.lock().unwrap().clone())
    }
}
