//! Certificate store for OCPP 2.1's security extensions
//! (`SignCertificate`/`InstallCertificate`/`DeleteCertificate`/
//! `GetInstalledCertificateIds`).
//!
//! A real station would hold an actual keypair and talk to a TLS stack;
//! this emulator only needs to track fingerprints and lifecycle so it can
//! answer CSMS certificate-management calls plausibly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CertificateType {
    ChargingStation,
    Csms,
    ManufacturerRootCa,
    V2gRootCa,
    MoRootCa,
    OemRootCa,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertHashData {
    pub hash_algorithm: String,
    pub issuer_name_hash: String,
    pub issuer_key_hash: String,
    pub serial_number: String,
}

impl CertHashData {
    /// Derive a deterministic, plausible fingerprint triple from raw
    /// bytes the station would otherwise extract from a real X.509
    /// certificate.
    pub fn from_der(der: &[u8], serial_number: impl Into<String>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(der);
        let digest = hasher.finalize();
        let hex_digest = hex::encode(digest);
        Self {
            hash_algorithm: "SHA256".to_string(),
            issuer_name_hash: hex_digest[..32].to_string(),
            issuer_key_hash: hex_digest[32..].to_string(),
            serial_number: serial_number.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateEntry {
    pub certificate_type: CertificateType,
    pub hash_data: CertHashData,
    pub installed_at: DateTime<Utc>,
}

/// Per-station certificate inventory plus pending-CSR tracking.
pub struct CertificateStore {
    installed: dashmap::DashMap<String, CertificateEntry>,
    pending_csr: dashmap::DashMap<String, DateTime<Utc>>,
}

impl CertificateStore {
    pub fn new() -> Self {
        Self {
            installed: dashmap::DashMap::new(),
            pending_csr: dashmap::DashMap::new(),
        }
    }

    /// Generate a CSR fingerprint key for a `SignCertificate` request and
    /// record it as pending until the matching `CertificateSigned` call
    /// arrives.
    pub fn begin_csr(&self, typed_name: impl Into<String>) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let _ = typed_name.into();
        self.pending_csr.insert(id.clone(), Utc::now());
        id
    }

    pub fn is_csr_pending(&self, csr_id: &str) -> bool {
        self.pending_csr.contains_key(csr_id)
    }

    pub fn install(&self, fingerprint: String, entry: CertificateEntry) {
        self.installed.insert(fingerprint, entry);
    }

    pub fn delete(&self, fingerprint: &str) -> bool {
        self.installed.remove(fingerprint).is_some()
    }

    pub fn list(&self, of_type: Option<CertificateType>) -> Vec<CertificateEntry> {
        self.installed
            .iter()
            .filter(|e| of_type.map(|t| t == e.value().certificate_type).unwrap_or(true))
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.installed.len()
    }
}

impl Default for CertificateStore {
    fn default() -> Self {
        Self::new()
    }
}
