//! `certificates` relation wire format (tls-certificates v3 shape)
//!
//! The requirer lists its CSRs in its unit databag; the provider answers
//! with a `certificates` list in its application databag. Key material
//! for this unit is staged in our own application databag on the same
//! relation.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::platform::DatabagContent;

/// Relation endpoint name
pub const CERTIFICATES_RELATION: &str = "certificates";

pub const REQUESTS_KEY: &str = "certificate_signing_requests";
pub const CERTIFICATES_KEY: &str = "certificates";

pub const PRIVATE_KEY_KEY: &str = "private_key";
pub const CSR_KEY: &str = "csr";
pub const CERTIFICATE_KEY: &str = "certificate";
pub const CA_KEY: &str = "ca";
pub const CHAIN_KEY: &str = "chain";

/// One entry of the requirer's request list
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRequest {
    pub certificate_signing_request: String,
    #[serde(default)]
    pub ca: bool,
}

impl CertificateRequest {
    pub fn server(csr: impl Into<String>) -> Self {
        Self {
            certificate_signing_request: csr.into(),
            ca: false,
        }
    }
}

/// One entry of the provider's `certificates` list
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCertificate {
    pub certificate: String,
    pub certificate_signing_request: String,
    pub ca: String,
    #[serde(default)]
    pub chain: Vec<String>,
    #[serde(default)]
    pub revoked: bool,
}

impl ProviderCertificate {
    /// Whether this certificate answers `csr`
    pub fn answers(&self, csr: &str) -> bool {
        same_pem(&self.certificate_signing_request, csr)
    }
}

/// PEM comparison ignoring surrounding whitespace
pub fn same_pem(a: &str, b: &str) -> bool {
    a.trim() == b.trim()
}

/// Decode the request list from a unit databag; absent means none
pub fn read_requests(bag: &DatabagContent) -> Result<Vec<CertificateRequest>> {
    match bag.get(REQUESTS_KEY) {
        None => Ok(Vec::new()),
        Some(raw) if raw.is_empty() => Ok(Vec::new()),
        Some(raw) => serde_json::from_str(raw).map_err(|e| {
            Error::RelationDataError(format!("{REQUESTS_KEY} is not valid JSON: {e}"))
        }),
    }
}

/// Encode the request list for a unit databag
pub fn write_requests(requests: &[CertificateRequest]) -> Result<DatabagContent> {
    let mut bag = DatabagContent::new();
    bag.insert(REQUESTS_KEY.to_string(), serde_json::to_string(requests)?);
    Ok(bag)
}

/// Decode the provider's certificate list; absent means none issued yet
pub fn read_provider_certificates(bag: &DatabagContent) -> Result<Vec<ProviderCertificate>> {
    match bag.get(CERTIFICATES_KEY) {
        None => Ok(Vec::new()),
        Some(raw) if raw.is_empty() => Ok(Vec::new()),
        Some(raw) => serde_json::from_str(raw).map_err(|e| {
            Error::RelationDataError(format!("{CERTIFICATES_KEY} is not valid JSON: {e}"))
        }),
    }
}

/// Key material staged for this application
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CertificateMaterial {
    pub private_key: Option<String>,
    pub csr: Option<String>,
    pub certificate: Option<String>,
    pub ca: Option<String>,
    pub chain: Option<Vec<String>>,
}

impl CertificateMaterial {
    pub fn from_databag(bag: &DatabagContent) -> Result<Self> {
        let get = |key: &str| bag.get(key).filter(|v| !v.is_empty()).cloned();
        let chain = match get(CHAIN_KEY) {
            Some(raw) => Some(serde_json::from_str(&raw).map_err(|e| {
                Error::RelationDataError(format!("{CHAIN_KEY} is not valid JSON: {e}"))
            })?),
            None => None,
        };
        Ok(Self {
            private_key: get(PRIVATE_KEY_KEY),
            csr: get(CSR_KEY),
            certificate: get(CERTIFICATE_KEY),
            ca: get(CA_KEY),
            chain,
        })
    }

    /// Databag update for the fields that are set
    pub fn to_databag(&self) -> Result<DatabagContent> {
        let mut bag = DatabagContent::new();
        let mut put = |key: &str, value: &Option<String>| {
            if let Some(v) = value {
                bag.insert(key.to_string(), v.clone());
            }
        };
        put(PRIVATE_KEY_KEY, &self.private_key);
        put(CSR_KEY, &self.csr);
        put(CERTIFICATE_KEY, &self.certificate);
        put(CA_KEY, &self.ca);
        if let Some(chain) = &self.chain {
            bag.insert(CHAIN_KEY.to_string(), serde_json::to_string(chain)?);
        }
        Ok(bag)
    }

    /// Databag update removing the issued certificate, CA and chain
    pub fn purge_issued() -> DatabagContent {
        [CERTIFICATE_KEY, CA_KEY, CHAIN_KEY]
            .into_iter()
            .map(|key| (key.to_string(), String::new()))
            .collect()
    }
}
