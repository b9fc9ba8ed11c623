//! Relation data formats

pub mod cluster;
pub mod tls;

pub use cluster::{EndpointSet, CLUSTER_RELATION, INTERFACE_VERSION};
pub use tls::{
    CertificateMaterial, CertificateRequest, ProviderCertificate, CERTIFICATES_RELATION,
};
