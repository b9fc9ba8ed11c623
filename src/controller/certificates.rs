//! Server certificate lifecycle over the `certificates` relation
//!
//! Key material is staged in this application's databag on the
//! `certificates` relation, which only the leader may read or write, so
//! every step below is a no-op on other units.

use chrono::Utc;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tracing::{debug, info, instrument, warn};
use x509_parser::pem::parse_x509_pem;

use super::context::ControllerState;
use super::status::{
    update_unit_status, MSG_WAITING_FOR_CERTIFICATE, MSG_WAITING_FOR_PEBBLE,
    MSG_WAITING_FOR_RELATION,
};
use crate::consul::TlsPaths;
use crate::error::{Error, Result};
use crate::platform::{Databag, RelationId, Status};
use crate::relation::tls::{read_provider_certificates, read_requests, same_pem, write_requests};
use crate::relation::{
    CertificateMaterial, CertificateRequest, ProviderCertificate, CERTIFICATES_RELATION,
};

/// A certificate this close to `notAfter` is renewed
pub const EXPIRY_NOTIFICATION_SECS: i64 = 7 * 24 * 60 * 60;

/// Whether a handler finished or must be redelivered later
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Done,
    Deferred,
}

/// Why a previously issued certificate is no longer usable
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvalidationReason {
    Expired,
    Revoked,
}

/// Generate an ECDSA P-256 private key as PKCS#8 PEM
pub fn generate_private_key() -> Result<String> {
    Ok(KeyPair::generate()?.serialize_pem())
}

/// Generate a CSR for `subject`, signed by `private_key_pem`
pub fn generate_csr(private_key_pem: &str, subject: &str) -> Result<String> {
    let key = KeyPair::from_pem(private_key_pem)?;
    let mut params = CertificateParams::new(vec![subject.to_string()])?;
    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, subject);
    params.distinguished_name = name;
    Ok(params.serialize_request(&key)?.pem()?)
}

/// `notAfter` of a PEM certificate as a unix timestamp
pub fn not_after(certificate_pem: &str) -> Result<i64> {
    let (_, pem) = parse_x509_pem(certificate_pem.as_bytes())
        .map_err(|e| Error::CertificateError(format!("invalid PEM: {e}")))?;
    let certificate = pem
        .parse_x509()
        .map_err(|e| Error::CertificateError(format!("invalid certificate: {e}")))?;
    Ok(certificate.validity().not_after.timestamp())
}

/// Subject the server certificate is requested for
pub fn certificate_subject(datacenter: &str) -> String {
    format!("server.{datacenter}.consul")
}

pub struct CertificateLifecycle<'a> {
    state: &'a ControllerState,
    tls_paths: TlsPaths,
}

impl<'a> CertificateLifecycle<'a> {
    pub fn new(state: &'a ControllerState) -> Self {
        Self {
            state,
            tls_paths: TlsPaths::default(),
        }
    }

    async fn relation(&self) -> Result<Option<RelationId>> {
        Ok(self
            .state
            .model
            .relation_ids(CERTIFICATES_RELATION)
            .await?
            .into_iter()
            .next())
    }

    /// The relation, or a waiting status and deferral when it is missing
    async fn require_relation(&self) -> Result<Option<RelationId>> {
        match self.relation().await? {
            Some(relation) => Ok(Some(relation)),
            None => {
                update_unit_status(self.state, &Status::waiting(MSG_WAITING_FOR_RELATION)).await?;
                Ok(None)
            }
        }
    }

    async fn material(&self, relation: &RelationId) -> Result<CertificateMaterial> {
        let bag = self
            .state
            .model
            .relation_get(relation, Databag::LocalApp)
            .await?;
        CertificateMaterial::from_databag(&bag)
    }

    async fn stage(&self, relation: &RelationId, material: &CertificateMaterial) -> Result<()> {
        if !self.state.model.is_leader().await? {
            warn!("Lost leadership, not staging certificate material");
            return Ok(());
        }
        self.state
            .model
            .relation_set(relation, Databag::LocalApp, &material.to_databag()?)
            .await
    }

    async fn subject(&self) -> Result<String> {
        let config = self.state.model.config().await?;
        Ok(certificate_subject(&config.datacenter))
    }

    /// Make sure a private key is staged; returns it
    async fn ensure_private_key(&self, relation: &RelationId) -> Result<String> {
        if let Some(key) = self.material(relation).await?.private_key {
            return Ok(key);
        }
        let key = generate_private_key()?;
        self.stage(
            relation,
            &CertificateMaterial {
                private_key: Some(key.clone()),
                ..Default::default()
            },
        )
        .await?;
        info!("Generated private key");
        Ok(key)
    }

    /// `install`: generate and stage the private key
    #[instrument(skip(self))]
    pub async fn on_install(&self) -> Result<Outcome> {
        let Some(relation) = self.require_relation().await? else {
            return Ok(Outcome::Deferred);
        };
        if !self.state.model.is_leader().await? {
            debug!("Not leader, key material is managed by the leader");
            return Ok(Outcome::Done);
        }
        self.ensure_private_key(&relation).await?;
        Ok(Outcome::Done)
    }

    /// `certificates-relation-created`: stage a CSR and request a certificate
    #[instrument(skip(self))]
    pub async fn on_relation_created(&self) -> Result<Outcome> {
        let Some(relation) = self.require_relation().await? else {
            return Ok(Outcome::Deferred);
        };
        if !self.state.model.is_leader().await? {
            return Ok(Outcome::Done);
        }

        let key = self.ensure_private_key(&relation).await?;
        let csr = generate_csr(&key, &self.subject().await?)?;
        self.stage(
            &relation,
            &CertificateMaterial {
                csr: Some(csr.clone()),
                ..Default::default()
            },
        )
        .await?;
        self.request_certificate(&relation, None, &csr).await?;
        info!("Requested server certificate");
        Ok(Outcome::Done)
    }

    /// Add `new_csr` to the request list, replacing `old_csr` if given
    async fn request_certificate(
        &self,
        relation: &RelationId,
        old_csr: Option<&str>,
        new_csr: &str,
    ) -> Result<()> {
        let bag = self
            .state
            .model
            .relation_get(relation, Databag::LocalUnit)
            .await?;
        let mut requests: Vec<CertificateRequest> = read_requests(&bag)?
            .into_iter()
            .filter(|r| !old_csr.is_some_and(|old| same_pem(&r.certificate_signing_request, old)))
            .collect();

        if !requests
            .iter()
            .any(|r| same_pem(&r.certificate_signing_request, new_csr))
        {
            requests.push(CertificateRequest::server(new_csr));
        }

        self.state
            .model
            .relation_set(relation, Databag::LocalUnit, &write_requests(&requests)?)
            .await
    }

    /// The provider's answer to the currently staged CSR, if any
    async fn current_certificate(
        &self,
        relation: &RelationId,
        material: &CertificateMaterial,
    ) -> Result<Option<ProviderCertificate>> {
        let Some(csr) = &material.csr else {
            return Ok(None);
        };
        let bag = self
            .state
            .model
            .relation_get(relation, Databag::RemoteApp)
            .await?;
        Ok(read_provider_certificates(&bag)?
            .into_iter()
            .find(|c| c.answers(csr)))
    }

    /// `certificates-relation-changed`: react to the provider's answer
    #[instrument(skip(self))]
    pub async fn on_relation_changed(&self) -> Result<Outcome> {
        let Some(relation) = self.require_relation().await? else {
            return Ok(Outcome::Deferred);
        };
        if !self.state.model.is_leader().await? {
            return Ok(Outcome::Done);
        }

        let material = self.material(&relation).await?;
        let Some(issued) = self.current_certificate(&relation, &material).await? else {
            debug!("No certificate issued for the current CSR yet");
            return Ok(Outcome::Done);
        };

        if issued.revoked {
            self.on_invalidated(&relation, &material, InvalidationReason::Revoked)
                .await?;
            return Ok(Outcome::Done);
        }

        let already_installed = material
            .certificate
            .as_deref()
            .is_some_and(|c| same_pem(c, &issued.certificate));
        if !already_installed {
            let outcome = self.on_certificate_available(&relation, &material, &issued).await?;
            if outcome == Outcome::Deferred {
                return Ok(outcome);
            }
        }

        self.check_expiry_of(&relation, &material, &issued, Utc::now().timestamp())
            .await?;
        Ok(Outcome::Done)
    }

    /// Install the issued certificate into the workload
    async fn on_certificate_available(
        &self,
        relation: &RelationId,
        material: &CertificateMaterial,
        issued: &ProviderCertificate,
    ) -> Result<Outcome> {
        let Some(private_key) = &material.private_key else {
            return Err(Error::CertificateError(
                "certificate issued but no private key is staged".to_string(),
            ));
        };
        if !self.state.workload.can_connect().await {
            update_unit_status(self.state, &Status::waiting(MSG_WAITING_FOR_PEBBLE)).await?;
            return Ok(Outcome::Deferred);
        }

        let workload = &self.state.workload;
        workload
            .push(&self.tls_paths.server_certificate_path, &issued.certificate)
            .await?;
        workload
            .push(&self.tls_paths.server_key_path, private_key)
            .await?;
        workload
            .push(&self.tls_paths.ca_certificate_path, &issued.ca)
            .await?;

        self.stage(
            relation,
            &CertificateMaterial {
                certificate: Some(issued.certificate.clone()),
                ca: Some(issued.ca.clone()),
                chain: Some(issued.chain.clone()),
                ..Default::default()
            },
        )
        .await?;
        info!("Server certificate installed");
        update_unit_status(self.state, &Status::active()).await?;
        Ok(Outcome::Done)
    }

    /// `update-status`: renew when the installed certificate is close to
    /// or past `notAfter`
    #[instrument(skip(self))]
    pub async fn check_expiry(&self) -> Result<()> {
        self.check_expiry_at(Utc::now().timestamp()).await
    }

    pub async fn check_expiry_at(&self, now: i64) -> Result<()> {
        let Some(relation) = self.relation().await? else {
            return Ok(());
        };
        if !self.state.model.is_leader().await? {
            return Ok(());
        }
        let material = self.material(&relation).await?;
        if let Some(issued) = self.current_certificate(&relation, &material).await? {
            self.check_expiry_of(&relation, &material, &issued, now)
                .await?;
        }
        Ok(())
    }

    async fn check_expiry_of(
        &self,
        relation: &RelationId,
        material: &CertificateMaterial,
        issued: &ProviderCertificate,
        now: i64,
    ) -> Result<()> {
        let expires_at = match not_after(&issued.certificate) {
            Ok(ts) => ts,
            Err(e) => {
                warn!("Cannot read certificate expiry: {}", e);
                return Ok(());
            }
        };

        if now >= expires_at {
            info!("Server certificate expired");
            self.on_invalidated(relation, material, InvalidationReason::Expired)
                .await
        } else if expires_at - now <= EXPIRY_NOTIFICATION_SECS {
            info!("Server certificate expires in {}s", expires_at - now);
            self.renew(relation, material).await
        } else {
            Ok(())
        }
    }

    /// Request a fresh certificate for the same key
    async fn renew(&self, relation: &RelationId, material: &CertificateMaterial) -> Result<()> {
        let Some(private_key) = &material.private_key else {
            return Err(Error::CertificateError(
                "cannot renew without a staged private key".to_string(),
            ));
        };
        let new_csr = generate_csr(private_key, &self.subject().await?)?;
        self.request_certificate(relation, material.csr.as_deref(), &new_csr)
            .await?;
        self.stage(
            relation,
            &CertificateMaterial {
                csr: Some(new_csr),
                ..Default::default()
            },
        )
        .await?;
        info!("Requested certificate renewal");
        Ok(())
    }

    async fn on_invalidated(
        &self,
        relation: &RelationId,
        material: &CertificateMaterial,
        reason: InvalidationReason,
    ) -> Result<()> {
        self.renew(relation, material).await?;
        if reason == InvalidationReason::Revoked {
            if self.state.model.is_leader().await? {
                self.state
                    .model
                    .relation_set(
                        relation,
                        Databag::LocalApp,
                        &CertificateMaterial::purge_issued(),
                    )
                    .await?;
            }
            update_unit_status(self.state, &Status::waiting(MSG_WAITING_FOR_CERTIFICATE))
                .await?;
        }
        Ok(())
    }

    /// `certificates-relation-broken`: every certificate is gone
    pub async fn on_all_invalidated(&self) -> Result<()> {
        info!("All certificates invalidated");
        Ok(())
    }
}
