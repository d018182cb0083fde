//! Path validation of issued certificates.

use chrono::{DateTime, Utc};
use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::X509StoreContext;

use crate::api::template::CertificateTemplate;
use crate::commons::CustodyResult;
use crate::commons::crypto::cert::Certificate;
use crate::commons::error::Error;


//------------ ChainVerifier -------------------------------------------------

/// Verifies a `[leaf, intermediates…, root]` chain.
///
/// Any failure is a [`Error::ChainValidation`]: it means the hierarchy is
/// misconfigured or something was tampered with, so it is never retried.
pub struct ChainVerifier<'a> {
    anchors: &'a [Certificate],
}

impl<'a> ChainVerifier<'a> {
    pub fn new(anchors: &'a [Certificate]) -> Self {
        ChainVerifier { anchors }
    }

    /// Standard path validation plus the checks the template demands.
    pub fn verify(
        &self,
        chain: &[Certificate],
        template: Option<&CertificateTemplate>,
        now: DateTime<Utc>,
    ) -> CustodyResult<()> {
        let (leaf, rest) = chain
            .split_first()
            .ok_or_else(|| Error::ChainValidation("empty chain".into()))?;

        let root = rest.last().unwrap_or(leaf);
        if !self.anchors.iter().any(|anchor| anchor == root) {
            return Err(Error::ChainValidation(format!(
                "chain ends at '{}' which is not a trust anchor",
                root.subject_cn().unwrap_or_default()
            )));
        }

        for pair in chain.windows(2) {
            if !pair[0].is_issued_by(&pair[1]) {
                return Err(Error::ChainValidation(format!(
                    "'{}' is not signed by '{}'",
                    pair[0].subject_cn().unwrap_or_default(),
                    pair[1].subject_cn().unwrap_or_default()
                )));
            }
        }

        self.openssl_verify(leaf, rest)?;

        // Nobody in the chain may outlive its issuer or be outside its
        // validity window now.
        let mut issuer_not_after = None;
        for cert in chain.iter().rev() {
            let info = cert.info()?;
            if !info.is_valid_at(now) {
                return Err(Error::ChainValidation(format!(
                    "'{}' is not valid at {}",
                    info.subject_cn.unwrap_or_default(),
                    now
                )));
            }
            if let Some(limit) = issuer_not_after {
                if info.not_after > limit {
                    return Err(Error::ChainValidation(format!(
                        "'{}' outlives its issuer",
                        info.subject_cn.unwrap_or_default()
                    )));
                }
            }
            issuer_not_after = Some(info.not_after);
        }

        if let Some(template) = template {
            Self::check_usage(leaf, template)?;
        }

        Ok(())
    }

    fn openssl_verify(&self, leaf: &Certificate, rest: &[Certificate]) -> CustodyResult<()> {
        let mut store = X509StoreBuilder::new()?;
        for anchor in self.anchors {
            store.add_cert(anchor.x509().to_owned())?;
        }
        let store = store.build();

        let mut untrusted = Stack::new()?;
        for cert in rest {
            untrusted.push(cert.x509().to_owned())?;
        }

        let mut context = X509StoreContext::new()?;
        let (valid, reason) = context.init(&store, leaf.x509(), &untrusted, |ctx| {
            let valid = ctx.verify_cert()?;
            Ok((valid, ctx.error().error_string().to_string()))
        })?;

        if valid {
            Ok(())
        } else {
            Err(Error::ChainValidation(reason))
        }
    }

    fn check_usage(leaf: &Certificate, template: &CertificateTemplate) -> CustodyResult<()> {
        let info = leaf.info()?;
        if info.is_ca {
            return Err(Error::ChainValidation("leaf certificate is a CA".into()));
        }
        for usage in &template.key_usage {
            if !info.key_usage.contains(usage) {
                return Err(Error::ChainValidation(format!("key usage {} missing", usage)));
            }
        }
        for usage in &template.extended_key_usage {
            if !info.extended_key_usage.contains(usage) {
                return Err(Error::ChainValidation(format!(
                    "extended key usage {} missing",
                    usage
                )));
            }
        }
        let strength = leaf.key_strength()?;
        if strength < template.min_key_bits {
            return Err(Error::ChainValidation(format!(
                "certified key has {} bits, template requires {}",
                strength, template.min_key_bits
            )));
        }
        Ok(())
    }
}
