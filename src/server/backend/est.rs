//! An RFC 7030 Enrollment over Secure Transport client.
//!
//! EST answers `simpleenroll` with `200` and a PKCS#7 certs-only
//! structure once issued, or with `202 Accepted` while the request waits
//! for approval. Polling a pending request means posting the same CSR
//! again, so the CSR itself serves as the token.

use std::fmt;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use log::{debug, info};
use openssl::pkcs7::Pkcs7;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use url::Url;

use crate::api::request::PendingToken;
use crate::api::template::TemplateName;
use crate::commons::crypto::{Certificate, Csr};
use crate::commons::util::httpclient;
use crate::server::secrets::Credential;

use super::{BackendError, ExistingRequest, EnrollmentAuthority, IssuedCertificate, PollOutcome, SubmitOutcome};

const PKCS10_CONTENT: &str = "application/pkcs10";


//------------ EstClient -----------------------------------------------------

pub struct EstClient {
    /// The EST base, e.g. `https://est.example.com/.well-known/est/`.
    base: Url,

    /// Whether the template name is used as the EST label.
    template_labels: bool,
    credential: Option<Credential>,
    client: reqwest::Client,
}

impl EstClient {
    pub fn new(base: Url, template_labels: bool, credential: Option<Credential>) -> Result<Self, BackendError> {
        let mut base = base;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let client = httpclient::client(base.as_str()).map_err(|e| BackendError::Protocol(e.to_string()))?;
        Ok(EstClient { base, template_labels, credential, client })
    }

    fn enroll_uri(&self, template: &TemplateName) -> Result<Url, BackendError> {
        let path = if self.template_labels {
            format!("{}/simpleenroll", template)
        } else {
            "simpleenroll".to_string()
        };
        self.base.join(&path).map_err(|e| BackendError::Protocol(format!("invalid EST URI: {}", e)))
    }

    /// Posts a CSR and interprets the answer.
    async fn simple_enroll(&self, csr: &Csr, template: &TemplateName) -> Result<SubmitOutcome, BackendError> {
        let uri = self.enroll_uri(template)?;
        let body = STANDARD.encode(csr.to_der()?);

        let mut request = self
            .client
            .post(uri.clone())
            .header(CONTENT_TYPE, HeaderValue::from_static(PKCS10_CONTENT))
            .header("Content-Transfer-Encoding", "base64")
            .body(body);
        if let Some(credential) = &self.credential {
            request = request.basic_auth(&credential.username, Some(credential.expose()));
        }

        let res = request
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(httpclient::Error::execute(uri.as_str(), e).to_string()))?;

        match res.status() {
            StatusCode::OK => {
                let text = httpclient::text_response(uri.as_str(), res)
                    .await
                    .map_err(|e| BackendError::Protocol(e.to_string()))?;
                let certs = Self::certs_only(&text)?;
                debug!("EST server at {} returned {} certificate(s)", uri, certs.len());
                Ok(SubmitOutcome::Issued(IssuedCertificate::from_bundle(certs, csr)?))
            }
            StatusCode::ACCEPTED => {
                let token = PendingToken::new(format!("{}:{}", template, STANDARD.encode(csr.to_der()?)));
                info!("EST server at {} accepted the request for manual approval", uri);
                Ok(SubmitOutcome::Pending(token))
            }
            status => {
                let err = httpclient::Error::from_res(uri.as_str(), res).await;
                if status.is_server_error() {
                    Err(BackendError::Server(err.to_string()))
                } else if matches!(
                    status,
                    StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                ) {
                    Ok(SubmitOutcome::Rejected(err.to_string()))
                } else {
                    Err(BackendError::Protocol(err.to_string()))
                }
            }
        }
    }

    /// Decodes a base64 PKCS#7 certs-only response.
    fn certs_only(body: &str) -> Result<Vec<Certificate>, BackendError> {
        let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
        let der = STANDARD
            .decode(compact)
            .map_err(|e| BackendError::Protocol(format!("response is not base64: {}", e)))?;
        let pkcs7 = Pkcs7::from_der(&der).map_err(|e| BackendError::Protocol(format!("response is not PKCS#7: {}", e)))?;
        let certs = pkcs7
            .signed()
            .and_then(|signed| signed.certificates())
            .ok_or_else(|| BackendError::Protocol("PKCS#7 response holds no certificates".into()))?;
        Ok(certs.iter().map(|cert| Certificate::from_x509(cert.to_owned())).collect())
    }

    fn decode_token(token: &PendingToken) -> Result<(TemplateName, Csr), BackendError> {
        let (template, csr) = token
            .as_str()
            .split_once(':')
            .ok_or_else(|| BackendError::UnknownToken(token.clone()))?;
        let der = STANDARD
            .decode(csr)
            .map_err(|_| BackendError::UnknownToken(token.clone()))?;
        let csr = Csr::from_der(&der).map_err(|_| BackendError::UnknownToken(token.clone()))?;
        Ok((TemplateName::from(template), csr))
    }
}

#[async_trait]
impl EnrollmentAuthority for EstClient {
    /// EST has no way to list requests.
    async fn find_existing(
        &self,
        _subject: &str,
        _template: &TemplateName,
    ) -> Result<Option<ExistingRequest>, BackendError> {
        Ok(None)
    }

    async fn submit(&self, csr: &Csr, template: &TemplateName) -> Result<SubmitOutcome, BackendError> {
        self.simple_enroll(csr, template).await
    }

    async fn poll(&self, token: &PendingToken) -> Result<PollOutcome, BackendError> {
        let (template, csr) = Self::decode_token(token)?;
        Ok(match self.simple_enroll(&csr, &template).await? {
            SubmitOutcome::Issued(issued) => PollOutcome::Issued(issued),
            SubmitOutcome::Pending(_) => PollOutcome::StillPending,
            SubmitOutcome::Rejected(reason) => PollOutcome::Rejected(reason),
        })
    }
}

impl fmt::Debug for EstClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "EstClient({})", self.base)
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn enroll_uris() {
        let base = Url::parse("https://est.example.com/.well-known/est").unwrap();
        let plain = EstClient::new(base.clone(), false, None).unwrap();
        let labeled = EstClient::new(base, true, None).unwrap();
        let template = TemplateName::from("WebServer");

        assert_eq!(
            plain.enroll_uri(&template).unwrap().as_str(),
            "https://est.example.com/.well-known/est/simpleenroll"
        );
        assert_eq!(
            labeled.enroll_uri(&template).unwrap().as_str(),
            "https://est.example.com/.well-known/est/WebServer/simpleenroll"
        );
    }

    #[test]
    fn tokens_carry_the_csr() {
        let (_, csr) = test::csr_for("est.example.com");
        let token = PendingToken::new(format!("WebServer:{}", STANDARD.encode(csr.to_der().unwrap())));
        let (template, decoded) = EstClient::decode_token(&token).unwrap();
        assert_eq!(template, TemplateName::from("WebServer"));
        assert_eq!(decoded.to_der().unwrap(), csr.to_der().unwrap());

        let bad = PendingToken::new("garbage");
        assert_eq!(EstClient::decode_token(&bad).unwrap_err(), BackendError::UnknownToken(bad));
    }

    #[tokio::test]
    async fn unreachable_server() {
        // Nothing listens on port 9 of localhost.
        let client = EstClient::new(Url::parse("http://127.0.0.1:9/.well-known/est/").unwrap(), false, None).unwrap();
        let (_, csr) = test::csr_for("est.example.com");
        let err = client.submit(&csr, &TemplateName::from("WebServer")).await.unwrap_err();
        assert!(matches!(err, BackendError::Unreachable(_)));
        assert!(err.is_transient());
    }
}
