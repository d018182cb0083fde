//! A client for the PAN-OS XML API.
//!
//! Every call goes to `https://<address>/api/` and answers with a
//! `<response status="...">` document, except certificate exports which
//! answer with the bundle itself.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use log::{debug, info, warn};
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::OnceCell;
use tokio::time::sleep;
use url::Url;
use xml::reader::{ParserConfig, XmlEvent};

use crate::commons::CustodyResult;
use crate::commons::error::Error;
use crate::commons::util::httpclient;
use crate::server::secrets::Credential;

use super::{ApplianceApi, DistributionError, InstallMaterial};

const API_KEY_HEADER: &str = "X-PAN-KEY";
const API_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a commit or validation job may take.
const JOB_TIMEOUT: Duration = Duration::from_secs(900);


//------------ PanOsClient ---------------------------------------------------

pub struct PanOsClient {
    api: Url,
    credential: Credential,

    /// The API key, generated from username and password on first use
    /// unless the credential is a key already.
    key: OnceCell<SecretString>,
    client: reqwest::Client,
}

impl PanOsClient {
    pub fn new(address: &str, credential: Credential) -> CustodyResult<Self> {
        let api = Url::parse(&format!("https://{}/api/", address))
            .map_err(|e| Error::invalid_request(format!("invalid appliance address '{}': {}", address, e)))?;

        // Management interfaces present a self-signed certificate until
        // the first install.
        let client = httpclient::client_with_tweaks(api.as_str(), API_TIMEOUT, true).map_err(Error::custom)?;
        Ok(PanOsClient { api, credential, key: OnceCell::new(), client })
    }

    async fn api_key(&self) -> Result<&SecretString, DistributionError> {
        self.key
            .get_or_try_init(|| async {
                if self.credential.username == "api" {
                    return Ok(self.credential.secret.clone());
                }
                debug!("Requesting API key for '{}' from {}", self.credential.username, self.api);
                let res = self
                    .client
                    .post(self.api.clone())
                    .form(&[
                        ("type", "keygen"),
                        ("user", self.credential.username.as_str()),
                        ("password", self.credential.expose()),
                    ])
                    .send()
                    .await
                    .map_err(|e| DistributionError::Unreachable(e.to_string()))?;
                let key = Self::response(res)
                    .await?
                    .text_of("key")
                    .ok_or_else(|| DistributionError::Authentication("keygen answer holds no key".into()))?;
                Ok::<_, DistributionError>(SecretString::new(key))
            })
            .await
    }

    /// Checks the HTTP status and the response status attribute.
    async fn response(res: reqwest::Response) -> Result<Element, DistributionError> {
        let status = res.status();
        let body = res.text().await.map_err(|e| DistributionError::Unreachable(e.to_string()))?;
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(DistributionError::Authentication(error_message(&body)));
        }
        if status.is_server_error() {
            return Err(DistributionError::Unreachable(format!("appliance answered {}", status)));
        }
        let response = match Element::parse(&body) {
            Some(response) if response.status().is_some() => response,
            _ => return Err(DistributionError::Rejected(format!("unexpected answer ({}): {}", status, body))),
        };
        match (response.status(), response.code()) {
            (Some("success"), _) => Ok(response),
            // Code 403 is an invalid or expired key.
            (_, Some("403")) => Err(DistributionError::Authentication(response.error_message())),
            _ => Err(DistributionError::Rejected(response.error_message())),
        }
    }

    async fn call(&self, params: &[(&str, &str)]) -> Result<Element, DistributionError> {
        let key = self.api_key().await?;
        let res = self
            .client
            .post(self.api.clone())
            .header(API_KEY_HEADER, key.expose_secret())
            .form(params)
            .send()
            .await
            .map_err(|e| DistributionError::Unreachable(httpclient::Error::execute(self.api.as_str(), e).to_string()))?;
        Self::response(res).await
    }

    async fn op(&self, cmd: &str) -> Result<Element, DistributionError> {
        self.call(&[("type", "op"), ("cmd", cmd)]).await
    }

    /// Waits for a commit or validation job to finish.
    async fn await_job(&self, job: &str) -> Result<(), DistributionError> {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(2),
            multiplier: 1.5,
            max_interval: Duration::from_secs(15),
            max_elapsed_time: Some(JOB_TIMEOUT),
            randomization_factor: 0.0,
            ..Default::default()
        };
        backoff.reset();

        let cmd = format!("<show><jobs><id>{}</id></jobs></show>", job);
        loop {
            let response = self.op(&cmd).await?;
            let state = response.find("job").unwrap_or(&response);
            if state.text_of("status").as_deref() == Some("FIN") {
                return match state.text_of("result").as_deref() {
                    Some("OK") => Ok(()),
                    _ => Err(DistributionError::Rejected(format!(
                        "job {} failed: {}",
                        job,
                        state.text_of("details").unwrap_or_default()
                    ))),
                };
            }
            match backoff.next_backoff() {
                Some(delay) => sleep(delay).await,
                None => return Err(DistributionError::Rejected(format!("job {} did not finish in time", job))),
            }
        }
    }
}

#[async_trait]
impl ApplianceApi for PanOsClient {
    /// Imports a PKCS#12 key pair, or only the certificate when the key
    /// stays on this host. Imports land in the candidate configuration,
    /// so a dry run imports too.
    async fn import_certificate(
        &self,
        name: &str,
        material: &InstallMaterial,
        passphrase: &SecretString,
        _dry_run: bool,
    ) -> Result<(), DistributionError> {
        let key = self.api_key().await?;
        let mut uri = self.api.clone();
        let part = match material.pkcs12(name, passphrase)? {
            Some(bundle) => {
                uri.query_pairs_mut()
                    .append_pair("type", "import")
                    .append_pair("category", "keypair")
                    .append_pair("certificate-name", name)
                    .append_pair("format", "pkcs12")
                    .append_pair("passphrase", passphrase.expose_secret());
                Part::bytes(bundle).file_name(format!("{}.p12", name))
            }
            None => {
                uri.query_pairs_mut()
                    .append_pair("type", "import")
                    .append_pair("category", "certificate")
                    .append_pair("certificate-name", name)
                    .append_pair("format", "pem");
                Part::bytes(material.certificate_pem()?.into_bytes()).file_name(format!("{}.pem", name))
            }
        };

        let res = self
            .client
            .post(uri)
            .header(API_KEY_HEADER, key.expose_secret())
            .multipart(Form::new().part("file", part))
            .send()
            .await
            .map_err(|e| DistributionError::Unreachable(httpclient::Error::execute(self.api.as_str(), e).to_string()))?;
        Self::response(res).await?;
        info!("Imported certificate '{}' into the candidate configuration at {}", name, self.api);
        Ok(())
    }

    async fn delete_certificate(&self, name: &str) -> Result<(), DistributionError> {
        let xpath = format!(
            "/config/shared/certificate/entry[@name='{}']",
            name.replace('\'', "&apos;")
        );
        self.call(&[("type", "config"), ("action", "delete"), ("xpath", &xpath)]).await?;
        info!("Deleted certificate '{}' from the candidate configuration at {}", name, self.api);
        Ok(())
    }

    async fn commit_configuration(&self, dry_run: bool) -> Result<(), DistributionError> {
        if dry_run {
            let response = self.op("<validate><full></full></validate>").await?;
            let validated = match response.text_of("job") {
                Some(job) => self.await_job(&job).await,
                None => Ok(()),
            };
            // Whatever the outcome, the candidate goes back to what runs.
            if let Err(e) = self.op("<revert><config></config></revert>").await {
                warn!("Could not revert candidate configuration at {}: {}", self.api, e);
            }
            return validated;
        }

        let response = self.call(&[("type", "commit"), ("cmd", "<commit></commit>")]).await?;
        match response.text_of("job") {
            Some(job) => {
                debug!("Commit job {} started at {}", job, self.api);
                self.await_job(&job).await
            }
            // "There are no changes to commit."
            None => Ok(()),
        }
    }

    async fn fetch_certificate(
        &self,
        name: &str,
        passphrase: &SecretString,
    ) -> Result<Option<Vec<u8>>, DistributionError> {
        let key = self.api_key().await?;
        let res = self
            .client
            .get(self.api.clone())
            .header(API_KEY_HEADER, key.expose_secret())
            .query(&[
                ("type", "export"),
                ("category", "certificate"),
                ("certificate-name", name),
                ("format", "pkcs12"),
                ("include-key", "yes"),
                ("passphrase", passphrase.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| DistributionError::Unreachable(httpclient::Error::execute(self.api.as_str(), e).to_string()))?;

        let status = res.status();
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(DistributionError::Authentication(format!("appliance answered {}", status)));
        }
        if status.is_server_error() {
            return Err(DistributionError::Unreachable(format!("appliance answered {}", status)));
        }
        let bytes = res.bytes().await.map_err(|e| DistributionError::Unreachable(e.to_string()))?;

        // Errors come as XML, the bundle as DER.
        if bytes.starts_with(b"<") {
            let response = Element::parse(&String::from_utf8_lossy(&bytes));
            let message = response.as_ref().map(Element::error_message).unwrap_or_else(|| "unknown error".into());
            if response.as_ref().and_then(Element::code) == Some("403") {
                return Err(DistributionError::Authentication(message));
            }
            warn!("No certificate '{}' to back up at {}: {}", name, self.api, message);
            return Ok(None);
        }
        Ok(Some(bytes.to_vec()))
    }
}

impl fmt::Debug for PanOsClient {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PanOsClient({})", self.api)
    }
}


//------------ Element -------------------------------------------------------

/// An element of an API answer, with the text it holds directly.
#[derive(Debug, Default)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<Element>,
}

impl Element {
    /// Parses a document into its root element.
    fn parse(body: &str) -> Option<Self> {
        let mut config = ParserConfig::new();
        config.trim_whitespace = true;
        config.ignore_comments = true;

        let mut open = vec![Element::default()];
        for event in config.create_reader(body.as_bytes()) {
            match event {
                Ok(XmlEvent::StartElement { name, attributes, .. }) => open.push(Element {
                    name: name.local_name,
                    attributes: attributes.into_iter().map(|attr| (attr.name.local_name, attr.value)).collect(),
                    ..Default::default()
                }),
                Ok(XmlEvent::EndElement { .. }) => {
                    let closed = open.pop()?;
                    open.last_mut()?.children.push(closed);
                }
                Ok(XmlEvent::Characters(text)) | Ok(XmlEvent::CData(text)) => {
                    if let Some(current) = open.last_mut() {
                        current.text.push_str(&text);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Cannot parse appliance answer: {}", e);
                    return None;
                }
            }
        }
        open.pop()?.children.into_iter().next()
    }

    fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
    }

    /// The first element called `name`, this one included, depth first.
    fn find(&self, name: &str) -> Option<&Element> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(name))
    }

    /// The text of the first element called `name` and everything below
    /// it, whitespace collapsed.
    fn text_of(&self, name: &str) -> Option<String> {
        let mut words = Vec::new();
        self.find(name)?.collect_text(&mut words);
        let text = words.join(" ");
        (!text.is_empty()).then_some(text)
    }

    fn collect_text<'a>(&'a self, words: &mut Vec<&'a str>) {
        words.extend(self.text.split_whitespace());
        for child in &self.children {
            child.collect_text(words);
        }
    }

    /// The `status` attribute of a `<response>`.
    fn status(&self) -> Option<&str> {
        (self.name == "response").then(|| self.attribute("status")).flatten()
    }

    /// The `code` attribute of a `<response>`.
    fn code(&self) -> Option<&str> {
        (self.name == "response").then(|| self.attribute("code")).flatten()
    }

    fn error_message(&self) -> String {
        self.text_of("msg")
            .or_else(|| self.text_of("line"))
            .unwrap_or_else(|| "unknown error".to_string())
    }
}

fn error_message(body: &str) -> String {
    match Element::parse(body) {
        Some(response) => response.error_message(),
        None => "unknown error".to_string(),
    }
}


//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_responses() {
        let key = Element::parse(r#"<response status="success"><result><key>LUFRPT1abc==</key></result></response>"#).unwrap();
        assert_eq!(key.text_of("key").as_deref(), Some("LUFRPT1abc=="));

        let job = Element::parse(
            r#"<response status="success" code="19"><result><msg><line>Commit job enqueued with jobid 42</line></msg><job>42</job></result></response>"#,
        )
        .unwrap();
        assert_eq!(job.status(), Some("success"));
        assert_eq!(job.text_of("job").as_deref(), Some("42"));
        assert_eq!(job.error_message(), "Commit job enqueued with jobid 42");

        let denied = Element::parse(r#"<response status="error" code="403"><result><msg>Invalid credential</msg></result></response>"#).unwrap();
        assert_eq!(denied.status(), Some("error"));
        assert_eq!(denied.code(), Some("403"));
        assert_eq!(denied.error_message(), "Invalid credential");

        let failed = Element::parse(
            r#"<response status="success"><result><job><id>42</id><status>FIN</status><result>FAIL</result><details><line>cert &amp; key mismatch</line></details></job></result></response>"#,
        )
        .unwrap();
        let state = failed.find("job").unwrap();
        assert_eq!(state.text_of("status").as_deref(), Some("FIN"));
        assert_eq!(state.text_of("result").as_deref(), Some("FAIL"));
        assert_eq!(state.text_of("details").as_deref(), Some("cert & key mismatch"));
    }

    #[test]
    fn parse_less_tidy_responses() {
        let quoted = Element::parse(
            "<?xml version=\"1.0\"?>\n<!-- keygen -->\n<response code='403' status='error'>\n  <msg>\n    <line>Key &#x27;k&#39; expired</line>\n  </msg>\n</response>",
        )
        .unwrap();
        assert_eq!(quoted.status(), Some("error"));
        assert_eq!(quoted.code(), Some("403"));
        assert_eq!(quoted.error_message(), "Key 'k' expired");

        let empty = Element::parse(r#"<response status="success"><result><job/><msg><![CDATA[no <changes> to commit]]></msg></result></response>"#).unwrap();
        assert_eq!(empty.text_of("job"), None);
        assert_eq!(empty.error_message(), "no <changes> to commit");

        let namespaced = Element::parse(r#"<response xmlns:p="urn:panos" status="success"><p:result><p:key>k3y</p:key></p:result></response>"#).unwrap();
        assert_eq!(namespaced.text_of("key").as_deref(), Some("k3y"));

        assert!(Element::parse("<response status=\"success\"><result>").is_none());
        assert!(Element::parse("PK\u{3}\u{4}").is_none());
        assert_eq!(error_message("not xml"), "unknown error");
    }

    #[test]
    fn api_address() {
        let client = PanOsClient::new("fw1.example.com", Credential::api_key("k")).unwrap();
        assert_eq!(client.api.as_str(), "https://fw1.example.com/api/");
        assert!(PanOsClient::new("fw 1", Credential::api_key("k")).is_err());
    }

    #[tokio::test]
    async fn api_keys_are_used_as_is() {
        let client = PanOsClient::new("fw1.example.com", Credential::api_key("k3y")).unwrap();
        assert_eq!(client.api_key().await.unwrap().expose_secret(), "k3y");
    }
}
