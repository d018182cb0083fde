//! Helpers for the HTTP calls made to enrollment services, challenge
//! hosts and appliance APIs.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use std::{env, fmt};

use reqwest::{Response, StatusCode};

use crate::commons::util::file;
use crate::constants::{CUSTODIAN_HTTPS_ROOT_CERTS_ENV, HTTP_CLIENT_TIMEOUT_SECS, HTTP_USER_AGENT};


/// Default client.
pub fn client(uri: &str) -> Result<reqwest::Client, Error> {
    client_with_tweaks(uri, Duration::from_secs(HTTP_CLIENT_TIMEOUT_SECS), false)
}

/// Client with tweaks.
///
/// Appliance management interfaces usually present a self-signed
/// certificate (often the very one being replaced), so those clients may
/// need to skip server certificate validation.
pub fn client_with_tweaks(uri: &str, timeout: Duration, accept_invalid_certs: bool) -> Result<reqwest::Client, Error> {
    let mut builder = reqwest::ClientBuilder::new().timeout(timeout).user_agent(HTTP_USER_AGENT);

    if let Ok(cert_list) = env::var(CUSTODIAN_HTTPS_ROOT_CERTS_ENV) {
        for path in cert_list.split(':').filter(|p| !p.is_empty()) {
            builder = builder.add_root_certificate(load_root_cert(path)?);
        }
    }

    if accept_invalid_certs || uri.starts_with("https://localhost") || uri.starts_with("https://127.0.0.1") {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder.build().map_err(|e| Error::request_build(uri, e))
}

fn load_root_cert(path_str: &str) -> Result<reqwest::Certificate, Error> {
    let path = PathBuf::from_str(path_str).map_err(|e| Error::request_build_https_cert(path_str, e))?;
    let bytes = file::read_optional(&path)
        .map_err(|e| Error::request_build_https_cert(path_str, e))?
        .ok_or_else(|| Error::request_build_https_cert(path_str, "file not found"))?;
    reqwest::Certificate::from_pem(&bytes).map_err(|e| Error::request_build_https_cert(path_str, e))
}

/// The body of a successful response.
pub async fn text_response(uri: &str, res: Response) -> Result<String, Error> {
    let status = res.status();
    if status.is_success() {
        res.text().await.map_err(|e| Error::response(uri, e))
    } else {
        Err(Error::from_res(uri, res).await)
    }
}


//------------ Error ---------------------------------------------------------

type ErrorUri = String;
type ErrorMessage = String;

#[derive(Debug)]
pub enum Error {
    RequestBuild(ErrorUri, ErrorMessage),
    RequestBuildHttpsCert(String, ErrorMessage),

    /// The request did not get an answer: connection refused, time out.
    RequestExecute(ErrorUri, ErrorMessage),

    Response(ErrorUri, ErrorMessage),
    ErrorResponseWithBody(ErrorUri, StatusCode, String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::RequestBuild(uri, msg) => write!(f, "Issue creating request for URI: {}, error: {}", uri, msg),
            Error::RequestBuildHttpsCert(path, msg) => {
                write!(f, "Cannot use configured HTTPS root cert '{}'. Error: {}", path, msg)
            }
            Error::RequestExecute(uri, msg) => write!(f, "Issue accessing URI: {}, error: {}", uri, msg),
            Error::Response(uri, msg) => write!(f, "Issue processing response from URI: {}, error: {}", uri, msg),
            Error::ErrorResponseWithBody(uri, code, body) => {
                if body.is_empty() {
                    write!(f, "Error response from URI: {}, status: {}", uri, code)
                } else {
                    write!(f, "Error response from URI: {}, status: {}, body: {}", uri, code, body)
                }
            }
        }
    }
}

impl Error {
    pub fn request_build(uri: &str, msg: impl fmt::Display) -> Self {
        Error::RequestBuild(uri.to_string(), msg.to_string())
    }

    pub fn request_build_https_cert(path: &str, msg: impl fmt::Display) -> Self {
        Error::RequestBuildHttpsCert(path.to_string(), msg.to_string())
    }

    pub fn execute(uri: &str, msg: impl fmt::Display) -> Self {
        Error::RequestExecute(uri.to_string(), msg.to_string())
    }

    pub fn response(uri: &str, msg: impl fmt::Display) -> Self {
        Error::Response(uri.to_string(), msg.to_string())
    }

    pub async fn from_res(uri: &str, res: Response) -> Self {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        Error::ErrorResponseWithBody(uri.to_string(), status, body)
    }

    /// The HTTP status, if the server answered at all.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::ErrorResponseWithBody(_, status, _) => Some(*status),
            _ => None,
        }
    }

    /// Whether the server could not be reached or failed itself.
    pub fn is_unavailable(&self) -> bool {
        match self {
            Error::RequestExecute(_, _) => true,
            Error::ErrorResponseWithBody(_, status, _) => status.is_server_error(),
            _ => false,
        }
    }
}

impl std::error::Error for Error {}
