use std::time::Duration;

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use reqwest::{Method, StatusCode};

use crate::config::ServerConfig;

use super::DavReader;
use super::propfind;
use super::types::{DavCapability, FetchError, RemoteEntry};

/// Characters that must be escaped inside a URL path segment.
const PATH_ENCODE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'%');

const PROPFIND_BODY: &str = r#"<?xml version="1.0"?>
<d:propfind xmlns:d="DAV:" xmlns:oc="http://owncloud.org/ns">
  <d:prop>
    <d:getetag/>
    <d:getcontenttype/>
    <d:getcontentlength/>
    <d:getlastmodified/>
    <d:creationdate/>
    <d:resourcetype/>
    <oc:fileid/>
    <oc:permissions/>
  </d:prop>
</d:propfind>"#;

/// Authenticated WebDAV client for one server session.
pub struct DavClient {
    http: reqwest::Client,
    /// e.g. `https://cloud.example.com/remote.php/dav/files/alice`
    base_url: String,
    /// Path prefix stripped from hrefs, e.g. `/remote.php/dav/files/alice`
    dav_root: String,
    username: String,
    password: String,
    capability: DavCapability,
}

impl DavClient {
    /// Open a session: one OPTIONS round-trip settles the server dialect,
    /// after which the sync path never inspects server versions again.
    pub async fn connect(server: &ServerConfig) -> Result<Self, FetchError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(server.timeout_secs))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| FetchError::Protocol(format!("cannot build HTTP client: {e}")))?;

        let base = server.url.trim_end_matches('/');
        let capability = match server.flavor.as_deref() {
            Some("nextcloud") | Some("owncloud") | None => DavCapability::Nextcloud,
            Some(_) => DavCapability::Generic,
        };
        let dav_root = match capability {
            DavCapability::Nextcloud => format!("/remote.php/dav/files/{}", server.username),
            DavCapability::Generic => "/webdav".to_string(),
        };
        let base_url = format!("{base}{dav_root}");

        let client = Self {
            http,
            base_url,
            dav_root,
            username: server.username.clone(),
            password: server.password.clone(),
            capability,
        };

        client.negotiate().await?;
        Ok(client)
    }

    /// OPTIONS against the DAV root: verifies credentials and that the
    /// server actually speaks WebDAV class 1.
    async fn negotiate(&self) -> Result<(), FetchError> {
        let resp = self
            .http
            .request(Method::OPTIONS, format!("{}/", self.base_url))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(map_transport_error)?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(FetchError::Auth(format!(
                    "server rejected credentials for {}",
                    self.username
                )));
            }
            s if s.is_server_error() => {
                return Err(FetchError::Transient(format!("server error {s}")));
            }
            _ => {}
        }

        let dav_classes = resp
            .headers()
            .get("dav")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !dav_classes.split(',').any(|c| c.trim() == "1") {
            return Err(FetchError::Protocol(format!(
                "server does not advertise WebDAV class 1 (DAV: {dav_classes:?})"
            )));
        }

        tracing::debug!(capability = ?self.capability, "DAV session negotiated");
        Ok(())
    }

    fn url_for(&self, remote_path: &str) -> String {
        let encoded: String = remote_path
            .split('/')
            .map(|seg| utf8_percent_encode(seg, PATH_ENCODE).to_string())
            .collect::<Vec<_>>()
            .join("/");
        format!("{}{encoded}", self.base_url)
    }

    /// Issue a Depth-1 PROPFIND and return the raw multistatus body.
    async fn propfind(&self, remote_path: &str) -> Result<String, FetchError> {
        let method = Method::from_bytes(b"PROPFIND").expect("static method name");
        let resp = self
            .http
            .request(method, self.url_for(remote_path))
            .basic_auth(&self.username, Some(&self.password))
            .header("Depth", "1")
            .header("Content-Type", "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await
            .map_err(map_transport_error)?;

        match resp.status() {
            StatusCode::MULTI_STATUS | StatusCode::OK => {
                resp.text().await.map_err(map_transport_error)
            }
            StatusCode::NOT_FOUND => Err(FetchError::NotFound(remote_path.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(FetchError::Auth(format!(
                "listing {remote_path} rejected"
            ))),
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                Err(FetchError::Transient(format!("server returned {s}")))
            }
            s => Err(FetchError::Protocol(format!(
                "unexpected status {s} for PROPFIND {remote_path}"
            ))),
        }
    }
}

impl DavReader for DavClient {
    async fn list_folder(&self, remote_path: &str) -> Result<Vec<RemoteEntry>, FetchError> {
        let body = self.propfind(remote_path).await?;
        propfind::parse_listing(&body, &self.dav_root, remote_path)
    }
}

/// Classify a reqwest transport failure. Connect/timeout/IO problems are
/// retryable; anything else on this path is a protocol defect.
fn map_transport_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        FetchError::Transient(e.to_string())
    } else {
        FetchError::Protocol(e.to_string())
    }
}
