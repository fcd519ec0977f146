//! HTTP transport to the device.
//!
//! Everything that touches the network goes through [`DeviceTransport`],
//! so the session, scanner and alarm watcher can be driven by a scripted
//! transport in tests.

use std::io::Read;
use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, COOKIE, WWW_AUTHENTICATE};
use tracing::debug;

use nvr_common::error::{ParseError, TransportError};
use nvr_common::protocol::{RequestEnvelope, ResponseEnvelope};

/// Status, challenge header and streaming body of a GET.
pub struct HttpReply {
    pub status: u16,
    pub www_authenticate: Option<String>,
    pub body: Box<dyn Read + Send>,
}

pub trait DeviceTransport: Send + Sync {
    /// POST an RPC envelope to `path` and decode the reply envelope.
    fn post_rpc(
        &self,
        path: &str,
        request: &RequestEnvelope,
    ) -> Result<ResponseEnvelope, TransportError>;

    /// GET `uri`, optionally with an `Authorization` header.  Non-2xx
    /// statuses are returned, not turned into errors.
    fn get(&self, uri: &str, authorization: Option<&str>) -> Result<HttpReply, TransportError>;

    /// Open the long-lived event subscription at `uri`.
    fn subscribe(&self, uri: &str, cookie: &str) -> Result<Box<dyn Read + Send>, TransportError>;
}

/// `reqwest`-backed transport.
pub struct HttpTransport {
    base_url: String,
    client: reqwest::blocking::Client,
    /// No timeout: the event stream stays open for the process lifetime.
    stream_client: reqwest::blocking::Client,
}

impl HttpTransport {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()?;
        let stream_client = reqwest::blocking::Client::builder()
            .timeout(None)
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            stream_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl DeviceTransport for HttpTransport {
    fn post_rpc(
        &self,
        path: &str,
        request: &RequestEnvelope,
    ) -> Result<ResponseEnvelope, TransportError> {
        let body = serde_json::to_vec(request).map_err(ParseError::from)?;
        let resp = self
            .client
            .post(self.url(path))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = resp.bytes()?;
        debug!("{} {} → {} bytes", path, request.method, bytes.len());
        let envelope: ResponseEnvelope =
            serde_json::from_slice(&bytes).map_err(ParseError::from)?;
        Ok(envelope)
    }

    fn get(&self, uri: &str, authorization: Option<&str>) -> Result<HttpReply, TransportError> {
        let mut request = self.client.get(self.url(uri));
        if let Some(auth) = authorization {
            request = request.header(AUTHORIZATION, auth);
        }
        let resp = request.send()?;

        let www_authenticate = resp
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(HttpReply {
            status: resp.status().as_u16(),
            www_authenticate,
            body: Box::new(resp),
        })
    }

    fn subscribe(&self, uri: &str, cookie: &str) -> Result<Box<dyn Read + Send>, TransportError> {
        let resp = self
            .stream_client
            .post(self.url(uri))
            .header(COOKIE, cookie)
            .send()?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                path: uri.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(Box::new(resp))
    }
}
