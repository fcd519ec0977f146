//! Scripted doubles for the device transport and the notification sink.

use std::collections::VecDeque;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono_tz::UTC;
use serde_json::{json, Value};

use nvr_common::config::Credentials;
use nvr_common::error::{NotifyError, TransportError};
use nvr_common::protocol::{method, RequestEnvelope, ResponseEnvelope};

use crate::notify::{Notification, NotificationSink};
use crate::session::SessionClient;
use crate::transport::{DeviceTransport, HttpReply};

type Handler =
    Box<dyn FnMut(&str, &RequestEnvelope) -> Result<ResponseEnvelope, TransportError> + Send>;

/// Transport whose RPC replies come from a closure and whose GET and
/// subscribe replies come from queues.
pub struct ScriptedTransport {
    handler: Mutex<Handler>,
    requests: Mutex<Vec<(String, RequestEnvelope)>>,
    gets: Mutex<VecDeque<(u16, Option<String>, Vec<u8>)>>,
    get_calls: Mutex<Vec<(String, Option<String>)>>,
    streams: Mutex<VecDeque<Vec<u8>>>,
    subscribe_calls: Mutex<Vec<(String, String)>>,
    drained: Option<Arc<AtomicBool>>,
}

impl ScriptedTransport {
    pub fn new<F>(handler: F) -> Self
    where
        F: FnMut(&str, &RequestEnvelope) -> Result<ResponseEnvelope, TransportError>
            + Send
            + 'static,
    {
        Self {
            handler: Mutex::new(Box::new(handler)),
            requests: Mutex::new(Vec::new()),
            gets: Mutex::new(VecDeque::new()),
            get_calls: Mutex::new(Vec::new()),
            streams: Mutex::new(VecDeque::new()),
            subscribe_calls: Mutex::new(Vec::new()),
            drained: None,
        }
    }

    /// Queue a reply for the next GET.
    pub fn with_get(self, status: u16, challenge: Option<&str>, body: &[u8]) -> Self {
        self.gets
            .lock()
            .unwrap()
            .push_back((status, challenge.map(str::to_string), body.to_vec()));
        self
    }

    /// Queue the body of the next event subscription.
    pub fn with_stream(self, body: &[u8]) -> Self {
        self.streams.lock().unwrap().push_back(body.to_vec());
        self
    }

    /// Raise `flag` once a subscribe finds no queued stream.
    pub fn stop_when_drained(mut self, flag: Arc<AtomicBool>) -> Self {
        self.drained = Some(flag);
        self
    }

    pub fn requests(&self) -> Vec<(String, RequestEnvelope)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.requests().into_iter().map(|(_, r)| r.method).collect()
    }

    pub fn get_calls(&self) -> Vec<(String, Option<String>)> {
        self.get_calls.lock().unwrap().clone()
    }

    pub fn subscribe_calls(&self) -> Vec<(String, String)> {
        self.subscribe_calls.lock().unwrap().clone()
    }
}

impl DeviceTransport for ScriptedTransport {
    fn post_rpc(
        &self,
        path: &str,
        request: &RequestEnvelope,
    ) -> Result<ResponseEnvelope, TransportError> {
        self.requests
            .lock()
            .unwrap()
            .push((path.to_string(), request.clone()));
        let mut handler = self.handler.lock().unwrap();
        (&mut *handler)(path, request)
    }

    fn get(&self, uri: &str, authorization: Option<&str>) -> Result<HttpReply, TransportError> {
        self.get_calls
            .lock()
            .unwrap()
            .push((uri.to_string(), authorization.map(str::to_string)));
        let (status, www_authenticate, body) =
            self.gets
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| TransportError::Status {
                    path: uri.to_string(),
                    status: 404,
                })?;
        Ok(HttpReply {
            status,
            www_authenticate,
            body: Box::new(Cursor::new(body)),
        })
    }

    fn subscribe(&self, uri: &str, cookie: &str) -> Result<Box<dyn Read + Send>, TransportError> {
        self.subscribe_calls
            .lock()
            .unwrap()
            .push((uri.to_string(), cookie.to_string()));
        match self.streams.lock().unwrap().pop_front() {
            Some(body) => Ok(Box::new(Cursor::new(body))),
            None => {
                if let Some(flag) = &self.drained {
                    flag.store(true, Ordering::SeqCst);
                }
                Err(TransportError::Status {
                    path: uri.to_string(),
                    status: 503,
                })
            }
        }
    }
}

pub fn envelope(value: Value) -> ResponseEnvelope {
    serde_json::from_value(value).unwrap()
}

/// Standard two-step login replies (session `S1`); `None` for other calls.
pub fn login_reply(_path: &str, req: &RequestEnvelope) -> Option<ResponseEnvelope> {
    if req.method != method::LOGIN {
        return None;
    }
    if req.session.is_empty() {
        Some(envelope(json!({
            "result": false,
            "params": {"random": "abc", "realm": "xyz"},
            "session": "S1"
        })))
    } else {
        Some(envelope(json!({"result": true})))
    }
}

/// Session already logged in through `transport`.
pub fn logged_in(transport: Arc<ScriptedTransport>) -> Arc<SessionClient> {
    let session = SessionClient::new(
        transport,
        Credentials {
            host: "http://cam".into(),
            username: "admin".into(),
            password: "secret".into(),
        },
        UTC,
    );
    session.login().unwrap();
    Arc::new(session)
}

#[derive(Debug, Clone)]
pub struct SentVideo {
    pub path: PathBuf,
    pub caption: String,
    pub contents: Vec<u8>,
}

/// Sink that keeps everything it is handed.
#[derive(Default)]
pub struct RecordingSink {
    fail: bool,
    sent: Mutex<Vec<Notification>>,
    videos: Mutex<Vec<SentVideo>>,
}

impl RecordingSink {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn videos(&self) -> Vec<SentVideo> {
        self.videos.lock().unwrap().clone()
    }
}

impl NotificationSink for RecordingSink {
    fn send_text(&self, message: &str) -> Result<(), NotifyError> {
        if self.fail {
            return Err(NotifyError::Status(500));
        }
        self.sent
            .lock()
            .unwrap()
            .push(Notification::Text(message.to_string()));
        Ok(())
    }

    fn send_video(&self, path: &Path, caption: &str) -> Result<(), NotifyError> {
        if self.fail {
            return Err(NotifyError::Status(500));
        }
        // The notify tests pass paths that don't exist.
        let contents = std::fs::read(path).unwrap_or_default();
        self.videos.lock().unwrap().push(SentVideo {
            path: path.to_path_buf(),
            caption: caption.to_string(),
            contents,
        });
        self.sent.lock().unwrap().push(Notification::Video {
            path: path.to_path_buf(),
            caption: caption.to_string(),
        });
        Ok(())
    }
}
