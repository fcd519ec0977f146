//! Authenticated RPC session with the device.
//!
//! One [`SessionClient`] is shared (behind an `Arc`) by the keep-alive
//! thread, the recording poller and the alarm watcher.  The session token
//! is the only shared mutable value besides the request sequence; login
//! swaps it atomically and every call reads it fresh, so a re-login in one
//! thread is picked up by the next call in another.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use nvr_common::config::Credentials;
use nvr_common::digest::{self, LoginChallenge};
use nvr_common::error::{AuthError, TransportError};
use nvr_common::protocol::{endpoint, method, RequestEnvelope, ResponseEnvelope};

use crate::transport::DeviceTransport;

/// First request id; the device only expects ids to look incrementing.
pub const SEQUENCE_SEED: u64 = 2;

/// Format of device-side timestamps (clock sync and file search).
pub const DEVICE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Authenticated,
    Reauthenticating,
}

pub struct SessionClient {
    transport: Arc<dyn DeviceTransport>,
    credentials: Credentials,
    clock_zone: Tz,
    token: RwLock<String>,
    sequence: AtomicU64,
    state: Mutex<SessionState>,
}

impl SessionClient {
    pub fn new(transport: Arc<dyn DeviceTransport>, credentials: Credentials, clock_zone: Tz) -> Self {
        Self {
            transport,
            credentials,
            clock_zone,
            token: RwLock::new(String::new()),
            sequence: AtomicU64::new(SEQUENCE_SEED),
            state: Mutex::new(SessionState::Unauthenticated),
        }
    }

    pub fn transport(&self) -> &dyn DeviceTransport {
        self.transport.as_ref()
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn clock_zone(&self) -> Tz {
        self.clock_zone
    }

    /// Current session token; empty until the first successful login.
    pub fn token(&self) -> String {
        self.token.read().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn has_session(&self) -> bool {
        !self.token().is_empty()
    }

    pub fn state(&self) -> SessionState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(SessionState::Unauthenticated)
    }

    /// Id the next RPC will carry.
    #[cfg(test)]
    pub fn next_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: SessionState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != next {
                debug!("Session state {:?} → {:?}", *state, next);
            }
            *state = next;
        }
    }

    fn take_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst)
    }

    // ── login ────────────────────────────────────────────────────────────

    /// Two-step login.  The token is published only once the device
    /// accepts the digest.
    pub fn login(&self) -> Result<(), AuthError> {
        let creds = &self.credentials;
        if creds.host.is_empty() {
            return Err(AuthError::MissingCredential("host"));
        }
        if creds.username.is_empty() {
            return Err(AuthError::MissingCredential("username"));
        }
        if creds.password.is_empty() {
            return Err(AuthError::MissingCredential("password"));
        }

        info!("Logging in to {} as {}", creds.host, creds.username);
        match self.handshake() {
            Ok(session) => {
                if let Ok(mut token) = self.token.write() {
                    *token = session;
                }
                self.set_state(SessionState::Authenticated);
                info!("Login successful");
                Ok(())
            }
            Err(e) => {
                if self.state() != SessionState::Unauthenticated {
                    self.set_state(SessionState::Reauthenticating);
                }
                Err(e)
            }
        }
    }

    fn handshake(&self) -> Result<String, AuthError> {
        let first = self.login_request("", "")?;

        let session = first
            .session
            .clone()
            .filter(|s| !s.is_empty())
            .ok_or(AuthError::EmptySession)?;
        let challenge = LoginChallenge {
            realm: first
                .param_str("realm")
                .ok_or(AuthError::MissingChallenge("realm"))?
                .to_string(),
            random: first
                .param_str("random")
                .ok_or(AuthError::MissingChallenge("random"))?
                .to_string(),
        };

        let hash = digest::login_digest(
            &self.credentials.username,
            &self.credentials.password,
            &challenge.random,
            &challenge.realm,
        );

        let second = self.login_request(&session, &hash)?;
        if !second.succeeded() {
            return Err(AuthError::Rejected);
        }
        Ok(session)
    }

    fn login_request(&self, session: &str, password: &str) -> Result<ResponseEnvelope, TransportError> {
        let request = RequestEnvelope {
            method: method::LOGIN.to_string(),
            params: json!({
                "userName": self.credentials.username,
                "password": password,
                "clientType": "Web3.0",
                "loginType": "Direct",
            }),
            id: self.take_sequence(),
            session: session.to_string(),
            object: None,
        };
        self.transport.post_rpc(endpoint::LOGIN, &request)
    }

    // ── calls ────────────────────────────────────────────────────────────

    /// Issue one RPC with the current token.  Consumes exactly one
    /// sequence number per invocation, including ones refused for lack
    /// of a session.
    pub fn call(
        &self,
        procedure: &str,
        params: Value,
        object: Option<i64>,
    ) -> Result<ResponseEnvelope, TransportError> {
        let id = self.take_sequence();
        let session = self.token();
        if session.is_empty() {
            return Err(TransportError::NoSession);
        }

        let request = RequestEnvelope {
            method: procedure.to_string(),
            params,
            id,
            session,
            object,
        };
        self.transport.post_rpc(endpoint::RPC, &request)
    }

    /// `global.keepAlive`; `Ok(false)` means the device dropped the session.
    pub fn keep_alive(&self) -> Result<bool, TransportError> {
        let resp = self.call(
            method::KEEP_ALIVE,
            json!({"timeout": 300, "active": true}),
            None,
        )?;
        Ok(resp.succeeded())
    }

    /// Set the device clock to `now` expressed in the configured zone.
    pub fn set_device_time(&self, now: DateTime<Utc>) -> Result<bool, TransportError> {
        let local = now
            .with_timezone(&self.clock_zone)
            .format(DEVICE_TIME_FORMAT)
            .to_string();
        let resp = self.call(
            method::SET_CURRENT_TIME,
            json!({"time": local, "tolerance": 5}),
            None,
        )?;
        if resp.succeeded() {
            info!("Device time set to {local}");
        } else {
            warn!("Device refused time update to {local}");
        }
        Ok(resp.succeeded())
    }

    // ── keep-alive loop ──────────────────────────────────────────────────

    /// One keep-alive period: renew the session and resync the clock, or
    /// log in again if the device no longer recognises the session.
    pub fn keep_alive_tick(&self) {
        if self.state() == SessionState::Reauthenticating {
            self.reauthenticate();
            return;
        }

        match self.keep_alive() {
            Ok(true) => {
                debug!("Keep-alive acknowledged");
                if let Err(e) = self.set_device_time(Utc::now()) {
                    warn!("Clock sync failed: {e}");
                }
            }
            Ok(false) => {
                warn!("Keep-alive rejected, session expired");
                self.set_state(SessionState::Reauthenticating);
                self.reauthenticate();
            }
            Err(e) => warn!("Keep-alive failed: {e}"),
        }
    }

    fn reauthenticate(&self) {
        match self.login() {
            Ok(()) => {
                if let Err(e) = self.set_device_time(Utc::now()) {
                    warn!("Clock sync after re-login failed: {e}");
                }
            }
            Err(e) => error!("Re-login failed, retrying next period: {e}"),
        }
    }

    /// Run [`keep_alive_tick`](Self::keep_alive_tick) every `interval`
    /// until shutdown.  Returns immediately if no session was ever
    /// established.
    pub fn run_keep_alive(&self, interval: Duration, shutdown: &AtomicBool) {
        info!("Keep-alive every {}s", interval.as_secs());
        while crate::sleep_unless_shutdown(interval, shutdown) {
            if !self.has_session() {
                warn!("No session established, stopping keep-alive");
                return;
            }
            self.keep_alive_tick();
        }
        info!("Keep-alive loop stopped");
    }
}
