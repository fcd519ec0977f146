//! Recording poller – finds new clips in the device's media index,
//! downloads them with HTTP Digest auth and sends them on.
//!
//! A path is marked in the ledger *before* it is downloaded.  A crash
//! between marking and delivery therefore skips that clip for good: the
//! agent prefers at-most-once delivery over duplicate clips.

use std::collections::{HashSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use nvr_common::digest::{self, DigestChallenge};
use nvr_common::error::{DownloadError, TransportError};
use nvr_common::protocol::{endpoint, method, FindNextPage, RecordingDescriptor};
use nvr_common::recording::recording_label;

use crate::ledger::ProcessedLedger;
use crate::notify::{self, Notification, NotificationSink};
use crate::session::{SessionClient, SessionState, DEVICE_TIME_FORMAT};

/// Descriptors requested per `findNextFile` page.
pub const FIND_BATCH: usize = 100;

/// Where and what to search for.
#[derive(Debug, Clone)]
pub struct ScanSettings {
    pub channel: i64,
    pub recording_dir: String,
    pub download_dir: PathBuf,
    pub half_window: chrono::Duration,
}

/// Lazily pages through the results of one file search.
pub struct FileFinder<'a> {
    session: &'a SessionClient,
    handle: i64,
    pending: VecDeque<RecordingDescriptor>,
    exhausted: bool,
}

impl<'a> FileFinder<'a> {
    fn fetch_page(&mut self) -> Result<(), TransportError> {
        let resp = self.session.call(
            method::FILE_FIND_NEXT,
            json!({"count": FIND_BATCH}),
            Some(self.handle),
        )?;
        if !resp.succeeded() {
            self.exhausted = true;
            return Ok(());
        }

        let page = FindNextPage::from_response(&resp)?;
        debug!("findNextFile: {} found", page.found);
        if page.found == 0 || page.infos.len() < FIND_BATCH {
            self.exhausted = true;
        }
        self.pending.extend(page.infos);
        Ok(())
    }

    /// Release the search handle on the device.  Best effort.
    pub fn close(self) {
        release_handle(self.session, self.handle);
    }
}

fn release_handle(session: &SessionClient, handle: i64) {
    for procedure in [method::FILE_FIND_CLOSE, method::FILE_FIND_DESTROY] {
        if let Err(e) = session.call(procedure, Value::Null, Some(handle)) {
            debug!("{procedure} failed: {e}");
        }
    }
}

impl Iterator for FileFinder<'_> {
    type Item = Result<RecordingDescriptor, TransportError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(d) = self.pending.pop_front() {
                return Some(Ok(d));
            }
            if self.exhausted {
                return None;
            }
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
    }
}

/// Start a file search covering `center ± half_window`.
///
/// No matching files yields an empty finder, not an error.
pub fn scan_window<'a>(
    session: &'a SessionClient,
    settings: &ScanSettings,
    center: DateTime<Utc>,
    half_window: chrono::Duration,
) -> Result<FileFinder<'a>, TransportError> {
    let created = session.call(method::FILE_FIND_CREATE, Value::Null, None)?;
    let handle = created.handle().ok_or_else(|| {
        nvr_common::error::ParseError::Shape(format!(
            "{} returned no handle: {}",
            method::FILE_FIND_CREATE,
            created.result
        ))
    })?;

    let zone = session.clock_zone();
    let start = (center - half_window)
        .with_timezone(&zone)
        .format(DEVICE_TIME_FORMAT)
        .to_string();
    let end = (center + half_window)
        .with_timezone(&zone)
        .format(DEVICE_TIME_FORMAT)
        .to_string();

    let condition = json!({
        "condition": {
            "Channel": settings.channel,
            "Dirs": [settings.recording_dir],
            "Types": ["mp4"],
            "Order": "Ascent",
            "Redundant": "Exclusion",
            "Events": null,
            "StartTime": start,
            "EndTime": end,
            "Flags": ["Timing", "Event", "Event", "Manual"],
        }
    });
    let found = match session.call(method::FILE_FIND, condition, Some(handle)) {
        Ok(found) => found,
        Err(e) => {
            release_handle(session, handle);
            return Err(e);
        }
    };
    if !found.succeeded() {
        debug!("No recordings between {start} and {end}");
    }

    Ok(FileFinder {
        session,
        handle,
        pending: VecDeque::new(),
        exhausted: !found.succeeded(),
    })
}

/// Download `file_path` into `dir`, answering the device's Digest
/// challenge.  Returns the local file, which the caller owns.
pub fn download_recording(
    session: &SessionClient,
    file_path: &str,
    dir: &Path,
) -> Result<PathBuf, DownloadError> {
    let uri = format!("{}{}", endpoint::LOAD_FILE, file_path);
    let transport = session.transport();

    let first = transport.get(&uri, None)?;
    let reply = if (200..300).contains(&first.status) {
        // Device did not ask for credentials.
        first
    } else {
        let header = first
            .www_authenticate
            .as_deref()
            .ok_or(DownloadError::MissingChallenge(first.status))?;
        let challenge = DigestChallenge::parse(header)?;
        drop(first);

        let creds = session.credentials();
        let response = digest::download_digest(
            &creds.username,
            &creds.password,
            "GET",
            &uri,
            &challenge.realm,
            &challenge.nonce,
        );
        let authorization = challenge.authorization(&creds.username, &uri, &response);
        transport.get(&uri, Some(&authorization))?
    };

    if !(200..300).contains(&reply.status) {
        return Err(DownloadError::Status {
            uri,
            status: reply.status,
        });
    }

    std::fs::create_dir_all(dir)?;
    let mut file = tempfile::Builder::new()
        .prefix("nvr-")
        .suffix(".mp4")
        .tempfile_in(dir)?;
    let mut body = reply.body;
    let bytes = std::io::copy(&mut body, &mut file)?;
    file.flush()?;
    let (_, path) = file.keep().map_err(|e| e.error)?;

    info!("Downloaded {} → {} ({} bytes)", file_path, path.display(), bytes);
    Ok(path)
}

/// Periodic recording poller.  Owns the ledger.
pub struct RecordingScanner {
    session: Arc<SessionClient>,
    sink: Arc<dyn NotificationSink>,
    ledger: ProcessedLedger,
    settings: ScanSettings,
}

impl RecordingScanner {
    pub fn new(
        session: Arc<SessionClient>,
        sink: Arc<dyn NotificationSink>,
        ledger: ProcessedLedger,
        settings: ScanSettings,
    ) -> Self {
        Self {
            session,
            sink,
            ledger,
            settings,
        }
    }

    #[cfg(test)]
    pub fn ledger(&self) -> &ProcessedLedger {
        &self.ledger
    }

    /// One poll cycle.  Returns how many new recordings were handed off.
    pub fn poll_once(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let session = self.session.clone();
        let mut finder = scan_window(&session, &self.settings, now, self.settings.half_window)
            .context("Recording search failed")?;

        let mut handled: HashSet<String> = HashSet::new();
        let mut delivered = 0;

        for item in finder.by_ref() {
            let desc = match item {
                Ok(d) => d,
                Err(e) => {
                    warn!("Listing recordings failed: {e}");
                    break;
                }
            };
            if !handled.insert(desc.file_path.clone()) || self.ledger.has(&desc.file_path) {
                continue;
            }

            debug!("New recording: {}", desc.file_path);
            self.ledger.mark_processed(&desc.file_path, now);
            if let Err(e) = self.ledger.save(now) {
                error!("Cannot save ledger: {e}");
            }
            if self.deliver(&desc) {
                delivered += 1;
            }
        }
        finder.close();

        Ok(delivered)
    }

    fn deliver(&self, desc: &RecordingDescriptor) -> bool {
        let local = match download_recording(&self.session, &desc.file_path, &self.settings.download_dir)
        {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to download {}: {e}", desc.file_path);
                return false;
            }
        };

        let notification = Notification::Video {
            path: local.clone(),
            caption: recording_label(&desc.file_path),
        };
        let sent = notify::dispatch(self.sink.as_ref(), &notification);
        if sent {
            info!("Sent {}", desc.file_path);
        }

        if let Err(e) = std::fs::remove_file(&local) {
            warn!("Cannot remove {}: {e}", local.display());
        }
        sent
    }

    /// Poll now, then every `interval` until shutdown.  Stops for good if
    /// there is no session at all; skips cycles while re-authenticating.
    pub fn run(&mut self, interval: Duration, shutdown: &AtomicBool) {
        info!("Polling recordings every {}s", interval.as_secs());
        loop {
            if !self.session.has_session() {
                warn!("No session established, stopping recording poller");
                return;
            }

            if self.session.state() == SessionState::Reauthenticating {
                debug!("Session re-authenticating, skipping poll");
            } else {
                match self.poll_once(Utc::now()) {
                    Ok(0) => debug!("No new recordings"),
                    Ok(n) => info!("Delivered {n} new recording(s)"),
                    Err(e) => warn!("Poll failed: {e:#}"),
                }
            }

            if !crate::sleep_unless_shutdown(interval, shutdown) {
                break;
            }
        }
        info!("Recording poller stopped");
    }
}
