//! NVR Agent – keeps a session with an IP camera / NVR, forwards new
//! recordings and motion alarms to a chat.
//!
//! This binary:
//! 1. Reads configuration from `agent.conf` and the environment
//! 2. Logs in to the device and syncs its clock
//! 3. Runs three loops: session keep-alive, recording poller and the
//!    alarm stream watcher.

mod alarms;
mod ledger;
mod notify;
mod scanner;
mod session;
mod transport;

#[cfg(test)]
mod testing;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info, warn};

use crate::alarms::AlarmWatcher;
use crate::ledger::ProcessedLedger;
use crate::notify::{NotificationSink, TelegramSink};
use crate::scanner::{RecordingScanner, ScanSettings};
use crate::session::SessionClient;
use crate::transport::HttpTransport;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

/// Longest single sleep between shutdown checks.
const SHUTDOWN_POLL: Duration = Duration::from_millis(500);

/// Sleep for `period` in short slices.  Returns `false` as soon as
/// `shutdown` is raised.
pub(crate) fn sleep_unless_shutdown(period: Duration, shutdown: &AtomicBool) -> bool {
    let mut remaining = period;
    while !remaining.is_zero() {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(SHUTDOWN_POLL);
        std::thread::sleep(step);
        remaining -= step;
    }
    !shutdown.load(Ordering::Relaxed)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    // ── load config ──────────────────────────────────────────────────
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = nvr_common::config::load(config_path.as_deref()).context("Config load failed")?;

    info!(
        "NVR Agent starting (device={}, name={}, tz={})",
        config.credentials.host,
        config.device_name,
        config.timezone.name()
    );

    // ── session ──────────────────────────────────────────────────────
    let transport = HttpTransport::new(&config.credentials.host, config.http_timeout())
        .context("Cannot build HTTP client")?;
    let session = Arc::new(SessionClient::new(
        Arc::new(transport),
        config.credentials.clone(),
        config.timezone,
    ));
    session.login().context("Login failed")?;
    if let Err(e) = session.set_device_time(Utc::now()) {
        warn!("Initial clock sync failed: {e}");
    }

    let sink: Arc<dyn NotificationSink> = Arc::new(
        TelegramSink::new(&config.telegram_bot_key, &config.telegram_chat_id)
            .context("Cannot build Telegram client")?,
    );

    // ── ctrl-c ───────────────────────────────────────────────────────
    ctrlc::set_handler(move || {
        SHUTDOWN.store(true, Ordering::Relaxed);
        info!("Shutdown signal received");
    })
    .context("Cannot set Ctrl-C handler")?;

    // ── keep-alive thread ────────────────────────────────────────────
    let keepalive_session = session.clone();
    let keepalive_interval = config.keepalive_interval();
    let keepalive_thread = std::thread::Builder::new()
        .name("keepalive".into())
        .spawn(move || keepalive_session.run_keep_alive(keepalive_interval, &SHUTDOWN))
        .context("Cannot spawn keep-alive thread")?;

    // ── recording poller thread ──────────────────────────────────────
    let ledger = ProcessedLedger::open(&config.db_path, config.ledger_retention())
        .context("Cannot open processed-file ledger")?;
    info!("{} recording(s) already processed", ledger.len());
    let settings = ScanSettings {
        channel: config.recording_channel,
        recording_dir: config.recording_dir.clone(),
        download_dir: config.download_dir.clone(),
        half_window: config.search_half_window(),
    };
    let mut recordings = RecordingScanner::new(session.clone(), sink.clone(), ledger, settings);
    let poll_interval = config.poll_interval();
    let recordings_thread = std::thread::Builder::new()
        .name("recordings".into())
        .spawn(move || recordings.run(poll_interval, &SHUTDOWN))
        .context("Cannot spawn recording thread")?;

    // ── alarm watcher thread ─────────────────────────────────────────
    // Not joined: its read blocks on the device stream until data arrives.
    let mut watcher = AlarmWatcher::new(
        session.clone(),
        sink,
        &config.device_name,
        config.alarm_codes.clone(),
        config.alarm_backoff(),
    );
    std::thread::Builder::new()
        .name("alarms".into())
        .spawn(move || watcher.watch(&SHUTDOWN))
        .context("Cannot spawn alarm thread")?;

    if recordings_thread.join().is_err() {
        error!("Recording thread panicked");
    }
    if keepalive_thread.join().is_err() {
        error!("Keep-alive thread panicked");
    }

    info!("NVR Agent stopped");
    Ok(())
}
