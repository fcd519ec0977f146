//! Alarm watcher – subscribes to the device's push event stream and turns
//! state changes into text notifications.
//!
//! The stream is an endless HTTP body of `var json={...}` frames.  Frames
//! are cut out of the byte stream with a balanced-brace scan, so a frame
//! may span any number of reads.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use nvr_common::protocol::{endpoint, method, parse_event_frame, AlarmEvent};

use crate::notify::{self, Notification, NotificationSink};
use crate::session::SessionClient;

const EVENT_MARKER: &[u8] = b"var json=";

/// Bytes requested per read from the stream.
const READ_CHUNK: usize = 4096;

/// Upper bound on buffered, not yet complete frame data.
const MAX_PENDING: usize = 1 << 20;

/// Consecutive read errors tolerated before re-subscribing.
const MAX_READ_ERRORS: u32 = 3;

// ── frame extraction ─────────────────────────────────────────────────────

/// Incremental extractor for `var json=` frames.
#[derive(Default)]
pub struct FrameScanner {
    pending: Vec<u8>,
}

impl FrameScanner {
    /// Append `chunk` and return every frame completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let Some(marker) = find(&self.pending, EVENT_MARKER) else {
                // Keep a possible partial marker at the tail.
                let keep = EVENT_MARKER.len() - 1;
                if self.pending.len() > keep {
                    self.pending.drain(..self.pending.len() - keep);
                }
                break;
            };
            self.pending.drain(..marker);

            let body = EVENT_MARKER.len();
            let Some(open) = self.pending[body..]
                .iter()
                .position(|b| !b.is_ascii_whitespace() && *b != b'(')
                .map(|p| p + body)
            else {
                break;
            };
            if self.pending[open] != b'{' {
                debug!("Skipping marker without JSON object");
                self.pending.drain(..body);
                continue;
            }

            match balanced_end(&self.pending[open..]) {
                Some(len) => {
                    let frame = String::from_utf8_lossy(&self.pending[open..open + len]).into_owned();
                    frames.push(frame);
                    self.pending.drain(..open + len);
                }
                None => {
                    if self.pending.len() > MAX_PENDING {
                        warn!(
                            "Event frame exceeds {} bytes, discarding",
                            MAX_PENDING
                        );
                        self.pending.drain(..body);
                        continue;
                    }
                    break;
                }
            }
        }

        frames
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Length of the JSON object starting at `bytes[0] == b'{'`, if complete.
fn balanced_end(bytes: &[u8]) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

// ── deduplication ────────────────────────────────────────────────────────

/// Suppresses an event identical to the last one emitted.
#[derive(Default)]
pub struct AlarmDeduplicator {
    last: Option<AlarmEvent>,
}

impl AlarmDeduplicator {
    /// `true` if `event` should be emitted; it then becomes the baseline.
    pub fn observe(&mut self, event: &AlarmEvent) -> bool {
        if self.last.as_ref() == Some(event) {
            return false;
        }
        self.last = Some(event.clone());
        true
    }
}

// ── watcher ──────────────────────────────────────────────────────────────

pub struct AlarmWatcher {
    session: Arc<SessionClient>,
    sink: Arc<dyn NotificationSink>,
    device_name: String,
    codes: Vec<String>,
    backoff: Duration,
    frames: FrameScanner,
    dedup: AlarmDeduplicator,
}

impl AlarmWatcher {
    pub fn new(
        session: Arc<SessionClient>,
        sink: Arc<dyn NotificationSink>,
        device_name: &str,
        codes: Vec<String>,
        backoff: Duration,
    ) -> Self {
        Self {
            session,
            sink,
            device_name: device_name.to_string(),
            codes,
            backoff,
            frames: FrameScanner::default(),
            dedup: AlarmDeduplicator::default(),
        }
    }

    /// Register for events and open the stream.
    fn subscribe(&self) -> Result<Box<dyn Read + Send>> {
        self.session
            .call(method::EVENT_INSTANCE, Value::Null, None)
            .context("eventManager.factory.instance")?;
        let attached = self
            .session
            .call(method::EVENT_ATTACH, json!({"codes": self.codes}), None)
            .context("eventManager.attach")?;
        if !attached.succeeded() {
            warn!("Device did not confirm attach to {:?}", self.codes);
        }

        let token = self.session.token();
        let uri = format!("{}?sessionId={}", endpoint::SUBSCRIBE, token);
        let cookie = format!(
            "secure; DhWebClientSessionID={}; username={}",
            token,
            self.session.credentials().username
        );
        let stream = self
            .session
            .transport()
            .subscribe(&uri, &cookie)
            .context("Cannot open event stream")?;
        Ok(stream)
    }

    /// Feed raw stream bytes; returns how many notifications were sent.
    pub fn handle_bytes(&mut self, chunk: &[u8]) -> usize {
        let mut emitted = 0;
        for frame in self.frames.push(chunk) {
            let events = match parse_event_frame(&frame) {
                Ok(events) => events,
                Err(e) => {
                    warn!("Malformed event frame: {e}");
                    continue;
                }
            };
            for event in events {
                debug!("{event:?}");
                if self.dedup.observe(&event) {
                    let text = format!(
                        "{}: {} {} {}",
                        self.device_name, event.code, event.action, event.locale_time
                    );
                    notify::dispatch(self.sink.as_ref(), &Notification::Text(text));
                    emitted += 1;
                } else {
                    debug!("Duplicate event");
                }
            }
        }
        emitted
    }

    /// Read the event stream until shutdown.  Read errors back off and
    /// retry; a closed stream or repeated errors re-subscribe.
    pub fn watch(&mut self, shutdown: &AtomicBool) {
        let mut buf = vec![0u8; READ_CHUNK];

        'subscribe: while !shutdown.load(Ordering::Relaxed) {
            let mut stream = match self.subscribe() {
                Ok(s) => s,
                Err(e) => {
                    warn!("Alarm subscription failed: {e:#}");
                    if !crate::sleep_unless_shutdown(self.backoff, shutdown) {
                        break;
                    }
                    continue;
                }
            };
            info!("Watching alarms {:?}", self.codes);
            self.frames = FrameScanner::default();

            let mut errors = 0;
            loop {
                if shutdown.load(Ordering::Relaxed) {
                    break 'subscribe;
                }
                match stream.read(&mut buf) {
                    Ok(0) => {
                        warn!("Event stream closed by device");
                        break;
                    }
                    Ok(n) => {
                        errors = 0;
                        self.handle_bytes(&buf[..n]);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        warn!("Error reading event stream: {e}");
                        errors += 1;
                        if !crate::sleep_unless_shutdown(self.backoff, shutdown) {
                            break 'subscribe;
                        }
                        if errors >= MAX_READ_ERRORS {
                            break;
                        }
                    }
                }
            }

            if !crate::sleep_unless_shutdown(self.backoff, shutdown) {
                break;
            }
        }
        info!("Alarm watcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{envelope, logged_in, login_reply, RecordingSink, ScriptedTransport};

    fn frame(action: &str, time: &str) -> String {
        format!(
            "var json={{\"method\":\"client.notifyEventStream\",\"params\":{{\"SID\":513,\"eventList\":[\
             {{\"Action\":\"{action}\",\"Code\":\"VideoMotion\",\"Data\":{{\"LocaleTime\":\"{time}\"}},\"Index\":0}}]}}}}\n"
        )
    }

    fn event(action: &str, time: &str) -> AlarmEvent {
        AlarmEvent {
            method: "client.notifyEventStream".into(),
            action: action.into(),
            code: "VideoMotion".into(),
            locale_time: time.into(),
        }
    }

    fn watcher(sink: Arc<RecordingSink>) -> AlarmWatcher {
        let transport = Arc::new(ScriptedTransport::new(|path, req| {
            Ok(login_reply(path, req).unwrap_or_else(|| envelope(json!({"result": true}))))
        }));
        AlarmWatcher::new(
            logged_in(transport),
            sink,
            "Porch",
            vec!["VideoMotion".into()],
            Duration::from_millis(10),
        )
    }

    #[test]
    fn test_scanner_single_chunk() {
        let mut s = FrameScanner::default();
        let frames = s.push(b"--myboundary\r\nContent-Type: text/plain\r\n\r\nvar json={\"a\":1}\n");
        assert_eq!(frames, vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn test_scanner_frame_split_across_chunks() {
        let mut s = FrameScanner::default();
        let text = frame("Start", "2024-01-01 10:00:00");
        let (a, b) = text.as_bytes().split_at(7); // splits the marker itself
        assert!(s.push(a).is_empty());
        let frames = s.push(b);
        assert_eq!(frames.len(), 1);
        assert_eq!(parse_event_frame(&frames[0]).unwrap()[0].action, "Start");
    }

    #[test]
    fn test_scanner_multiple_frames_and_nested_strings() {
        let mut s = FrameScanner::default();
        let frames = s.push(b"var json={\"s\":\"}{\\\"\",\"o\":{\"x\":{}}}\nvar json=({\"b\":2})\n");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], "{\"s\":\"}{\\\"\",\"o\":{\"x\":{}}}");
        assert_eq!(frames[1], "{\"b\":2}");
    }

    #[test]
    fn test_scanner_large_frame() {
        let mut s = FrameScanner::default();
        let padding = "x".repeat(10_000);
        let text = format!("var json={{\"pad\":\"{padding}\"}}\n");
        let mut frames = Vec::new();
        for chunk in text.as_bytes().chunks(1024) {
            frames.extend(s.push(chunk));
        }
        assert_eq!(frames.len(), 1);
        assert!(frames[0].ends_with("\"}"));
    }

    #[test]
    fn test_scanner_drops_oversized_frame() {
        const CHUNK: usize = 64 * 1024;
        let mut s = FrameScanner::default();

        assert!(s.push(b"var json={\"pad\":\"").is_empty());
        let filler = vec![b'x'; CHUNK];
        let mut pushed = 0;
        while pushed <= MAX_PENDING {
            assert!(s.push(&filler).is_empty());
            assert!(s.pending.len() <= MAX_PENDING + CHUNK);
            pushed += CHUNK;
        }
        assert!(s.pending.len() < EVENT_MARKER.len());

        let frames = s.push(b"var json={\"b\":2}\n");
        assert_eq!(frames, vec!["{\"b\":2}".to_string()]);
    }

    #[test]
    fn test_dedup_sequence() {
        let mut d = AlarmDeduplicator::default();
        let e1 = event("Start", "t1");
        let e2 = event("Stop", "t2");
        let emitted: Vec<bool> = [&e1, &e1, &e2, &e1].iter().map(|e| d.observe(e)).collect();
        assert_eq!(emitted, vec![true, false, true, true]);
    }

    #[test]
    fn test_watcher_emits_three_of_four() {
        let sink = Arc::new(RecordingSink::default());
        let mut w = watcher(sink.clone());
        let e1 = frame("Start", "2024-01-01 10:00:00");
        let e2 = frame("Stop", "2024-01-01 10:00:09");

        let stream = format!("{e1}{e1}{e2}{e1}");
        let emitted: usize = stream
            .as_bytes()
            .chunks(100)
            .map(|c| w.handle_bytes(c))
            .sum();

        assert_eq!(emitted, 3);
        let texts: Vec<_> = sink
            .sent()
            .into_iter()
            .map(|n| match n {
                Notification::Text(t) => t,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            texts,
            vec![
                "Porch: VideoMotion Start 2024-01-01 10:00:00",
                "Porch: VideoMotion Stop 2024-01-01 10:00:09",
                "Porch: VideoMotion Start 2024-01-01 10:00:00",
            ]
        );
    }

    #[test]
    fn test_watcher_skips_malformed_frame() {
        let sink = Arc::new(RecordingSink::default());
        let mut w = watcher(sink.clone());
        let good = frame("Start", "t");
        let input = format!("var json={{\"method\":\"x\"}}\n{good}");
        assert_eq!(w.handle_bytes(input.as_bytes()), 1);
    }

    #[test]
    fn test_watch_subscribes_and_stops() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let body = format!(
            "{}{}",
            frame("Start", "2024-01-01 10:00:00"),
            frame("Start", "2024-01-01 10:00:00")
        );
        let transport = Arc::new(
            ScriptedTransport::new(|path, req| {
                Ok(login_reply(path, req).unwrap_or_else(|| envelope(json!({"result": true}))))
            })
            .with_stream(body.as_bytes())
            .stop_when_drained(shutdown.clone()),
        );
        let sink = Arc::new(RecordingSink::default());
        let mut w = AlarmWatcher::new(
            logged_in(transport.clone()),
            sink.clone(),
            "Porch",
            vec!["VideoMotion".into()],
            Duration::from_millis(10),
        );

        w.watch(&shutdown);

        assert_eq!(sink.sent().len(), 1);
        let methods = transport.methods();
        assert!(methods.contains(&method::EVENT_INSTANCE.to_string()));
        let attach = transport
            .requests()
            .into_iter()
            .find(|(_, r)| r.method == method::EVENT_ATTACH)
            .unwrap();
        assert_eq!(attach.1.params["codes"][0], "VideoMotion");

        let subs = transport.subscribe_calls();
        assert_eq!(subs[0].0, "/SubscribeNotify.cgi?sessionId=S1");
        assert_eq!(subs[0].1, "secure; DhWebClientSessionID=S1; username=admin");
    }
}
