//! Recording-path parsing.
//!
//! Device recordings are stored as
//!   `/mnt/sd/2024-01-01/001/dav/10/10.00.00-10.05.00[M][0@0][0].mp4`
//! i.e. `<dir>/<date>/<disk>/<type>/<hour>/<start>-<end>[flags].<ext>`.

use std::sync::LazyLock;

use regex::Regex;

static RECORDING_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(\d{4}-\d{2}-\d{2})/\d+/[^/]+/\d{2}/(\d{2}\.\d{2}\.\d{2})-(\d{2}\.\d{2}\.\d{2})",
    )
    .expect("static regex")
});

/// Date and time span embedded in a recording path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingSpan {
    pub date: String,
    pub start: String,
    pub end: String,
}

impl RecordingSpan {
    pub fn parse(path: &str) -> Option<Self> {
        let caps = RECORDING_PATH.captures(path)?;
        Some(Self {
            date: caps[1].to_string(),
            start: caps[2].to_string(),
            end: caps[3].to_string(),
        })
    }
}

impl std::fmt::Display for RecordingSpan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} - {} to {}", self.date, self.start, self.end)
    }
}

/// Human-readable caption for a recording, or the path itself when it
/// does not follow the device layout.
pub fn recording_label(path: &str) -> String {
    RecordingSpan::parse(path)
        .map(|span| span.to_string())
        .unwrap_or_else(|| path.to_string())
}
