//! Sync and query progress reporting.
//!
//! Reports observable progress during `cidx sync` (documents trained, batches
//! merged) and fan-out queries (sources answered) so users see how much is
//! left. Progress is emitted on **stderr** so stdout remains parseable for
//! scripts.

use std::io::Write;
use std::sync::Arc;

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// Walking the corpus directory. Total unknown.
    Scanning { corpus: String },
    /// Per-document artifact n of total is ready (built or cached).
    Training {
        n: u64,
        total: u64,
        document: String,
    },
    /// Batch n of total at the given merge level is done.
    Merging { level: u32, n: u64, total: u64 },
    /// Source n of total answered (or failed).
    Querying {
        n: u64,
        total: u64,
        source: String,
        ok: bool,
    },
}

/// Reports progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr: "sync  training  12 / 340 documents".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Scanning { corpus } => format!("sync {}  scanning...\n", corpus),
            ProgressEvent::Training { n, total, document } => format!(
                "sync  training  {} / {} documents  ({})\n",
                format_number(*n),
                format_number(*total),
                document
            ),
            ProgressEvent::Merging { level, n, total } => format!(
                "sync  merging  batch {} / {}  (level {})\n",
                format_number(*n),
                format_number(*total),
                level
            ),
            ProgressEvent::Querying {
                n,
                total,
                source,
                ok,
            } => format!(
                "query  {} / {} sources  {} {}\n",
                format_number(*n),
                format_number(*total),
                if *ok { "ok" } else { "failed" },
                source
            ),
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl JsonProgress {
    fn to_json(event: &ProgressEvent) -> serde_json::Value {
        match event {
            ProgressEvent::Scanning { corpus } => serde_json::json!({
                "event": "progress",
                "phase": "scanning",
                "corpus": corpus
            }),
            ProgressEvent::Training { n, total, document } => serde_json::json!({
                "event": "progress",
                "phase": "training",
                "n": n,
                "total": total,
                "document": document
            }),
            ProgressEvent::Merging { level, n, total } => serde_json::json!({
                "event": "progress",
                "phase": "merging",
                "level": level,
                "n": n,
                "total": total
            }),
            ProgressEvent::Querying {
                n,
                total,
                source,
                ok,
            } => serde_json::json!({
                "event": "progress",
                "phase": "querying",
                "n": n,
                "total": total,
                "source": source,
                "ok": ok
            }),
        }
    }
}

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        if let Ok(line) = serde_json::to_string(&Self::to_json(&event)) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Arc<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Arc::new(NoProgress),
            ProgressMode::Human => Arc::new(StderrProgress),
            ProgressMode::Json => Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Collects events for assertions.
    #[derive(Default)]
    pub(crate) struct RecordingProgress(pub Mutex<Vec<ProgressEvent>>);

    impl ProgressReporter for RecordingProgress {
        fn report(&self, event: ProgressEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(1), "1");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1234), "1,234");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn json_events_carry_phase() {
        let value = JsonProgress::to_json(&ProgressEvent::Merging {
            level: 1,
            n: 2,
            total: 3,
        });
        assert_eq!(value["phase"], "merging");
        assert_eq!(value["level"], 1);
        assert_eq!(value["total"], 3);
    }
}
