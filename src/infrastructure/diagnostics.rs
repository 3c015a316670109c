//! Packet diagnostics
//!
//! Every frame written to or received from the device is offered to the
//! configured sinks, whether or not it decodes. Nothing here feeds back into
//! device state.

use crate::domain::models::{Direction, PacketFrame};
use crate::domain::settings::DiagnosticsSettings;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// One byte that changed between two inbound frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteChange {
    pub offset: usize,
    /// `None` when the offset did not exist in the older frame
    pub old: Option<u8>,
    /// `None` when the offset does not exist in the newer frame
    pub new: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameDiff {
    pub elapsed: Duration,
    pub changes: Vec<ByteChange>,
}

/// Receiver of raw link traffic.
pub trait DiagnosticsSink: Send + Sync {
    fn on_frame(&self, frame: &PacketFrame);

    fn on_diff(&self, _diff: &FrameDiff) {}
}

/// Hex dump of every frame at debug level.
pub struct TracingFrameSink;

impl DiagnosticsSink for TracingFrameSink {
    fn on_frame(&self, frame: &PacketFrame) {
        let arrow = match frame.direction {
            Direction::Inbound => "<-",
            Direction::Outbound => "->",
        };
        debug!(target: "ac_infinity_ble::packets", "{} [{}] {}", arrow, frame.bytes.len(), frame.hex());
    }

    fn on_diff(&self, diff: &FrameDiff) {
        for change in &diff.changes {
            info!(
                target: "ac_infinity_ble::learning",
                "byte {:>3}: {} -> {} (+{} ms)",
                change.offset,
                fmt_byte(change.old),
                fmt_byte(change.new),
                diff.elapsed.as_millis()
            );
        }
    }
}

fn fmt_byte(byte: Option<u8>) -> String {
    byte.map_or_else(|| "--".to_string(), |b| format!("{:02X}", b))
}

/// Appends frames to a file, one JSON object per line.
pub struct CaptureFileSink {
    writer: Mutex<BufWriter<File>>,
}

impl CaptureFileSink {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open capture file {}", path.display()))?;
        info!("Capturing packets to {}", path.display());
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl DiagnosticsSink for CaptureFileSink {
    fn on_frame(&self, frame: &PacketFrame) {
        let Ok(mut writer) = self.writer.lock() else {
            return;
        };
        if let Err(e) = write_line(&mut *writer, frame) {
            warn!("Packet capture write failed: {}", e);
        }
    }
}

fn write_line(writer: &mut impl Write, frame: &PacketFrame) -> std::io::Result<()> {
    serde_json::to_writer(&mut *writer, frame)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

/// Learning mode: compares each inbound frame with the previous one when they
/// arrive close together and reports the offsets that changed.
pub struct LearningMode {
    window: Duration,
    last: Mutex<Option<(DateTime<Utc>, Vec<u8>)>>,
}

impl LearningMode {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(None),
        }
    }

    /// Record an inbound frame, returning the diff against its predecessor if
    /// that one is inside the window and something changed.
    pub fn observe(&self, frame: &PacketFrame) -> Option<FrameDiff> {
        let mut last = self.last.lock().unwrap_or_else(|p| p.into_inner());
        let previous = last.replace((frame.timestamp, frame.bytes.clone()));
        let (at, bytes) = previous?;

        let elapsed = (frame.timestamp - at).to_std().ok()?;
        if elapsed > self.window {
            return None;
        }

        let changes = diff_bytes(&bytes, &frame.bytes);
        if changes.is_empty() {
            return None;
        }
        Some(FrameDiff { elapsed, changes })
    }
}

/// Byte-by-byte comparison, including offsets only one side has.
pub fn diff_bytes(old: &[u8], new: &[u8]) -> Vec<ByteChange> {
    (0..old.len().max(new.len()))
        .filter_map(|offset| {
            let (o, n) = (old.get(offset).copied(), new.get(offset).copied());
            (o != n).then_some(ByteChange {
                offset,
                old: o,
                new: n,
            })
        })
        .collect()
}

/// Fan-out to all configured sinks.
#[derive(Default)]
pub struct Diagnostics {
    sinks: Vec<Arc<dyn DiagnosticsSink>>,
    learning: Option<LearningMode>,
}

impl Diagnostics {
    /// No sinks, no learning: frames are dropped.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &DiagnosticsSettings) -> Result<Self> {
        let mut diagnostics = Self::default();
        if settings.packet_logging || settings.learning_mode {
            diagnostics = diagnostics.with_sink(Arc::new(TracingFrameSink));
        }
        if let Some(path) = &settings.capture_file {
            diagnostics = diagnostics.with_sink(Arc::new(CaptureFileSink::open(path)?));
        }
        if settings.learning_mode {
            diagnostics = diagnostics.with_learning(Duration::from_millis(settings.learning_window_ms));
        }
        Ok(diagnostics)
    }

    pub fn with_sink(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn with_learning(mut self, window: Duration) -> Self {
        self.learning = Some(LearningMode::new(window));
        self
    }

    pub fn is_active(&self) -> bool {
        !self.sinks.is_empty()
    }

    pub fn record(&self, direction: Direction, bytes: &[u8]) {
        if !self.is_active() {
            return;
        }
        let frame = PacketFrame::now(direction, bytes);
        for sink in &self.sinks {
            sink.on_frame(&frame);
        }

        if direction == Direction::Inbound {
            if let Some(diff) = self.learning.as_ref().and_then(|l| l.observe(&frame)) {
                for sink in &self.sinks {
                    sink.on_diff(&diff);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect {
        frames: Mutex<Vec<PacketFrame>>,
        diffs: Mutex<Vec<FrameDiff>>,
    }

    impl DiagnosticsSink for Collect {
        fn on_frame(&self, frame: &PacketFrame) {
            self.frames.lock().unwrap().push(frame.clone());
        }

        fn on_diff(&self, diff: &FrameDiff) {
            self.diffs.lock().unwrap().push(diff.clone());
        }
    }

    fn frame_at(ms: i64, bytes: &[u8]) -> PacketFrame {
        PacketFrame {
            direction: Direction::Inbound,
            timestamp: DateTime::<Utc>::from_timestamp_millis(1_700_000_000_000 + ms).unwrap(),
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn test_diff_bytes() {
        let changes = diff_bytes(&[1, 2, 3], &[1, 9, 3, 4]);
        assert_eq!(
            changes,
            vec![
                ByteChange {
                    offset: 1,
                    old: Some(2),
                    new: Some(9)
                },
                ByteChange {
                    offset: 3,
                    old: None,
                    new: Some(4)
                },
            ]
        );
        assert!(diff_bytes(&[5, 5], &[5, 5]).is_empty());
    }

    #[test]
    fn test_learning_window() {
        let learning = LearningMode::new(Duration::from_secs(2));
        assert!(learning.observe(&frame_at(0, &[0, 1, 50])).is_none());

        let diff = learning.observe(&frame_at(500, &[0, 1, 60])).unwrap();
        assert_eq!(diff.elapsed, Duration::from_millis(500));
        assert_eq!(diff.changes.len(), 1);
        assert_eq!(diff.changes[0].offset, 2);

        // Outside the window: no diff
        assert!(learning.observe(&frame_at(5000, &[0, 0, 60])).is_none());
    }

    #[test]
    fn test_record_fans_out_and_diffs_inbound_only() {
        let collect = Arc::new(Collect::default());
        let diagnostics = Diagnostics::disabled()
            .with_sink(collect.clone())
            .with_learning(Duration::from_secs(60));

        diagnostics.record(Direction::Inbound, &[1, 1, 10]);
        diagnostics.record(Direction::Outbound, &[0xFF]);
        diagnostics.record(Direction::Inbound, &[1, 1, 20]);

        assert_eq!(collect.frames.lock().unwrap().len(), 3);
        let diffs = collect.diffs.lock().unwrap();
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].changes[0].old, Some(10));
        assert_eq!(diffs[0].changes[0].new, Some(20));
    }

    #[test]
    fn test_capture_file_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("captures").join("frames.jsonl");
        let diagnostics = Diagnostics::from_settings(&DiagnosticsSettings {
            capture_file: Some(path.clone()),
            ..Default::default()
        })
        .unwrap();

        diagnostics.record(Direction::Outbound, &[0x00, 0x01, 0x01]);
        diagnostics.record(Direction::Inbound, &[0x00, 0x01, 0x64]);

        let contents = std::fs::read_to_string(&path).unwrap();
        let frames: Vec<PacketFrame> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].direction, Direction::Outbound);
        assert_eq!(frames[1].bytes, vec![0x00, 0x01, 0x64]);
    }

    #[test]
    fn test_disabled_records_nothing() {
        let diagnostics = Diagnostics::from_settings(&DiagnosticsSettings::default()).unwrap();
        assert!(!diagnostics.is_active());
        diagnostics.record(Direction::Inbound, &[1, 2, 3]);
    }
}
