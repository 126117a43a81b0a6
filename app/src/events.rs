use std::path::Path;

use screen_capture::{Resolution, SessionHandle};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct RecordingStartedEvent {
    pub path: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClipSavedEvent {
    pub path: String,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
    #[serde(rename = "sizeBytes")]
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEvent {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeEvent {
    pub display: String,
    pub selected: Option<Resolution>,
    pub qualifying: Vec<Resolution>,
}

/// The terminal front end: human-readable lines, or one JSON object per line.
#[derive(Debug, Clone, Copy)]
pub struct Reporter {
    json: bool,
}

impl Reporter {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    fn emit<T: Serialize>(&self, event: &str, payload: &T, human: String) {
        if self.json {
            let line = serde_json::json!({ "event": event, "payload": payload });
            println!("{}", line);
        } else {
            println!("{}", human);
        }
    }

    /// Emit recording status
    pub fn status(&self, status: &str) {
        self.emit("recording-status", &status, format!("• {}", status));
    }

    pub fn started(&self, handle: &SessionHandle) {
        let resolution = handle.resolution();
        let event = RecordingStartedEvent {
            path: handle.output_path().display().to_string(),
            width: resolution.width,
            height: resolution.height,
        };
        let human = format!(
            "🔴 Recording {} at {} -> {}\n   Press Enter or Ctrl+C to stop.",
            handle.display(),
            resolution,
            event.path
        );
        self.emit("recording-started", &event, human);
    }

    pub fn clip_saved(&self, path: &Path, duration_ms: u64, size_bytes: u64) {
        let event = ClipSavedEvent {
            path: path.display().to_string(),
            duration_ms,
            size_bytes,
        };
        let human = format!(
            "✅ Saved {} ({:.1}s, {} KiB)",
            event.path,
            duration_ms as f64 / 1000.0,
            size_bytes / 1024
        );
        self.emit("clip-saved", &event, human);
    }

    pub fn error(&self, code: &str, message: &str) {
        let event = ErrorEvent {
            code: code.to_string(),
            message: message.to_string(),
        };
        let human = format!("❌ {}: {}", code, message);
        self.emit("recording-error", &event, human);
    }

    pub fn probe(&self, event: &ProbeEvent) {
        let human = match event.selected {
            Some(selected) => format!(
                "Display {} records at {} (fits: {})",
                event.display,
                selected,
                event
                    .qualifying
                    .iter()
                    .map(|r| r.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            None => format!("Display {}: no candidate width fits", event.display),
        };
        self.emit("probe", event, human);
    }
}
