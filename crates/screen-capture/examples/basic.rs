// Basic screen recording example
//
// Records 5 seconds of the X display :0.0 (1920x1080) into ./recordings

use screen_capture::{CaptureSession, CaptureToken, DisplayMetrics, FfmpegBackend, RecordingConfig};
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("🎬 Starting screen recording...");

    let config = RecordingConfig {
        output_dir: "recordings".into(),
        ..Default::default()
    };

    let session = CaptureSession::new(FfmpegBackend::new(config.clone()), config)?;
    let handle = session
        .open(DisplayMetrics::new(1920, 1080), CaptureToken::new(":0.0"))
        .wait()?;
    println!("▶️  Recording at {}... (5 seconds)", handle.resolution());

    std::thread::sleep(Duration::from_secs(5));

    session.stop(&handle);
    println!("✅ Recording saved to: {:?}", handle.output_path());

    Ok(())
}
