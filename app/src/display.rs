// Display metrics for the capture target
//
// An explicit size wins; otherwise the settings file; otherwise the platform
// is asked (X11 only, via xdpyinfo).

use anyhow::{anyhow, bail, Context, Result};
use log::debug;
use screen_capture::DisplayMetrics;

/// Parse `WIDTHxHEIGHT`, e.g. `1920x1080`.
pub fn parse_display_size(value: &str) -> Result<DisplayMetrics> {
    let (w, h) = value
        .trim()
        .split_once(['x', 'X'])
        .ok_or_else(|| anyhow!("expected WIDTHxHEIGHT, got {:?}", value))?;
    let width: u32 = w.trim().parse().with_context(|| format!("bad width in {:?}", value))?;
    let height: u32 = h.trim().parse().with_context(|| format!("bad height in {:?}", value))?;
    if width == 0 || height == 0 {
        bail!("display size must be positive, got {}x{}", width, height);
    }
    Ok(DisplayMetrics::new(width, height))
}

/// Pull the screen size out of `xdpyinfo` output (`dimensions:    1920x1080 pixels (...)`).
pub fn parse_xdpyinfo(output: &str) -> Option<DisplayMetrics> {
    output.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("dimensions:")?;
        let size = rest.split_whitespace().next()?;
        parse_display_size(size).ok()
    })
}

/// Ask the platform for the size of `target`.
pub async fn query_platform(target: &str) -> Result<DisplayMetrics> {
    if !cfg!(target_os = "linux") {
        bail!("cannot query the display size on this platform; pass --display-size");
    }

    let output = tokio::process::Command::new("xdpyinfo")
        .arg("-display")
        .arg(target)
        .output()
        .await
        .context("Failed to run xdpyinfo; pass --display-size instead")?;
    if !output.status.success() {
        bail!("xdpyinfo could not open display {:?}", target);
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let metrics = parse_xdpyinfo(&text).ok_or_else(|| anyhow!("xdpyinfo reported no dimensions"))?;
    debug!("Display {} is {}", target, metrics);
    Ok(metrics)
}

/// One snapshot for the session about to open.
pub async fn resolve(
    explicit: Option<DisplayMetrics>,
    configured: Option<DisplayMetrics>,
    target: &str,
) -> Result<DisplayMetrics> {
    match explicit.or(configured) {
        Some(metrics) => Ok(metrics),
        None => query_platform(target).await,
    }
}
