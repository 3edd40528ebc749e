use anyhow::Result;
use std::path::Path;
use std::process::{Command, Stdio};
use vidface_vision::video::{Ffmpeg, FrameSource, VideoDecoder};

fn ffmpeg_available() -> bool {
    ["ffmpeg", "ffprobe"].iter().all(|bin| {
        Command::new(bin)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    })
}

fn render_test_clip(path: &Path, frames: usize) -> Result<()> {
    let status = Command::new("ffmpeg")
        .args(["-v", "error", "-y", "-f", "lavfi", "-i", "testsrc=size=64x48:rate=10"])
        .args(["-frames:v", &frames.to_string(), "-pix_fmt", "yuv420p"])
        .arg(path)
        .status()?;
    anyhow::ensure!(status.success(), "ffmpeg could not render the test clip");
    Ok(())
}

#[test]
fn decodes_every_frame_of_a_short_clip() -> Result<()> {
    env_logger::try_init().ok();
    if !ffmpeg_available() {
        eprintln!("Skipping: ffmpeg/ffprobe not installed");
        return Ok(());
    }

    let dir = tempfile::tempdir()?;
    let clip = dir.path().join("clip.mp4");
    render_test_clip(&clip, 5)?;

    let mut video = Ffmpeg::default().open(&clip)?;
    assert_eq!(video.frame_count(), 5);

    let mut decoded = 0;
    while let Some(frame) = video.next_frame()? {
        assert_eq!(frame.dimensions(), (64, 48));
        decoded += 1;
    }
    assert_eq!(decoded, 5);
    assert!(video.next_frame()?.is_none());
    Ok(())
}

/// Frame gaps grow quadratically, so no constant rate fits the stream.
fn render_variable_rate_clip(path: &Path, frames: usize) -> Result<()> {
    let status = Command::new("ffmpeg")
        .args(["-v", "error", "-y", "-f", "lavfi", "-i", "testsrc=size=64x48:rate=10"])
        .args(["-frames:v", &frames.to_string(), "-vf", "setpts=N*N/10/TB"])
        .args(["-fps_mode", "vfr", "-pix_fmt", "yuv420p"])
        .arg(path)
        .status()?;
    anyhow::ensure!(status.success(), "ffmpeg could not render the test clip");
    Ok(())
}

#[test]
fn variable_rate_clip_yields_each_frame_once() -> Result<()> {
    if !ffmpeg_available() {
        eprintln!("Skipping: ffmpeg/ffprobe not installed");
        return Ok(());
    }

    let dir = tempfile::tempdir()?;
    let clip = dir.path().join("vfr.mkv");
    render_variable_rate_clip(&clip, 12)?;

    let mut video = Ffmpeg::default().open(&clip)?;
    let mut decoded = 0;
    while video.next_frame()?.is_some() {
        decoded += 1;
    }
    assert_eq!(decoded, 12);
    assert_eq!(video.frame_count(), decoded);
    Ok(())
}

#[test]
fn dropping_mid_stream_stops_the_decoder() -> Result<()> {
    if !ffmpeg_available() {
        eprintln!("Skipping: ffmpeg/ffprobe not installed");
        return Ok(());
    }

    let dir = tempfile::tempdir()?;
    let clip = dir.path().join("long.mp4");
    render_test_clip(&clip, 100)?;

    let mut video = Ffmpeg::default().open(&clip)?;
    assert!(video.next_frame()?.is_some());
    drop(video);
    Ok(())
}

#[test]
fn opening_a_non_video_fails() -> Result<()> {
    if !ffmpeg_available() {
        eprintln!("Skipping: ffmpeg/ffprobe not installed");
        return Ok(());
    }

    let dir = tempfile::tempdir()?;
    let junk = dir.path().join("junk.mp4");
    std::fs::write(&junk, b"definitely not a video")?;
    assert!(Ffmpeg::default().open(&junk).is_err());
    Ok(())
}
