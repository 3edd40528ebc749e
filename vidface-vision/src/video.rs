use anyhow::{Context, Result};
use image::RgbImage;
use serde::Deserialize;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};

/// Sequential access to the decoded frames of one video.
pub trait FrameSource {
    /// Frame count advertised by the container.
    fn frame_count(&self) -> usize;

    /// Next decoded frame, or `None` at end of stream.
    fn next_frame(&mut self) -> Result<Option<RgbImage>>;
}

/// Opens videos by path.
pub trait VideoDecoder: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>>;
}

/// Decoder backed by the `ffprobe` and `ffmpeg` executables.
#[derive(Debug, Clone)]
pub struct Ffmpeg {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl Default for Ffmpeg {
    fn default() -> Self {
        Self::new("ffmpeg", "ffprobe")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamInfo {
    pub width: u32,
    pub height: u32,
    pub frames: usize,
}

#[derive(Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Deserialize)]
struct ProbeStream {
    width: Option<u32>,
    height: Option<u32>,
    nb_frames: Option<String>,
    nb_read_frames: Option<String>,
}

/// Parse `ffprobe -of json` output for the first video stream.
///
/// Returns the dimensions and, when the container or a counting pass reports it, the frame
/// count.
pub fn parse_probe(json: &[u8]) -> Result<(u32, u32, Option<usize>)> {
    let probe: ProbeOutput = serde_json::from_slice(json).context("parse ffprobe output")?;
    let stream = probe
        .streams
        .into_iter()
        .next()
        .ok_or_else(|| anyhow::anyhow!("no video stream"))?;
    let (width, height) = match (stream.width, stream.height) {
        (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
        _ => anyhow::bail!("video stream has no dimensions"),
    };
    let frames = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<usize>().ok())
        .or_else(|| {
            stream
                .nb_read_frames
                .as_deref()
                .and_then(|n| n.parse::<usize>().ok())
        });
    Ok((width, height, frames))
}

impl Ffmpeg {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    fn run_probe(&self, path: &Path, count_frames: bool) -> Result<Vec<u8>> {
        let entries = if count_frames {
            "stream=width,height,nb_read_frames"
        } else {
            "stream=width,height,nb_frames"
        };
        let mut cmd = Command::new(&self.ffprobe);
        cmd.args(["-v", "error", "-select_streams", "v:0"]);
        if count_frames {
            cmd.arg("-count_frames");
        }
        cmd.args(["-show_entries", entries, "-of", "json"]).arg(path);

        let output = cmd
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("running {}", self.ffprobe.display()))?;
        if !output.status.success() {
            anyhow::bail!(
                "ffprobe failed on {}: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output.stdout)
    }

    /// Dimensions and frame count of the first video stream.
    ///
    /// Containers that do not record a frame count (some webm/mkv files) fall back to a full
    /// counting pass.
    pub fn probe(&self, path: &Path) -> Result<StreamInfo> {
        let (width, height, frames) = parse_probe(&self.run_probe(path, false)?)?;
        let frames = match frames {
            Some(n) => n,
            None => {
                log::debug!("{} has no frame count, counting", path.display());
                parse_probe(&self.run_probe(path, true)?)?.2.unwrap_or(0)
            }
        };
        Ok(StreamInfo {
            width,
            height,
            frames,
        })
    }
}

impl VideoDecoder for Ffmpeg {
    fn open(&self, path: &Path) -> Result<Box<dyn FrameSource>> {
        let info = self.probe(path)?;
        log::debug!(
            "opened {}: {}x{} frames={}",
            path.display(),
            info.width,
            info.height,
            info.frames
        );
        Ok(Box::new(FfmpegVideo {
            ffmpeg: self.ffmpeg.clone(),
            path: path.to_path_buf(),
            info,
            child: None,
            stdout: None,
            finished: false,
        }))
    }
}

/// One video being decoded through an `ffmpeg` rawvideo pipe.
///
/// The decoder process is only spawned on the first `next_frame` call.
pub struct FfmpegVideo {
    ffmpeg: PathBuf,
    path: PathBuf,
    info: StreamInfo,
    child: Option<Child>,
    stdout: Option<ChildStdout>,
    finished: bool,
}

impl FfmpegVideo {
    /// Frames come out exactly as decoded: no duplication or dropping to a constant rate, so
    /// the n-th frame read is the n-th frame of the stream.
    fn spawn(&mut self) -> Result<()> {
        let mut child = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-nostdin", "-noautorotate", "-i"])
            .arg(&self.path)
            .args(["-map", "0:v:0", "-fps_mode", "passthrough"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("running {}", self.ffmpeg.display()))?;
        self.stdout = child.stdout.take();
        self.child = Some(child);
        Ok(())
    }
}

impl FrameSource for FfmpegVideo {
    fn frame_count(&self) -> usize {
        self.info.frames
    }

    fn next_frame(&mut self) -> Result<Option<RgbImage>> {
        if self.finished {
            return Ok(None);
        }
        if self.child.is_none() {
            self.spawn()?;
        }
        let stdout = self
            .stdout
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("ffmpeg stdout unavailable"))?;

        let len = (self.info.width * self.info.height * 3) as usize;
        let mut buf = vec![0u8; len];
        match stdout.read_exact(&mut buf) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.finished = true;
                return Ok(None);
            }
            Err(e) => {
                self.finished = true;
                return Err(e).context("reading decoded frame");
            }
        }
        RgbImage::from_raw(self.info.width, self.info.height, buf)
            .map(Some)
            .ok_or_else(|| anyhow::anyhow!("failed to build image buffer"))
    }
}

impl Drop for FfmpegVideo {
    fn drop(&mut self) {
        self.stdout.take();
        if let Some(mut child) = self.child.take() {
            // stop early when the caller has all the frames it wanted
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_reads_container_frame_count() {
        let json = br#"{"programs":[],"streams":[{"width":640,"height":360,"nb_frames":"250"}]}"#;
        assert_eq!(parse_probe(json).unwrap(), (640, 360, Some(250)));
    }

    #[test]
    fn probe_falls_back_to_counted_frames() {
        let json = br#"{"streams":[{"width":320,"height":240,"nb_read_frames":"12"}]}"#;
        assert_eq!(parse_probe(json).unwrap(), (320, 240, Some(12)));

        let json = br#"{"streams":[{"width":320,"height":240,"nb_frames":"N/A"}]}"#;
        assert_eq!(parse_probe(json).unwrap(), (320, 240, None));
    }

    #[test]
    fn probe_rejects_audio_only_files() {
        assert!(parse_probe(br#"{"streams":[]}"#).is_err());
        assert!(parse_probe(br#"{}"#).is_err());
        assert!(parse_probe(br#"{"streams":[{"width":0,"height":0}]}"#).is_err());
    }

    #[test]
    fn missing_binary_fails_to_open() {
        let ffmpeg = Ffmpeg::new("/nonexistent/ffmpeg", "/nonexistent/ffprobe");
        assert!(ffmpeg.open(Path::new("clip.mp4")).is_err());
    }
}
