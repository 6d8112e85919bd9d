//! Recording session configuration

use crate::audio_input::SourceDevice;
use crate::capture::BackendKind;
use crate::gfx::CaptureTarget;
use anyhow::{Result, anyhow};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Medium,
    High,
    VeryHigh,
    Ultra,
}

impl Quality {
    /// Rate-control options for the chosen encoder.
    pub fn codec_options(&self, codec: &str) -> &'static [(&'static str, &'static str)] {
        match codec {
            "h264_nvenc" => match self {
                Quality::Medium => &[("cq", "28")],
                Quality::High => &[("cq", "24")],
                Quality::VeryHigh => &[("cq", "20")],
                Quality::Ultra => &[("cq", "16")],
            },
            "h264_qsv" => match self {
                Quality::Medium => &[("global_quality", "28")],
                Quality::High => &[("global_quality", "24")],
                Quality::VeryHigh => &[("global_quality", "20")],
                Quality::Ultra => &[("global_quality", "16")],
            },
            _ => match self {
                Quality::Medium => &[("crf", "28")],
                Quality::High => &[("crf", "24")],
                Quality::VeryHigh => &[("crf", "20")],
                Quality::Ultra => &[("crf", "16")],
            },
        }
    }
}

impl std::str::FromStr for Quality {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "medium" => Ok(Quality::Medium),
            "high" => Ok(Quality::High),
            "very_high" => Ok(Quality::VeryHigh),
            "ultra" => Ok(Quality::Ultra),
            other => Err(anyhow!(
                "unknown quality '{}' (expected medium, high, very_high or ultra)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Mkv,
    Mp4,
}

impl Container {
    pub fn extension(&self) -> &'static str {
        match self {
            Container::Mkv => "mkv",
            Container::Mp4 => "mp4",
        }
    }
}

impl std::str::FromStr for Container {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mkv" | "matroska" => Ok(Container::Mkv),
            "mp4" => Ok(Container::Mp4),
            other => Err(anyhow!("unknown container '{}' (expected mkv or mp4)", other)),
        }
    }
}

/// Chosen once at startup; the two modes are mutually exclusive.
#[derive(Debug, Clone)]
pub enum RecordMode {
    /// Write every packet to `output` as it is produced.
    Continuous { output: PathBuf },
    /// Keep the trailing `window` buffered; write files only on request.
    Replay { window: Duration, output_dir: PathBuf },
}

/// One output audio track and the devices mixed into it.
#[derive(Debug, Clone)]
pub struct TrackSpec {
    pub sources: Vec<SourceDevice>,
}

#[derive(Debug, Clone)]
pub struct RecordOptions {
    pub target: CaptureTarget,
    pub fps: u32,
    pub capture_cursor: bool,
    pub quality: Quality,
    pub container: Container,
    pub gop_secs: u32,
    pub backend: Option<BackendKind>,
    pub mode: RecordMode,
    pub tracks: Vec<TrackSpec>,
}

impl RecordOptions {
    pub fn validate(&self) -> Result<()> {
        if self.fps == 0 || self.fps > 500 {
            return Err(anyhow!("framerate {} out of range", self.fps));
        }
        if self.gop_secs == 0 {
            return Err(anyhow!("keyframe interval must be at least one second"));
        }
        match &self.mode {
            RecordMode::Continuous { output } => {
                if output.as_os_str().is_empty() {
                    return Err(anyhow!("output file required"));
                }
            }
            RecordMode::Replay { window, output_dir } => {
                if *window < Duration::from_secs(2) {
                    return Err(anyhow!("replay buffer must be at least 2 seconds"));
                }
                if !output_dir.is_dir() {
                    return Err(anyhow!(
                        "replay output directory '{}' does not exist",
                        output_dir.display()
                    ));
                }
            }
        }
        for track in &self.tracks {
            if track.sources.is_empty() {
                return Err(anyhow!("audio track without sources"));
            }
        }
        Ok(())
    }
}

/// `screen`, `focused`, a numeric window id, or an output name.
pub fn parse_target(s: &str) -> CaptureTarget {
    match s {
        "screen" => CaptureTarget::Screen,
        "focused" => CaptureTarget::Focused,
        other => {
            let id = other
                .strip_prefix("0x")
                .map(|hex| u32::from_str_radix(hex, 16))
                .unwrap_or_else(|| other.parse::<u32>());
            match id {
                Ok(id) => CaptureTarget::Window(id),
                Err(_) => CaptureTarget::Output(other.to_string()),
            }
        }
    }
}

/// Device list for one track; `|` merges devices into a single track.
pub fn parse_track(s: &str) -> TrackSpec {
    let sources = s
        .split('|')
        .map(|part| match part.trim() {
            "default" => SourceDevice::Default,
            "silent" | "none" => SourceDevice::Silent,
            name => SourceDevice::Named(name.to_string()),
        })
        .collect();
    TrackSpec { sources }
}

/// Returns a version as specified in Cargo.toml
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn app_name() -> &'static str {
    env!("CARGO_PKG_NAME")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target_forms() {
        assert_eq!(parse_target("screen"), CaptureTarget::Screen);
        assert_eq!(parse_target("focused"), CaptureTarget::Focused);
        assert_eq!(parse_target("0x3c0000f"), CaptureTarget::Window(0x3c0000f));
        assert_eq!(parse_target("12345"), CaptureTarget::Window(12345));
        assert_eq!(
            parse_target("DP-1"),
            CaptureTarget::Output("DP-1".to_string())
        );
    }

    #[test]
    fn test_parse_track_merges_devices() {
        let track = parse_track("default|alsa_output.pci.monitor");
        assert_eq!(track.sources.len(), 2);
        assert_eq!(track.sources[0], SourceDevice::Default);
        assert_eq!(
            track.sources[1],
            SourceDevice::Named("alsa_output.pci.monitor".to_string())
        );

        let silent = parse_track("none");
        assert_eq!(silent.sources, vec![SourceDevice::Silent]);
    }

    #[test]
    fn test_validate_rejects_missing_replay_dir() {
        let options = RecordOptions {
            target: CaptureTarget::Screen,
            fps: 60,
            capture_cursor: true,
            quality: Quality::VeryHigh,
            container: Container::Mkv,
            gop_secs: 2,
            backend: None,
            mode: RecordMode::Replay {
                window: Duration::from_secs(30),
                output_dir: PathBuf::from("/definitely/not/a/real/dir"),
            },
            tracks: Vec::new(),
        };
        assert!(options.validate().is_err());

        let ok = RecordOptions {
            mode: RecordMode::Replay {
                window: Duration::from_secs(30),
                output_dir: std::env::temp_dir(),
            },
            ..options
        };
        ok.validate().unwrap();
    }

    #[test]
    fn test_validate_bounds() {
        let mut options = RecordOptions {
            target: CaptureTarget::Screen,
            fps: 0,
            capture_cursor: false,
            quality: Quality::High,
            container: Container::Mp4,
            gop_secs: 2,
            backend: None,
            mode: RecordMode::Continuous {
                output: PathBuf::from("out.mp4"),
            },
            tracks: Vec::new(),
        };
        assert!(options.validate().is_err());
        options.fps = 60;
        options.validate().unwrap();

        options.mode = RecordMode::Replay {
            window: Duration::from_secs(1),
            output_dir: std::env::temp_dir(),
        };
        assert!(options.validate().is_err());
    }
}
