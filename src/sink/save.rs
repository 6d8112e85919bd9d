//! Asynchronous replay save job
//!
//! Each save runs on its own detached thread. It owns a deep copy of the
//! ring contents and a clone of the stream parameters taken before any
//! further packets were produced, so it needs no synchronization beyond
//! the snapshot that created it. On success the output path is printed as
//! a single line on stdout.

use super::output::Output;
use super::ring::{ReplayRing, ReplaySlice};
use ac_ffmpeg::codec::CodecParameters;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

pub(crate) struct SaveJob {
    pub slice: ReplaySlice,
    pub stream_parameters: Vec<CodecParameters>,
    pub output_dir: PathBuf,
    pub container_ext: String,
    pub ring: Arc<ReplayRing>,
    pub in_flight: Arc<AtomicBool>,
}

// Codec parameters are immutable after the encoders open; moving the
// cloned handles into the save thread is sound.
unsafe impl Send for SaveJob {}

pub(crate) fn spawn(job: SaveJob) {
    thread::spawn(move || {
        let path = replay_file_name(&job.output_dir, &job.container_ext);
        match write_replay(&job.slice, &job.stream_parameters, &path) {
            Ok(packets) => {
                log::info!("Replay saved: {} ({} packets)", path.display(), packets);
                // The output path contract: exactly one absolute path line
                // on stdout
                let absolute = std::fs::canonicalize(&path).unwrap_or(path);
                println!("{}", absolute.display());
                // A completed save empties the buffer; the next save
                // starts from fresh data.
                job.ring.clear();
            }
            Err(e) => {
                // Non-fatal: recording continues, nothing is emitted
                log::error!("Failed to save replay: {:#}", e);
            }
        }
        job.in_flight.store(false, Ordering::Release);
    });
}

fn write_replay(
    slice: &ReplaySlice,
    stream_parameters: &[CodecParameters],
    path: &Path,
) -> Result<usize> {
    let mut output = Output::create(path, stream_parameters)
        .with_context(|| format!("cannot open '{}'", path.display()))?;

    let mut written = 0usize;
    for packet in &slice.packets[slice.start_index..] {
        let offset = if packet.is_video() {
            slice.video_pts_offset
        } else {
            slice.audio_pts_offset
        };
        output.write(packet, offset)?;
        written += 1;
    }

    output.finalize()?;
    Ok(written)
}

/// `Replay_<timestamp>.<ext>` inside `dir`, which must already exist.
pub fn replay_file_name(dir: &Path, ext: &str) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S");
    dir.join(format!("Replay_{}.{}", stamp, ext))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_file_name_shape() {
        let path = replay_file_name(Path::new("/tmp/replays"), "mkv");
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("Replay_"));
        assert!(name.ends_with(".mkv"));
        assert_eq!(path.parent().unwrap(), Path::new("/tmp/replays"));
    }
}
