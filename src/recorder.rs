//! Main recording loop
//!
//! One thread drives capture, pacing, encoding and sink submission; all
//! graphics-API calls stay on it. Audio device threads feed the track
//! mixers on the side and are joined before anything is finalized.

use crate::audio_input::{self, SourceDevice};
use crate::capture::{self, BackendConfig, CaptureBackend, StopState};
use crate::config::{RecordMode, RecordOptions};
use crate::encoder::video::VideoSettings;
use crate::encoder::{AudioTrack, VideoEncoderCtx};
use crate::pacer::FramePacer;
use crate::signals::{self, SignalOfStop};
use crate::sink::{Output, PacketSink, ReplayRing, ReplaySink, StreamPacket, VIDEO_STREAM_INDEX};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// How the session ended; drives the process exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// User-requested stop or clean target teardown.
    Clean,
    /// Terminal runtime failure.
    Error,
}

const MAX_CONSECUTIVE_CAPTURE_ERRORS: u32 = 10;
const STATS_INTERVAL: Duration = Duration::from_secs(10);

pub fn run(options: &RecordOptions, sos: SignalOfStop) -> Result<SessionEnd> {
    // Capture backend first: it resolves the geometry everything else needs
    let mut backend = capture::create_backend(
        options.backend,
        &BackendConfig {
            target: options.target.clone(),
            fps: options.fps,
            capture_cursor: options.capture_cursor,
        },
    )
    .context("failed to start a capture backend")?;

    let geometry = backend
        .geometry()
        .context("capture backend reported no geometry")?;

    let mut video = match VideoEncoderCtx::new(&VideoSettings {
        width: geometry.width,
        height: geometry.height,
        fps: options.fps,
        quality: options.quality,
        gop_secs: options.gop_secs,
    }) {
        Ok(v) => v,
        Err(e) => {
            backend.stop();
            return Err(e);
        }
    };
    log::info!(
        "Capturing {}x{} at {} fps with {}",
        geometry.width,
        geometry.height,
        options.fps,
        video.codec_name()
    );

    // Audio: validate devices up front, then one track context per spec
    let all_sources: Vec<SourceDevice> = options
        .tracks
        .iter()
        .flat_map(|t| t.sources.iter().cloned())
        .collect();
    if let Err(e) = audio_input::validate_devices(&all_sources) {
        backend.stop();
        return Err(e);
    }

    let mut tracks = Vec::with_capacity(options.tracks.len());
    for (i, spec) in options.tracks.iter().enumerate() {
        match AudioTrack::new(VIDEO_STREAM_INDEX + 1 + i, spec.sources.len()) {
            Ok(track) => tracks.push(track),
            Err(e) => {
                backend.stop();
                return Err(e);
            }
        }
    }

    let mut stream_parameters = vec![video.codec_parameters()];
    stream_parameters.extend(tracks.iter().map(|t| t.codec_parameters()));

    let mut sink = match &options.mode {
        RecordMode::Continuous { output } => {
            let out = match Output::create(output, &stream_parameters) {
                Ok(out) => out,
                Err(e) => {
                    backend.stop();
                    return Err(e);
                }
            };
            log::info!("Recording to {}", output.display());
            PacketSink::Live(out)
        }
        RecordMode::Replay { window, output_dir } => {
            log::info!(
                "Replay buffer of {}s armed, saves go to {}",
                window.as_secs(),
                output_dir.display()
            );
            PacketSink::Replay(ReplaySink::new(
                Arc::new(ReplayRing::new(*window)),
                stream_parameters.clone(),
                output_dir.clone(),
                options.container.extension().to_string(),
            ))
        }
    };

    // Audio device threads, one per source
    let mut audio_threads: Vec<JoinHandle<()>> = Vec::new();
    for (track, spec) in tracks.iter().zip(&options.tracks) {
        let mixer = track.mixer();
        for (source_index, source) in spec.sources.iter().enumerate() {
            audio_threads.push(audio_input::spawn_source(
                source.clone(),
                source_index,
                Arc::clone(&mixer),
                sos.clone(),
            ));
        }
    }

    let end = drive(&mut backend, &mut video, &mut tracks, &mut sink, &sos, options.fps);

    // Shutdown: stop the world, join audio, flush, finalize
    sos.cancel();
    for handle in audio_threads {
        let _ = handle.join();
    }

    if matches!(options.mode, RecordMode::Continuous { .. }) {
        let now = Instant::now();
        if let Ok(packets) = video.finish() {
            for (packet, discard) in packets {
                let sp = StreamPacket::from_encoded(
                    &packet,
                    VIDEO_STREAM_INDEX,
                    video.time_base(),
                    discard,
                    now,
                );
                let _ = sink.submit(sp, now);
            }
        }
        for track in &mut tracks {
            let index = track.stream_index();
            let time_base = track.time_base();
            if let Ok(packets) = track.finish() {
                for packet in packets {
                    let sp = StreamPacket::from_encoded(&packet, index, time_base, false, now);
                    let _ = sink.submit(sp, now);
                }
            }
        }
    }

    backend.stop();
    sink.finalize()?;
    Ok(end)
}

/// The pacing/encode loop proper. Runs until stopped, the target goes away,
/// or the backend errors out.
fn drive(
    backend: &mut CaptureBackend,
    video: &mut VideoEncoderCtx,
    tracks: &mut [AudioTrack],
    sink: &mut PacketSink,
    sos: &SignalOfStop,
    fps: u32,
) -> SessionEnd {
    let start = Instant::now();
    let mut pacer = FramePacer::new(fps);
    let mut consecutive_capture_errors = 0u32;
    let mut captured_frames = 0u64;
    let mut duplicated_frames = 0u64;
    let mut last_stats = start;

    loop {
        if sos.cancelled() {
            log::info!("Stop requested");
            return SessionEnd::Clean;
        }

        let now = Instant::now();
        backend.tick(now);
        match backend.should_stop() {
            StopState::Stop { error: false } => {
                log::info!("Capture target gone, stopping");
                return SessionEnd::Clean;
            }
            StopState::Stop { error: true } => {
                log::error!("Capture backend failed");
                return SessionEnd::Error;
            }
            StopState::Continue => {}
        }

        let elapsed = now.duration_since(start);

        if pacer.capture_due(elapsed) {
            match backend.capture() {
                Ok(()) => {
                    consecutive_capture_errors = 0;
                    captured_frames += 1;
                }
                Err(e) => {
                    log::error!("Capture failed: {}", e);
                    consecutive_capture_errors += 1;
                    if consecutive_capture_errors >= MAX_CONSECUTIVE_CAPTURE_ERRORS {
                        log::error!(
                            "Too many consecutive capture failures ({}), stopping",
                            consecutive_capture_errors
                        );
                        return SessionEnd::Error;
                    }
                }
            }
        }

        // Owed-frame accounting: the first submission of a batch is the new
        // image, the rest are timestamp-consuming duplicates.
        let owed = pacer.frames_owed(elapsed);
        if owed > 0 {
            match backend.frame() {
                Ok(view) => {
                    let base_pts = pacer.frames_sent() - owed as i64;
                    for i in 0..owed {
                        let discard = i > 0;
                        if discard {
                            duplicated_frames += 1;
                        }
                        if let Err(e) = video.submit(view, base_pts + i as i64, discard) {
                            // One rejected submit must not forfeit the session
                            log::warn!("Video encode submit failed: {}", e);
                        }
                    }
                }
                Err(e) => log::warn!("No frame available: {}", e),
            }

            match video.drain() {
                Ok(packets) => {
                    for (packet, discard) in packets {
                        let sp = StreamPacket::from_encoded(
                            &packet,
                            VIDEO_STREAM_INDEX,
                            video.time_base(),
                            discard,
                            now,
                        );
                        if let Err(e) = sink.submit(sp, now) {
                            log::warn!("Packet write failed: {}", e);
                        }
                    }
                }
                Err(e) => log::warn!("Video encoder drain failed: {}", e),
            }
        }

        for track in tracks.iter_mut() {
            let index = track.stream_index();
            let time_base = track.time_base();
            match track.process(elapsed) {
                Ok(packets) => {
                    for packet in packets {
                        let sp =
                            StreamPacket::from_encoded(&packet, index, time_base, false, now);
                        if let Err(e) = sink.submit(sp, now) {
                            log::warn!("Audio packet write failed: {}", e);
                        }
                    }
                }
                Err(e) => log::warn!("Audio track {} failed: {}", index, e),
            }
        }

        if signals::take_save_request() {
            sink.request_save();
        }

        if now.duration_since(last_stats) >= STATS_INTERVAL {
            log::info!(
                "Recording: {} frames captured, {} sent ({} pacing duplicates)",
                captured_frames,
                pacer.frames_sent(),
                duplicated_frames
            );
            last_stats = now;
        }

        // Sleep off the rest of the polling slot
        let iteration = Instant::now().duration_since(now);
        if let Some(remaining) = pacer.poll_interval().checked_sub(iteration) {
            std::thread::sleep(remaining);
        }
    }
}
