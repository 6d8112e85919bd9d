//! Packet sink: live muxing or the replay ring
//!
//! Encoded packets leave the encode pipeline through exactly one of two
//! sinks, chosen at startup. Continuous mode writes every packet straight
//! to a live muxer. Replay mode queues packets in an age-bounded ring and
//! writes a file only on request.

pub mod output;
pub mod ring;
pub mod save;

pub use output::Output;
pub use ring::{ReplayRing, ReplaySlice};

use ac_ffmpeg::codec::CodecParameters;
use ac_ffmpeg::packet::Packet;
use ac_ffmpeg::time::TimeBase;
use anyhow::Result;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// The video track is always stream 0; audio tracks follow.
pub const VIDEO_STREAM_INDEX: usize = 0;

/// One encoded unit as it travels from an encoder into a sink. Payload
/// bytes are owned (copied out of the codec packet) so the ring can hold
/// them across encoder reuse and hand deep copies to save jobs.
#[derive(Debug, Clone)]
pub struct StreamPacket {
    pub stream_index: usize,
    pub pts: i64,
    pub dts: i64,
    pub keyframe: bool,
    pub discard: bool,
    pub data: Bytes,
    pub time_base: TimeBase,
    pub recorded_at: Instant,
}

impl StreamPacket {
    pub fn from_encoded(
        packet: &Packet,
        stream_index: usize,
        time_base: TimeBase,
        discard: bool,
        now: Instant,
    ) -> Self {
        let pts = packet.pts().timestamp();
        let dts = if packet.dts().is_null() {
            pts
        } else {
            packet.dts().timestamp()
        };
        Self {
            stream_index,
            pts,
            dts,
            keyframe: packet.is_key(),
            discard,
            data: Bytes::copy_from_slice(packet.data()),
            time_base,
            recorded_at: now,
        }
    }

    pub fn is_video(&self) -> bool {
        self.stream_index == VIDEO_STREAM_INDEX
    }
}

pub enum PacketSink {
    Live(output::Output),
    Replay(ReplaySink),
}

impl PacketSink {
    pub fn submit(&mut self, packet: StreamPacket, now: Instant) -> Result<()> {
        match self {
            PacketSink::Live(out) => out.write(&packet, 0),
            PacketSink::Replay(replay) => {
                replay.ring.append(packet, now);
                Ok(())
            }
        }
    }

    /// Kick off an asynchronous replay save. No-op outside replay mode.
    pub fn request_save(&self) {
        match self {
            PacketSink::Live(_) => {
                log::warn!("Save requested but not recording a replay buffer");
            }
            PacketSink::Replay(replay) => replay.request_save(),
        }
    }

    /// Normal-shutdown finalization. The live muxer gets its trailer; the
    /// unsaved replay tail is discarded.
    pub fn finalize(self) -> Result<()> {
        match self {
            PacketSink::Live(out) => out.finalize(),
            PacketSink::Replay(replay) => {
                log::info!(
                    "Discarding {} unsaved buffered packets",
                    replay.ring.len()
                );
                Ok(())
            }
        }
    }
}

/// Replay-mode state: the shared ring plus everything a save job needs.
pub struct ReplaySink {
    ring: Arc<ReplayRing>,
    stream_parameters: Vec<CodecParameters>,
    output_dir: PathBuf,
    container_ext: String,
    save_in_flight: Arc<AtomicBool>,
}

impl ReplaySink {
    pub fn new(
        ring: Arc<ReplayRing>,
        stream_parameters: Vec<CodecParameters>,
        output_dir: PathBuf,
        container_ext: String,
    ) -> Self {
        Self {
            ring,
            stream_parameters,
            output_dir,
            container_ext,
            save_in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    fn request_save(&self) {
        // Only one save may run; a request while one is in flight is
        // dropped, not queued.
        if self
            .save_in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::warn!("Replay save already in progress, ignoring request");
            return;
        }

        let Some(slice) = self.ring.snapshot() else {
            // Replay too short to contain a keyframe; not an error
            log::info!("No keyframe buffered yet, nothing to save");
            self.save_in_flight.store(false, Ordering::Release);
            return;
        };

        save::spawn(save::SaveJob {
            slice,
            stream_parameters: self.stream_parameters.clone(),
            output_dir: self.output_dir.clone(),
            container_ext: self.container_ext.clone(),
            ring: Arc::clone(&self.ring),
            in_flight: Arc::clone(&self.save_in_flight),
        });
    }
}
