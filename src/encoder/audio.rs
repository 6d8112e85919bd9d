//! Audio track encoding
//!
//! One encoder context per output track. Device threads feed the track's
//! mixer; the drive loop calls [`AudioTrack::process`] which drains full
//! frames from the mixer sink and, when a track has gone quiet past the
//! grace window, synthesizes silence so the track pts never stalls against
//! the video timeline.

use super::mixer::AudioMixer;
use ac_ffmpeg::codec::audio::frame::get_sample_format;
use ac_ffmpeg::codec::audio::{AudioEncoder, AudioFrameMut, ChannelLayout};
use ac_ffmpeg::codec::{CodecParameters, Encoder};
use ac_ffmpeg::packet::Packet;
use ac_ffmpeg::time::{TimeBase, Timestamp};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;

pub const SAMPLE_RATE: u32 = 48_000;
pub const CHANNELS: usize = 2;

/// Per-source queue bound, one second of samples.
const SOURCE_QUEUE_CAP: usize = SAMPLE_RATE as usize * CHANNELS;

pub struct AudioTrack {
    encoder: AudioEncoder,
    mixer: Arc<AudioMixer>,
    stream_index: usize,
    /// Running pts in samples; advances by exactly `frame_size` per encoded
    /// frame, synthesized silence included.
    pts: i64,
    frame_size: usize,
    time_base: TimeBase,
    /// Elapsed time at the last encoded frame, real or synthesized.
    last_progress: Duration,
    scratch: Vec<f32>,
}

impl AudioTrack {
    /// Build a track with `source_count` input devices. A mixing stage is
    /// only meaningful for more than one source; with a single source the
    /// mixer degenerates to the track's input queue.
    pub fn new(stream_index: usize, source_count: usize) -> Result<Self> {
        let encoder = AudioEncoder::builder("libopus")
            .context("opus encoder not available")?
            .sample_rate(SAMPLE_RATE)
            .channel_layout(ChannelLayout::from_channels(CHANNELS as u32).unwrap())
            .sample_format(get_sample_format("flt"))
            .build()
            .context("failed to open opus encoder")?;

        let frame_size = encoder.samples_per_frame().unwrap_or(960);
        if source_count > 1 {
            log::info!(
                "Audio track {}: mixing {} sources",
                stream_index,
                source_count
            );
        }

        Ok(Self {
            encoder,
            mixer: Arc::new(AudioMixer::new(
                source_count,
                frame_size * CHANNELS,
                SOURCE_QUEUE_CAP,
            )),
            stream_index,
            pts: 0,
            frame_size,
            time_base: TimeBase::new(1, SAMPLE_RATE as i32),
            last_progress: Duration::ZERO,
            scratch: Vec::new(),
        })
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    pub fn mixer(&self) -> Arc<AudioMixer> {
        Arc::clone(&self.mixer)
    }

    pub fn time_base(&self) -> TimeBase {
        self.time_base
    }

    pub fn codec_parameters(&self) -> CodecParameters {
        self.encoder.codec_parameters().into()
    }

    /// Drain mixed frames and inject silence for quiet gaps. Called once
    /// per drive-loop iteration with the elapsed time since pipeline start.
    pub fn process(&mut self, elapsed: Duration) -> Result<Vec<Packet>> {
        let mut packets = Vec::new();

        let mut scratch = std::mem::take(&mut self.scratch);
        while self.mixer.pull_frame(&mut scratch) {
            self.encode_samples(&scratch, &mut packets)?;
            self.last_progress = elapsed;
        }
        self.scratch = scratch;

        let gap = elapsed.saturating_sub(self.last_progress);
        let missing = missing_frames(gap, SAMPLE_RATE, self.frame_size);
        if missing > 0 {
            log::debug!(
                "Audio track {}: no samples for {:?}, inserting {} silent frames",
                self.stream_index,
                gap,
                missing
            );
            for _ in 0..missing {
                self.encode_silence(&mut packets)?;
            }
            self.last_progress += frame_period(SAMPLE_RATE, self.frame_size) * missing as u32;
        }

        Ok(packets)
    }

    /// Signal end of stream and drain the remaining packets.
    pub fn finish(&mut self) -> Result<Vec<Packet>> {
        self.encoder.flush()?;
        let mut packets = Vec::new();
        while let Some(packet) = self.encoder.take()? {
            packets.push(packet);
        }
        Ok(packets)
    }

    fn encode_samples(&mut self, samples: &[f32], packets: &mut Vec<Packet>) -> Result<()> {
        let mut frame = self.blank_frame();
        {
            let mut planes = frame.planes_mut();
            let data = planes[0].data_mut();
            let target: &mut [f32] = unsafe {
                std::slice::from_raw_parts_mut(
                    data.as_mut_ptr() as *mut f32,
                    data.len() / std::mem::size_of::<f32>(),
                )
            };
            let n = samples.len().min(target.len());
            target[..n].copy_from_slice(&samples[..n]);
        }
        self.push_frame(frame, packets)
    }

    fn encode_silence(&mut self, packets: &mut Vec<Packet>) -> Result<()> {
        let frame = self.blank_frame();
        self.push_frame(frame, packets)
    }

    fn blank_frame(&self) -> AudioFrameMut {
        AudioFrameMut::silence(
            self.encoder.codec_parameters().channel_layout(),
            self.encoder.codec_parameters().sample_format(),
            self.encoder.codec_parameters().sample_rate(),
            self.frame_size,
        )
    }

    fn push_frame(
        &mut self,
        frame: AudioFrameMut,
        packets: &mut Vec<Packet>,
    ) -> Result<()> {
        let frame = frame
            .freeze()
            .with_pts(Timestamp::new(self.pts, self.time_base));
        self.encoder.push(frame)?;
        self.pts += self.frame_size as i64;

        while let Some(packet) = self.encoder.take()? {
            packets.push(packet);
        }
        Ok(())
    }
}

fn frame_period(sample_rate: u32, frame_size: usize) -> Duration {
    Duration::from_secs_f64(frame_size as f64 / sample_rate as f64)
}

/// Whole silence frames owed after a quiet gap. Nothing is owed until the
/// gap exceeds one frame period plus a one-frame grace window, and the
/// count rounds down; under-inserting recovers on the next real buffer,
/// duplicated or overlapping real audio does not.
fn missing_frames(gap: Duration, sample_rate: u32, frame_size: usize) -> u64 {
    let period = frame_size as f64 / sample_rate as f64;
    // Nudge past representation error so an exact multiple of the period
    // counts as reached
    let periods = gap.as_secs_f64() / period + 1e-9;
    if periods < 2.0 {
        0
    } else {
        periods as u64 - 1
    }
}
