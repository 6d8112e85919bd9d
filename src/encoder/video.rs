//! Hardware video encoder context

use crate::capture::FrameView;
use crate::config::Quality;
use ac_ffmpeg::codec::video::frame::get_pixel_format;
use ac_ffmpeg::codec::video::{PixelFormat, VideoEncoder, VideoFrame, VideoFrameMut};
use ac_ffmpeg::codec::{CodecParameters, Encoder};
use ac_ffmpeg::packet::Packet;
use ac_ffmpeg::time::{TimeBase, Timestamp};
use anyhow::{Result, anyhow};
use std::collections::HashSet;
use std::collections::VecDeque;

/// Encoder fallback chain: hardware first, software last. Each entry names
/// the codec, the BGRA-family input format it accepts, and its base options.
const ENCODER_CHAIN: &[(&str, &str, &[(&str, &str)])] = &[
    (
        "h264_nvenc",
        "bgr0",
        &[
            ("preset", "p5"),
            ("rc", "vbr"),
            ("spatial-aq", "1"),
        ],
    ),
    (
        "h264_qsv",
        "bgra",
        &[("preset", "medium")],
    ),
    // Software fallback; the rgb variant takes the capture format directly
    (
        "libx264rgb",
        "bgr0",
        &[("preset", "veryfast")],
    ),
];

#[derive(Debug, Clone)]
pub struct VideoSettings {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub quality: Quality,
    /// Keyframe interval in seconds. Bounds how far before the replay
    /// window a save has to reach back.
    pub gop_secs: u32,
}

pub struct VideoEncoderCtx {
    encoder: VideoEncoder,
    pool: FramePool,
    time_base: TimeBase,
    width: usize,
    height: usize,
    codec_name: String,
    /// Pts values submitted as pacing duplicates, matched against drained
    /// packets to tag them.
    duplicate_pts: HashSet<i64>,
}

impl VideoEncoderCtx {
    pub fn new(settings: &VideoSettings) -> Result<Self> {
        // Encoders want even dimensions
        let width = (settings.width + (settings.width % 2)) as usize;
        let height = (settings.height + (settings.height % 2)) as usize;

        // Decoder-timeline pts are frame counts
        let time_base = TimeBase::new(1, settings.fps as i32);
        let gop = (settings.fps * settings.gop_secs).to_string();

        let mut chosen = None;
        for (codec, format_name, options) in ENCODER_CHAIN {
            let mut builder = match VideoEncoder::builder(codec) {
                Ok(b) => b,
                Err(e) => {
                    log::debug!("Encoder {} not available, skipping: {}", codec, e);
                    continue;
                }
            };
            let pixel_format = get_pixel_format(format_name);
            builder = builder
                .pixel_format(pixel_format)
                .width(width)
                .height(height)
                .time_base(time_base)
                .set_option("g", &gop);
            for (k, v) in *options {
                builder = builder.set_option(k, v);
            }
            for (k, v) in settings.quality.codec_options(codec) {
                builder = builder.set_option(k, v);
            }
            match builder.build() {
                Ok(encoder) => {
                    chosen = Some((encoder, codec.to_string(), pixel_format));
                    break;
                }
                Err(e) => {
                    log::debug!("Encoder {} failed to initialize: {}", codec, e);
                }
            }
        }

        let (encoder, codec_name, pixel_format) = chosen.ok_or_else(|| {
            anyhow!("no H.264 encoder available, install FFmpeg with libx264 support")
        })?;
        log::info!("Using video encoder: {}", codec_name);

        Ok(Self {
            encoder,
            pool: FramePool::new(width, height, time_base, pixel_format),
            time_base,
            width,
            height,
            codec_name,
            duplicate_pts: HashSet::new(),
        })
    }

    pub fn codec_name(&self) -> &str {
        &self.codec_name
    }

    pub fn time_base(&self) -> TimeBase {
        self.time_base
    }

    pub fn codec_parameters(&self) -> CodecParameters {
        self.encoder.codec_parameters().into()
    }

    /// Submit one frame. `discard` marks a pacing duplicate: it still
    /// consumes the pts slot but is tagged on the way out so downstream
    /// consumers can avoid double-counting real frames.
    pub fn submit(&mut self, view: FrameView<'_>, pts: i64, discard: bool) -> Result<()> {
        let mut frame = self.pool.take();
        frame = frame.with_pts(Timestamp::new(pts, self.time_base));

        {
            let mut planes = frame.planes_mut();
            let plane = planes[0].data_mut();
            let line_size = plane.len() / self.height;
            copy_rows(
                view.data,
                view.stride,
                plane,
                line_size,
                self.height.min(view.height as usize),
                (self.width * 4).min(view.width as usize * 4),
            );
        }

        if discard {
            self.duplicate_pts.insert(pts);
        }

        let frame = frame.freeze();
        self.encoder.push(frame.clone())?;
        self.pool.put(frame);
        Ok(())
    }

    /// Pull every packet the encoder has ready, tagging pacing duplicates.
    pub fn drain(&mut self) -> Result<Vec<(Packet, bool)>> {
        let mut out = Vec::new();
        while let Some(packet) = self.encoder.take()? {
            let discard = self.duplicate_pts.remove(&packet.pts().timestamp());
            out.push((packet, discard));
        }
        Ok(out)
    }

    /// Signal end of stream and drain the remaining packets.
    pub fn finish(&mut self) -> Result<Vec<(Packet, bool)>> {
        self.encoder.flush()?;
        self.drain()
    }
}

/// Row-wise copy between surfaces with differing strides. Fast path for a
/// full-width match, bounded row copies otherwise.
fn copy_rows(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    rows: usize,
    row_bytes: usize,
) {
    if src_stride == dst_stride && src_stride == row_bytes {
        let total = (rows * row_bytes).min(src.len()).min(dst.len());
        dst[..total].copy_from_slice(&src[..total]);
        return;
    }

    for r in 0..rows {
        let src_start = r * src_stride;
        let dst_start = r * dst_stride;
        if src_start + row_bytes > src.len() || dst_start + row_bytes > dst.len() {
            break;
        }
        dst[dst_start..dst_start + row_bytes]
            .copy_from_slice(&src[src_start..src_start + row_bytes]);
    }
}

/// Pool of reusable frames so the per-submission cost is one plane copy,
/// not an allocation.
struct FramePool {
    frames: VecDeque<VideoFrame>,
    width: usize,
    height: usize,
    time_base: TimeBase,
    pixel_format: PixelFormat,
}

const POOL_SIZE: usize = 4;

impl FramePool {
    fn new(width: usize, height: usize, time_base: TimeBase, pixel_format: PixelFormat) -> Self {
        let mut frames = VecDeque::with_capacity(POOL_SIZE);
        for _ in 0..POOL_SIZE {
            frames.push_back(
                VideoFrameMut::black(pixel_format, width, height)
                    .with_time_base(time_base)
                    .freeze(),
            );
        }
        Self {
            frames,
            width,
            height,
            time_base,
            pixel_format,
        }
    }

    fn put(&mut self, frame: VideoFrame) {
        if self.frames.len() < POOL_SIZE * 2 {
            self.frames.push_back(frame);
        }
    }

    fn take(&mut self) -> VideoFrameMut {
        // Each pooled frame is tried once; frames the encoder still holds
        // go back to the pool.
        for _ in 0..self.frames.len() {
            let Some(frame) = self.frames.pop_front() else {
                break;
            };
            match frame.try_into_mut() {
                Ok(frame) => return frame,
                Err(frame) => self.frames.push_back(frame),
            }
        }
        VideoFrameMut::black(self.pixel_format, self.width, self.height)
            .with_time_base(self.time_base)
    }
}
