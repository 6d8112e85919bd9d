//! Container writer
//!
//! Thin wrapper over the media library's muxer: one stream per track,
//! header on build, trailer on finalize. Packets arrive as [`StreamPacket`]s
//! in their codec timebase; the muxer rescales them onto each output
//! stream's timebase as they are written.

use super::StreamPacket;
use ac_ffmpeg::codec::CodecParameters;
use ac_ffmpeg::format::io::IO;
use ac_ffmpeg::format::muxer::{Muxer, OutputFormat};
use ac_ffmpeg::packet::PacketMut;
use ac_ffmpeg::time::Timestamp;
use anyhow::{Context, Result, anyhow};
use std::fs::File;
use std::path::Path;

pub struct Output {
    muxer: Muxer<File>,
}

impl Output {
    /// Create the container with one stream per entry in `stream_parameters`,
    /// ordered by stream index.
    pub fn create(path: &Path, stream_parameters: &[CodecParameters]) -> Result<Self> {
        let name = path
            .to_str()
            .ok_or_else(|| anyhow!("output path is not valid UTF-8"))?;
        let output_format = OutputFormat::guess_from_file_name(name)
            .ok_or_else(|| anyhow!("unable to guess container format for '{}'", name))?;

        let file = File::create(path)
            .with_context(|| format!("failed to create output file '{}'", name))?;
        let io = IO::from_seekable_write_stream(file);

        let mut builder = Muxer::builder();
        for parameters in stream_parameters {
            builder.add_stream(parameters)?;
        }
        let muxer = builder.build(io, output_format)?;
        Ok(Self { muxer })
    }

    /// Write one packet, rebasing its timestamps by `pts_offset` (codec
    /// timebase units).
    pub fn write(&mut self, packet: &StreamPacket, pts_offset: i64) -> Result<()> {
        let rebased = PacketMut::from(&packet.data[..])
            .with_time_base(packet.time_base)
            .with_pts(Timestamp::new(packet.pts - pts_offset, packet.time_base))
            .with_dts(Timestamp::new(packet.dts - pts_offset, packet.time_base))
            .with_key_flag(packet.keyframe)
            .freeze()
            .with_stream_index(packet.stream_index);
        self.muxer.push(rebased)?;
        Ok(())
    }

    /// Flush buffered packets and write the trailer.
    pub fn finalize(mut self) -> Result<()> {
        self.muxer.flush()?;
        Ok(())
    }
}
