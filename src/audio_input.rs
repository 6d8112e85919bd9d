//! Audio input device threads
//!
//! One dedicated thread per physical source, blocking-read style: the cpal
//! callback bridges captured buffers into a bounded synchronous channel and
//! the device thread forwards them into its track's mixer. Device threads
//! never touch the video path; they poll the stop token once per iteration
//! and are joined before any output is finalized.

use crate::encoder::AudioMixer;
use crate::encoder::audio::{CHANNELS, SAMPLE_RATE};
use crate::signals::SignalOfStop;
use anyhow::{Result, anyhow};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Sample, SampleFormat, SupportedStreamConfig};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, SyncSender, sync_channel};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// One input feeding a track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceDevice {
    /// The system default input device.
    Default,
    /// An input device matched by name.
    Named(String),
    /// No physical device; the track still advances with silence.
    Silent,
}

/// Fail early on devices that do not exist, listing what does.
pub fn validate_devices(sources: &[SourceDevice]) -> Result<()> {
    let host = cpal::default_host();
    for source in sources {
        match source {
            SourceDevice::Silent => {}
            SourceDevice::Default => {
                host.default_input_device()
                    .ok_or_else(|| anyhow!("no default audio input device found"))?;
            }
            SourceDevice::Named(name) => {
                let mut names = Vec::new();
                let found = host.input_devices()?.any(|d| {
                    let device_name = d.name().unwrap_or_default();
                    let matched = &device_name == name;
                    names.push(device_name);
                    matched
                });
                if !found {
                    return Err(anyhow!(
                        "audio device '{}' not found. Available devices: {:?}",
                        name,
                        names
                    ));
                }
            }
        }
    }
    Ok(())
}

/// Spawn the reader thread for one source. `source_index` addresses the
/// source's queue inside the track mixer.
pub fn spawn_source(
    source: SourceDevice,
    source_index: usize,
    mixer: Arc<AudioMixer>,
    sos: SignalOfStop,
) -> JoinHandle<()> {
    // One mixed frame per read deadline
    let period =
        Duration::from_secs_f64(mixer.frame_len() as f64 / CHANNELS as f64 / SAMPLE_RATE as f64);

    thread::spawn(move || match source {
        SourceDevice::Silent => {
            // Nothing to read; the track's silence synthesis keeps its pts
            // moving. Sleep one period per iteration.
            while !sos.cancelled() {
                sos.wait_timeout(period);
            }
        }
        SourceDevice::Default | SourceDevice::Named(_) => {
            if let Err(e) = run_device(&source, source_index, &mixer, &sos, period) {
                log::error!(
                    "Audio source {:?} stopped: {:#}; its track continues as silence",
                    source,
                    e
                );
                while !sos.cancelled() {
                    sos.wait_timeout(period);
                }
            }
        }
    })
}

fn run_device(
    source: &SourceDevice,
    source_index: usize,
    mixer: &Arc<AudioMixer>,
    sos: &SignalOfStop,
    period: Duration,
) -> Result<()> {
    let host = cpal::default_host();
    let device = match source {
        SourceDevice::Default => host
            .default_input_device()
            .ok_or_else(|| anyhow!("no default input device"))?,
        SourceDevice::Named(name) => host
            .input_devices()?
            .find(|d| d.name().map(|n| &n == name).unwrap_or(false))
            .ok_or_else(|| anyhow!("device '{}' disappeared", name))?,
        SourceDevice::Silent => unreachable!(),
    };

    let config = pick_config(&device)?;
    log::info!(
        "Audio source {:?}: {} Hz, {} ch, {:?}",
        source,
        config.sample_rate(),
        config.channels(),
        config.sample_format()
    );

    // cpal callback → bounded sync channel → this thread
    let (tx, rx) = sync_channel::<Vec<f32>>(64);
    let err_fn = |err| log::error!("Audio stream error: {}", err);

    let stream = match config.sample_format() {
        SampleFormat::I16 => device.build_input_stream(
            &config.into(),
            {
                let tx = tx.clone();
                move |data: &[i16], _: &_| forward(data, &tx)
            },
            err_fn,
            None,
        )?,
        SampleFormat::I32 => device.build_input_stream(
            &config.into(),
            {
                let tx = tx.clone();
                move |data: &[i32], _: &_| forward(data, &tx)
            },
            err_fn,
            None,
        )?,
        SampleFormat::F32 => device.build_input_stream(
            &config.into(),
            {
                let tx = tx.clone();
                move |data: &[f32], _: &_| forward(data, &tx)
            },
            err_fn,
            None,
        )?,
        other => return Err(anyhow!("unsupported sample format {:?}", other)),
    };
    stream.play()?;

    read_loop(&rx, source_index, mixer, sos, period);

    let _ = stream.pause();
    Ok(())
}

/// Blocking read of the next PCM chunk, one deadline per iteration.
fn read_loop(
    rx: &Receiver<Vec<f32>>,
    source_index: usize,
    mixer: &Arc<AudioMixer>,
    sos: &SignalOfStop,
    period: Duration,
) {
    while !sos.cancelled() {
        match rx.recv_timeout(period) {
            Ok(samples) => mixer.push(source_index, &samples),
            // Nothing this period; the track-side silence timer handles it
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn forward<T>(data: &[T], tx: &SyncSender<Vec<f32>>)
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    let samples: Vec<f32> = data.iter().map(|s| f32::from_sample(*s)).collect();
    // try_send: the capture callback must never block
    let _ = tx.try_send(samples);
}

/// The pipeline runs at a fixed 48 kHz stereo; pick a device mode that
/// supplies it natively.
fn pick_config(device: &cpal::Device) -> Result<SupportedStreamConfig> {
    let target = SAMPLE_RATE;
    device
        .supported_input_configs()?
        .filter(|c| c.channels() as usize == CHANNELS)
        .find(|c| c.min_sample_rate() <= target && c.max_sample_rate() >= target)
        .map(|c| c.with_sample_rate(target))
        .ok_or_else(|| {
            anyhow!(
                "device '{}' does not support {} Hz stereo capture",
                device.name().unwrap_or_default(),
                SAMPLE_RATE
            )
        })
}
