//! Capture backends
//!
//! Three ways of getting target pixels into encoder-visible memory, behind
//! one capability set: a vendor frame-grab session (`grab`), cross-API
//! texture interop (`interop`), and dma-buf plane export (`dmabuf`). The
//! set of backends is closed, so dispatch is a tagged enum rather than
//! trait objects.

mod dmabuf;
mod grab;
mod interop;

pub use dmabuf::DmabufCapture;
pub use grab::GrabCapture;
pub use interop::InteropCapture;

use crate::gfx::{self, CaptureTarget, TargetGeometry};
use anyhow::{Result, anyhow};
use std::time::{Duration, Instant};

/// How long a resize must stay quiet before GPU resources are re-registered.
/// Continuous drags produce event bursts; re-registering per event thrashes
/// the interop layer.
pub const RESIZE_DEBOUNCE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Direct-to-device-memory vendor grab API. Defined but never picked by
    /// auto-selection; drivers are known to stutter under the push model.
    Grab,
    /// Window texture shared into the encoder device via GPU interop.
    Interop,
    /// Zero-copy dma-buf plane export.
    Dmabuf,
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "grab" => Ok(BackendKind::Grab),
            "interop" => Ok(BackendKind::Interop),
            "dmabuf" => Ok(BackendKind::Dmabuf),
            other => Err(anyhow!(
                "unknown backend '{}' (expected grab, interop or dmabuf)",
                other
            )),
        }
    }
}

/// Terminal-condition poll result, checked once per drive-loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopState {
    Continue,
    Stop { error: bool },
}

/// Borrowed view of the pixels the encoder should consume next. BGRA.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub data: &'a [u8],
    pub stride: usize,
    pub width: u32,
    pub height: u32,
}

/// Common backend parameters from the session configuration.
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub target: CaptureTarget,
    pub fps: u32,
    pub capture_cursor: bool,
}

/// Deferred resize handling. Events accumulate; the latest geometry is
/// released only after [`RESIZE_DEBOUNCE`] of quiet.
#[derive(Debug, Default)]
pub struct ResizeDebounce {
    pending: Option<(u32, u32)>,
    last_event: Option<Instant>,
}

impl ResizeDebounce {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, now: Instant, width: u32, height: u32) {
        self.pending = Some((width, height));
        self.last_event = Some(now);
    }

    /// Whether a resize is pending but not yet released.
    pub fn pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Take the settled geometry, if the debounce window has elapsed.
    pub fn take_expired(&mut self, now: Instant) -> Option<(u32, u32)> {
        let last = self.last_event?;
        if now.duration_since(last) >= RESIZE_DEBOUNCE {
            self.last_event = None;
            self.pending.take()
        } else {
            None
        }
    }
}

pub enum CaptureBackend {
    Grab(GrabCapture),
    Interop(InteropCapture),
    Dmabuf(DmabufCapture),
}

impl CaptureBackend {
    /// Acquire every backend resource, or roll back and fail.
    pub fn start(&mut self) -> Result<()> {
        match self {
            CaptureBackend::Grab(b) => b.start(),
            CaptureBackend::Interop(b) => b.start(),
            CaptureBackend::Dmabuf(b) => b.start(),
        }
    }

    /// Cooperative per-iteration step: window events, resize debounce,
    /// resource re-registration. Never blocks.
    pub fn tick(&mut self, now: Instant) {
        match self {
            CaptureBackend::Grab(b) => b.tick(now),
            CaptureBackend::Interop(b) => b.tick(now),
            CaptureBackend::Dmabuf(b) => b.tick(now),
        }
    }

    pub fn should_stop(&self) -> StopState {
        match self {
            CaptureBackend::Grab(b) => b.should_stop(),
            CaptureBackend::Interop(b) => b.should_stop(),
            CaptureBackend::Dmabuf(b) => b.should_stop(),
        }
    }

    /// Perform the one device-side copy (or plane bind) for this frame.
    pub fn capture(&mut self) -> Result<()> {
        match self {
            CaptureBackend::Grab(b) => b.capture(),
            CaptureBackend::Interop(b) => b.capture(),
            CaptureBackend::Dmabuf(b) => b.capture(),
        }
    }

    /// The pixels the encoder should read. Valid until the next tick.
    pub fn frame(&self) -> Result<FrameView<'_>> {
        match self {
            CaptureBackend::Grab(b) => b.frame(),
            CaptureBackend::Interop(b) => b.frame(),
            CaptureBackend::Dmabuf(b) => b.frame(),
        }
    }

    pub fn geometry(&self) -> Option<TargetGeometry> {
        match self {
            CaptureBackend::Grab(b) => b.geometry(),
            CaptureBackend::Interop(b) => b.geometry(),
            CaptureBackend::Dmabuf(b) => b.geometry(),
        }
    }

    /// Idempotent teardown, safe after a failed `start`.
    pub fn stop(&mut self) {
        match self {
            CaptureBackend::Grab(b) => b.stop(),
            CaptureBackend::Interop(b) => b.stop(),
            CaptureBackend::Dmabuf(b) => b.stop(),
        }
    }
}

fn build(kind: BackendKind, config: &BackendConfig) -> Result<CaptureBackend> {
    let window_system = gfx::load_window_system();
    Ok(match kind {
        BackendKind::Grab => CaptureBackend::Grab(GrabCapture::new(
            window_system,
            gfx::load_grab_driver()?,
            config.clone(),
        )),
        BackendKind::Interop => CaptureBackend::Interop(InteropCapture::new(
            window_system,
            gfx::load_interop_context()?,
            config.clone(),
        )),
        BackendKind::Dmabuf => {
            CaptureBackend::Dmabuf(DmabufCapture::new(window_system, config.clone()))
        }
    })
}

/// Create and start a backend. `kind` of `None` auto-selects: dma-buf first,
/// texture interop second. The grab backend must be asked for explicitly.
pub fn create_backend(
    kind: Option<BackendKind>,
    config: &BackendConfig,
) -> Result<CaptureBackend> {
    let candidates: &[BackendKind] = match kind {
        Some(BackendKind::Grab) => &[BackendKind::Grab],
        Some(BackendKind::Interop) => &[BackendKind::Interop],
        Some(BackendKind::Dmabuf) => &[BackendKind::Dmabuf],
        None => &[BackendKind::Dmabuf, BackendKind::Interop],
    };

    let mut last_err = anyhow!("no capture backend available");
    for &candidate in candidates {
        match build(candidate, config) {
            Ok(mut backend) => match backend.start() {
                Ok(()) => {
                    log::info!("Using capture backend: {:?}", candidate);
                    return Ok(backend);
                }
                Err(e) => {
                    log::warn!("Backend {:?} failed to start: {}", candidate, e);
                    backend.stop();
                    last_err = e;
                }
            },
            Err(e) => {
                log::warn!("Backend {:?} unavailable: {}", candidate, e);
                last_err = e;
            }
        }
    }
    Err(last_err)
}

#[cfg(test)]
pub(crate) mod testutil;
