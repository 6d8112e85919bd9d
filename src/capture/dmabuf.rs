//! Zero-copy capture via dma-buf plane export
//!
//! The window system exports the target's backing buffer as a dma-buf file
//! descriptor once after geometry settles. The encoder-visible frame wraps
//! that mapping by reference, so the steady state has no per-frame copy at
//! all; `capture` only re-asserts the bind. Descriptor release is tied to
//! the mapping's Drop. Layouts with more than one plane are rejected.

use super::{BackendConfig, FrameView, ResizeDebounce, StopState};
use crate::gfx::{PlaneDescriptor, TargetGeometry, WindowEvent, WindowSystem};
use anyhow::{Context, Result, anyhow};
use std::time::Instant;

/// An exported plane mapped for encoder access. Dropping this releases the
/// mapping and then the descriptor's file descriptor.
struct MappedPlane {
    map: memmap2::Mmap,
    descriptor: PlaneDescriptor,
    width: u32,
    height: u32,
}

impl MappedPlane {
    fn bind(descriptor: PlaneDescriptor, geometry: &TargetGeometry) -> Result<Self> {
        let map = unsafe {
            memmap2::MmapOptions::new()
                .offset(descriptor.offset as u64)
                .len(descriptor.size)
                .map(&descriptor.fd)
                .context("failed to map exported plane")?
        };
        Ok(Self {
            map,
            descriptor,
            width: geometry.width,
            height: geometry.height,
        })
    }
}

pub struct DmabufCapture {
    window_system: Box<dyn WindowSystem>,
    config: BackendConfig,
    geometry: Option<TargetGeometry>,
    plane: Option<MappedPlane>,
    debounce: ResizeDebounce,
    started: bool,
    stopped: bool,
    errored: bool,
}

impl DmabufCapture {
    pub fn new(window_system: Box<dyn WindowSystem>, config: BackendConfig) -> Self {
        Self {
            window_system,
            config,
            geometry: None,
            plane: None,
            debounce: ResizeDebounce::new(),
            started: false,
            stopped: false,
            errored: false,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        let geometry = match self.window_system.resolve_target(&self.config.target) {
            Ok(g) => g,
            Err(e) => {
                self.stop();
                return Err(e);
            }
        };
        self.geometry = Some(geometry);

        if let Err(e) = self.export(geometry) {
            self.stop();
            return Err(e);
        }
        self.started = true;
        Ok(())
    }

    fn export(&mut self, geometry: TargetGeometry) -> Result<()> {
        let mut planes = self.window_system.export_planes(&geometry)?;
        if planes.len() != 1 {
            return Err(anyhow!(
                "dma-buf capture supports single-plane layouts only, got {} planes",
                planes.len()
            ));
        }
        self.plane = Some(MappedPlane::bind(planes.remove(0), &geometry)?);
        Ok(())
    }

    pub fn tick(&mut self, now: Instant) {
        if !self.started || self.stopped || self.errored {
            return;
        }

        for event in self.window_system.poll_events() {
            match event {
                WindowEvent::Closed => self.stopped = true,
                WindowEvent::Resized { width, height } => {
                    self.debounce.observe(now, width, height);
                }
                WindowEvent::Expose => {}
            }
        }

        if let Some((width, height)) = self.debounce.take_expired(now) {
            let mut geometry = self.geometry.unwrap_or(TargetGeometry {
                x: 0,
                y: 0,
                width,
                height,
            });
            geometry.width = width;
            geometry.height = height;

            // Old descriptor must be released before a new export
            self.plane = None;
            if let Err(e) = self.export(geometry) {
                log::error!("dma-buf re-export after resize failed: {}", e);
                self.errored = true;
                return;
            }
            self.geometry = Some(geometry);
            log::info!("dma-buf plane re-exported at {}x{}", width, height);
        }
    }

    pub fn should_stop(&self) -> StopState {
        if self.errored {
            StopState::Stop { error: true }
        } else if self.stopped {
            StopState::Stop { error: false }
        } else {
            StopState::Continue
        }
    }

    /// The plane is live-mapped; there is nothing to copy. Only re-assert
    /// that the bind still exists.
    pub fn capture(&mut self) -> Result<()> {
        if self.plane.is_none() {
            return Err(anyhow!("capture called before start"));
        }
        Ok(())
    }

    pub fn frame(&self) -> Result<FrameView<'_>> {
        let plane = self
            .plane
            .as_ref()
            .ok_or_else(|| anyhow!("frame requested before start"))?;
        let stride = plane.descriptor.stride as usize;
        let len = (stride * plane.height as usize).min(plane.map.len());
        Ok(FrameView {
            data: &plane.map[..len],
            stride,
            width: plane.width,
            height: plane.height,
        })
    }

    pub fn geometry(&self) -> Option<TargetGeometry> {
        self.geometry
    }

    pub fn stop(&mut self) {
        self.plane = None;
        self.started = false;
    }
}

impl Drop for DmabufCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{FailAt, TestRig};
    use super::*;
    use crate::gfx::CaptureTarget;
    use std::time::Duration;

    fn config() -> BackendConfig {
        BackendConfig {
            target: CaptureTarget::Screen,
            fps: 60,
            capture_cursor: false,
        }
    }

    #[test]
    fn test_steady_state_has_one_export_and_no_copies() {
        let rig = TestRig::new();
        let mut capture = DmabufCapture::new(rig.window_system(), config());
        capture.start().unwrap();

        for _ in 0..100 {
            capture.capture().unwrap();
        }

        let s = rig.state.lock().unwrap();
        assert_eq!(s.exports, 1);
        assert_eq!(s.copy_2d_calls, 0);
        drop(s);

        let frame = capture.frame().unwrap();
        assert_eq!(frame.width, 1280);
        assert_eq!(frame.stride, 1280 * 4);
        assert_eq!(frame.data.len(), 1280 * 4 * 720);
    }

    #[test]
    fn test_multi_plane_layout_rejected() {
        let rig = TestRig::new();
        rig.state.lock().unwrap().plane_count = 2;
        let mut capture = DmabufCapture::new(rig.window_system(), config());

        let err = capture.start().unwrap_err();
        assert!(err.to_string().contains("single-plane"));

        capture.stop();
        capture.stop();
        assert!(capture.capture().is_err());
    }

    #[test]
    fn test_export_failure_rolls_back() {
        let rig = TestRig::new();
        rig.state.lock().unwrap().fail_at = Some(FailAt::ExportPlanes);
        let mut capture = DmabufCapture::new(rig.window_system(), config());
        assert!(capture.start().is_err());
        capture.stop();
    }

    #[test]
    fn test_resize_reexports_after_debounce() {
        let rig = TestRig::new();
        let mut capture = DmabufCapture::new(rig.window_system(), config());
        capture.start().unwrap();

        let t0 = Instant::now();
        rig.state.lock().unwrap().events.push(WindowEvent::Resized {
            width: 1920,
            height: 1080,
        });
        capture.tick(t0);
        assert_eq!(rig.state.lock().unwrap().exports, 1);

        capture.tick(t0 + Duration::from_secs(1));
        assert_eq!(rig.state.lock().unwrap().exports, 2);
        assert_eq!(capture.geometry().unwrap().height, 1080);
    }
}
