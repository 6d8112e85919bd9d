//! Window capture through cross-API texture sharing
//!
//! The window system hands out a source texture that must never be
//! registered with the interop API directly. A second, interop-created
//! target texture is the only registered surface; each capture is an
//! image-to-image device copy into it, followed by a mapped 2D read back
//! into the staging surface the encoder consumes.

use super::{BackendConfig, FrameView, ResizeDebounce, StopState};
use crate::gfx::{
    InteropContext, ResourceHandle, SourceTexture, Surface, TargetGeometry, TextureHandle,
    WindowEvent, WindowSystem,
};
use anyhow::{Result, anyhow};
use std::time::Instant;

pub struct InteropCapture {
    window_system: Box<dyn WindowSystem>,
    interop: Box<dyn InteropContext>,
    config: BackendConfig,
    geometry: Option<TargetGeometry>,
    source: Option<SourceTexture>,
    target: Option<TextureHandle>,
    registered: Option<ResourceHandle>,
    surface: Option<Surface>,
    debounce: ResizeDebounce,
    started: bool,
    stopped: bool,
    errored: bool,
}

impl InteropCapture {
    pub fn new(
        window_system: Box<dyn WindowSystem>,
        interop: Box<dyn InteropContext>,
        config: BackendConfig,
    ) -> Self {
        Self {
            window_system,
            interop,
            config,
            geometry: None,
            source: None,
            target: None,
            registered: None,
            surface: None,
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

        if let Err(e) = self.acquire(geometry) {
            self.stop();
            return Err(e);
        }
        self.started = true;
        Ok(())
    }

    /// Acquire the texture chain for `geometry`. On failure the slots that
    /// were filled stay set; the caller unwinds them through `stop`.
    fn acquire(&mut self, geometry: TargetGeometry) -> Result<()> {
        self.source = Some(self.window_system.acquire_texture(&geometry)?);
        self.target = Some(
            self.interop
                .create_texture(geometry.width, geometry.height)?,
        );
        let target = self.target.as_ref().unwrap();
        self.registered = Some(self.interop.register(target)?);
        self.surface = Some(Surface::new(geometry.width, geometry.height));
        Ok(())
    }

    /// Release the texture chain in reverse acquisition order.
    fn release(&mut self) {
        if let Some(resource) = self.registered.take() {
            self.interop.unregister(resource);
        }
        if let Some(target) = self.target.take() {
            self.interop.destroy_texture(target);
        }
        if let Some(source) = self.source.take() {
            self.window_system.release_texture(source);
        }
        self.surface = None;
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

            self.release();
            if let Err(e) = self.acquire(geometry) {
                log::error!("Interop re-registration after resize failed: {}", e);
                self.release();
                self.errored = true;
                return;
            }
            self.geometry = Some(geometry);
            log::info!("Interop resources re-registered at {}x{}", width, height);
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

    pub fn capture(&mut self) -> Result<()> {
        let source = self
            .source
            .ok_or_else(|| anyhow!("capture called before start"))?;
        let target = self
            .target
            .ok_or_else(|| anyhow!("capture called before start"))?;
        let registered = self
            .registered
            .ok_or_else(|| anyhow!("capture called before start"))?;
        let surface = self
            .surface
            .as_mut()
            .ok_or_else(|| anyhow!("capture called before start"))?;

        self.interop.copy_texture(&source, &target)?;

        let mapped = self.interop.map(&registered)?;
        let copied = self.interop.copy_2d(&mapped, surface);
        self.interop.unmap(mapped);
        copied
    }

    pub fn frame(&self) -> Result<FrameView<'_>> {
        let surface = self
            .surface
            .as_ref()
            .ok_or_else(|| anyhow!("frame requested before start"))?;
        Ok(FrameView {
            data: &surface.data,
            stride: surface.stride,
            width: surface.width,
            height: surface.height,
        })
    }

    pub fn geometry(&self) -> Option<TargetGeometry> {
        self.geometry
    }

    pub fn stop(&mut self) {
        self.release();
        self.started = false;
    }
}

impl Drop for InteropCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
