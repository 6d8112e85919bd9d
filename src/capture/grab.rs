//! Device-memory capture via the vendor frame-grab API

use super::{BackendConfig, FrameView, ResizeDebounce, StopState};
use crate::gfx::{
    GrabDriver, GrabSession, GrabStatus, Surface, TargetGeometry, WindowEvent, WindowSystem,
};
use anyhow::{Result, anyhow};
use std::time::Instant;

/// One vendor capture session grabbing straight into a device buffer.
///
/// The grab call is non-blocking: "no new frame yet" leaves the previous
/// surface contents in place, which the pacer is free to re-encode.
pub struct GrabCapture {
    window_system: Box<dyn WindowSystem>,
    driver: Box<dyn GrabDriver>,
    config: BackendConfig,
    geometry: Option<TargetGeometry>,
    session: Option<Box<dyn GrabSession>>,
    surface: Option<Surface>,
    debounce: ResizeDebounce,
    started: bool,
    stopped: bool,
    errored: bool,
}

impl GrabCapture {
    pub fn new(
        window_system: Box<dyn WindowSystem>,
        driver: Box<dyn GrabDriver>,
        config: BackendConfig,
    ) -> Self {
        Self {
            window_system,
            driver,
            config,
            geometry: None,
            session: None,
            surface: None,
            debounce: ResizeDebounce::new(),
            started: false,
            stopped: false,
            errored: false,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if !self.driver.session_supported() {
            self.stop();
            return Err(anyhow!("frame-grab sessions not supported by the driver"));
        }

        let capture_cursor = if self.config.capture_cursor && !self.driver.cursor_supported() {
            log::warn!("Driver too old for cursor capture, recording without cursor");
            false
        } else {
            self.config.capture_cursor
        };

        let geometry = match self.window_system.resolve_target(&self.config.target) {
            Ok(g) => g,
            Err(e) => {
                self.stop();
                return Err(e);
            }
        };
        self.geometry = Some(geometry);

        match self
            .driver
            .create_session(&geometry, self.config.fps, capture_cursor)
        {
            Ok(session) => self.session = Some(session),
            Err(e) => {
                self.stop();
                return Err(e.context("failed to create frame-grab session"));
            }
        }

        self.surface = Some(Surface::new(geometry.width, geometry.height));
        self.started = true;
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
            if let Err(e) = self.rebuild_session(width, height) {
                log::error!("Failed to rebuild grab session after resize: {}", e);
                self.errored = true;
            }
        }
    }

    fn rebuild_session(&mut self, width: u32, height: u32) -> Result<()> {
        let mut geometry = self
            .geometry
            .ok_or_else(|| anyhow!("grab session has no geometry"))?;
        geometry.width = width;
        geometry.height = height;

        // The old session must be gone before the driver hands out a new one.
        self.session = None;
        let cursor = self.config.capture_cursor && self.driver.cursor_supported();
        self.session = Some(
            self.driver
                .create_session(&geometry, self.config.fps, cursor)?,
        );
        self.surface = Some(Surface::new(width, height));
        self.geometry = Some(geometry);
        log::info!("Grab session rebuilt at {}x{}", width, height);
        Ok(())
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
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| anyhow!("capture called before start"))?;
        let surface = self
            .surface
            .as_mut()
            .ok_or_else(|| anyhow!("capture called before start"))?;

        match session.grab(surface)? {
            GrabStatus::Captured => {}
            // The source is slower than our tick; the previous grab stays
            // valid and will be re-encoded.
            GrabStatus::NoNewFrame => {}
        }
        Ok(())
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
        // Safe on a backend that never finished start: every resource slot
        // is an Option, released in reverse acquisition order.
        self.session = None;
        self.surface = None;
        self.started = false;
    }
}

impl Drop for GrabCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
