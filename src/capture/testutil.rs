//! Counting fakes for the gfx seams, shared by the backend tests.
//!
//! Every acquire/release pair is counted so lifecycle tests can assert that
//! a failed start leaks nothing and never touches resources that were never
//! acquired.

use crate::gfx::{
    CaptureTarget, GrabDriver, GrabSession, GrabStatus, InteropContext, MappedArray, OutputInfo,
    PlaneDescriptor, ResourceHandle, SourceTexture, Surface, TargetGeometry, TextureHandle,
    WindowEvent, WindowSystem,
};
use anyhow::{Result, anyhow};
use std::os::fd::{FromRawFd, OwnedFd};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    ResolveTarget,
    AcquireTexture,
    CreateTexture,
    Register,
    CreateSession,
    ExportPlanes,
    CopyTexture,
    Map,
    Copy2d,
    Grab,
}

pub struct RigState {
    pub fail_at: Option<FailAt>,
    pub events: Vec<WindowEvent>,
    pub grab_status: GrabStatus,
    pub plane_count: usize,

    pub sessions_created: u32,
    pub live_sessions: i32,
    pub source_acquired: u32,
    pub live_source_textures: i32,
    pub textures_created: u32,
    pub live_textures: i32,
    pub registrations: u32,
    pub live_registrations: i32,
    pub live_maps: i32,
    pub exports: u32,
    pub copy_texture_calls: u32,
    pub copy_2d_calls: u32,
    pub grabs: u32,
    next_id: u64,
}

impl RigState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

pub struct TestRig {
    pub state: Arc<Mutex<RigState>>,
}

impl TestRig {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RigState {
                fail_at: None,
                events: Vec::new(),
                grab_status: GrabStatus::Captured,
                plane_count: 1,
                sessions_created: 0,
                live_sessions: 0,
                source_acquired: 0,
                live_source_textures: 0,
                textures_created: 0,
                live_textures: 0,
                registrations: 0,
                live_registrations: 0,
                live_maps: 0,
                exports: 0,
                copy_texture_calls: 0,
                copy_2d_calls: 0,
                grabs: 0,
                next_id: 0,
            })),
        }
    }

    pub fn window_system(&self) -> Box<dyn WindowSystem> {
        Box::new(FakeWindowSystem {
            state: Arc::clone(&self.state),
        })
    }

    pub fn grab_driver(&self) -> Box<dyn GrabDriver> {
        Box::new(FakeGrabDriver {
            state: Arc::clone(&self.state),
        })
    }

    pub fn interop(&self) -> Box<dyn InteropContext> {
        Box::new(FakeInterop {
            state: Arc::clone(&self.state),
        })
    }

    /// True when every counted resource has been released.
    pub fn all_released(&self) -> bool {
        let s = self.state.lock().unwrap();
        s.live_sessions == 0
            && s.live_source_textures == 0
            && s.live_textures == 0
            && s.live_registrations == 0
            && s.live_maps == 0
    }
}

fn failing(state: &Arc<Mutex<RigState>>, point: FailAt) -> bool {
    state.lock().unwrap().fail_at == Some(point)
}

struct FakeWindowSystem {
    state: Arc<Mutex<RigState>>,
}

impl WindowSystem for FakeWindowSystem {
    fn resolve_target(&mut self, _target: &CaptureTarget) -> Result<TargetGeometry> {
        if failing(&self.state, FailAt::ResolveTarget) {
            return Err(anyhow!("injected: target not found"));
        }
        Ok(TargetGeometry {
            x: 0,
            y: 0,
            width: 1280,
            height: 720,
        })
    }

    fn outputs(&self) -> Vec<OutputInfo> {
        Vec::new()
    }

    fn poll_events(&mut self) -> Vec<WindowEvent> {
        std::mem::take(&mut self.state.lock().unwrap().events)
    }

    fn acquire_texture(&mut self, geometry: &TargetGeometry) -> Result<SourceTexture> {
        if failing(&self.state, FailAt::AcquireTexture) {
            return Err(anyhow!("injected: window texture binding failed"));
        }
        let mut s = self.state.lock().unwrap();
        s.source_acquired += 1;
        s.live_source_textures += 1;
        let id = s.next_id();
        Ok(SourceTexture {
            id,
            width: geometry.width,
            height: geometry.height,
        })
    }

    fn release_texture(&mut self, _texture: SourceTexture) {
        self.state.lock().unwrap().live_source_textures -= 1;
    }

    fn export_planes(&mut self, geometry: &TargetGeometry) -> Result<Vec<PlaneDescriptor>> {
        if failing(&self.state, FailAt::ExportPlanes) {
            return Err(anyhow!("injected: export failed"));
        }
        let mut s = self.state.lock().unwrap();
        s.exports += 1;
        let count = s.plane_count;
        drop(s);

        let stride = geometry.width * 4;
        let size = stride as usize * geometry.height as usize;
        (0..count)
            .map(|_| {
                Ok(PlaneDescriptor {
                    fd: memfd(size)?,
                    stride,
                    offset: 0,
                    modifier: 0,
                    size,
                })
            })
            .collect()
    }
}

/// Anonymous mappable fd standing in for an exported dma-buf plane.
fn memfd(size: usize) -> Result<OwnedFd> {
    unsafe {
        let fd = libc::memfd_create(c"shadowcast-test".as_ptr(), 0);
        if fd < 0 {
            return Err(anyhow!("memfd_create failed"));
        }
        if libc::ftruncate(fd, size as libc::off_t) < 0 {
            libc::close(fd);
            return Err(anyhow!("ftruncate failed"));
        }
        Ok(OwnedFd::from_raw_fd(fd))
    }
}

struct FakeGrabDriver {
    state: Arc<Mutex<RigState>>,
}

impl GrabDriver for FakeGrabDriver {
    fn session_supported(&self) -> bool {
        true
    }

    fn cursor_supported(&self) -> bool {
        true
    }

    fn create_session(
        &mut self,
        _geometry: &TargetGeometry,
        _fps: u32,
        _capture_cursor: bool,
    ) -> Result<Box<dyn GrabSession>> {
        if failing(&self.state, FailAt::CreateSession) {
            return Err(anyhow!("injected: session creation failed"));
        }
        let mut s = self.state.lock().unwrap();
        s.sessions_created += 1;
        s.live_sessions += 1;
        Ok(Box::new(FakeGrabSession {
            state: Arc::clone(&self.state),
        }))
    }
}

struct FakeGrabSession {
    state: Arc<Mutex<RigState>>,
}

impl GrabSession for FakeGrabSession {
    fn grab(&mut self, dst: &mut Surface) -> Result<GrabStatus> {
        if failing(&self.state, FailAt::Grab) {
            return Err(anyhow!("injected: grab failed"));
        }
        let mut s = self.state.lock().unwrap();
        s.grabs += 1;
        let fill = (s.grabs % 251) as u8;
        dst.data.fill(fill);
        Ok(s.grab_status)
    }
}

impl Drop for FakeGrabSession {
    fn drop(&mut self) {
        self.state.lock().unwrap().live_sessions -= 1;
    }
}

struct FakeInterop {
    state: Arc<Mutex<RigState>>,
}

impl InteropContext for FakeInterop {
    fn create_texture(&mut self, _width: u32, _height: u32) -> Result<TextureHandle> {
        if failing(&self.state, FailAt::CreateTexture) {
            return Err(anyhow!("injected: texture creation failed"));
        }
        let mut s = self.state.lock().unwrap();
        s.textures_created += 1;
        s.live_textures += 1;
        let id = s.next_id();
        Ok(TextureHandle(id))
    }

    fn destroy_texture(&mut self, _texture: TextureHandle) {
        self.state.lock().unwrap().live_textures -= 1;
    }

    fn register(&mut self, texture: &TextureHandle) -> Result<ResourceHandle> {
        if failing(&self.state, FailAt::Register) {
            return Err(anyhow!("injected: registration failed"));
        }
        let mut s = self.state.lock().unwrap();
        s.registrations += 1;
        s.live_registrations += 1;
        Ok(ResourceHandle(texture.0))
    }

    fn unregister(&mut self, _resource: ResourceHandle) {
        self.state.lock().unwrap().live_registrations -= 1;
    }

    fn copy_texture(&mut self, _src: &SourceTexture, _dst: &TextureHandle) -> Result<()> {
        if failing(&self.state, FailAt::CopyTexture) {
            return Err(anyhow!("injected: texture copy failed"));
        }
        self.state.lock().unwrap().copy_texture_calls += 1;
        Ok(())
    }

    fn map(&mut self, resource: &ResourceHandle) -> Result<MappedArray> {
        if failing(&self.state, FailAt::Map) {
            return Err(anyhow!("injected: map failed"));
        }
        let mut s = self.state.lock().unwrap();
        s.live_maps += 1;
        Ok(MappedArray {
            id: resource.0,
            width: 1280,
            height: 720,
            pitch: 1280 * 4,
        })
    }

    fn copy_2d(&mut self, _mapped: &MappedArray, dst: &mut Surface) -> Result<()> {
        if failing(&self.state, FailAt::Copy2d) {
            return Err(anyhow!("injected: 2D copy failed"));
        }
        let mut s = self.state.lock().unwrap();
        s.copy_2d_calls += 1;
        let fill = (s.copy_2d_calls % 251) as u8;
        dst.data.fill(fill);
        Ok(())
    }

    fn unmap(&mut self, _mapped: MappedArray) {
        self.state.lock().unwrap().live_maps -= 1;
    }
}
