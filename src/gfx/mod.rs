//! Graphics-layer seams
//!
//! The vendor capture driver, the GPU interop API, and the window system are
//! consumed through the traits below. The real implementations are dynamic
//! vendor bindings loaded at runtime; when a binding is missing the loader
//! reports the capability as absent and backend startup fails cleanly. Tests
//! drive the capture backends through counting fakes of these traits.

use anyhow::{Result, anyhow};
use std::os::fd::OwnedFd;

/// Pixel geometry of a capture target, in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetGeometry {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// What the user asked to record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureTarget {
    /// The whole virtual screen.
    Screen,
    /// One named output (monitor).
    Output(String),
    /// A fixed window by id.
    Window(u32),
    /// Whichever window has input focus, re-resolved on focus change.
    Focused,
}

#[derive(Debug, Clone)]
pub struct OutputInfo {
    pub name: String,
    pub geometry: TargetGeometry,
}

/// Window-system events relevant to an active capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowEvent {
    Resized { width: u32, height: u32 },
    Closed,
    Expose,
}

/// A window-system surface usable as a copy source. The handle is opaque to
/// everything but the interop context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceTexture {
    pub id: u64,
    pub width: u32,
    pub height: u32,
}

/// One exported dma-buf plane: file descriptor plus layout.
#[derive(Debug)]
pub struct PlaneDescriptor {
    pub fd: OwnedFd,
    pub stride: u32,
    pub offset: u32,
    pub modifier: u64,
    pub size: usize,
}

/// CPU-visible staging surface the encoder reads from. BGRA, row-major.
#[derive(Debug)]
pub struct Surface {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub data: Vec<u8>,
}

impl Surface {
    pub fn new(width: u32, height: u32) -> Self {
        let stride = width as usize * 4;
        Self {
            width,
            height,
            stride,
            data: vec![0u8; stride * height as usize],
        }
    }
}

/// Window-system query and event surface.
pub trait WindowSystem {
    fn resolve_target(&mut self, target: &CaptureTarget) -> Result<TargetGeometry>;

    /// Known outputs, for selection and for error messages.
    fn outputs(&self) -> Vec<OutputInfo>;

    /// Drain pending events for the bound target. Non-blocking.
    fn poll_events(&mut self) -> Vec<WindowEvent>;

    /// Bind the target's pixels as a copy-source texture.
    fn acquire_texture(&mut self, geometry: &TargetGeometry) -> Result<SourceTexture>;

    fn release_texture(&mut self, texture: SourceTexture);

    /// Export the target's backing buffer as dma-buf planes.
    fn export_planes(&mut self, geometry: &TargetGeometry) -> Result<Vec<PlaneDescriptor>>;
}

/// Outcome of one non-blocking grab call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrabStatus {
    Captured,
    /// The source has not produced a new frame since the last call. The
    /// previous surface contents stay valid.
    NoNewFrame,
}

/// Vendor frame-grab driver (push/direct capture API).
pub trait GrabDriver {
    fn session_supported(&self) -> bool;

    /// Cursor capture is gated on a minimum driver version.
    fn cursor_supported(&self) -> bool;

    fn create_session(
        &mut self,
        geometry: &TargetGeometry,
        fps: u32,
        capture_cursor: bool,
    ) -> Result<Box<dyn GrabSession>>;
}

pub trait GrabSession {
    /// Grab the next frame into `dst`. Non-blocking.
    fn grab(&mut self, dst: &mut Surface) -> Result<GrabStatus>;
}

/// GPU texture handle created by the interop context. Only textures created
/// here may be registered; window-system source textures may not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureHandle(pub u64);

/// A texture registered for external access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceHandle(pub u64);

/// A mapped registered resource, valid until `unmap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappedArray {
    pub id: u64,
    pub width: u32,
    pub height: u32,
    pub pitch: usize,
}

/// Cross-API GPU resource sharing.
pub trait InteropContext {
    fn create_texture(&mut self, width: u32, height: u32) -> Result<TextureHandle>;

    fn destroy_texture(&mut self, texture: TextureHandle);

    fn register(&mut self, texture: &TextureHandle) -> Result<ResourceHandle>;

    fn unregister(&mut self, resource: ResourceHandle);

    /// Image-to-image device copy, source texture into an interop-created one.
    fn copy_texture(&mut self, src: &SourceTexture, dst: &TextureHandle) -> Result<()>;

    fn map(&mut self, resource: &ResourceHandle) -> Result<MappedArray>;

    /// 2D device-to-device read back of a mapped array into `dst`.
    fn copy_2d(&mut self, mapped: &MappedArray, dst: &mut Surface) -> Result<()>;

    fn unmap(&mut self, mapped: MappedArray);
}

/// Window-system adapter, always available.
pub fn load_window_system() -> Box<dyn WindowSystem> {
    Box::new(SystemWindowSystem)
}

/// Vendor frame-grab driver, bound at runtime. Absent here; backend startup
/// reports the capability as missing.
pub fn load_grab_driver() -> Result<Box<dyn GrabDriver>> {
    Err(anyhow!("vendor frame-grab library not available on this system"))
}

/// GPU interop context, bound at runtime alongside the encoder device.
pub fn load_interop_context() -> Result<Box<dyn InteropContext>> {
    Err(anyhow!("GPU interop runtime not available on this system"))
}

/// Window-system adapter over the display enumeration library. Monitor
/// targets resolve for real; window binding, events and dma-buf export need
/// the display-server vendor binding, which this adapter does not carry.
pub struct SystemWindowSystem;

impl WindowSystem for SystemWindowSystem {
    fn resolve_target(&mut self, target: &CaptureTarget) -> Result<TargetGeometry> {
        match target {
            CaptureTarget::Screen => {
                let outputs = self.outputs();
                if outputs.is_empty() {
                    return Err(anyhow!("no displays found"));
                }
                // Bounding box of all outputs
                let min_x = outputs.iter().map(|o| o.geometry.x).min().unwrap();
                let min_y = outputs.iter().map(|o| o.geometry.y).min().unwrap();
                let max_x = outputs
                    .iter()
                    .map(|o| o.geometry.x + o.geometry.width as i32)
                    .max()
                    .unwrap();
                let max_y = outputs
                    .iter()
                    .map(|o| o.geometry.y + o.geometry.height as i32)
                    .max()
                    .unwrap();
                Ok(TargetGeometry {
                    x: min_x,
                    y: min_y,
                    width: (max_x - min_x) as u32,
                    height: (max_y - min_y) as u32,
                })
            }
            CaptureTarget::Output(name) => {
                let outputs = self.outputs();
                outputs
                    .iter()
                    .find(|o| &o.name == name)
                    .map(|o| o.geometry)
                    .ok_or_else(|| {
                        anyhow!(
                            "output '{}' not found. Available outputs: {:?}",
                            name,
                            outputs.iter().map(|o| o.name.clone()).collect::<Vec<_>>()
                        )
                    })
            }
            CaptureTarget::Window(_) | CaptureTarget::Focused => Err(anyhow!(
                "window targets require the display-server capture binding, which is not loaded"
            )),
        }
    }

    fn outputs(&self) -> Vec<OutputInfo> {
        let Ok(displays) = display_info::DisplayInfo::all() else {
            return Vec::new();
        };
        displays
            .into_iter()
            .map(|d| OutputInfo {
                name: d.name,
                geometry: TargetGeometry {
                    x: d.x,
                    y: d.y,
                    width: d.width,
                    height: d.height,
                },
            })
            .collect()
    }

    fn poll_events(&mut self) -> Vec<WindowEvent> {
        Vec::new()
    }

    fn acquire_texture(&mut self, _geometry: &TargetGeometry) -> Result<SourceTexture> {
        Err(anyhow!("window texture binding not loaded"))
    }

    fn release_texture(&mut self, _texture: SourceTexture) {}

    fn export_planes(&mut self, _geometry: &TargetGeometry) -> Result<Vec<PlaneDescriptor>> {
        Err(anyhow!("dma-buf export extension not available"))
    }
}
