//! Camera streams: the acquisition boundary and its V4L2 implementation.
//!
//! [`StreamSource`] is what the kiosk flow consumes. It hands out a
//! [`VideoStream`] for a set of [`Constraints`], much like a browser's
//! `getUserMedia`. The V4L2 backend maps facing modes onto configured device
//! nodes.

use crate::frame::{self, Frame};
use async_trait::async_trait;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::capability::Flags;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("camera unavailable after {attempts} attempt(s): {last}")]
    Unavailable { attempts: usize, last: String },
}

/// Which way the camera points relative to the kiosk user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FacingMode {
    /// Rear-facing, pointed at the badge.
    Environment,
    /// Front-facing, pointed at the user's face.
    User,
}

impl std::fmt::Display for FacingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FacingMode::Environment => f.write_str("environment"),
            FacingMode::User => f.write_str("user"),
        }
    }
}

/// Stream acquisition constraints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Constraints {
    pub facing: Option<FacingMode>,
    /// Ideal width; the device may negotiate something else.
    pub width: u32,
    /// Ideal height; the device may negotiate something else.
    pub height: u32,
}

impl Constraints {
    pub fn facing(mode: FacingMode) -> Self {
        Self {
            facing: Some(mode),
            ..Self::default()
        }
    }

    /// The same constraints with the facing requirement dropped.
    pub fn without_facing(self) -> Self {
        Self {
            facing: None,
            ..self
        }
    }
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            facing: None,
            width: 640,
            height: 480,
        }
    }
}

/// Something that can open video streams.
#[async_trait]
pub trait StreamSource: Send + Sync {
    async fn request_stream(
        &self,
        constraints: &Constraints,
    ) -> Result<Box<dyn VideoStream>, CameraError>;
}

/// A live video stream.
#[async_trait]
pub trait VideoStream: Send {
    /// Pull the next frame. `Ok(None)` means the stream has nothing usable yet.
    async fn next_frame(&mut self) -> Result<Option<Frame>, CameraError>;

    /// Stop the stream and release the device. Calling it twice is a no-op.
    fn stop(&mut self);

    /// Short human-readable identifier (device path, mock name).
    fn label(&self) -> &str;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Buffers queued on the driver while streaming. Kept small so a dequeued
/// buffer is never far behind the live image.
const STREAM_BUFFERS: u32 = 2;

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel).
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"YUYV" => Some(PixelFormat::Yuyv),
            b"GREY" => Some(PixelFormat::Grey),
            _ => None,
        }
    }

    /// Luma plane of one raw buffer.
    fn to_gray(self, buf: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CameraError> {
        match self {
            PixelFormat::Grey => {
                let pixels = (width * height) as usize;
                buf.get(..pixels).map(<[u8]>::to_vec).ok_or_else(|| {
                    CameraError::CaptureFailed(format!(
                        "GREY buffer too short: expected {pixels}, got {}",
                        buf.len()
                    ))
                })
            }
            PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, width, height)
                .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
        }
    }
}

fn open_error(device_path: &str, err: std::io::Error) -> CameraError {
    match err.kind() {
        std::io::ErrorKind::PermissionDenied => CameraError::PermissionDenied(device_path.into()),
        std::io::ErrorKind::NotFound => CameraError::DeviceNotFound(device_path.into()),
        _ if err.raw_os_error() == Some(16) => CameraError::DeviceBusy,
        _ => CameraError::DeviceNotFound(format!("{device_path}: {err}")),
    }
}

/// A V4L2 capture device with its format negotiated, not yet streaming.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a capture device and ask for YUYV at roughly `width` x `height`.
    /// The driver may answer with another size or with GREY.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }
        let device = Device::with_path(device_path).map_err(|e| open_error(device_path, e))?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("{device_path}: capability query failed: {e}"))
        })?;
        if !caps.capabilities.contains(Flags::VIDEO_CAPTURE)
            || !caps.capabilities.contains(Flags::STREAMING)
        {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut requested = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("reading current format: {e}"))
        })?;
        requested.fourcc = FourCC::new(b"YUYV");
        requested.width = width;
        requested.height = height;
        let granted = device.set_format(&requested).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("setting format: {e}"))
        })?;

        let pixel_format = PixelFormat::from_fourcc(granted.fourcc).ok_or_else(|| {
            CameraError::FormatNegotiationFailed(format!(
                "driver offered {:?}, only YUYV and GREY are handled",
                granted.fourcc
            ))
        })?;

        tracing::info!(
            device = device_path,
            card = %caps.card,
            width = granted.width,
            height = granted.height,
            format = ?pixel_format,
            "camera opened"
        );

        Ok(Self {
            device,
            width: granted.width,
            height: granted.height,
            device_path: device_path.to_string(),
            pixel_format,
        })
    }

    /// Queue the mmap buffers and turn streaming on. The returned capture
    /// keeps streaming until it is dropped.
    pub fn start(self) -> Result<LiveCapture, CameraError> {
        let stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| {
                CameraError::CaptureFailed(format!("{}: mmap stream setup failed: {e}", self.device_path))
            })?;
        tracing::debug!(device = %self.device_path, buffers = STREAM_BUFFERS, "streaming started");
        Ok(LiveCapture {
            stream,
            camera: self,
        })
    }

    /// Capture-capable nodes among `/dev/video0` to `/dev/video15`.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                if !caps.capabilities.contains(Flags::VIDEO_CAPTURE) {
                    return None;
                }
                Some(DeviceInfo {
                    path,
                    name: caps.card,
                    driver: caps.driver,
                    bus: caps.bus,
                })
            })
            .collect()
    }
}

/// A camera with streaming on. Buffers stay queued between grabs; dropping
/// it turns streaming off and closes the device.
pub struct LiveCapture {
    stream: MmapStream<'static>,
    camera: Camera,
}

impl LiveCapture {
    /// Block until the driver hands back the next filled buffer.
    pub fn grab(&mut self) -> Result<Frame, CameraError> {
        let (buf, meta) = self
            .stream
            .next()
            .map_err(|e| CameraError::CaptureFailed(format!("dequeue failed: {e}")))?;
        let (width, height) = (self.camera.width, self.camera.height);
        let gray = self.camera.pixel_format.to_gray(buf, width, height)?;
        Ok(Frame::from_gray(gray, width, height, meta.sequence))
    }
}

/// Device nodes the V4L2 source hands out per facing mode.
#[derive(Debug, Clone)]
pub struct V4l2Devices {
    pub environment: Option<String>,
    pub user: Option<String>,
    /// Used when no facing mode is requested.
    pub fallback: String,
}

/// [`StreamSource`] backed by V4L2 device nodes.
pub struct V4l2Source {
    devices: V4l2Devices,
}

impl V4l2Source {
    pub fn new(devices: V4l2Devices) -> Self {
        Self { devices }
    }

    fn path_for(&self, facing: Option<FacingMode>) -> Result<&str, CameraError> {
        let path = match facing {
            Some(FacingMode::Environment) => self.devices.environment.as_deref(),
            Some(FacingMode::User) => self.devices.user.as_deref(),
            None => Some(self.devices.fallback.as_str()),
        };
        path.ok_or_else(|| {
            CameraError::DeviceNotFound(format!(
                "no device configured for facing mode {}",
                facing.map(|m| m.to_string()).unwrap_or_default()
            ))
        })
    }
}

#[async_trait]
impl StreamSource for V4l2Source {
    async fn request_stream(
        &self,
        constraints: &Constraints,
    ) -> Result<Box<dyn VideoStream>, CameraError> {
        let path = self.path_for(constraints.facing)?.to_string();
        let (width, height) = (constraints.width, constraints.height);
        let open_path = path.clone();
        let capture = tokio::task::spawn_blocking(move || {
            Camera::open(&open_path, width, height)?.start()
        })
        .await
        .map_err(|e| CameraError::CaptureFailed(format!("open task failed: {e}")))??;
        Ok(Box::new(V4l2Stream {
            capture: Arc::new(Mutex::new(Some(capture))),
            label: path,
        }))
    }
}

/// One streaming session on a V4L2 device. Dequeues run on the blocking pool.
pub struct V4l2Stream {
    capture: Arc<Mutex<Option<LiveCapture>>>,
    label: String,
}

#[async_trait]
impl VideoStream for V4l2Stream {
    async fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        let capture = Arc::clone(&self.capture);
        tokio::task::spawn_blocking(move || {
            let mut guard = capture
                .lock()
                .map_err(|_| CameraError::CaptureFailed("capture lock poisoned".into()))?;
            guard.as_mut().map(LiveCapture::grab).transpose()
        })
        .await
        .map_err(|e| CameraError::CaptureFailed(format!("capture task failed: {e}")))?
    }

    fn stop(&mut self) {
        if let Ok(mut guard) = self.capture.lock() {
            if guard.take().is_some() {
                tracing::debug!(device = %self.label, "streaming stopped");
            }
        }
    }

    fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for V4l2Stream {
    fn drop(&mut self) {
        self.stop();
    }
}
