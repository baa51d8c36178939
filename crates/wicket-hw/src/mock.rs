//! In-memory camera doubles.
//!
//! `MockSource` records every acquisition request and tracks how many of its
//! streams are open, including the peak, so callers can assert that sessions
//! never overlap.

use crate::camera::{CameraError, Constraints, StreamSource, VideoStream};
use crate::frame::Frame;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct MockBehavior {
    /// Fail any request that carries a facing mode.
    pub reject_facing: bool,
    /// Fail every request.
    pub reject_all: bool,
    /// Number of unready (zero-sized) frames delivered before real ones.
    pub warmup_frames: usize,
    /// Never deliver a ready frame.
    pub never_ready: bool,
    pub width: u32,
    pub height: u32,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            reject_facing: false,
            reject_all: false,
            warmup_frames: 0,
            never_ready: false,
            width: 32,
            height: 24,
        }
    }
}

#[derive(Default)]
struct MockState {
    requests: Mutex<Vec<Constraints>>,
    opened: AtomicUsize,
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[derive(Clone)]
pub struct MockSource {
    behavior: MockBehavior,
    state: Arc<MockState>,
}

impl MockSource {
    pub fn new(behavior: MockBehavior) -> Self {
        Self {
            behavior,
            state: Arc::default(),
        }
    }

    /// Every constraint set passed to `request_stream`, in order.
    pub fn requests(&self) -> Vec<Constraints> {
        self.state
            .requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Streams successfully opened so far.
    pub fn open_count(&self) -> usize {
        self.state.opened.load(Ordering::SeqCst)
    }

    /// Streams currently open.
    pub fn active_streams(&self) -> usize {
        self.state.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open streams observed.
    pub fn peak_active(&self) -> usize {
        self.state.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StreamSource for MockSource {
    async fn request_stream(
        &self,
        constraints: &Constraints,
    ) -> Result<Box<dyn VideoStream>, CameraError> {
        if let Ok(mut requests) = self.state.requests.lock() {
            requests.push(*constraints);
        }
        if self.behavior.reject_all {
            return Err(CameraError::DeviceNotFound("mock: no camera".into()));
        }
        if self.behavior.reject_facing && constraints.facing.is_some() {
            return Err(CameraError::PermissionDenied("mock: facing mode".into()));
        }

        self.state.opened.fetch_add(1, Ordering::SeqCst);
        let now = self.state.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.peak.fetch_max(now, Ordering::SeqCst);

        Ok(Box::new(MockStream {
            behavior: self.behavior.clone(),
            state: Arc::clone(&self.state),
            sequence: 0,
            live: true,
        }))
    }
}

pub struct MockStream {
    behavior: MockBehavior,
    state: Arc<MockState>,
    sequence: u32,
    live: bool,
}

#[async_trait]
impl VideoStream for MockStream {
    async fn next_frame(&mut self) -> Result<Option<Frame>, CameraError> {
        if !self.live {
            return Ok(None);
        }
        self.sequence += 1;
        if self.behavior.never_ready || (self.sequence as usize) <= self.behavior.warmup_frames {
            return Ok(Some(Frame::from_gray(Vec::new(), 0, 0, self.sequence)));
        }
        let (w, h) = (self.behavior.width, self.behavior.height);
        let data = (0..(w * h) as usize)
            .map(|i| 64 + ((i as u32 + self.sequence) % 128) as u8)
            .collect();
        Ok(Some(Frame::from_gray(data, w, h, self.sequence)))
    }

    fn stop(&mut self) {
        if self.live {
            self.live = false;
            self.state.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn label(&self) -> &str {
        "mock"
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.stop();
    }
}
