use std::time::Duration;
use wicket_core::{BurstConfig, FlowConfig};
use wicket_hw::V4l2Devices;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Environment-facing V4L2 device used for badge scanning (default: /dev/video0).
    pub qr_camera_device: String,
    /// User-facing V4L2 device used for the face burst (default: /dev/video2).
    pub face_camera_device: String,
    /// Device opened when a request carries no facing constraint.
    pub fallback_camera_device: String,
    /// Verification endpoint.
    pub verify_url: String,
    /// Timeout in seconds for one verification POST.
    pub verify_timeout_secs: u64,
    pub scan_interval_ms: u64,
    /// Pause between QR acceptance and face capture.
    pub transition_delay_ms: u64,
    pub manual_debounce_ms: u64,
    pub burst_max_frames: usize,
    pub burst_interval_ms: u64,
    pub burst_max_duration_ms: u64,
    pub burst_retry_ms: u64,
    pub burst_max_attempts: u32,
    pub jpeg_quality: u8,
    /// How long a result stays up before the kiosk resets.
    pub reset_delay_ms: u64,
    /// Reopen the QR camera after every reset.
    pub rescan_after_reset: bool,
    /// Register on the system bus instead of the session bus.
    pub system_bus: bool,
}

impl Config {
    /// Load configuration from `WICKET_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self {
            qr_camera_device: env_string("WICKET_QR_CAMERA_DEVICE", "/dev/video0"),
            face_camera_device: env_string("WICKET_FACE_CAMERA_DEVICE", "/dev/video2"),
            fallback_camera_device: env_string("WICKET_FALLBACK_CAMERA_DEVICE", "/dev/video0"),
            verify_url: env_string("WICKET_VERIFY_URL", "http://127.0.0.1:8000/api/verify"),
            verify_timeout_secs: env_u64("WICKET_VERIFY_TIMEOUT_SECS", 15),
            scan_interval_ms: env_u64("WICKET_SCAN_INTERVAL_MS", 200),
            transition_delay_ms: env_u64("WICKET_TRANSITION_DELAY_MS", 1000),
            manual_debounce_ms: env_u64("WICKET_MANUAL_DEBOUNCE_MS", 1000),
            burst_max_frames: env_usize("WICKET_BURST_MAX_FRAMES", 6),
            burst_interval_ms: env_u64("WICKET_BURST_INTERVAL_MS", 350),
            burst_max_duration_ms: env_u64("WICKET_BURST_MAX_DURATION_MS", 2500),
            burst_retry_ms: env_u64("WICKET_BURST_RETRY_MS", 800),
            burst_max_attempts: env_u64("WICKET_BURST_MAX_ATTEMPTS", 5).min(u32::MAX as u64)
                as u32,
            jpeg_quality: env_u64("WICKET_JPEG_QUALITY", 95).clamp(1, 100) as u8,
            reset_delay_ms: env_u64("WICKET_RESET_DELAY_MS", 5000),
            rescan_after_reset: env_flag("WICKET_RESCAN_AFTER_RESET", true),
            system_bus: env_flag("WICKET_SYSTEM_BUS", false),
        }
    }

    /// Flow timings derived from this config.
    pub fn flow_config(&self) -> FlowConfig {
        FlowConfig {
            scan_interval: Duration::from_millis(self.scan_interval_ms.max(1)),
            transition_delay: Duration::from_millis(self.transition_delay_ms),
            manual_debounce: Duration::from_millis(self.manual_debounce_ms),
            burst: BurstConfig {
                max_frames: self.burst_max_frames.max(1),
                interval: Duration::from_millis(self.burst_interval_ms),
                max_duration: Duration::from_millis(self.burst_max_duration_ms),
                jpeg_quality: self.jpeg_quality,
            },
            burst_retry: Duration::from_millis(self.burst_retry_ms),
            burst_max_attempts: self.burst_max_attempts.max(1),
            reset_delay: Duration::from_millis(self.reset_delay_ms),
            rescan_after_reset: self.rescan_after_reset,
            ..FlowConfig::default()
        }
    }

    pub fn v4l2_devices(&self) -> V4l2Devices {
        V4l2Devices {
            environment: Some(self.qr_camera_device.clone()),
            user: Some(self.face_camera_device.clone()),
            fallback: self.fallback_camera_device.clone(),
        }
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key).map(|v| v != "0").unwrap_or(default)
}
