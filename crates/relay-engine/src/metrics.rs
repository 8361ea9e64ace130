//! Metrics collection and reporting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use relay_ipc::{StreamMetrics, WarningType};

/// Achieved frame rate below this share of the target raises a warning.
const LOW_FPS_RATIO: f32 = 0.5;

/// No frame rate warning before the session has run this long.
const FPS_WARMUP: Duration = Duration::from_secs(2);

/// Collects and reports session metrics.
///
/// Written by the capture task, read by the engine thread.
pub struct MetricsCollector {
    start_time: RwLock<Option<Instant>>,
    frame_count: AtomicU64,
    sink_rejections: AtomicU64,
    bytes_sent: AtomicU64,
    last_report_time: RwLock<Instant>,
    last_frame_count: AtomicU64,
    last_rejections: AtomicU64,
    target_fps: f32,
    target_bitrate_kbps: u32,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new(target_fps: f32, target_bitrate_kbps: u32) -> Self {
        Self {
            start_time: RwLock::new(None),
            frame_count: AtomicU64::new(0),
            sink_rejections: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            last_report_time: RwLock::new(Instant::now()),
            last_frame_count: AtomicU64::new(0),
            last_rejections: AtomicU64::new(0),
            target_fps,
            target_bitrate_kbps,
        }
    }

    /// Start metrics collection.
    pub fn start(&self) {
        *self.start_time.write() = Some(Instant::now());
        *self.last_report_time.write() = Instant::now();
    }

    /// Stop metrics collection.
    pub fn stop(&self) {
        *self.start_time.write() = None;
    }

    /// Record a frame accepted by the sink.
    pub fn record_frame(&self, bytes: u64) {
        self.frame_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record a frame the sink rejected.
    pub fn record_sink_rejection(&self) {
        self.sink_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames accepted by the sink so far.
    pub fn frames_sent(&self) -> u64 {
        self.frame_count.load(Ordering::Relaxed)
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> StreamMetrics {
        let now = Instant::now();

        let elapsed = now.duration_since(*self.last_report_time.read());
        let current_frames = self.frame_count.load(Ordering::Relaxed);
        let last_frames = self.last_frame_count.load(Ordering::Relaxed);

        let fps = if elapsed.as_secs_f32() > 0.0 {
            current_frames.saturating_sub(last_frames) as f32 / elapsed.as_secs_f32()
        } else {
            0.0
        };

        let start = *self.start_time.read();
        let bytes = self.bytes_sent.load(Ordering::Relaxed);
        let bitrate_kbps = match start {
            Some(start) => {
                let total_elapsed = now.duration_since(start).as_secs_f32();
                if total_elapsed > 0.0 {
                    ((bytes * 8) as f32 / total_elapsed / 1000.0) as u32
                } else {
                    0
                }
            }
            None => 0,
        };

        StreamMetrics {
            fps,
            target_fps: self.target_fps,
            bitrate_kbps,
            target_bitrate_kbps: self.target_bitrate_kbps,
            frames_sent: current_frames,
            sink_rejections: self.sink_rejections.load(Ordering::Relaxed),
            bytes_sent: bytes,
            uptime_seconds: start.map_or(0, |s| now.duration_since(s).as_secs()),
        }
    }

    /// Check for warnings since the last report.
    pub fn check_warnings(&self) -> Vec<WarningType> {
        let mut warnings = Vec::new();

        let rejections = self.sink_rejections.load(Ordering::Relaxed)
            - self.last_rejections.load(Ordering::Relaxed);
        if rejections > 0 {
            warnings.push(WarningType::SinkRejections { count: rejections });
        }

        let start = *self.start_time.read();
        let warmed_up = start.is_some_and(|s| s.elapsed() >= FPS_WARMUP);
        if warmed_up {
            let fps = self.snapshot().fps;
            if fps < self.target_fps * LOW_FPS_RATIO {
                warnings.push(WarningType::LowFrameRate {
                    fps,
                    target_fps: self.target_fps,
                });
            }
        }

        warnings
    }

    /// Update last report time for FPS calculation.
    pub fn mark_reported(&self) {
        *self.last_report_time.write() = Instant::now();
        self.last_frame_count.store(
            self.frame_count.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
        self.last_rejections.store(
            self.sink_rejections.load(Ordering::Relaxed),
            Ordering::Relaxed,
        );
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(60.0, 800)
    }
}
