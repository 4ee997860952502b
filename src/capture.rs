//! External interface contracts (C9): the narrow surface the core consumes from
//! sensor/codec collaborators that are out of scope for this crate. Sensor/ISP
//! init, the vendor capture SDK, and JPEG encoding all live behind these traits;
//! only mock implementations (for tests and for running this crate standalone)
//! live here.

use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Monotonic wall-clock source, in milliseconds. Must never go backwards —
/// callers stamp block and stack timestamps directly from this value.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// One acquired frame: a full-resolution luma plane and a paired half-height
/// chroma plane. Stride equals width; the vendor capture API this models does
/// not pad rows.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub luma: Vec<u8>,
    pub chroma: Vec<u8>,
    pub width: usize,
    pub height: usize,
    pub ts_ms: u64,
}

/// Source of full-resolution frames. A real implementation wraps the vendor
/// capture API's acquire/release pair, copying the plane once on acquire so the
/// rest of the pipeline never holds a raw pointer whose lifetime is tied to the
/// driver's internal buffer pool.
pub trait CaptureSource: Send {
    /// Pull the next frame. Transient failures (buffer not yet ready) are
    /// reported as `Err`; the ingest loop sleeps briefly and retries.
    fn acquire_frame(&mut self) -> io::Result<CapturedFrame>;

    /// Release a previously acquired frame back to the driver. A mock source
    /// has nothing to release; a real one returns the buffer to its pool.
    fn release_frame(&mut self, frame: CapturedFrame) {
        drop(frame);
    }
}

/// Encodes a stacked luma/chroma pair to a compressed image file (JPEG in
/// practice). Not required to be thread-safe across distinct output paths —
/// the stacker only ever has one encode in flight at a time.
pub trait ImageEncoder: Send {
    fn encode(
        &self,
        path: &Path,
        luma: &[u8],
        chroma: &[u8],
        width: usize,
        height: usize,
        quality: u8,
    ) -> io::Result<()>;
}

/// Narrow seam onto the motion-ROI grid monitor (out of scope for this
/// crate; it only produces metadata). The stacker polls this at every
/// stack boundary and, if it returns `Some`, folds the value into the
/// companion `/event` POST's optional motion-metadata field.
pub trait MotionMetadataSource: Send + Sync {
    fn snapshot(&self) -> Option<serde_json::Value>;
}

/// No-op `MotionMetadataSource` for deployments without a motion-ROI monitor
/// attached (the default).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMotionMetadata;

impl MotionMetadataSource for NoMotionMetadata {
    fn snapshot(&self) -> Option<serde_json::Value> {
        None
    }
}

/// `Clock` backed by the OS wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Synthetic capture source for tests and for running this crate without a
/// real sensor attached. Generates a constant-gray frame, optionally with a
/// single diagonal bright streak (for exercising the detector end-to-end),
/// advancing its own simulated clock by one nominal frame period per call.
pub struct MockCaptureSource {
    width: usize,
    height: usize,
    background: u8,
    frame_period_ms: u64,
    ts_ms: u64,
    frames_emitted: u64,
    streak: Option<MockStreak>,
}

/// Parameters for a synthetic diagonal streak injected into generated frames,
/// active for `[start_frame, start_frame + duration_frames)`.
#[derive(Debug, Clone, Copy)]
pub struct MockStreak {
    pub start_frame: u64,
    pub duration_frames: u64,
    pub brightness: u8,
}

impl MockCaptureSource {
    pub fn new(width: usize, height: usize, background: u8, fps: f64) -> Self {
        Self {
            width,
            height,
            background,
            frame_period_ms: (1000.0 / fps).round() as u64,
            ts_ms: 0,
            frames_emitted: 0,
            streak: None,
        }
    }

    pub fn with_streak(mut self, streak: MockStreak) -> Self {
        self.streak = Some(streak);
        self
    }
}

impl CaptureSource for MockCaptureSource {
    fn acquire_frame(&mut self) -> io::Result<CapturedFrame> {
        let mut luma = vec![self.background; self.width * self.height];
        let chroma = vec![128u8; self.width * (self.height / 2).max(1)];

        if let Some(streak) = self.streak {
            let in_window = self.frames_emitted >= streak.start_frame
                && self.frames_emitted < streak.start_frame + streak.duration_frames;
            if in_window {
                let offset = self.frames_emitted - streak.start_frame;
                let len = self.width.min(self.height) as u64;
                let step = offset * len / streak.duration_frames.max(1);
                let x = step as usize;
                let y = step as usize;
                if x < self.width && y < self.height {
                    luma[y * self.width + x] = streak.brightness;
                }
            }
        }

        let frame = CapturedFrame {
            luma,
            chroma,
            width: self.width,
            height: self.height,
            ts_ms: self.ts_ms,
        };

        self.ts_ms += self.frame_period_ms;
        self.frames_emitted += 1;
        Ok(frame)
    }
}

/// Encoder stub used in tests: writes a small placeholder file so downstream
/// staging/upload logic has something real to operate on, without linking an
/// actual JPEG codec (out of scope for this crate).
#[derive(Debug, Default, Clone, Copy)]
pub struct MockImageEncoder;

impl ImageEncoder for MockImageEncoder {
    fn encode(
        &self,
        path: &Path,
        luma: &[u8],
        _chroma: &[u8],
        width: usize,
        height: usize,
        _quality: u8,
    ) -> io::Result<()> {
        if luma.len() != width * height {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "luma plane does not match width*height",
            ));
        }
        // Not a real JPEG: a tiny marker header plus the raw luma bytes is
        // enough for the stacker/upload path to round-trip in tests.
        let mut out = Vec::with_capacity(luma.len() + 8);
        out.extend_from_slice(b"MOCKJPG\0");
        out.extend_from_slice(luma);
        std::fs::write(path, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_nonzero() {
        let clock = SystemClock;
        assert!(clock.now_ms() > 0);
    }

    #[test]
    fn test_mock_capture_produces_expected_dimensions() {
        let mut source = MockCaptureSource::new(8, 6, 20, 25.0);
        let frame = source.acquire_frame().unwrap();
        assert_eq!(frame.luma.len(), 8 * 6);
        assert_eq!(frame.chroma.len(), 8 * 3);
        assert!(frame.luma.iter().all(|&p| p == 20));
    }

    #[test]
    fn test_mock_capture_advances_timestamp_by_frame_period() {
        let mut source = MockCaptureSource::new(4, 4, 0, 25.0);
        let f0 = source.acquire_frame().unwrap();
        let f1 = source.acquire_frame().unwrap();
        assert_eq!(f1.ts_ms - f0.ts_ms, 40); // 1000/25 = 40ms
    }

    #[test]
    fn test_mock_capture_with_streak_brightens_a_pixel_in_window() {
        let mut source = MockCaptureSource::new(10, 10, 10, 25.0).with_streak(MockStreak {
            start_frame: 0,
            duration_frames: 5,
            brightness: 250,
        });
        let mut saw_bright = false;
        for _ in 0..5 {
            let frame = source.acquire_frame().unwrap();
            if frame.luma.iter().any(|&p| p == 250) {
                saw_bright = true;
            }
        }
        assert!(saw_bright);
    }

    #[test]
    fn test_mock_encoder_writes_marker_and_luma() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stack.jpg");
        let encoder = MockImageEncoder;
        encoder.encode(&path, &[1, 2, 3, 4], &[128, 128], 2, 2, 85).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert!(bytes.starts_with(b"MOCKJPG\0"));
        assert_eq!(&bytes[8..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_no_motion_metadata_snapshot_is_none() {
        assert_eq!(NoMotionMetadata.snapshot(), None);
    }

    #[test]
    fn test_mock_encoder_rejects_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.jpg");
        let encoder = MockImageEncoder;
        let err = encoder.encode(&path, &[1, 2, 3], &[], 2, 2, 85).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
