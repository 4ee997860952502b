//! Ingest/driver (C8): pulls frames from the capture collaborator, downsamples
//! to detection resolution, and fans each frame out to the detection engine
//! and the frame stacker. Owns both for their entire lifetime and never blocks
//! on network or file I/O — all of that is confined to the worker/encoder
//! threads owned by the engine and stacker respectively.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, warn};

use crate::capture::{CaptureSource, Clock};
use crate::engine::DetectionEngine;
use crate::stacker::FrameStacker;

/// Sleep duration after a transient capture failure before retrying.
const ACQUIRE_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Nearest-neighbour downsample a full-resolution luma plane into a
/// pre-allocated `dst_w * dst_h` buffer. `step = src_dim / dst_dim`, integer
/// division, matching the spec's nearest-neighbour contract exactly (no
/// interpolation, no rounding beyond the implicit floor of integer division).
pub fn downsample_nearest(src: &[u8], src_w: usize, src_h: usize, dst: &mut [u8], dst_w: usize, dst_h: usize) {
    debug_assert_eq!(dst.len(), dst_w * dst_h);
    let step_x = (src_w / dst_w).max(1);
    let step_y = (src_h / dst_h).max(1);

    for dy in 0..dst_h {
        let sy = (dy * step_y).min(src_h.saturating_sub(1));
        for dx in 0..dst_w {
            let sx = (dx * step_x).min(src_w.saturating_sub(1));
            dst[dy * dst_w + dx] = src[sy * src_w + sx];
        }
    }
}

/// Owns the background grab thread and the two downstream consumers
/// (detection engine, frame stacker) for the lifetime of the process.
pub struct Ingest {
    running: Arc<AtomicBool>,
    grab_thread: Option<JoinHandle<()>>,
}

impl Ingest {
    /// Spawn the ingest thread. `capture`/`clock` are moved into the thread;
    /// `engine`/`stacker` are moved in as well and live for as long as ingest
    /// runs, matching "owns the detection engine and stacker handles for
    /// their entire lifetime".
    pub fn start(
        mut capture: Box<dyn CaptureSource>,
        clock: Arc<dyn Clock>,
        mut engine: DetectionEngine,
        mut stacker: FrameStacker,
        detect_w: usize,
        detect_h: usize,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = Arc::clone(&running);

        let grab_thread = std::thread::Builder::new()
            .name("ingest".to_string())
            .spawn(move || {
                let mut downsampled = vec![0u8; detect_w * detect_h];

                while thread_running.load(Ordering::SeqCst) {
                    let frame = match capture.acquire_frame() {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!(error = %e, "frame acquire failed, retrying");
                            std::thread::sleep(ACQUIRE_RETRY_DELAY);
                            continue;
                        }
                    };

                    let ts_ms = clock.now_ms();
                    downsample_nearest(&frame.luma, frame.width, frame.height, &mut downsampled, detect_w, detect_h);

                    engine.push_frame(&downsampled, detect_w, ts_ms);
                    stacker.on_frame(&frame.luma, &frame.chroma, ts_ms);

                    capture.release_frame(frame);
                }

                engine.shutdown();
                stacker.shutdown();
            })
            .expect("failed to spawn ingest thread");

        Self {
            running,
            grab_thread: Some(grab_thread),
        }
    }

    /// Flip the shared run flag and join the ingest thread, which in turn
    /// shuts down the engine and stacker's worker/encoder threads.
    pub fn shutdown(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.grab_thread.take() {
            if handle.join().is_err() {
                warn!("ingest thread panicked during shutdown");
            }
        }
    }
}

impl Drop for Ingest {
    fn drop(&mut self) {
        if self.grab_thread.is_some() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downsample_identity_when_dimensions_match() {
        let src = vec![1, 2, 3, 4, 5, 6, 7, 8, 9];
        let mut dst = vec![0u8; 9];
        downsample_nearest(&src, 3, 3, &mut dst, 3, 3);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_downsample_halves_dimensions_with_step_2() {
        // 4x4 source, downsample to 2x2: step=2, samples at (0,0),(2,0),(0,2),(2,2)
        #[rustfmt::skip]
        let src: Vec<u8> = vec![
            1, 2, 3, 4,
            5, 6, 7, 8,
            9, 10, 11, 12,
            13, 14, 15, 16,
        ];
        let mut dst = vec![0u8; 4];
        downsample_nearest(&src, 4, 4, &mut dst, 2, 2);
        assert_eq!(dst, vec![1, 3, 9, 11]);
    }

    #[test]
    fn test_downsample_handles_non_integer_ratio_without_out_of_bounds() {
        let src = vec![7u8; 100 * 75];
        let mut dst = vec![0u8; 64 * 48];
        downsample_nearest(&src, 100, 75, &mut dst, 64, 48);
        assert!(dst.iter().all(|&p| p == 7));
    }
}
