//! Full-resolution frame stacker (C7).
//!
//! Accumulates `frames_per_stack` full-resolution frames, averages them into a
//! single luma/chroma pair, optionally subtracts a dark frame, and hands the
//! result off (lock-free from the ingest thread's perspective once the handoff
//! mutex is released) to a background encoder thread for compression and upload.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::capture::{ImageEncoder, MotionMetadataSource};
use crate::push_client::PushClient;

/// One averaged stack handed from the stacker to the encoder thread.
struct PendingStack {
    ts_ms: u64,
    stack_index: u64,
    luma: Vec<u8>,
    chroma: Vec<u8>,
    motion: Option<serde_json::Value>,
}

struct StackerShared {
    pending: Mutex<Option<PendingStack>>,
    condvar: Condvar,
    running: AtomicBool,
}

/// Build the canonical stack-image filename from a station label and timestamp.
pub fn stack_filename(station: &str, timestamp_ms: u64) -> String {
    let secs = (timestamp_ms / 1000) as i64;
    let millis = (timestamp_ms % 1000) as u32;
    let dt: DateTime<Utc> = DateTime::from_timestamp(secs, millis * 1_000_000)
        .unwrap_or_else(|| DateTime::from_timestamp(0, 0).expect("epoch is always valid"));
    format!(
        "STACK_{}_{}_{}_{:03}.jpg",
        station,
        dt.format("%Y%m%d"),
        dt.format("%H%M%S"),
        millis,
    )
}

/// Load a dark frame from `path`. The file is the raw concatenation of a luma
/// plane (`width*height` bytes) followed by a chroma plane
/// (`width*(height/2)` bytes). Returns `None` (logging a warning) if the file
/// is absent or its length does not match, per the "ignored otherwise" clause.
fn load_dark_frame(path: &Path, expected_luma_len: usize, expected_chroma_len: usize) -> Option<(Vec<u8>, Vec<u8>)> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "dark frame not readable, proceeding without it");
            return None;
        }
    };
    let expected_total = expected_luma_len + expected_chroma_len;
    if bytes.len() != expected_total {
        warn!(
            path = %path.display(),
            expected = expected_total,
            actual = bytes.len(),
            "dark frame length mismatch, proceeding without it"
        );
        return None;
    }
    let luma = bytes[..expected_luma_len].to_vec();
    let chroma = bytes[expected_luma_len..].to_vec();
    Some((luma, chroma))
}

/// Accumulates full-resolution frames and periodically hands an averaged,
/// optionally dark-subtracted stack off to a background encoder thread.
pub struct FrameStacker {
    width: usize,
    height: usize,
    frames_per_stack: u32,
    jpeg_quality: u8,
    station: String,
    stack_tmp_dir: PathBuf,

    luma_accum: Vec<u32>,
    chroma_accum: Vec<u32>,
    luma_out: Vec<u8>,
    chroma_out: Vec<u8>,
    dark_luma: Option<Vec<u8>>,
    dark_chroma: Option<Vec<u8>>,
    frame_count: u32,
    stack_index: u64,

    shared: Arc<StackerShared>,
    encoder_thread: Option<JoinHandle<()>>,
    motion: Arc<dyn MotionMetadataSource>,
}

impl FrameStacker {
    /// Construct a stacker for `width`x`height` frames and spawn its background
    /// encoder thread. `dark_frame_path`, if given, is loaded eagerly.
    /// `motion` is polled once per completed stack for an optional metadata
    /// snapshot folded into the companion `/event` POST; pass
    /// `Arc::new(NoMotionMetadata)` when no ROI monitor is attached.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        width: usize,
        height: usize,
        frames_per_stack: u32,
        jpeg_quality: u8,
        station: String,
        stack_tmp_dir: PathBuf,
        dark_frame_path: Option<PathBuf>,
        push: Arc<PushClient>,
        encoder: Arc<dyn ImageEncoder>,
        motion: Arc<dyn MotionMetadataSource>,
    ) -> Self {
        let chroma_h = (height / 2).max(1);
        let (dark_luma, dark_chroma) = match &dark_frame_path {
            Some(path) => load_dark_frame(path, width * height, width * chroma_h).unzip(),
            None => (None, None),
        };

        let shared = Arc::new(StackerShared {
            pending: Mutex::new(None),
            condvar: Condvar::new(),
            running: AtomicBool::new(true),
        });

        let worker_shared = Arc::clone(&shared);
        let worker_push = Arc::clone(&push);
        let worker_encoder = Arc::clone(&encoder);
        let worker_station = station.clone();
        let worker_tmp_dir = stack_tmp_dir.clone();
        let worker_quality = jpeg_quality;
        let worker_width = width;
        let worker_height = height;

        let encoder_thread = std::thread::Builder::new()
            .name("stack-encoder".to_string())
            .spawn(move || {
                encoder_loop(
                    worker_shared,
                    worker_push,
                    worker_encoder,
                    worker_station,
                    worker_tmp_dir,
                    worker_quality,
                    worker_width,
                    worker_height,
                )
            })
            .expect("failed to spawn stack-encoder thread");

        Self {
            width,
            height,
            frames_per_stack,
            jpeg_quality,
            station,
            stack_tmp_dir,
            luma_accum: vec![0u32; width * height],
            chroma_accum: vec![0u32; width * chroma_h],
            luma_out: vec![0u8; width * height],
            chroma_out: vec![0u8; width * chroma_h],
            dark_luma,
            dark_chroma,
            frame_count: 0,
            stack_index: 0,
            shared,
            encoder_thread: Some(encoder_thread),
            motion,
        }
    }

    /// Feed one full-resolution frame. On the boundary frame (`frame_count`
    /// reaches `frames_per_stack`) this averages, dark-subtracts, and attempts
    /// the handoff to the encoder thread.
    pub fn on_frame(&mut self, luma: &[u8], chroma: &[u8], ts_ms: u64) {
        debug_assert_eq!(luma.len(), self.luma_accum.len());
        debug_assert_eq!(chroma.len(), self.chroma_accum.len());

        for (acc, &s) in self.luma_accum.iter_mut().zip(luma.iter()) {
            *acc += s as u32;
        }
        for (acc, &s) in self.chroma_accum.iter_mut().zip(chroma.iter()) {
            *acc += s as u32;
        }
        self.frame_count += 1;
        if self.frame_count < self.frames_per_stack {
            return;
        }

        let f = self.frame_count as u32;
        for (out, acc) in self.luma_out.iter_mut().zip(self.luma_accum.iter_mut()) {
            *out = (*acc / f) as u8;
            *acc = 0;
        }
        for (out, acc) in self.chroma_out.iter_mut().zip(self.chroma_accum.iter_mut()) {
            *out = (*acc / f) as u8;
            *acc = 0;
        }
        self.frame_count = 0;

        if let Some(dark) = &self.dark_luma {
            for (out, &d) in self.luma_out.iter_mut().zip(dark.iter()) {
                *out = out.saturating_sub(d);
            }
        }
        if let Some(dark) = &self.dark_chroma {
            for (out, &d) in self.chroma_out.iter_mut().zip(dark.iter()) {
                let adjusted = *out as i32 - d as i32 + 128;
                *out = adjusted.clamp(0, 255) as u8;
            }
        }

        self.stack_index += 1;
        let motion_snapshot = self.motion.snapshot();
        let mut pending = self.shared.pending.lock().expect("stacker mutex poisoned");
        if pending.is_none() {
            *pending = Some(PendingStack {
                ts_ms,
                stack_index: self.stack_index,
                luma: self.luma_out.clone(),
                chroma: self.chroma_out.clone(),
                motion: motion_snapshot,
            });
            drop(pending);
            self.shared.condvar.notify_one();
        } else {
            warn!(stack_index = self.stack_index, "encode busy, stack dropped");
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Signal the encoder thread to stop and join it.
    pub fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.condvar.notify_all();
        if let Some(handle) = self.encoder_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for FrameStacker {
    fn drop(&mut self) {
        if self.encoder_thread.is_some() {
            self.shutdown();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn encoder_loop(
    shared: Arc<StackerShared>,
    push: Arc<PushClient>,
    encoder: Arc<dyn ImageEncoder>,
    station: String,
    tmp_dir: PathBuf,
    jpeg_quality: u8,
    width: usize,
    height: usize,
) {
    loop {
        let stack = {
            let mut guard = shared.pending.lock().expect("stacker mutex poisoned");
            loop {
                if guard.is_some() {
                    break guard.take();
                }
                if !shared.running.load(Ordering::SeqCst) {
                    return;
                }
                guard = shared.condvar.wait(guard).expect("stacker condvar poisoned");
            }
        };

        let Some(stack) = stack else { continue };

        let filename = stack_filename(&station, stack.ts_ms);
        let path = tmp_dir.join(&filename);

        if let Err(e) = std::fs::create_dir_all(&tmp_dir) {
            warn!(error = %e, "failed to create stack tmp dir");
            continue;
        }
        if let Err(e) = encoder.encode(&path, &stack.luma, &stack.chroma, width, height, jpeg_quality) {
            warn!(stack_index = stack.stack_index, error = %e, "stack encode failed");
            continue;
        }

        if let Err(e) = push.post_stack(&path, &filename) {
            warn!(stack_index = stack.stack_index, error = %e, "stack upload failed");
        } else {
            info!(stack_index = stack.stack_index, %filename, "stack published");
        }

        let mut event = serde_json::json!({
            "camera_id": station,
            "type": "stack",
            "filename": filename,
            "timestamp_ms": stack.ts_ms,
            "stack_index": stack.stack_index,
        });
        if let Some(motion) = stack.motion {
            event["motion"] = motion;
        }
        if let Ok(body) = serde_json::to_vec(&event) {
            if let Err(e) = push.post_json(&body) {
                warn!(stack_index = stack.stack_index, error = %e, "stack event POST failed");
            }
        }

        if let Err(e) = std::fs::remove_file(&path) {
            debug!(path = %path.display(), error = %e, "failed to remove staged stack file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{MockImageEncoder, NoMotionMetadata};

    fn test_stacker(width: usize, height: usize, frames_per_stack: u32, dark: Option<PathBuf>) -> FrameStacker {
        let push = Arc::new(PushClient::new("127.0.0.1", 1, 50));
        let encoder: Arc<dyn ImageEncoder> = Arc::new(MockImageEncoder);
        let tmp_dir = tempfile::tempdir().unwrap().into_path();
        FrameStacker::start(
            width,
            height,
            frames_per_stack,
            85,
            "AB0001".to_string(),
            tmp_dir,
            dark,
            push,
            encoder,
            Arc::new(NoMotionMetadata),
        )
    }

    #[test]
    fn test_stack_filename_format() {
        let dt = DateTime::parse_from_rfc3339("2024-03-05T06:07:08.123Z").unwrap();
        let ts_ms = dt.timestamp_millis() as u64;
        assert_eq!(stack_filename("AB0001", ts_ms), "STACK_AB0001_20240305_060708_123.jpg");
    }

    #[test]
    fn test_on_frame_averages_constant_input() {
        let mut stacker = test_stacker(4, 4, 4, None);
        for i in 0..4 {
            let luma = vec![40u8; 16];
            let chroma = vec![128u8; 8];
            stacker.on_frame(&luma, &chroma, i * 10);
        }
        // After averaging, luma_out should be 40 everywhere (checked indirectly
        // by re-running once more and ensuring accumulators reset to zero, i.e.
        // a subsequent single low-value frame doesn't carry residual sum).
        stacker.on_frame(&[0u8; 16], &[0u8; 8], 1000);
        assert_eq!(stacker.frame_count, 1);
    }

    #[test]
    fn test_dark_frame_subtraction_saturates_luma_at_zero() {
        let dir = tempfile::tempdir().unwrap();
        let dark_path = dir.path().join("dark.bin");
        // width=2,height=2 -> luma 4 bytes, chroma 2 bytes (height/2=1)
        let mut dark_bytes = vec![50u8; 4];
        dark_bytes.extend(vec![100u8; 2]);
        std::fs::write(&dark_path, &dark_bytes).unwrap();

        let mut stacker = test_stacker(2, 2, 1, Some(dark_path));
        assert!(stacker.dark_luma.is_some());

        // Single frame at value 30 < dark value 50 -> saturates to 0.
        stacker.on_frame(&[30, 30, 30, 30], &[90, 90], 0);
        assert!(stacker.luma_out.iter().all(|&v| v == 0));
    }

    #[test]
    fn test_dark_frame_length_mismatch_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let dark_path = dir.path().join("dark.bin");
        std::fs::write(&dark_path, vec![1u8; 3]).unwrap(); // wrong length
        let stacker = test_stacker(4, 4, 4, Some(dark_path));
        assert!(stacker.dark_luma.is_none());
        assert!(stacker.dark_chroma.is_none());
    }

    #[test]
    fn test_motion_metadata_snapshot_is_folded_into_companion_event() {
        struct FixedMotion;
        impl MotionMetadataSource for FixedMotion {
            fn snapshot(&self) -> Option<serde_json::Value> {
                Some(serde_json::json!({"roi_hits": 3}))
            }
        }

        let push = Arc::new(PushClient::new("127.0.0.1", 1, 50));
        let encoder: Arc<dyn ImageEncoder> = Arc::new(MockImageEncoder);
        let tmp_dir = tempfile::tempdir().unwrap().into_path();
        let mut stacker = FrameStacker::start(
            2,
            2,
            1,
            85,
            "AB0001".to_string(),
            tmp_dir,
            None,
            push,
            encoder,
            Arc::new(FixedMotion),
        );
        stacker.on_frame(&[10, 10, 10, 10], &[128, 128], 0);
        // The snapshot is taken synchronously in on_frame and handed to the
        // encoder thread; nothing to assert here beyond "it doesn't panic"
        // since the JSON body itself is exercised end-to-end in
        // tests/scenarios.rs's stacker scenario.
        stacker.shutdown();
    }

    #[test]
    fn test_shutdown_joins_encoder_thread() {
        let mut stacker = test_stacker(2, 2, 1, None);
        stacker.shutdown();
        assert!(stacker.encoder_thread.is_none());
    }
}
