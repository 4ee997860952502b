//! Detection engine (C6): owns the double-buffered FTP accumulation, Hough
//! voting, candidate thresholding, line validation, and publication.
//!
//! The engine itself is driven by the ingest thread (`push_frame` is called
//! once per downsampled frame); it owns a single background worker thread that
//! finalises, votes, and publishes one completed 256-frame block at a time.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use tracing::{info, warn};

use crate::config::{DetectConfig, PushConfig};
use crate::ftp::FtpBlock;
use crate::header::{canonical_filename, write_block_file, DetectorHeader};
use crate::hough::{HoughAccum, MeteorLine};
use crate::push_client::PushClient;
use crate::trig;

/// Upper bound on Hough peaks considered per block; the engine publishes at
/// most one detection regardless, but needs a cap to bound `find_peaks` work.
const DETECTOR_MAX_LINES: usize = 16;

/// Outcome of processing one completed FTP block, used for structured logging
/// and so tests can assert which policy path a block took without scraping
/// log text.
#[derive(Debug, Clone, PartialEq)]
pub enum PublishOutcome {
    Published,
    SkippedNoCandidates,
    SkippedSaturated,
    SkippedBelowVotes,
    SkippedTooShort,
    Failed(String),
}

struct PendingBlock {
    block: FtpBlock,
    completion_ts_ms: u64,
}

/// Two fixed `FtpBlock` instances circulate between the ingest side and the
/// worker: `pending` carries a filled block to the worker, `free` carries the
/// other one back once the worker has copied its stats into the output
/// planes and no longer needs its storage. Ingest never allocates a third.
struct EngineShared {
    pending: Mutex<Option<PendingBlock>>,
    free: Mutex<Option<FtpBlock>>,
    condvar: Condvar,
    running: AtomicBool,
}

/// Owns the active FTP block and hands completed blocks off to a worker
/// thread for finalisation, Hough voting, and publication.
pub struct DetectionEngine {
    active_block: FtpBlock,
    frame_count: u32,
    block_frames: u32,
    width: usize,
    height: usize,
    shared: Arc<EngineShared>,
    worker_thread: Option<JoinHandle<()>>,
}

impl DetectionEngine {
    /// Construct the engine and spawn its detection worker thread.
    pub fn start(detect: DetectConfig, push_config: PushConfig, push: Arc<PushClient>) -> Self {
        let width = detect.detect_w as usize;
        let height = detect.detect_h as usize;

        let shared = Arc::new(EngineShared {
            pending: Mutex::new(None),
            free: Mutex::new(Some(FtpBlock::create(width, height))),
            condvar: Condvar::new(),
            running: AtomicBool::new(true),
        });

        let worker_shared = Arc::clone(&shared);
        let worker_detect = detect.clone();
        let header_template = DetectorHeader::template(width as u32, height as u32, push_config.camno, detect.fps);

        let worker_thread = std::thread::Builder::new()
            .name("detection-worker".to_string())
            .spawn(move || {
                worker_loop(worker_shared, worker_detect, push_config, push, header_template);
            })
            .expect("failed to spawn detection-worker thread");

        Self {
            active_block: FtpBlock::create(width, height),
            frame_count: 0,
            block_frames: detect.block_frames as u32,
            width,
            height,
            shared,
            worker_thread: Some(worker_thread),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    /// Feed one downsampled detection-resolution frame.
    pub fn push_frame(&mut self, y_plane: &[u8], stride: usize, ts_ms: u64) {
        if self.frame_count == 0 {
            self.active_block.reset(ts_ms);
        }
        let frame_idx = (self.frame_count & 0xFF) as u8;
        self.active_block.update(y_plane, stride, frame_idx);
        self.frame_count += 1;

        if self.frame_count < self.block_frames {
            return;
        }

        let mut pending = self.shared.pending.lock().expect("engine mutex poisoned");
        if pending.is_some() {
            warn!(block_index = self.active_block.block_index(), "processing busy, block dropped");
            self.frame_count = 0;
            return;
        }

        let mut free = self.shared.free.lock().expect("engine mutex poisoned");
        let Some(mut next) = free.take() else {
            // The worker hasn't returned the other fixed buffer yet (still
            // finalising the previous block); drop this completed block
            // rather than allocate a third buffer to hold it.
            drop(free);
            warn!(block_index = self.active_block.block_index(), "no free block, block dropped");
            self.frame_count = 0;
            return;
        };
        drop(free);

        // `next` is the other of the two fixed buffers, last used some number
        // of swaps ago; its own block_index is stale. Carry the sequence
        // forward from the block it's replacing so the published sequence
        // keeps rolling over mod 256 across the whole stream, not just
        // within one buffer's own usage history.
        next.set_block_index(self.active_block.block_index());
        let filled = std::mem::replace(&mut self.active_block, next);
        *pending = Some(PendingBlock {
            block: filled,
            completion_ts_ms: ts_ms,
        });
        drop(pending);
        self.shared.condvar.notify_one();
        self.frame_count = 0;
    }

    /// Signal the worker thread to stop and join it.
    pub fn shutdown(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.condvar.notify_all();
        if let Some(handle) = self.worker_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DetectionEngine {
    fn drop(&mut self) {
        if self.worker_thread.is_some() {
            self.shutdown();
        }
    }
}

fn worker_loop(
    shared: Arc<EngineShared>,
    detect: DetectConfig,
    push_config: PushConfig,
    push: Arc<PushClient>,
    header_template: DetectorHeader,
) {
    let width = detect.detect_w as usize;
    let height = detect.detect_h as usize;
    let table = trig::shared_table(detect.theta_steps);
    let mut hough = HoughAccum::create(detect.rho_max, detect.theta_steps);

    let mut max_plane = vec![0u8; width * height];
    let mut maxf_plane = vec![0u8; width * height];
    let mut avg_plane = vec![0u8; width * height];
    let mut std_plane = vec![0u8; width * height];
    let mut xs = Vec::with_capacity(detect.max_candidates);
    let mut ys = Vec::with_capacity(detect.max_candidates);
    let mut peaks = Vec::with_capacity(DETECTOR_MAX_LINES);

    loop {
        let pending = {
            let mut guard = shared.pending.lock().expect("engine mutex poisoned");
            loop {
                if guard.is_some() {
                    break guard.take();
                }
                if !shared.running.load(Ordering::SeqCst) {
                    return;
                }
                guard = shared.condvar.wait(guard).expect("engine condvar poisoned");
            }
        };
        let Some(pending) = pending else { continue };
        let PendingBlock { block, completion_ts_ms } = pending;

        block.finalize(&mut max_plane, &mut maxf_plane, &mut avg_plane, &mut std_plane);
        let block_index = block.block_index();
        let block_start_ms = block.timestamp_ms();

        // Hand the now-finalised buffer back to the ingest side so it can be
        // recycled into the next swap instead of ingest allocating a third one.
        *shared.free.lock().expect("engine mutex poisoned") = Some(block);

        scan_candidates(&max_plane, &avg_plane, &std_plane, &detect, width, height, &mut xs, &mut ys);

        let outcome = process_candidates(
            &xs,
            &ys,
            &detect,
            &mut hough,
            table,
            &mut peaks,
            &max_plane,
            &maxf_plane,
            &avg_plane,
            &std_plane,
            width,
            height,
            block_index,
            block_start_ms,
            completion_ts_ms,
            &push_config,
            &push,
            &header_template,
        );

        match &outcome {
            PublishOutcome::Published => info!(block_index, "detection published"),
            PublishOutcome::Failed(reason) => warn!(block_index, %reason, "publication failed"),
            other => tracing::debug!(block_index, ?other, "block skipped"),
        }
    }
}

/// Scan the max/avg/std planes for pixels whose temporal excursion exceeds
/// the configured threshold, in row-major order, capped at `max_candidates`.
#[allow(clippy::too_many_arguments)]
fn scan_candidates(
    max_plane: &[u8],
    avg_plane: &[u8],
    std_plane: &[u8],
    detect: &DetectConfig,
    width: usize,
    height: usize,
    xs: &mut Vec<i32>,
    ys: &mut Vec<i32>,
) {
    xs.clear();
    ys.clear();
    for y in 0..height {
        for x in 0..width {
            if xs.len() >= detect.max_candidates {
                break;
            }
            let i = y * width + x;
            let diff = max_plane[i].wrapping_sub(avg_plane[i]);
            let thresh = detect.k_sigma.wrapping_mul(std_plane[i]);
            if diff > thresh {
                xs.push(x as i32);
                ys.push(y as i32);
            }
        }
    }
}

/// Finalise, scan, Hough-vote, and (if a candidate line clears every gate)
/// publish one already-completed FTP block, synchronously and without a
/// worker thread. Used by integration tests that need the resulting
/// `PublishOutcome` as a direct observable rather than inferring it from
/// whether a POST arrived.
pub fn process_block(block: &FtpBlock, detect: &DetectConfig, push_config: &PushConfig, push: &PushClient) -> PublishOutcome {
    let width = detect.detect_w as usize;
    let height = detect.detect_h as usize;
    let table = trig::shared_table(detect.theta_steps);
    let mut hough = HoughAccum::create(detect.rho_max, detect.theta_steps);
    let mut peaks = Vec::with_capacity(DETECTOR_MAX_LINES);

    let mut max_plane = vec![0u8; width * height];
    let mut maxf_plane = vec![0u8; width * height];
    let mut avg_plane = vec![0u8; width * height];
    let mut std_plane = vec![0u8; width * height];
    block.finalize(&mut max_plane, &mut maxf_plane, &mut avg_plane, &mut std_plane);

    let mut xs = Vec::with_capacity(detect.max_candidates.min(width * height));
    let mut ys = Vec::with_capacity(detect.max_candidates.min(width * height));
    scan_candidates(&max_plane, &avg_plane, &std_plane, detect, width, height, &mut xs, &mut ys);

    let header_template = DetectorHeader::template(width as u32, height as u32, push_config.camno, detect.fps);
    let block_start_ms = block.timestamp_ms();

    process_candidates(
        &xs,
        &ys,
        detect,
        &mut hough,
        table,
        &mut peaks,
        &max_plane,
        &maxf_plane,
        &avg_plane,
        &std_plane,
        width,
        height,
        block.block_index(),
        block_start_ms,
        block_start_ms,
        push_config,
        push,
        &header_template,
    )
}

#[allow(clippy::too_many_arguments)]
fn process_candidates(
    xs: &[i32],
    ys: &[i32],
    detect: &DetectConfig,
    hough: &mut HoughAccum,
    table: &trig::TrigTable,
    peaks: &mut Vec<MeteorLine>,
    max_plane: &[u8],
    maxf_plane: &[u8],
    avg_plane: &[u8],
    std_plane: &[u8],
    width: usize,
    height: usize,
    block_index: u8,
    block_start_ms: u64,
    completion_ts_ms: u64,
    push_config: &PushConfig,
    push: &PushClient,
    header_template: &DetectorHeader,
) -> PublishOutcome {
    let count = xs.len();
    if count < detect.min_candidates {
        return PublishOutcome::SkippedNoCandidates;
    }
    if count >= detect.max_candidates {
        return PublishOutcome::SkippedSaturated;
    }

    hough.reset();
    for (&x, &y) in xs.iter().zip(ys.iter()) {
        hough.vote(x, y, table);
    }
    hough.find_peaks(detect.peak_threshold, peaks, DETECTOR_MAX_LINES);

    let mut best_outcome = PublishOutcome::SkippedBelowVotes;

    for line in peaks.iter() {
        if line.votes < detect.min_votes {
            continue;
        }

        let Some((p1, p2)) = line_endpoints(line.rho as f64, line.theta, table, width, height) else {
            continue;
        };
        let dx = p2.0 - p1.0;
        let dy = p2.1 - p1.1;
        let length = (dx * dx + dy * dy).sqrt();
        if length < detect.min_length_px as f64 {
            best_outcome = PublishOutcome::SkippedTooShort;
            continue;
        }

        return publish_detection(
            line,
            p1,
            p2,
            length,
            block_start_ms,
            completion_ts_ms,
            max_plane,
            maxf_plane,
            avg_plane,
            std_plane,
            &detect.ff_tmp_dir,
            push_config,
            push,
            header_template,
        );
    }

    best_outcome
}

/// Intersect the parametric line `x*cosθ + y*sinθ = ρ` with the four image
/// borders and return the first two distinct in-bounds intersections, in
/// border-scan order (left, right, top, bottom).
fn line_endpoints(
    rho: f64,
    theta_deg: u16,
    table: &trig::TrigTable,
    width: usize,
    height: usize,
) -> Option<((f64, f64), (f64, f64))> {
    let cos_t = table.cos(theta_deg as usize) as f64 / trig::TRIG_SCALE as f64;
    let sin_t = table.sin(theta_deg as usize) as f64 / trig::TRIG_SCALE as f64;
    let w = (width - 1) as f64;
    let h = (height - 1) as f64;
    const EPS: f64 = 1e-9;

    let mut points: Vec<(f64, f64)> = Vec::with_capacity(2);
    let mut push_unique = |p: (f64, f64)| {
        if points.len() < 2 && !points.iter().any(|&(px, py)| (px - p.0).abs() < 1e-6 && (py - p.1).abs() < 1e-6) {
            points.push(p);
        }
    };

    if sin_t.abs() > EPS {
        let y = rho / sin_t;
        if (0.0..=h).contains(&y) {
            push_unique((0.0, y));
        }
        let y2 = (rho - cos_t * w) / sin_t;
        if (0.0..=h).contains(&y2) {
            push_unique((w, y2));
        }
    }
    if cos_t.abs() > EPS {
        let x = rho / cos_t;
        if (0.0..=w).contains(&x) {
            push_unique((x, 0.0));
        }
        let x2 = (rho - sin_t * h) / cos_t;
        if (0.0..=w).contains(&x2) {
            push_unique((x2, h));
        }
    }

    if points.len() == 2 {
        Some((points[0], points[1]))
    } else {
        None
    }
}

#[allow(clippy::too_many_arguments)]
fn publish_detection(
    line: &MeteorLine,
    p1: (f64, f64),
    p2: (f64, f64),
    length: f64,
    block_start_ms: u64,
    completion_ts_ms: u64,
    max_plane: &[u8],
    maxf_plane: &[u8],
    avg_plane: &[u8],
    std_plane: &[u8],
    ff_tmp_dir: &str,
    push_config: &PushConfig,
    push: &PushClient,
    header_template: &DetectorHeader,
) -> PublishOutcome {
    let filename = canonical_filename(&push_config.station_id, completion_ts_ms);
    let path = PathBuf::from(ff_tmp_dir).join(&filename);

    if let Err(e) = std::fs::create_dir_all(ff_tmp_dir) {
        return PublishOutcome::Failed(format!("create ff_tmp_dir failed: {e}"));
    }

    if let Err(e) = write_block_file(&path, header_template, max_plane, maxf_plane, avg_plane, std_plane) {
        return PublishOutcome::Failed(format!("write block file failed: {e}"));
    }

    let event = serde_json::json!({
        "camera_id": push_config.station_id,
        "type": "meteor",
        "timestamp_ms": completion_ts_ms,
        "block_start_ms": block_start_ms,
        "candidate": {
            "rho": line.rho,
            "theta": line.theta,
            "x1": p1.0.round() as i32,
            "y1": p1.1.round() as i32,
            "x2": p2.0.round() as i32,
            "y2": p2.1.round() as i32,
            "length_px": length.round() as u32,
            "votes": line.votes,
        },
    });

    match serde_json::to_vec(&event) {
        Ok(body) => {
            if let Err(e) = push.post_json(&body) {
                warn!(error = %e, "event POST failed");
            }
        }
        Err(e) => warn!(error = %e, "event serialization failed"),
    }

    if let Err(e) = push.post_ff(&path, &filename) {
        warn!(error = %e, "block file POST failed");
    }

    if let Err(e) = std::fs::remove_file(&path) {
        tracing::debug!(path = %path.display(), error = %e, "failed to remove staged block file");
    }

    PublishOutcome::Published
}
