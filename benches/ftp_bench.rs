//! Manual timing harness for the FTP update hot loop and the Hough vote loop.
//!
//! `harness = false` in Cargo.toml means this file supplies its own `main`
//! rather than using the default libtest bench harness — useful here since
//! these loops run on a target with no hardware FPU, so the number worth
//! watching is raw iterations/sec, not statistical noise across many samples.

use std::time::Instant;

use meteor_daq::ftp::FtpBlock;
use meteor_daq::hough::HoughAccum;
use meteor_daq::trig::TrigTable;

fn bench_ftp_update() {
    let width = 640;
    let height = 480;
    let mut block = FtpBlock::create(width, height);
    block.reset(0);
    let frame = vec![128u8; width * height];

    let start = Instant::now();
    let iterations = 256;
    for i in 0..iterations {
        block.update(&frame, width, (i & 0xFF) as u8);
    }
    let elapsed = start.elapsed();
    println!(
        "ftp_update: {iterations} frames of {width}x{height} in {:?} ({:.1} fps)",
        elapsed,
        iterations as f64 / elapsed.as_secs_f64()
    );
}

fn bench_hough_vote() {
    let table = TrigTable::new(180);
    let mut accum = HoughAccum::create(900, 180);
    let candidates: Vec<(i32, i32)> = (0..2000).map(|i| (i % 640, (i * 7) % 480)).collect();

    let start = Instant::now();
    for &(x, y) in &candidates {
        accum.vote(x, y, &table);
    }
    let elapsed = start.elapsed();
    println!(
        "hough_vote: {} candidates x {} theta bins in {:?} ({:.1} votes/sec)",
        candidates.len(),
        table.theta_steps(),
        elapsed,
        (candidates.len() * table.theta_steps()) as f64 / elapsed.as_secs_f64()
    );
}

fn main() {
    bench_ftp_update();
    bench_hough_vote();
}
