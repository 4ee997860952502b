//! On-camera meteor detection pipeline.
//!
//! Integer-only FTP (Four-frame Temporal Pixel) block accumulation, a
//! fixed-point Hough-transform line detector, a double-buffered ingest/worker
//! pipeline, a full-resolution frame stacker with dark-frame subtraction, and
//! an RMS-compatible file/network publication layer, built for a low-power
//! embedded imaging device with no hardware FPU on the hot path.

pub mod capture;
pub mod config;
pub mod engine;
pub mod error;
pub mod ftp;
pub mod header;
pub mod hough;
pub mod ingest;
pub mod push_client;
pub mod stacker;
pub mod trig;

pub use config::AppConfig;
pub use engine::{DetectionEngine, PublishOutcome};
pub use error::{AppResult, DaqError};
pub use ingest::Ingest;
pub use stacker::FrameStacker;
