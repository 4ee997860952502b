//! Fixed-point trigonometry table (C1).
//!
//! The Hough accumulator's inner loop runs once per candidate pixel per theta bin,
//! many thousands of times per block, on a processor with no hardware floating-point
//! unit in the hot path. Precomputing `cos`/`sin` at 1024x fixed point avoids any
//! float arithmetic there.

use once_cell::sync::OnceCell;

/// Fixed-point scale applied to sin/cos values before truncating to i16.
pub const TRIG_SCALE: i32 = 1024;

/// Precomputed `round(cos(t*pi/theta_steps) * 1024)` and the matching sine table,
/// for `t` in `[0, theta_steps)`.
#[derive(Debug, Clone)]
pub struct TrigTable {
    cos_tab: Vec<i16>,
    sin_tab: Vec<i16>,
}

impl TrigTable {
    /// Build the table for `theta_steps` bins spanning `[0, 180)` degrees.
    pub fn new(theta_steps: u16) -> Self {
        let mut cos_tab = Vec::with_capacity(theta_steps as usize);
        let mut sin_tab = Vec::with_capacity(theta_steps as usize);

        for t in 0..theta_steps {
            let angle = t as f64 * std::f64::consts::PI / theta_steps as f64;
            cos_tab.push((angle.cos() * TRIG_SCALE as f64).round() as i16);
            sin_tab.push((angle.sin() * TRIG_SCALE as f64).round() as i16);
        }

        Self { cos_tab, sin_tab }
    }

    /// Cosine of bin `t`, scaled by [`TRIG_SCALE`].
    #[inline]
    pub fn cos(&self, t: usize) -> i32 {
        self.cos_tab[t] as i32
    }

    /// Sine of bin `t`, scaled by [`TRIG_SCALE`].
    #[inline]
    pub fn sin(&self, t: usize) -> i32 {
        self.sin_tab[t] as i32
    }

    /// Number of theta bins this table covers.
    pub fn theta_steps(&self) -> usize {
        self.cos_tab.len()
    }
}

static TABLE: OnceCell<TrigTable> = OnceCell::new();

/// Returns the process-wide trig table for the given bin count, initialising it
/// on first use. Subsequent calls with a different `theta_steps` still return the
/// table built on first call — callers construct one engine per process, so this
/// matches the "initialise once" contract in spec (C1).
pub fn shared_table(theta_steps: u16) -> &'static TrigTable {
    TABLE.get_or_init(|| TrigTable::new(theta_steps))
}
