//! Hough-transform line accumulator and peak extraction (C3).
//!
//! Candidate pixels vote into a 2D (ρ, θ) accumulator using the fixed-point trig
//! table from [`crate::trig`]; peaks are pulled out with 3×3 local-maximum
//! suppression and handed to the detection engine for length/vote validation.

use crate::trig::TrigTable;

/// A candidate line: Hough-space parameters plus the vote count, before the
/// detection engine refines it into geometric endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MeteorLine {
    pub rho: i32,
    pub theta: u16,
    pub votes: u32,
    pub length_px: u32,
}

/// 2D vote accumulator indexed by `(rho + rho_max, theta)`. ~648 KB at the
/// default `rho_max = 900`, `theta_steps = 180`, so it is always heap-allocated.
pub struct HoughAccum {
    rho_max: i32,
    theta_steps: u16,
    votes: Vec<u16>,
}

impl HoughAccum {
    /// Allocate a zeroed accumulator for the given parameters.
    pub fn create(rho_max: i32, theta_steps: u16) -> Self {
        let rows = (2 * rho_max) as usize;
        Self {
            rho_max,
            theta_steps,
            votes: vec![0u16; rows * theta_steps as usize],
        }
    }

    pub fn rho_max(&self) -> i32 {
        self.rho_max
    }

    pub fn theta_steps(&self) -> u16 {
        self.theta_steps
    }

    #[inline]
    fn index(&self, rho_index: i32, theta_index: u16) -> usize {
        rho_index as usize * self.theta_steps as usize + theta_index as usize
    }

    /// Zero every cell.
    pub fn reset(&mut self) {
        self.votes.iter_mut().for_each(|v| *v = 0);
    }

    /// Cast one vote per theta bin for the point `(x, y)`, using `table` for the
    /// fixed-point sin/cos lookups. `table.theta_steps()` must equal this
    /// accumulator's `theta_steps`.
    pub fn vote(&mut self, x: i32, y: i32, table: &TrigTable) {
        debug_assert_eq!(table.theta_steps(), self.theta_steps as usize);
        for t in 0..self.theta_steps {
            let rho_f = x * table.cos(t as usize) + y * table.sin(t as usize);
            // TRIG_SCALE is 1024 = 2^10; an arithmetic shift is an exact,
            // floor-toward-negative-infinity divide and avoids any float path.
            let rho = rho_f >> 10;
            let rho_index = rho + self.rho_max;
            if rho_index >= 0 && rho_index < 2 * self.rho_max {
                let idx = self.index(rho_index, t);
                self.votes[idx] = self.votes[idx].saturating_add(1);
            }
        }
    }

    #[inline]
    fn get(&self, rho_index: i32, theta_index: i32) -> u16 {
        self.votes[self.index(rho_index, theta_index as u16)]
    }

    /// Scan the interior of the accumulator for cells at or above `threshold`
    /// votes that are a local maximum over their 3×3 neighbourhood, emitting up
    /// to `max_lines` of them in row-major scan order.
    pub fn find_peaks(&self, threshold: u16, out: &mut Vec<MeteorLine>, max_lines: usize) -> usize {
        out.clear();
        let rows = 2 * self.rho_max;
        let cols = self.theta_steps as i32;

        'scan: for r in 1..(rows - 1) {
            for t in 1..(cols - 1) {
                let v = self.get(r, t);
                if v < threshold {
                    continue;
                }
                let mut is_peak = true;
                for dr in -1..=1i32 {
                    for dt in -1..=1i32 {
                        if dr == 0 && dt == 0 {
                            continue;
                        }
                        if self.get(r + dr, t + dt) > v {
                            is_peak = false;
                            break;
                        }
                    }
                    if !is_peak {
                        break;
                    }
                }
                if is_peak {
                    out.push(MeteorLine {
                        rho: r - self.rho_max,
                        theta: t as u16,
                        votes: v as u32,
                        length_px: v as u32,
                    });
                    if out.len() >= max_lines {
                        break 'scan;
                    }
                }
            }
        }
        out.len()
    }
}
