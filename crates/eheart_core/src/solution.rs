//! Dense output of a solve: a continuous interpolant over the solved interval.

use nalgebra::DVector;

use crate::error::{EngineError, EngineResult};
use crate::solvers::tsit5_interpolation_weights;

/// One accepted step together with the stage derivatives needed to
/// interpolate inside it.
#[derive(Debug, Clone)]
pub(crate) struct Segment {
    pub(crate) t0: f64,
    pub(crate) t1: f64,
    pub(crate) y0: DVector<f64>,
    pub(crate) y1: DVector<f64>,
    pub(crate) k: Vec<DVector<f64>>,
}

impl Segment {
    fn interpolate(&self, t: f64) -> DVector<f64> {
        if t == self.t1 {
            return self.y1.clone();
        }
        if t == self.t0 {
            return self.y0.clone();
        }
        let h = self.t1 - self.t0;
        let theta = (t - self.t0) / h;
        let weights = tsit5_interpolation_weights(theta);
        let mut y = self.y0.clone();
        for (w, k) in weights.iter().zip(&self.k) {
            y.axpy(h * w, k, 1.0);
        }
        y
    }
}

/// Read-only, callable solution of one solve. A later solve produces a new
/// `Solution` rather than mutating this one.
#[derive(Debug, Clone)]
pub struct Solution {
    t_start: f64,
    t_end: f64,
    y_start: DVector<f64>,
    y_end: DVector<f64>,
    segments: Vec<Segment>,
}

impl Solution {
    /// A solution over an empty interval.
    pub(crate) fn point(t: f64, y: DVector<f64>) -> Self {
        Self {
            t_start: t,
            t_end: t,
            y_start: y.clone(),
            y_end: y,
            segments: Vec::new(),
        }
    }

    pub(crate) fn from_segments(t_start: f64, y_start: DVector<f64>, segments: Vec<Segment>) -> Self {
        let (t_end, y_end) = match segments.last() {
            Some(last) => (last.t1, last.y1.clone()),
            None => (t_start, y_start.clone()),
        };
        Self {
            t_start,
            t_end,
            y_start,
            y_end,
            segments,
        }
    }

    /// `(start, end)` in integration order; `end < start` for backward solves.
    pub fn t_span(&self) -> (f64, f64) {
        (self.t_start, self.t_end)
    }

    pub fn dimension(&self) -> usize {
        self.y_start.len()
    }

    /// Number of accepted integrator steps.
    pub fn step_count(&self) -> usize {
        self.segments.len()
    }

    pub fn end_state(&self) -> Vec<f64> {
        self.y_end.as_slice().to_vec()
    }

    pub fn contains(&self, t: f64) -> bool {
        let (lo, hi) = self.bounds();
        let tol = 1e-9 * (hi - lo).abs().max(1.0);
        t.is_finite() && t >= lo - tol && t <= hi + tol
    }

    fn bounds(&self) -> (f64, f64) {
        if self.t_start <= self.t_end {
            (self.t_start, self.t_end)
        } else {
            (self.t_end, self.t_start)
        }
    }

    /// State at `t` by interpolation.
    pub fn at(&self, t: f64) -> EngineResult<Vec<f64>> {
        if !self.contains(t) {
            return Err(EngineError::OutOfRange {
                t,
                start: self.t_start,
                end: self.t_end,
            });
        }
        if self.segments.is_empty() {
            return Ok(self.y_start.as_slice().to_vec());
        }
        let dir = if self.t_end >= self.t_start { 1.0 } else { -1.0 };
        let s = dir * (t - self.t_start);
        let idx = self
            .segments
            .partition_point(|seg| dir * (seg.t1 - self.t_start) < s)
            .min(self.segments.len() - 1);
        Ok(self.segments[idx].interpolate(t).as_slice().to_vec())
    }

    /// States at several times, one vector per time.
    pub fn at_many(&self, times: &[f64]) -> EngineResult<Vec<Vec<f64>>> {
        times.iter().map(|&t| self.at(t)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_segment(t0: f64, t1: f64, y0: f64, slope: f64) -> Segment {
        let k = vec![DVector::from_element(1, slope); 7];
        Segment {
            t0,
            t1,
            y0: DVector::from_element(1, y0),
            y1: DVector::from_element(1, y0 + slope * (t1 - t0)),
            k,
        }
    }

    #[test]
    fn constant_slope_is_interpolated_exactly() {
        let solution = Solution::from_segments(
            0.0,
            DVector::from_element(1, 1.0),
            vec![linear_segment(0.0, 0.5, 1.0, 2.0), linear_segment(0.5, 1.0, 2.0, 2.0)],
        );
        assert_eq!(solution.t_span(), (0.0, 1.0));
        for &t in &[0.0, 0.25, 0.5, 0.75, 1.0] {
            let y = solution.at(t).expect("inside span");
            assert!((y[0] - (1.0 + 2.0 * t)).abs() < 1e-12, "t = {t}: {}", y[0]);
        }
    }

    #[test]
    fn times_outside_span_are_rejected() {
        let solution = Solution::from_segments(
            0.0,
            DVector::from_element(1, 1.0),
            vec![linear_segment(0.0, 1.0, 1.0, 1.0)],
        );
        let err = solution.at(1.5).expect_err("outside");
        assert!(matches!(err, EngineError::OutOfRange { .. }));
        assert!(solution.at(f64::NAN).is_err());
    }

    #[test]
    fn point_solution_returns_its_state() {
        let solution = Solution::point(2.0, DVector::from_vec(vec![3.0, 4.0]));
        assert_eq!(solution.at(2.0).expect("point"), vec![3.0, 4.0]);
        assert_eq!(solution.step_count(), 0);
        assert!(solution.at_many(&[]).expect("empty").is_empty());
    }

    #[test]
    fn backward_segments_are_searched_in_reverse() {
        let solution = Solution::from_segments(
            1.0,
            DVector::from_element(1, 0.0),
            vec![linear_segment(1.0, 0.5, 0.0, 1.0), linear_segment(0.5, 0.0, -0.5, 1.0)],
        );
        let y = solution.at(0.25).expect("inside");
        assert!((y[0] + 0.75).abs() < 1e-12);
    }
}
