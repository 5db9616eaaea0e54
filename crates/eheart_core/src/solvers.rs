use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::solution::{Segment, Solution};
use crate::traits::{DynamicalSystem, Integrator, Steppable};

#[derive(Error, Debug)]
pub enum SolverError {
    #[error("Invalid solver option: {0}")]
    InvalidOption(String),

    #[error("State dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Invalid integration interval: {0}")]
    InvalidInterval(String),

    #[error("Step size {step:e} at t = {t} fell below the minimum step size {min_step:e}")]
    StepSizeTooSmall { t: f64, step: f64, min_step: f64 },

    #[error("Exceeded {max_steps} steps at t = {t} before reaching t = {t_end}")]
    MaxStepsExceeded { max_steps: usize, t: f64, t_end: f64 },

    #[error("Non-finite derivative at t = {t}")]
    NonFinite { t: f64 },

    #[error(transparent)]
    System(anyhow::Error),
}

/// Integrator configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SolverOptions {
    /// Initial step size; chosen automatically when `None`.
    pub init_step: Option<f64>,
    pub min_step: f64,
    pub max_step: f64,
    pub rtol: f64,
    pub atol: f64,
    pub max_steps: usize,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            init_step: None,
            min_step: 0.0,
            max_step: f64::INFINITY,
            rtol: 1e-6,
            atol: 1e-10,
            max_steps: 100_000,
        }
    }
}

impl SolverOptions {
    pub fn validate(&self) -> Result<(), SolverError> {
        if let Some(h) = self.init_step {
            if !h.is_finite() || h <= 0.0 {
                return Err(SolverError::InvalidOption(
                    "init_step must be finite and positive".to_string(),
                ));
            }
        }
        if !self.min_step.is_finite() || self.min_step < 0.0 {
            return Err(SolverError::InvalidOption(
                "min_step must be finite and non-negative".to_string(),
            ));
        }
        if self.max_step.is_nan() || self.max_step <= 0.0 || self.max_step < self.min_step {
            return Err(SolverError::InvalidOption(
                "max_step must be positive and not below min_step".to_string(),
            ));
        }
        if !self.rtol.is_finite() || self.rtol <= 0.0 {
            return Err(SolverError::InvalidOption(
                "rtol must be finite and positive".to_string(),
            ));
        }
        if !self.atol.is_finite() || self.atol <= 0.0 {
            return Err(SolverError::InvalidOption(
                "atol must be finite and positive".to_string(),
            ));
        }
        if self.max_steps == 0 {
            return Err(SolverError::InvalidOption(
                "max_steps must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Apply overrides; keys that are not overridden keep their value.
    pub fn merged(&self, overrides: &SolverOverrides) -> Result<Self, SolverError> {
        let merged = Self {
            init_step: overrides.init_step.or(self.init_step),
            min_step: overrides.min_step.unwrap_or(self.min_step),
            max_step: overrides.max_step.unwrap_or(self.max_step),
            rtol: overrides.rtol.unwrap_or(self.rtol),
            atol: overrides.atol.unwrap_or(self.atol),
            max_steps: overrides.max_steps.unwrap_or(self.max_steps),
        };
        merged.validate()?;
        Ok(merged)
    }
}

/// Partial update of [`SolverOptions`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SolverOverrides {
    pub init_step: Option<f64>,
    pub min_step: Option<f64>,
    pub max_step: Option<f64>,
    pub rtol: Option<f64>,
    pub atol: Option<f64>,
    pub max_steps: Option<usize>,
}

impl SolverOverrides {
    /// Build from named numeric options as they arrive over the wire.
    pub fn from_entries<'a>(
        entries: impl IntoIterator<Item = (&'a str, f64)>,
    ) -> Result<Self, SolverError> {
        let mut overrides = Self::default();
        for (key, value) in entries {
            match key {
                "init_step" => overrides.init_step = Some(value),
                "min_step" => overrides.min_step = Some(value),
                "max_step" => overrides.max_step = Some(value),
                "rtol" => overrides.rtol = Some(value),
                "atol" => overrides.atol = Some(value),
                "max_steps" => {
                    if !value.is_finite() || value < 1.0 || value.fract() != 0.0 {
                        return Err(SolverError::InvalidOption(format!(
                            "max_steps must be a positive integer, got {value}"
                        )));
                    }
                    overrides.max_steps = Some(value as usize);
                }
                other => {
                    return Err(SolverError::InvalidOption(format!(
                        "unknown option `{other}`"
                    )))
                }
            }
        }
        Ok(overrides)
    }
}

/// Classic Runge-Kutta 4th Order Solver
pub struct RK4 {
    k1: Vec<f64>,
    k2: Vec<f64>,
    k3: Vec<f64>,
    k4: Vec<f64>,
    tmp: Vec<f64>,
}

impl RK4 {
    pub fn new(dim: usize) -> Self {
        Self {
            k1: vec![0.0; dim],
            k2: vec![0.0; dim],
            k3: vec![0.0; dim],
            k4: vec![0.0; dim],
            tmp: vec![0.0; dim],
        }
    }
}

impl Steppable for RK4 {
    fn step(
        &mut self,
        system: &mut impl DynamicalSystem,
        t: &mut f64,
        state: &mut [f64],
        dt: f64,
    ) -> Result<(), SolverError> {
        let t0 = *t;

        // k1 = f(t, y)
        system.apply(t0, state, &mut self.k1)?;

        // k2 = f(t + dt/2, y + dt*k1/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k1[i] * 0.5;
        }
        system.apply(t0 + dt * 0.5, &self.tmp, &mut self.k2)?;

        // k3 = f(t + dt/2, y + dt*k2/2)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k2[i] * 0.5;
        }
        system.apply(t0 + dt * 0.5, &self.tmp, &mut self.k3)?;

        // k4 = f(t + dt, y + dt*k3)
        for i in 0..state.len() {
            self.tmp[i] = state[i] + dt * self.k3[i];
        }
        system.apply(t0 + dt, &self.tmp, &mut self.k4)?;

        // y_next = y + dt/6 * (k1 + 2k2 + 2k3 + k4)
        for i in 0..state.len() {
            state[i] +=
                dt / 6.0 * (self.k1[i] + 2.0 * self.k2[i] + 2.0 * self.k3[i] + self.k4[i]);
        }

        *t = t0 + dt;
        Ok(())
    }
}

// Tsitouras 5(4) tableau.
const C: [f64; 6] = [0.161, 0.327, 0.9, 0.9800255409045097, 1.0, 1.0];

const A: [&[f64]; 6] = [
    &[0.161],
    &[-0.008480655492356989, 0.335480655492357],
    &[2.898, -6.359447987781783, 4.361447987781783],
    &[
        5.325864858437957,
        -11.748883564062828,
        7.495539342889693,
        -0.09249506636030195,
    ],
    &[
        5.86145544294642,
        -12.92096931784711,
        8.159367898576159,
        -0.071584973281401,
        -0.02826857949054663,
    ],
    &[
        0.09646076681806523,
        0.01,
        0.4798896504144996,
        1.379008574103742,
        -3.290069515436099,
        2.324710524099774,
    ],
];

// Difference between the 5th and embedded 4th order weights.
const BTILDE: [f64; 7] = [
    -0.00178001105222577714,
    -0.0008164344596567469,
    0.007880878010261995,
    -0.1447110071732629,
    0.5823571654525552,
    -0.45808210592918697,
    1.0 / 66.0,
];

// Continuous extension: b_i(θ) = r_i1 θ + r_i2 θ² + r_i3 θ³ + r_i4 θ⁴.
const R: [[f64; 4]; 7] = [
    [1.0, -2.763706197274826, 2.9132554618219126, -1.0530884977290216],
    [0.0, 0.13169999999999998, -0.2234, 0.1017],
    [0.0, 3.9302962368947516, -5.941033872131505, 2.490627285651253],
    [0.0, -12.411077166933676, 30.33818863028232, -16.548102889244902],
    [0.0, 37.50931341651104, -88.1789048947664, 47.37952196281928],
    [0.0, -27.896526289197286, 65.09189467479366, -34.87065786149661],
    [0.0, 1.5, -4.0, 2.5],
];

/// Interpolation weights for `θ ∈ [0, 1]` inside one Tsit5 step.
pub(crate) fn tsit5_interpolation_weights(theta: f64) -> [f64; 7] {
    let mut w = [0.0; 7];
    for (wi, r) in w.iter_mut().zip(R.iter()) {
        *wi = theta * (r[0] + theta * (r[1] + theta * (r[2] + theta * r[3])));
    }
    w
}

const SAFETY: f64 = 0.9;
const MIN_FACTOR: f64 = 0.2;
const MAX_FACTOR: f64 = 10.0;

struct Carry {
    t: f64,
    y: DVector<f64>,
    f: DVector<f64>,
    h: f64,
}

/// Adaptive Tsitouras 5(4) integrator with dense output.
///
/// Between calls it remembers where it stopped, the derivative there and the
/// last accepted step size; a call that starts from exactly that point reuses
/// them.
#[derive(Default)]
pub struct Tsit5Integrator {
    carry: Option<Carry>,
}

impl Tsit5Integrator {
    pub fn new() -> Self {
        Self::default()
    }

    fn rhs(
        system: &mut dyn DynamicalSystem,
        t: f64,
        y: &DVector<f64>,
    ) -> Result<DVector<f64>, SolverError> {
        let mut out = DVector::zeros(y.len());
        system.apply(t, y.as_slice(), out.as_mut_slice())?;
        Ok(out)
    }

    /// One trial step of signed size `h`. Returns the new state, the seven
    /// stage derivatives (the last is f at the new state) and the error
    /// estimate.
    fn attempt(
        system: &mut dyn DynamicalSystem,
        t: f64,
        y: &DVector<f64>,
        f: &DVector<f64>,
        h: f64,
    ) -> Result<(DVector<f64>, Vec<DVector<f64>>, DVector<f64>), SolverError> {
        let mut k = Vec::with_capacity(7);
        k.push(f.clone());
        for (stage, row) in A.iter().enumerate() {
            let mut tmp = y.clone();
            for (a, ki) in row.iter().zip(&k) {
                tmp.axpy(h * a, ki, 1.0);
            }
            if stage == A.len() - 1 {
                let f_new = Self::rhs(system, t + h, &tmp)?;
                k.push(f_new);
                let mut err = DVector::zeros(y.len());
                for (bt, ki) in BTILDE.iter().zip(&k) {
                    err.axpy(h * bt, ki, 1.0);
                }
                return Ok((tmp, k, err));
            }
            let next = Self::rhs(system, t + C[stage] * h, &tmp)?;
            k.push(next);
        }
        unreachable!("tableau always ends with the solution row")
    }

    fn error_norm(err: &DVector<f64>, y: &DVector<f64>, y_new: &DVector<f64>, options: &SolverOptions) -> f64 {
        let n = err.len().max(1) as f64;
        let sum: f64 = err
            .iter()
            .zip(y.iter().zip(y_new.iter()))
            .map(|(e, (a, b))| {
                let scale = options.atol + options.rtol * a.abs().max(b.abs());
                (e / scale).powi(2)
            })
            .sum();
        (sum / n).sqrt()
    }

    fn rms_scaled(v: &DVector<f64>, y: &DVector<f64>, options: &SolverOptions) -> f64 {
        let n = v.len().max(1) as f64;
        let sum: f64 = v
            .iter()
            .zip(y.iter())
            .map(|(x, yi)| (x / (options.atol + options.rtol * yi.abs())).powi(2))
            .sum();
        (sum / n).sqrt()
    }

    /// Starting step size estimate (Hairer, Nørsett & Wanner, II.4).
    fn initial_step(
        system: &mut dyn DynamicalSystem,
        t0: f64,
        y0: &DVector<f64>,
        f0: &DVector<f64>,
        dir: f64,
        span: f64,
        options: &SolverOptions,
    ) -> Result<f64, SolverError> {
        let d0 = Self::rms_scaled(y0, y0, options);
        let d1 = Self::rms_scaled(f0, y0, options);
        let h0 = if d0 < 1e-5 || d1 < 1e-5 {
            1e-6
        } else {
            0.01 * d0 / d1
        }
        .min(span);

        let mut y1 = y0.clone();
        y1.axpy(dir * h0, f0, 1.0);
        let f1 = Self::rhs(system, t0 + dir * h0, &y1)?;
        let d2 = Self::rms_scaled(&(f1 - f0), y0, options) / h0;

        let dmax = d1.max(d2);
        let h1 = if dmax <= 1e-15 {
            (h0 * 1e-3).max(1e-6)
        } else {
            (0.01 / dmax).powf(1.0 / 5.0)
        };
        Ok((100.0 * h0).min(h1).min(span).min(options.max_step))
    }
}

fn all_finite(v: &DVector<f64>) -> bool {
    v.iter().all(|x| x.is_finite())
}

impl Integrator for Tsit5Integrator {
    fn integrate(
        &mut self,
        system: &mut dyn DynamicalSystem,
        t0: f64,
        y0: &[f64],
        t_end: f64,
        options: &SolverOptions,
    ) -> Result<Solution, SolverError> {
        options.validate()?;
        let dim = system.dimension();
        if y0.len() != dim {
            return Err(SolverError::DimensionMismatch {
                expected: dim,
                actual: y0.len(),
            });
        }
        if !t0.is_finite() || !t_end.is_finite() {
            return Err(SolverError::InvalidInterval(format!(
                "cannot integrate from {t0} to {t_end}"
            )));
        }

        let y_start = DVector::from_column_slice(y0);
        if t_end == t0 {
            return Ok(Solution::point(t0, y_start));
        }
        let dir = if t_end > t0 { 1.0 } else { -1.0 };
        let span = (t_end - t0).abs();

        let (mut f, carried_h) = match self.carry.take() {
            Some(carry) if carry.t == t0 && carry.y == y_start && carry.h * dir > 0.0 => {
                (carry.f, Some(carry.h.abs()))
            }
            _ => (Self::rhs(system, t0, &y_start)?, None),
        };
        if !all_finite(&f) {
            return Err(SolverError::NonFinite { t: t0 });
        }

        let mut h = match carried_h.or(options.init_step) {
            Some(h) => h,
            None => Self::initial_step(system, t0, &y_start, &f, dir, span, options)?,
        };
        h = h.min(options.max_step).max(options.min_step);

        let mut t = t0;
        let mut y = y_start.clone();
        let mut segments = Vec::new();
        let mut steps = 0usize;

        while t != t_end {
            if steps >= options.max_steps {
                return Err(SolverError::MaxStepsExceeded {
                    max_steps: options.max_steps,
                    t,
                    t_end,
                });
            }
            steps += 1;

            let remaining = (t_end - t).abs();
            let last = h >= remaining;
            let h_try = if last { remaining } else { h };

            let (y_new, k, err) = Self::attempt(system, t, &y, &f, dir * h_try)?;
            let err_norm = if all_finite(&y_new) && all_finite(&k[6]) {
                Self::error_norm(&err, &y, &y_new, options)
            } else {
                f64::INFINITY
            };

            if err_norm <= 1.0 {
                let t_new = if last { t_end } else { t + dir * h_try };
                let factor = if err_norm == 0.0 {
                    MAX_FACTOR
                } else {
                    (SAFETY * err_norm.powf(-1.0 / 5.0)).clamp(MIN_FACTOR, MAX_FACTOR)
                };
                let h_next = (h_try * factor).min(options.max_step);
                // A step shortened to hit t_end says little about the next one.
                h = if last { h.max(h_next) } else { h_next };

                f = k[6].clone();
                segments.push(Segment {
                    t0: t,
                    t1: t_new,
                    y0: y.clone(),
                    y1: y_new.clone(),
                    k,
                });
                t = t_new;
                y = y_new;
            } else {
                let factor = if err_norm.is_finite() {
                    (SAFETY * err_norm.powf(-1.0 / 5.0)).max(MIN_FACTOR)
                } else {
                    MIN_FACTOR
                };
                h = h_try * factor;
                let floor = 4.0 * f64::EPSILON * t.abs().max(1.0);
                if h < options.min_step || h < floor {
                    return Err(SolverError::StepSizeTooSmall {
                        t,
                        step: h,
                        min_step: options.min_step,
                    });
                }
            }
        }

        self.carry = Some(Carry {
            t,
            y: y.clone(),
            f,
            h: dir * h,
        });
        Ok(Solution::from_segments(t0, y_start, segments))
    }

    fn reset(&mut self) {
        self.carry = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Decay {
        rate: f64,
        calls: usize,
    }

    impl DynamicalSystem for Decay {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&mut self, _t: f64, x: &[f64], out: &mut [f64]) -> Result<(), SolverError> {
            self.calls += 1;
            out[0] = -self.rate * x[0];
            Ok(())
        }
    }

    struct Oscillator;

    impl DynamicalSystem for Oscillator {
        fn dimension(&self) -> usize {
            2
        }

        fn apply(&mut self, _t: f64, x: &[f64], out: &mut [f64]) -> Result<(), SolverError> {
            out[0] = x[1];
            out[1] = -x[0];
            Ok(())
        }
    }

    struct Blowup;

    impl DynamicalSystem for Blowup {
        fn dimension(&self) -> usize {
            1
        }

        fn apply(&mut self, _t: f64, x: &[f64], out: &mut [f64]) -> Result<(), SolverError> {
            out[0] = x[0] * x[0];
            Ok(())
        }
    }

    fn assert_err_contains<T: std::fmt::Debug>(result: Result<T, SolverError>, needle: &str) {
        let err = result.expect_err("expected error");
        let message = format!("{err}");
        assert!(
            message.contains(needle),
            "expected error to contain \"{needle}\", got \"{message}\""
        );
    }

    #[test]
    fn rk4_step_advances_state_and_time() {
        let mut system = Decay { rate: 1.0, calls: 0 };
        let mut stepper = RK4::new(1);
        let mut t = 0.0;
        let mut state = [1.0];
        for _ in 0..10 {
            stepper.step(&mut system, &mut t, &mut state, 0.1).expect("step");
        }
        assert!((t - 1.0).abs() < 1e-12);
        assert!((state[0] - (-1.0f64).exp()).abs() < 1e-6);
        assert_eq!(system.calls, 40);
    }

    #[test]
    fn tsit5_matches_exponential_decay() {
        let mut system = Decay { rate: 1.0, calls: 0 };
        let mut integrator = Tsit5Integrator::new();
        let solution = integrator
            .integrate(&mut system, 0.0, &[10.0], 1.0, &SolverOptions::default())
            .expect("integrate");
        let end = solution.end_state()[0];
        let expected = 10.0 * (-1.0f64).exp();
        assert!((end - expected).abs() < expected * 1e-5);

        for &t in &[0.1, 0.35, 0.5, 0.9] {
            let y = solution.at(t).expect("dense output")[0];
            let exact = 10.0 * (-t).exp();
            assert!((y - exact).abs() < exact * 1e-5, "t = {t}: {y} vs {exact}");
        }
    }

    #[test]
    fn tsit5_integrates_backwards() {
        let mut system = Decay { rate: 1.0, calls: 0 };
        let mut integrator = Tsit5Integrator::new();
        let solution = integrator
            .integrate(&mut system, 1.0, &[1.0], 0.0, &SolverOptions::default())
            .expect("integrate");
        assert_eq!(solution.t_span(), (1.0, 0.0));
        let y = solution.end_state()[0];
        assert!((y - 1.0f64.exp()).abs() < 1.0f64.exp() * 1e-5);
    }

    #[test]
    fn tsit5_keeps_oscillator_on_circle() {
        let mut integrator = Tsit5Integrator::new();
        let solution = integrator
            .integrate(
                &mut Oscillator,
                0.0,
                &[1.0, 0.0],
                2.0 * std::f64::consts::PI,
                &SolverOptions::default(),
            )
            .expect("integrate");
        let y = solution.end_state();
        assert!((y[0] - 1.0).abs() < 1e-4);
        assert!(y[1].abs() < 1e-4);
    }

    #[test]
    fn continuing_from_the_end_reuses_the_last_derivative() {
        let mut system = Decay { rate: 1.0, calls: 0 };
        let mut integrator = Tsit5Integrator::new();
        let options = SolverOptions::default();
        let first = integrator
            .integrate(&mut system, 0.0, &[1.0], 1.0, &options)
            .expect("first");
        let calls_after_first = system.calls;
        let second = integrator
            .integrate(&mut system, 1.0, &first.end_state(), 2.0, &options)
            .expect("second");
        // Each attempt costs six evaluations once k1 is carried over; a fresh
        // start would add one for f(t0) and one for the step size estimate.
        let spent = system.calls - calls_after_first;
        assert_eq!(spent % 6, 0, "spent {spent} evaluations");
        assert!(spent >= 6 * second.step_count());
    }

    #[test]
    fn finite_time_blowup_fails() {
        let mut integrator = Tsit5Integrator::new();
        let options = SolverOptions {
            max_steps: 10_000,
            ..SolverOptions::default()
        };
        let result = integrator.integrate(&mut Blowup, 0.0, &[1.0], 2.0, &options);
        assert!(result.is_err(), "y' = y^2 from y(0) = 1 blows up at t = 1");
    }

    #[test]
    fn min_step_bounds_step_rejection() {
        let mut integrator = Tsit5Integrator::new();
        let options = SolverOptions {
            init_step: Some(1.0),
            min_step: 0.5,
            max_step: 1.0,
            ..SolverOptions::default()
        };
        let mut system = Decay { rate: 50.0, calls: 0 };
        assert_err_contains(
            integrator.integrate(&mut system, 0.0, &[1.0], 10.0, &options),
            "fell below the minimum step size",
        );
    }

    #[test]
    fn max_steps_is_enforced() {
        let mut integrator = Tsit5Integrator::new();
        let options = SolverOptions {
            max_step: 0.01,
            max_steps: 5,
            ..SolverOptions::default()
        };
        let mut system = Decay { rate: 1.0, calls: 0 };
        assert_err_contains(
            integrator.integrate(&mut system, 0.0, &[1.0], 1.0, &options),
            "Exceeded 5 steps",
        );
    }

    #[test]
    fn options_validate_and_merge() {
        let options = SolverOptions::default();
        let overrides =
            SolverOverrides::from_entries([("init_step", 0.1), ("max_step", 1.0), ("max_steps", 50.0)])
                .expect("known keys");
        let merged = options.merged(&overrides).expect("valid");
        assert_eq!(merged.init_step, Some(0.1));
        assert_eq!(merged.max_step, 1.0);
        assert_eq!(merged.max_steps, 50);
        assert_eq!(merged.rtol, options.rtol);

        assert_err_contains(SolverOverrides::from_entries([("tolerance", 1.0)]), "unknown option");
        assert_err_contains(SolverOverrides::from_entries([("max_steps", 2.5)]), "positive integer");
        let bad = SolverOverrides {
            min_step: Some(2.0),
            max_step: Some(1.0),
            ..SolverOverrides::default()
        };
        assert_err_contains(options.merged(&bad), "max_step");
    }

    #[test]
    fn dimension_mismatch_is_reported() {
        let mut integrator = Tsit5Integrator::new();
        assert_err_contains(
            integrator.integrate(&mut Oscillator, 0.0, &[1.0], 1.0, &SolverOptions::default()),
            "dimension mismatch",
        );
    }
}
