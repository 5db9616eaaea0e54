//! The simulation engine: owns a model, its current trajectory point and the
//! integrator, and enforces the Ready/Failed state machine.
//!
//! Every mutating operation validates its whole input before writing
//! anything, so a rejected call leaves the engine exactly as it was. A solve
//! is atomic: `t` and the state vector change only after the integration and
//! all requested samples succeeded.

use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};

use ndarray::{ArrayD, IxDyn};
use serde::Serialize;
use tracing::{debug, warn};

use crate::attributes::{Attributes, StateLayout};
use crate::diffvar::{array, scalar, DiffVar, Value};
use crate::error::{EngineError, EngineResult};
use crate::expression::{Bytecode, Compiler};
use crate::method::{MethodArgs, MethodValue};
use crate::model::Model;
use crate::solution::Solution;
use crate::solvers::{SolverError, SolverOptions, SolverOverrides, Tsit5Integrator};
use crate::traits::{DynamicalSystem, Integrator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineStatus {
    Ready,
    Failed,
}

/// Arguments of [`Engine::restart`]. Fields left `None` keep their value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RestartOptions {
    pub t: Option<f64>,
    pub y: Option<Vec<f64>>,
    pub solver: SolverOverrides,
}

/// Values sampled from a solution at output times.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Samples {
    pub t: Vec<f64>,
    /// One series per flat state component.
    pub diffvars: Vec<Vec<f64>>,
    /// One series per watching expression.
    pub watching: Vec<Vec<f64>>,
}

#[derive(Debug, Clone)]
pub struct SolveOutput {
    pub solution: Solution,
    pub samples: Samples,
}

/// Where [`Engine::eval`] evaluates the model.
#[derive(Debug, Clone, Copy)]
pub enum EvalPoint<'a> {
    /// The engine's current `t` and state.
    Current,
    /// An explicit single point.
    At { t: f64, y: &'a [f64] },
    /// Several times on a solution, evaluated as one batch.
    Trajectory {
        times: &'a [f64],
        solution: &'a Solution,
    },
}

/// Read-only view of the model right after `calc_ode` ran at an evaluation
/// point.
pub struct EvalView<'a> {
    t: &'a Value,
    attrs: &'a Attributes,
}

impl<'a> EvalView<'a> {
    pub fn t(&self) -> &Value {
        self.t
    }

    pub fn attrs(&self) -> &Attributes {
        self.attrs
    }

    pub fn var(&self, name: &str) -> Option<&DiffVar> {
        self.attrs.diffvar_by_name(name)
    }

    pub fn expression(&self, source: &str) -> EngineResult<Value> {
        let bytecode = Compiler::new(self.attrs).compile_str(source)?;
        Ok(bytecode.eval(self.t, self.attrs)?)
    }
}

/// Adapts a model to the integrator's right-hand side.
struct ModelSystem<'a> {
    model: &'a dyn Model,
    attrs: &'a mut Attributes,
    layout: &'a StateLayout,
}

impl<'a> DynamicalSystem for ModelSystem<'a> {
    fn dimension(&self) -> usize {
        self.layout.dimension()
    }

    fn apply(&mut self, t: f64, x: &[f64], out: &mut [f64]) -> Result<(), SolverError> {
        self.attrs.load_point(self.layout, x);
        self.model
            .calc_ode(&scalar(t), self.attrs)
            .map_err(SolverError::System)?;
        self.attrs
            .collect_derivatives(self.layout, out)
            .map_err(|err| SolverError::System(err.into()))?;
        if out.iter().any(|d| !d.is_finite()) {
            return Err(SolverError::NonFinite { t });
        }
        Ok(())
    }
}

fn model_error(err: anyhow::Error) -> EngineError {
    match err.downcast::<EngineError>() {
        Ok(engine_err) => engine_err,
        Err(other) => EngineError::Model(other),
    }
}

/// Upper bound on the number of output samples of one solve.
pub const MAX_SAMPLES: usize = 1_000_000;

/// Output times from `t0` to `t1` spaced by `dt`, ending exactly on `t1`.
pub fn sample_times(t0: f64, t1: f64, dt: f64) -> Vec<f64> {
    let span = (t1 - t0).abs();
    if span == 0.0 {
        return vec![t0];
    }
    let dir = if t1 > t0 { 1.0 } else { -1.0 };
    let n = (span / dt + 1e-9).floor() as usize;
    let mut times: Vec<f64> = (0..=n).map(|i| t0 + dir * i as f64 * dt).collect();
    let tol = 1e-9 * dt;
    match times.last_mut() {
        Some(last) if (*last - t1).abs() <= tol || dir * (*last - t1) > 0.0 => *last = t1,
        _ => times.push(t1),
    }
    times
}

pub struct Engine {
    model: Box<dyn Model>,
    attrs: Attributes,
    layout: StateLayout,
    t: f64,
    y: Vec<f64>,
    options: SolverOptions,
    integrator: Box<dyn Integrator>,
    status: EngineStatus,
    watching: Vec<Bytecode>,
}

impl Engine {
    /// Bind `model`: run `initialize_vars` once, freeze the state layout and
    /// seed the state from the declared initial values.
    pub fn new(model: Box<dyn Model>, t0: f64, overrides: &SolverOverrides) -> EngineResult<Self> {
        Self::with_integrator(model, t0, overrides, Box::new(Tsit5Integrator::new()))
    }

    pub fn with_integrator(
        mut model: Box<dyn Model>,
        t0: f64,
        overrides: &SolverOverrides,
        integrator: Box<dyn Integrator>,
    ) -> EngineResult<Self> {
        if !t0.is_finite() {
            return Err(EngineError::InvalidArgument(format!(
                "initial time must be finite, got {t0}"
            )));
        }
        let options = SolverOptions::default().merged(overrides)?;
        let mut attrs = Attributes::new();
        model.initialize_vars(&mut attrs);
        let (layout, y) = attrs.seal()?;
        debug!(
            dimension = layout.dimension(),
            variables = ?layout.names(),
            t0,
            "engine initialized"
        );
        Ok(Self {
            model,
            attrs,
            layout,
            t: t0,
            y,
            options,
            integrator,
            status: EngineStatus::Ready,
            watching: Vec::new(),
        })
    }

    pub fn t(&self) -> f64 {
        self.t
    }

    /// The flat state vector in declaration order.
    pub fn state(&self) -> &[f64] {
        &self.y
    }

    pub fn status(&self) -> EngineStatus {
        self.status
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn watching_vars(&self) -> Vec<&str> {
        self.watching.iter().map(|b| b.source()).collect()
    }

    /// Put the engine into `Failed` after an operation was abandoned midway,
    /// e.g. when model code panicked during a solve.
    pub fn mark_failed(&mut self) {
        self.status = EngineStatus::Failed;
        self.integrator.reset();
    }

    fn require(&self, allowed: &[EngineStatus], operation: &'static str) -> EngineResult<()> {
        if allowed.contains(&self.status) {
            return Ok(());
        }
        let required = if allowed.contains(&EngineStatus::Failed) {
            "ready or failed"
        } else {
            "ready"
        };
        Err(EngineError::InvalidState {
            operation,
            required,
            status: self.status,
        })
    }

    /// Overwrite named differential variables. Either every entry is applied
    /// or none is.
    pub fn set_diffvar_values<I, K>(&mut self, values: I) -> EngineResult<()>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: AsRef<str>,
    {
        self.require(&[EngineStatus::Ready], "set_diffvar_values")?;
        let mut writes = Vec::new();
        for (name, value) in values {
            let name = name.as_ref();
            let slot = self
                .layout
                .slot(name)
                .ok_or_else(|| EngineError::UnknownVariable(name.to_string()))?;
            if value.len() != slot.len {
                return Err(EngineError::ShapeMismatch {
                    name: name.to_string(),
                    expected: slot.shape.clone(),
                    actual: value.shape().to_vec(),
                });
            }
            writes.push((slot.offset, value));
        }
        for (offset, value) in writes {
            for (dst, src) in self.y[offset..].iter_mut().zip(value.iter()) {
                *dst = *src;
            }
        }
        self.integrator.reset();
        Ok(())
    }

    /// Current values by name, in declaration order, with declared shapes.
    pub fn get_diffvar_values(&self) -> EngineResult<Vec<(String, Value)>> {
        self.require(&[EngineStatus::Ready, EngineStatus::Failed], "get_diffvar_values")?;
        self.layout
            .slots()
            .iter()
            .map(|slot| -> EngineResult<(String, Value)> {
                let data = self.y[slot.offset..slot.offset + slot.len].to_vec();
                let value = if slot.shape.is_empty() {
                    scalar(data[0])
                } else {
                    ArrayD::from_shape_vec(IxDyn(&slot.shape), data).map_err(|_| {
                        EngineError::ShapeMismatch {
                            name: slot.name.clone(),
                            expected: slot.shape.clone(),
                            actual: vec![slot.len],
                        }
                    })?
                };
                Ok((slot.name.clone(), value))
            })
            .collect()
    }

    pub fn get_diffvar_names(&self) -> Vec<String> {
        self.layout.names()
    }

    /// Replace the list of expressions sampled alongside each solve.
    ///
    /// Each expression is compiled and evaluated once at the current point;
    /// the list is replaced only if all of them succeed.
    pub fn set_watching_vars<S: AsRef<str>>(&mut self, sources: &[S]) -> EngineResult<()> {
        self.require(&[EngineStatus::Ready], "set_watching_vars")?;
        let compiled = self.compile_all(sources)?;
        let first = self.run_compiled(&compiled, EvalPoint::Current)?;
        debug!(count = first.len(), "watching variables set");
        self.watching = compiled;
        Ok(())
    }

    fn compile_all<S: AsRef<str>>(&self, sources: &[S]) -> EngineResult<Vec<Bytecode>> {
        let compiler = Compiler::new(&self.attrs);
        sources
            .iter()
            .map(|s| compiler.compile_str(s.as_ref()).map_err(EngineError::from))
            .collect()
    }

    /// Integrate from the current `t` to `t_target`.
    ///
    /// With `output_interval`, the returned samples hold the state and the
    /// watching expressions at evenly spaced times from the previous `t` to
    /// `t_target` inclusive; without it, at `t_target` only. On failure the
    /// engine becomes `Failed` and keeps its previous `t` and state.
    pub fn solve_ivp(
        &mut self,
        t_target: f64,
        output_interval: Option<f64>,
    ) -> EngineResult<SolveOutput> {
        self.require(&[EngineStatus::Ready], "solve_ivp")?;
        if !t_target.is_finite() {
            return Err(EngineError::InvalidArgument(format!(
                "target time must be finite, got {t_target}"
            )));
        }
        if let Some(dt) = output_interval {
            if !dt.is_finite() || dt <= 0.0 {
                return Err(EngineError::InvalidArgument(format!(
                    "output interval must be finite and positive, got {dt}"
                )));
            }
            let count = (t_target - self.t).abs() / dt + 2.0;
            if !(count <= MAX_SAMPLES as f64) {
                return Err(EngineError::InvalidArgument(format!(
                    "output interval {dt} over [{}, {t_target}] exceeds {MAX_SAMPLES} samples",
                    self.t
                )));
            }
        }

        let t0 = self.t;
        match self.try_solve(t_target, output_interval) {
            Ok(output) => {
                self.t = t_target;
                self.y = output.solution.end_state();
                debug!(
                    t0,
                    t = t_target,
                    steps = output.solution.step_count(),
                    "solve finished"
                );
                Ok(output)
            }
            Err(err) => {
                self.status = EngineStatus::Failed;
                self.integrator.reset();
                warn!(t0, t_target, error = %err, "solve failed");
                Err(err)
            }
        }
    }

    fn try_solve(&mut self, t_target: f64, output_interval: Option<f64>) -> EngineResult<SolveOutput> {
        let mut system = ModelSystem {
            model: self.model.as_ref(),
            attrs: &mut self.attrs,
            layout: &self.layout,
        };
        let solution =
            self.integrator
                .integrate(&mut system, self.t, &self.y, t_target, &self.options)?;

        let times = match output_interval {
            Some(dt) => sample_times(self.t, t_target, dt),
            None => vec![t_target],
        };
        let samples = self.sample(&solution, &times)?;
        Ok(SolveOutput { solution, samples })
    }

    /// Sample state components and watching expressions at `times`.
    pub fn sample(&mut self, solution: &Solution, times: &[f64]) -> EngineResult<Samples> {
        let states = solution.at_many(times)?;
        let diffvars = (0..self.layout.dimension())
            .map(|j| states.iter().map(|y| y[j]).collect())
            .collect();
        let watching = std::mem::take(&mut self.watching);
        let result = self.run_compiled(&watching, EvalPoint::Trajectory { times, solution });
        self.watching = watching;
        Ok(Samples {
            t: times.to_vec(),
            diffvars,
            watching: result?,
        })
    }

    /// Run `calc_ode` at `point` and hand the resulting model view to `f`.
    ///
    /// A trajectory is evaluated in one call with a batch axis over all
    /// times; variables then have shape `shape ++ [N]` and `t` has shape
    /// `[N]`.
    pub fn eval<R>(
        &mut self,
        point: EvalPoint<'_>,
        f: impl FnOnce(&EvalView<'_>) -> R,
    ) -> EngineResult<R> {
        self.require(&[EngineStatus::Ready, EngineStatus::Failed], "eval")?;
        let t = match point {
            EvalPoint::Current => {
                self.attrs.load_point(&self.layout, &self.y);
                scalar(self.t)
            }
            EvalPoint::At { t, y } => {
                if y.len() != self.layout.dimension() {
                    return Err(EngineError::ShapeMismatch {
                        name: "state vector".to_string(),
                        expected: vec![self.layout.dimension()],
                        actual: vec![y.len()],
                    });
                }
                self.attrs.load_point(&self.layout, y);
                scalar(t)
            }
            EvalPoint::Trajectory { times, solution } => {
                if solution.dimension() != self.layout.dimension() {
                    return Err(EngineError::ShapeMismatch {
                        name: "solution".to_string(),
                        expected: vec![self.layout.dimension()],
                        actual: vec![solution.dimension()],
                    });
                }
                let states = solution.at_many(times)?;
                self.attrs.load_batch(&self.layout, &states);
                array(times)
            }
        };
        self.model
            .calc_ode(&t, &mut self.attrs)
            .map_err(model_error)?;
        Ok(f(&EvalView {
            t: &t,
            attrs: &self.attrs,
        }))
    }

    /// Evaluate named expressions at `point`, each flattened to a series.
    ///
    /// On a trajectory of N times a result that does not depend on the batch
    /// is repeated N times. An empty trajectory yields empty series without
    /// running the model.
    pub fn eval_expressions<S: AsRef<str>>(
        &mut self,
        sources: &[S],
        point: EvalPoint<'_>,
    ) -> EngineResult<Vec<Vec<f64>>> {
        self.require(&[EngineStatus::Ready, EngineStatus::Failed], "eval")?;
        let compiled = self.compile_all(sources)?;
        self.run_compiled(&compiled, point)
    }

    fn run_compiled(
        &mut self,
        compiled: &[Bytecode],
        point: EvalPoint<'_>,
    ) -> EngineResult<Vec<Vec<f64>>> {
        let batch = match point {
            EvalPoint::Trajectory { times, .. } => Some(times.len()),
            _ => None,
        };
        if compiled.is_empty() || batch == Some(0) {
            return Ok(vec![Vec::new(); compiled.len()]);
        }
        let results = self.eval(point, |view| {
            compiled
                .iter()
                .map(|bytecode| bytecode.eval(view.t(), view.attrs()))
                .collect::<Result<Vec<_>, _>>()
        })??;
        Ok(results
            .into_iter()
            .map(|value| match batch {
                Some(n) if value.ndim() == 0 => vec![value.iter().copied().next().unwrap_or(f64::NAN); n],
                _ => value.iter().copied().collect(),
            })
            .collect())
    }

    /// Restart integration, optionally from a new `t` and state and with new
    /// solver options. Invalid input is rejected without changing anything;
    /// otherwise the engine is `Ready` afterwards.
    pub fn restart(&mut self, options: RestartOptions) -> EngineResult<()> {
        self.require(&[EngineStatus::Ready, EngineStatus::Failed], "restart")?;
        if let Some(t) = options.t {
            if !t.is_finite() {
                return Err(EngineError::InvalidArgument(format!(
                    "restart time must be finite, got {t}"
                )));
            }
        }
        if let Some(y) = &options.y {
            if y.len() != self.layout.dimension() {
                return Err(EngineError::ShapeMismatch {
                    name: "state vector".to_string(),
                    expected: vec![self.layout.dimension()],
                    actual: vec![y.len()],
                });
            }
            if y.iter().any(|v| !v.is_finite()) {
                return Err(EngineError::InvalidArgument(
                    "restart state must be finite".to_string(),
                ));
            }
        }
        let merged = self.options.merged(&options.solver)?;

        if let Some(t) = options.t {
            self.t = t;
        }
        if let Some(y) = options.y {
            self.y = y;
        }
        self.options = merged;
        self.integrator.reset();
        self.status = EngineStatus::Ready;
        debug!(t = self.t, "engine restarted");
        Ok(())
    }

    /// Overwrite named constants. Either every entry is applied or none is.
    pub fn set_constants<I, K>(&mut self, values: I) -> EngineResult<()>
    where
        I: IntoIterator<Item = (K, f64)>,
        K: AsRef<str>,
    {
        self.require(&[EngineStatus::Ready, EngineStatus::Failed], "set_constants")?;
        let values: Vec<(K, f64)> = values.into_iter().collect();
        for (name, _) in &values {
            if self.attrs.constant_by_name(name.as_ref()).is_none() {
                return Err(EngineError::UnknownConstant(name.as_ref().to_string()));
            }
        }
        for (name, value) in &values {
            self.attrs.set_constant(name.as_ref(), *value)?;
        }
        self.integrator.reset();
        Ok(())
    }

    /// Invoke a named model method. Constants changed by a failing or
    /// panicking method are rolled back; a panic is then resumed.
    pub fn call_method(&mut self, name: &str, args: &MethodArgs) -> EngineResult<Vec<MethodValue>> {
        self.require(&[EngineStatus::Ready, EngineStatus::Failed], "call_method")?;
        let snapshot = self.attrs.constants_snapshot();
        let result = catch_unwind(AssertUnwindSafe(|| {
            self.model.call_method(name, args, &mut self.attrs)
        }));
        self.integrator.reset();
        match result {
            Ok(Ok(values)) => Ok(values),
            Ok(Err(err)) => {
                self.attrs.restore_constants(snapshot);
                Err(model_error(err))
            }
            Err(payload) => {
                self.attrs.restore_constants(snapshot);
                resume_unwind(payload)
            }
        }
    }
}
