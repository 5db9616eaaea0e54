use crate::solution::Solution;
use crate::solvers::{SolverError, SolverOptions};

/// Right-hand side of an ODE system `dy/dt = f(t, y)`.
pub trait DynamicalSystem {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// t: current time
    /// x: current state
    /// out: buffer to write dx/dt
    fn apply(&mut self, t: f64, x: &[f64], out: &mut [f64]) -> Result<(), SolverError>;
}

/// A trait for fixed-step solvers that can step a system forward.
pub trait Steppable {
    /// Performs one step of size dt.
    /// t: current time (updated after step)
    /// state: current state (updated after step)
    fn step(
        &mut self,
        system: &mut impl DynamicalSystem,
        t: &mut f64,
        state: &mut [f64],
        dt: f64,
    ) -> Result<(), SolverError>;
}

/// The integration capability the engine drives.
///
/// Given a start point, a right-hand side and a target time, produce a
/// continuous solution over `[t0, t_end]` (or `[t_end, t0]` backwards).
/// Implementations may keep bookkeeping between calls to continue where the
/// previous call stopped; `reset` discards it.
pub trait Integrator: Send {
    fn integrate(
        &mut self,
        system: &mut dyn DynamicalSystem,
        t0: f64,
        y0: &[f64],
        t_end: f64,
        options: &SolverOptions,
    ) -> Result<Solution, SolverError>;

    fn reset(&mut self);
}
