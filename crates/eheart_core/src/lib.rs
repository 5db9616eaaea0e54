pub mod attributes;
pub mod diffvar;
pub mod engine;
pub mod error;
pub mod expression;
pub mod method;
pub mod model;
pub mod models;
pub mod registry;
pub mod solution;
pub mod solvers;
/// The `eheart_core` crate provides the simulation engine behind the e-Heart
/// server. A model describes a system of ODEs through one declaration method
/// and one right-hand-side method; the engine drives it through time.
///
/// Key components:
/// - **Attributes / DiffVar**: explicit declaration registry and array-valued differential variables.
/// - **Model**: the user contract (`initialize_vars`, `calc_ode`, `call_method`).
/// - **Engine**: Ready/Failed state machine with atomic solves, restarts and dense-output evaluation.
/// - **Solvers**: adaptive Tsit5 integrator with continuous extension, plus RK4.
/// - **Expression**: bytecode VM for watching variables and ad-hoc queries.
pub mod traits;
