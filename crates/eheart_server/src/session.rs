//! One session per connection: decodes requests, drives the bound engine and
//! turns every outcome into a response.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use eheart_core::diffvar::{array, scalar};
use eheart_core::engine::{Engine, EvalPoint, RestartOptions};
use eheart_core::error::EngineError;
use eheart_core::method::MethodArgs;
use eheart_core::registry::ModelRegistry;
use eheart_core::solution::Solution;
use eheart_core::solvers::{SolverError, SolverOverrides};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::protocol::{
    CallModelMethodParam, ChangeTimeParam, Command, EvalModelVarParam, GenericScalarOrArray,
    InitParam, NumberOrArray, ProtocolError, Request, Response, SetDiffvarValParam,
    SetModelConstParam, SetWatchingVarParam, SolveIVPParam,
};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("{0} requires the engine to be initialized; send INIT first")]
    NotInitialized(Command),

    #[error("INIT was already processed on this session")]
    AlreadyInitialized,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl From<SolverError> for SessionError {
    fn from(err: SolverError) -> Self {
        SessionError::Engine(err.into())
    }
}

type SessionResult<T> = Result<T, SessionError>;

pub struct Session {
    registry: Arc<ModelRegistry>,
    engine: Option<Engine>,
    /// Trajectory of the latest solve, for `t`-only EVAL_MODEL_VAR. Dropped
    /// whenever the state is moved off that trajectory.
    last_solution: Option<Solution>,
}

impl Session {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            engine: None,
            last_solution: None,
        }
    }

    pub fn engine(&self) -> Option<&Engine> {
        self.engine.as_ref()
    }

    /// Decode one line of text and process it. Undecodable input is answered
    /// with a failure status like any other error.
    pub fn process_line(&mut self, line: &str) -> Response {
        match Request::from_json(line) {
            Ok(request) => self.process(request),
            Err(err) => {
                error!(error = %err, "undecodable request");
                Response::failure(err.to_string())
            }
        }
    }

    /// Process one request to completion. Never fails and never panics: every
    /// error, including a panic in model code, becomes a failure status.
    pub fn process(&mut self, request: Request) -> Response {
        let command = request.command;
        info!(%command, "request received");
        debug!(%command, parameter = %request.parameter, "request parameter");

        let outcome = catch_unwind(AssertUnwindSafe(|| self.dispatch(&request)));
        match outcome {
            Ok(Ok(response)) => {
                info!(%command, "request succeeded");
                response
            }
            Ok(Err(err)) => {
                error!(%command, error = %err, "request failed");
                Response::failure(err.to_string())
            }
            Err(payload) => {
                let message = panic_payload_to_string(payload);
                if command == Command::SolveIvp {
                    if let Some(engine) = self.engine.as_mut() {
                        engine.mark_failed();
                    }
                }
                error!(%command, panic = %message, "request panicked");
                Response::failure(format!("{command} panicked: {message}"))
            }
        }
    }

    fn dispatch(&mut self, request: &Request) -> SessionResult<Response> {
        let command = request.command;
        if command == Command::Init {
            let param: InitParam = request.param()?;
            return self.init(param);
        }
        let Some(engine) = self.engine.as_mut() else {
            return Err(SessionError::NotInitialized(command));
        };

        match command {
            Command::Init => Err(SessionError::AlreadyInitialized),
            Command::SetDiffvarVal => {
                let param: SetDiffvarValParam = request.param()?;
                let values: Vec<_> = param
                    .valmap
                    .into_iter()
                    .map(|(name, value)| {
                        let value = match value {
                            NumberOrArray::Number(x) => scalar(x),
                            NumberOrArray::Array(xs) => array(&xs),
                        };
                        (name, value)
                    })
                    .collect();
                engine.set_diffvar_values(values)?;
                self.last_solution = None;
                Ok(Response::ok())
            }
            Command::GetDiffvarName => Ok(Response::DiffvarName {
                names: engine.get_diffvar_names(),
            }),
            Command::GetCurrentVal => Ok(Response::CurrentVal {
                t: engine.t(),
                y: engine.state().to_vec(),
            }),
            Command::SetWatchingVar => {
                let param: SetWatchingVarParam = request.param()?;
                engine.set_watching_vars(&param.vars)?;
                Ok(Response::ok())
            }
            Command::SolveIvp => {
                let param: SolveIVPParam = request.param()?;
                let output = engine.solve_ivp(param.tn, param.output_interval)?;
                self.last_solution = Some(output.solution);
                Ok(output.samples.into())
            }
            Command::ChangeTime => {
                let param: ChangeTimeParam = request.param()?;
                let solver = overrides(&param.options)?;
                engine.restart(RestartOptions {
                    t: param.t,
                    y: None,
                    solver,
                })?;
                self.last_solution = None;
                Ok(Response::ok())
            }
            Command::SetModelConst => {
                let param: SetModelConstParam = request.param()?;
                engine.set_constants(param.valmap)?;
                Ok(Response::ok())
            }
            Command::EvalModelVar => {
                let param: EvalModelVarParam = request.param()?;
                let current = engine.state().to_vec();
                let times;
                let point = match (param.t, param.y.as_deref()) {
                    (None, None) => EvalPoint::Current,
                    (Some(t), Some(y)) => EvalPoint::At { t, y },
                    (None, Some(y)) => EvalPoint::At { t: engine.t(), y },
                    (Some(t), None) => match self.last_solution.as_ref() {
                        Some(solution) if solution.contains(t) => {
                            times = [t];
                            EvalPoint::Trajectory {
                                times: &times,
                                solution,
                            }
                        }
                        _ => EvalPoint::At { t, y: &current },
                    },
                };
                let series = engine.eval_expressions(&param.vars, point)?;
                Ok(Response::ValueArray {
                    values: series.into_iter().flatten().collect(),
                })
            }
            Command::CallModelMethod => {
                let param: CallModelMethodParam = request.param()?;
                let mut args = MethodArgs::new();
                for (name, value) in param.args {
                    let value = value.into_method_value(&name)?;
                    args.insert(name, value);
                }
                let returned = engine.call_method(&param.method_name, &args)?;
                Ok(Response::MethodReturn {
                    return_value: returned
                        .into_iter()
                        .map(GenericScalarOrArray::from)
                        .collect(),
                })
            }
        }
    }

    fn init(&mut self, param: InitParam) -> SessionResult<Response> {
        if self.engine.is_some() {
            return Err(SessionError::AlreadyInitialized);
        }
        let solver = overrides(&param.options)?;
        let model = self.registry.create(&param.model)?;
        let engine = Engine::new(model, param.t, &solver)?;
        info!(model = %param.model, t = param.t, dimension = engine.layout().dimension(), "model bound");
        self.engine = Some(engine);
        Ok(Response::ok())
    }
}

fn overrides(options: &std::collections::BTreeMap<String, f64>) -> SessionResult<SolverOverrides> {
    Ok(SolverOverrides::from_entries(
        options.iter().map(|(key, value)| (key.as_str(), *value)),
    )?)
}

fn panic_payload_to_string(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    "model code panicked".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use eheart_core::attributes::{Attributes, VarId};
    use eheart_core::diffvar::Value;
    use eheart_core::engine::EngineStatus;
    use eheart_core::method::MethodValue;
    use eheart_core::model::Model;
    use serde_json::json;

    fn assert_err_contains(response: &Response, expected: &str) {
        match response {
            Response::Status {
                success: false,
                message,
            } => assert!(
                message.contains(expected),
                "expected failure containing {expected:?}, got {message:?}"
            ),
            other => panic!("expected a failure status, got {other:?}"),
        }
    }

    fn send(session: &mut Session, command: Command, parameter: serde_json::Value) -> Response {
        session.process(Request::new(command, parameter))
    }

    fn session() -> Session {
        Session::new(Arc::new(ModelRegistry::with_builtin_models()))
    }

    fn init(session: &mut Session, model: &str) {
        let response = send(session, Command::Init, json!({ "model": model }));
        assert_eq!(response, Response::ok());
    }

    /// A model whose right-hand side panics once `y` passes 1.
    struct Panicky {
        y: Option<VarId>,
    }

    impl Model for Panicky {
        fn initialize_vars(&mut self, attrs: &mut Attributes) {
            self.y = Some(attrs.diffvar("y", scalar(0.0)));
        }

        fn calc_ode(&self, _t: &Value, attrs: &mut Attributes) -> anyhow::Result<()> {
            let y = self.y.ok_or_else(|| anyhow::anyhow!("not initialized"))?;
            if attrs[y].value().iter().any(|v| *v > 1.0) {
                panic!("y escaped");
            }
            let one = attrs[y].value().mapv(|_| 1.0);
            attrs[y].set_derivative(one);
            Ok(())
        }
    }

    /// Writes `k` and then panics from any method.
    struct Overwriter {
        x: Option<VarId>,
    }

    impl Model for Overwriter {
        fn initialize_vars(&mut self, attrs: &mut Attributes) {
            self.x = Some(attrs.diffvar("x", scalar(0.0)));
            attrs.constant("k", 1.0);
        }

        fn calc_ode(&self, _t: &Value, attrs: &mut Attributes) -> anyhow::Result<()> {
            let x = self.x.ok_or_else(|| anyhow::anyhow!("not initialized"))?;
            let zero = attrs[x].value().mapv(|_| 0.0);
            attrs[x].set_derivative(zero);
            Ok(())
        }

        fn call_method(
            &mut self,
            name: &str,
            _args: &MethodArgs,
            attrs: &mut Attributes,
        ) -> anyhow::Result<Vec<MethodValue>> {
            attrs.set_constant("k", 99.0)?;
            panic!("{name} gave up after the write");
        }
    }

    #[test]
    fn commands_before_init_fail_without_closing_the_session() {
        let mut session = session();
        for command in [
            Command::SetDiffvarVal,
            Command::GetDiffvarName,
            Command::GetCurrentVal,
            Command::SolveIvp,
            Command::ChangeTime,
            Command::EvalModelVar,
        ] {
            let response = send(&mut session, command, json!({}));
            assert_err_contains(&response, "send INIT first");
        }
        init(&mut session, "ExpDecay");
        assert_eq!(
            send(&mut session, Command::GetDiffvarName, json!({})),
            Response::DiffvarName {
                names: vec!["y".to_string()]
            }
        );
    }

    #[test]
    fn second_init_is_rejected() {
        let mut session = session();
        init(&mut session, "ExpDecay");
        let response = send(&mut session, Command::Init, json!({ "model": "CellRing" }));
        assert_err_contains(&response, "already processed");
        assert_eq!(
            session.engine().map(|e| e.get_diffvar_names()),
            Some(vec!["y".to_string()])
        );
    }

    #[test]
    fn unknown_model_and_bad_options_leave_session_uninitialized() {
        let mut session = session();
        let response = send(&mut session, Command::Init, json!({ "model": "model.nonexistent.Model" }));
        assert_err_contains(&response, "Unknown model: model.nonexistent.Model");

        let response = send(
            &mut session,
            Command::Init,
            json!({ "model": "ExpDecay", "options": { "tolerance": 1e-3 } }),
        );
        assert_err_contains(&response, "unknown option `tolerance`");
        assert!(session.engine().is_none());

        init(&mut session, "ExpDecay");
    }

    #[test]
    fn malformed_input_is_reported() {
        let mut session = session();
        assert_err_contains(&session.process_line("{not json"), "Malformed request");
        assert_err_contains(
            &session.process_line(r#"{"command": "EXPLODE"}"#),
            "unknown variant",
        );
        init(&mut session, "ExpDecay");
        let response = send(&mut session, Command::SolveIvp, json!({ "tn": [1.0] }));
        assert_err_contains(&response, "Invalid parameter for SOLVE_IVP");
        let response = send(&mut session, Command::SetWatchingVar, json!({ "vars": ["y +"] }));
        assert!(!response.is_success());
    }

    #[test]
    fn set_and_read_current_values() {
        let mut session = session();
        init(&mut session, "CellRing");
        let values: Vec<f64> = (0..8).map(|i| i as f64).collect();
        let response = send(
            &mut session,
            Command::SetDiffvarVal,
            json!({ "valmap": { "u": values } }),
        );
        assert_eq!(response, Response::ok());
        assert_eq!(
            send(&mut session, Command::GetCurrentVal, json!({})),
            Response::CurrentVal { t: 0.0, y: values }
        );

        let response = send(
            &mut session,
            Command::SetDiffvarVal,
            json!({ "valmap": { "u": [1.0, 2.0] } }),
        );
        assert_err_contains(&response, "Shape mismatch for u");
        let response = send(
            &mut session,
            Command::SetDiffvarVal,
            json!({ "valmap": { "v": 1.0 } }),
        );
        assert_err_contains(&response, "Unknown differential variable: v");
    }

    #[test]
    fn solve_reports_samples_and_watching_series() {
        let mut session = session();
        init(&mut session, "ExpDecay");
        send(&mut session, Command::SetDiffvarVal, json!({ "valmap": { "y": 1.0 } }));
        let response = send(
            &mut session,
            Command::SetWatchingVar,
            json!({ "vars": ["ydot", "2 * y"] }),
        );
        assert_eq!(response, Response::ok());

        let response = send(
            &mut session,
            Command::SolveIvp,
            json!({ "tn": 1.0, "output_interval": 0.25 }),
        );
        let Response::Solution {
            t,
            diffvars,
            watching_vars,
        } = response
        else {
            panic!("expected a solution, got {response:?}");
        };
        assert_eq!(t.values, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
        assert_eq!(diffvars.len(), 1);
        assert_eq!(watching_vars.len(), 2);
        for (i, &ti) in t.values.iter().enumerate() {
            let y = diffvars[0].values[i];
            assert!((y - (-ti).exp()).abs() < 1e-5, "t = {ti}: {y}");
            assert!((watching_vars[0].values[i] + y).abs() < 1e-12);
            assert!((watching_vars[1].values[i] - 2.0 * y).abs() < 1e-12);
        }

        let response = send(&mut session, Command::SolveIvp, json!({ "tn": 2.0 }));
        let Response::Solution { t, diffvars, .. } = response else {
            panic!("expected a solution, got {response:?}");
        };
        assert_eq!(t.values, vec![2.0]);
        assert!((diffvars[0].values[0] - (-2.0f64).exp()).abs() < 1e-5);
    }

    #[test]
    fn change_time_with_and_without_t() {
        let mut session = session();
        init(&mut session, "ExpDecay");
        send(&mut session, Command::SetDiffvarVal, json!({ "valmap": { "y": 1.0 } }));

        let response = send(&mut session, Command::ChangeTime, json!({ "t": 5.0 }));
        assert_eq!(response, Response::ok());
        assert_eq!(
            send(&mut session, Command::GetCurrentVal, json!({})),
            Response::CurrentVal { t: 5.0, y: vec![1.0] }
        );

        let response = send(
            &mut session,
            Command::ChangeTime,
            json!({ "options": { "rtol": 1e-9 } }),
        );
        assert_eq!(response, Response::ok());
        let engine = session.engine().expect("initialized");
        assert_eq!(engine.t(), 5.0);
        assert_eq!(engine.options().rtol, 1e-9);

        let response = send(
            &mut session,
            Command::ChangeTime,
            json!({ "t": 1.0, "options": { "rtol": -1.0 } }),
        );
        assert!(!response.is_success());
        assert_eq!(session.engine().map(Engine::t), Some(5.0));
    }

    #[test]
    fn set_model_const_is_all_or_nothing() {
        let mut session = session();
        init(&mut session, "ExpDecay");
        let response = send(
            &mut session,
            Command::SetModelConst,
            json!({ "valmap": { "tau": 2.0, "omega": 1.0 } }),
        );
        assert_err_contains(&response, "Unknown constant: omega");
        let response = send(
            &mut session,
            Command::EvalModelVar,
            json!({ "vars": ["tau"] }),
        );
        assert_eq!(response, Response::ValueArray { values: vec![1.0] });

        send(&mut session, Command::SetModelConst, json!({ "valmap": { "tau": 2.0 } }));
        let response = send(
            &mut session,
            Command::EvalModelVar,
            json!({ "vars": ["tau"] }),
        );
        assert_eq!(response, Response::ValueArray { values: vec![2.0] });
    }

    #[test]
    fn eval_model_var_at_explicit_and_interpolated_points() {
        let mut session = session();
        init(&mut session, "ExpDecay");
        send(&mut session, Command::SetDiffvarVal, json!({ "valmap": { "y": 4.0 } }));

        let response = send(
            &mut session,
            Command::EvalModelVar,
            json!({ "vars": ["ydot", "y", "t"] }),
        );
        assert_eq!(response, Response::ValueArray { values: vec![-4.0, 4.0, 0.0] });

        let response = send(
            &mut session,
            Command::EvalModelVar,
            json!({ "vars": ["ydot", "t"], "t": 3.0, "y": [2.0] }),
        );
        assert_eq!(response, Response::ValueArray { values: vec![-2.0, 3.0] });

        send(&mut session, Command::SolveIvp, json!({ "tn": 1.0 }));
        let response = send(
            &mut session,
            Command::EvalModelVar,
            json!({ "vars": ["y"], "t": 0.5 }),
        );
        let Response::ValueArray { values } = response else {
            panic!("expected values, got {response:?}");
        };
        assert_eq!(values.len(), 1);
        assert!((values[0] - 4.0 * (-0.5f64).exp()).abs() < 1e-5);

        let response = send(
            &mut session,
            Command::EvalModelVar,
            json!({ "vars": ["y"], "t": 1.0, "y": [1.0, 2.0] }),
        );
        assert!(!response.is_success());
    }

    #[test]
    fn scalar_and_singleton_array_arguments_are_distinct() {
        let mut session = session();
        init(&mut session, "ExpDecay");

        let response = send(
            &mut session,
            Command::CallModelMethod,
            json!({
                "method_name": "single_array_method",
                "args": {
                    "ary": { "isscalar": false, "value": [{ "real": 1.5 }] },
                    "factor": { "isscalar": true, "value": [{ "real": 2.0 }] },
                },
            }),
        );
        assert_eq!(
            serde_json::to_value(&response).expect("encode"),
            json!({
                "type": "method_return",
                "return_value": [{ "isscalar": false, "value": [{ "real": 3.0 }] }],
            })
        );

        let response = send(
            &mut session,
            Command::CallModelMethod,
            json!({
                "method_name": "single_array_method",
                "args": {
                    "ary": { "isscalar": true, "value": [{ "real": 1.5 }] },
                    "factor": { "isscalar": true, "value": [{ "real": 2.0 }] },
                },
            }),
        );
        assert_err_contains(&response, "argument `ary` must be an array");

        let response = send(
            &mut session,
            Command::CallModelMethod,
            json!({
                "method_name": "single_valued_method",
                "args": {
                    "ary": { "isscalar": false, "value": [{ "real": 1.0 }, { "real": 5.0 }] },
                    "idx": { "isscalar": true, "value": [{ "integer": 1 }] },
                    "factor": { "isscalar": true, "value": [{ "real": 0.5 }] },
                },
            }),
        );
        assert_eq!(
            serde_json::to_value(&response).expect("encode"),
            json!({
                "type": "method_return",
                "return_value": [{ "isscalar": true, "value": [{ "real": 2.5 }] }],
            })
        );
    }

    #[test]
    fn tuple_method_returns_every_value() {
        let mut session = session();
        init(&mut session, "ExpDecay");
        let response = send(
            &mut session,
            Command::CallModelMethod,
            json!({
                "method_name": "tuple_method",
                "args": {
                    "prefix": { "isscalar": true, "value": [{ "string": "cell_" }] },
                    "strary": { "isscalar": false, "value": [{ "string": "a" }] },
                },
            }),
        );
        assert_eq!(
            serde_json::to_value(&response).expect("encode"),
            json!({
                "type": "method_return",
                "return_value": [
                    { "isscalar": false, "value": [{ "string": "cell_a" }] },
                    { "isscalar": true, "value": [{ "integer": 1 }] },
                ],
            })
        );

        let response = send(
            &mut session,
            Command::CallModelMethod,
            json!({
                "method_name": "tuple_method",
                "args": {
                    "prefix": { "isscalar": true, "value": [] },
                    "strary": { "isscalar": false, "value": [] },
                },
            }),
        );
        assert_err_contains(&response, "exactly one value");

        let response = send(
            &mut session,
            Command::CallModelMethod,
            json!({ "method_name": "launch", "args": {} }),
        );
        assert_err_contains(&response, "no method named `launch`");
    }

    #[test]
    fn panicking_model_fails_the_solve_and_keeps_the_state() {
        let mut registry = ModelRegistry::new();
        registry.register("Panicky", || Box::new(Panicky { y: None }));
        let mut session = Session::new(Arc::new(registry));
        init(&mut session, "Panicky");

        let response = send(&mut session, Command::SolveIvp, json!({ "tn": 5.0 }));
        assert_err_contains(&response, "y escaped");
        let engine = session.engine().expect("initialized");
        assert_eq!(engine.status(), EngineStatus::Failed);
        assert_eq!(engine.t(), 0.0);
        assert_eq!(engine.state(), &[0.0]);

        let response = send(&mut session, Command::SolveIvp, json!({ "tn": 0.5 }));
        assert_err_contains(&response, "solve_ivp requires the engine to be");

        assert_eq!(send(&mut session, Command::ChangeTime, json!({})), Response::ok());
        let response = send(&mut session, Command::SolveIvp, json!({ "tn": 0.5 }));
        assert!(response.is_success(), "{response:?}");
        let engine = session.engine().expect("initialized");
        assert_eq!(engine.t(), 0.5);
        assert!((engine.state()[0] - 0.5).abs() < 1e-12);
    }

    #[test]
    fn panicking_method_leaves_constants_untouched() {
        let mut registry = ModelRegistry::new();
        registry.register("Overwriter", || Box::new(Overwriter { x: None }));
        let mut session = Session::new(Arc::new(registry));
        init(&mut session, "Overwriter");

        let response = send(
            &mut session,
            Command::CallModelMethod,
            json!({ "method_name": "overwrite", "args": {} }),
        );
        assert_err_contains(&response, "overwrite gave up after the write");
        let response = send(&mut session, Command::EvalModelVar, json!({ "vars": ["k"] }));
        assert_eq!(response, Response::ValueArray { values: vec![1.0] });
        assert_eq!(
            session.engine().map(Engine::status),
            Some(EngineStatus::Ready)
        );
    }

    #[test]
    fn hostile_payloads_are_plain_failures() {
        let mut session = session();
        init(&mut session, "ExpDecay");

        let deep = format!("{}y", "-".repeat(500_000));
        let response = send(&mut session, Command::SetWatchingVar, json!({ "vars": [deep] }));
        assert_err_contains(&response, "Syntax error");
        let response = send(
            &mut session,
            Command::EvalModelVar,
            json!({ "vars": [format!("{}y{}", "(".repeat(500_000), ")".repeat(500_000))] }),
        );
        assert_err_contains(&response, "Syntax error");

        let response = send(
            &mut session,
            Command::SolveIvp,
            json!({ "tn": 1e9, "output_interval": 1e-3 }),
        );
        assert_err_contains(&response, "exceeds");
        assert_eq!(
            send(&mut session, Command::GetCurrentVal, json!({})),
            Response::CurrentVal { t: 0.0, y: vec![0.0] }
        );
        assert_eq!(
            session.engine().map(Engine::status),
            Some(EngineStatus::Ready)
        );
    }

    #[test]
    fn restart_and_new_values_drop_the_previous_trajectory() {
        let mut session = session();
        init(&mut session, "ExpDecay");
        send(&mut session, Command::SetDiffvarVal, json!({ "valmap": { "y": 4.0 } }));
        send(&mut session, Command::SolveIvp, json!({ "tn": 1.0 }));

        send(&mut session, Command::ChangeTime, json!({ "t": 0.0 }));
        let current = session.engine().map(|e| e.state()[0]).expect("initialized");
        let response = send(&mut session, Command::EvalModelVar, json!({ "vars": ["y"], "t": 0.5 }));
        assert_eq!(response, Response::ValueArray { values: vec![current] });

        send(&mut session, Command::SolveIvp, json!({ "tn": 1.0 }));
        send(&mut session, Command::SetDiffvarVal, json!({ "valmap": { "y": 7.0 } }));
        let response = send(&mut session, Command::EvalModelVar, json!({ "vars": ["y"], "t": 0.5 }));
        assert_eq!(response, Response::ValueArray { values: vec![7.0] });
    }
}
