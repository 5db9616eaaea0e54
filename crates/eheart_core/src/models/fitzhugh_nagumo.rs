//! FitzHugh-Nagumo excitable cell driven by a rectangular current pulse.
//!
//! ```text
//! dv/dt = v - v^3 / 3 - w + I(t)
//! dw/dt = eps * (v + a - b * w)
//! ```
//!
//! `I(t)` is `stim_amplitude` on `[stim_start, stim_start + stim_duration)`
//! and zero elsewhere; it is published as the observable `i_stim`. The
//! initial state is the resting point for the default constants.

use anyhow::{anyhow, Result};

use crate::attributes::{Attributes, ConstId, VarId};
use crate::diffvar::{scalar, select, Value};
use crate::method::{MethodArgs, MethodValue};
use crate::model::Model;

pub const NAME: &str = "FitzHughNagumo";

pub fn create() -> Box<dyn Model> {
    Box::new(FitzHughNagumo::default())
}

#[derive(Debug, Clone, Copy)]
struct Ids {
    v: VarId,
    w: VarId,
    a: ConstId,
    b: ConstId,
    eps: ConstId,
    stim_amplitude: ConstId,
    stim_start: ConstId,
    stim_duration: ConstId,
}

#[derive(Debug, Default)]
pub struct FitzHughNagumo {
    ids: Option<Ids>,
}

impl Model for FitzHughNagumo {
    fn initialize_vars(&mut self, attrs: &mut Attributes) {
        self.ids = Some(Ids {
            v: attrs.diffvar("v", scalar(-1.199_408_035)),
            w: attrs.diffvar("w", scalar(-0.624_260_044)),
            a: attrs.constant("a", 0.7),
            b: attrs.constant("b", 0.8),
            eps: attrs.constant("eps", 0.08),
            stim_amplitude: attrs.constant("stim_amplitude", 1.0),
            stim_start: attrs.constant("stim_start", 1.0),
            stim_duration: attrs.constant("stim_duration", 1.0),
        });
    }

    fn calc_ode(&self, t: &Value, attrs: &mut Attributes) -> Result<()> {
        let ids = self
            .ids
            .ok_or_else(|| anyhow!("calc_ode called before initialize_vars"))?;
        let start = attrs.get(ids.stim_start);
        let end = start + attrs.get(ids.stim_duration);
        let on = t.mapv(|t| t >= start && t < end);
        let i_stim = select(&on, &scalar(attrs.get(ids.stim_amplitude)), &scalar(0.0))?;

        let v = attrs[ids.v].value();
        let w = attrs[ids.w].value();
        let dv = v - &v.mapv(|x| x.powi(3) / 3.0) - w + &i_stim;
        let dw = (v + attrs.get(ids.a) - w * attrs.get(ids.b)) * attrs.get(ids.eps);

        attrs.observe("i_stim", i_stim);
        attrs[ids.v].set_derivative(dv);
        attrs[ids.w].set_derivative(dw);
        Ok(())
    }

    fn call_method(
        &mut self,
        name: &str,
        args: &MethodArgs,
        attrs: &mut Attributes,
    ) -> Result<Vec<MethodValue>> {
        match name {
            // Reconfigure the pulse in one call.
            "set_stimulus" => {
                let amplitude = args.real("amplitude")?;
                let start = args.real("start")?;
                let duration = args.real("duration")?;
                if !(duration >= 0.0) {
                    anyhow::bail!("stimulus duration must be non-negative, got {duration}");
                }
                attrs.set_constant("stim_amplitude", amplitude)?;
                attrs.set_constant("stim_start", start)?;
                attrs.set_constant("stim_duration", duration)?;
                Ok(Vec::new())
            }
            _ => anyhow::bail!("model has no method named `{name}`"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Engine, EvalPoint};
    use crate::solvers::SolverOverrides;

    #[test]
    fn resting_state_is_nearly_stationary() {
        let mut engine = Engine::new(create(), 0.0, &SolverOverrides::default()).expect("engine");
        let ders = engine
            .eval_expressions(&["der(v)", "der(w)"], EvalPoint::Current)
            .expect("eval");
        assert!(ders[0][0].abs() < 1e-5, "dv = {}", ders[0][0]);
        assert!(ders[1][0].abs() < 1e-5, "dw = {}", ders[1][0]);
    }

    #[test]
    fn pulse_fires_an_action_potential() {
        let mut engine = Engine::new(create(), 0.0, &SolverOverrides::default()).expect("engine");
        let output = engine.solve_ivp(10.0, Some(0.5)).expect("solve");
        let samples = output.samples;
        let v_max = samples.diffvars[0]
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);
        assert!(v_max > 1.0, "peak v = {v_max}");
    }

    #[test]
    fn set_stimulus_rewrites_constants() {
        let mut engine = Engine::new(create(), 0.0, &SolverOverrides::default()).expect("engine");
        let mut args = MethodArgs::new();
        args.insert("amplitude", MethodValue::real(2.0));
        args.insert("start", MethodValue::real(0.0));
        args.insert("duration", MethodValue::real(1.0));
        engine.call_method("set_stimulus", &args).expect("call");
        let values = engine
            .eval_expressions(&["i_stim", "stim_amplitude"], EvalPoint::Current)
            .expect("eval");
        assert_eq!(values, vec![vec![2.0], vec![2.0]]);

        args.insert("duration", MethodValue::real(-1.0));
        assert!(engine.call_method("set_stimulus", &args).is_err());
    }
}
