//! `dy/dt = -y / tau`, with a few auxiliary methods for exercising
//! `CALL_MODEL_METHOD`.

use anyhow::{anyhow, bail, Result};

use crate::attributes::{Attributes, ConstId, VarId};
use crate::diffvar::{scalar, Value};
use crate::method::{MethodArgs, MethodValue};
use crate::model::Model;

pub const NAME: &str = "ExpDecay";

pub fn create() -> Box<dyn Model> {
    Box::new(ExpDecay::default())
}

#[derive(Debug, Default)]
pub struct ExpDecay {
    ids: Option<(VarId, ConstId)>,
}

impl Model for ExpDecay {
    fn initialize_vars(&mut self, attrs: &mut Attributes) {
        let tau = attrs.constant("tau", 1.0);
        let y = attrs.diffvar("y", scalar(0.0));
        self.ids = Some((y, tau));
    }

    fn calc_ode(&self, _t: &Value, attrs: &mut Attributes) -> Result<()> {
        let (y, tau) = self
            .ids
            .ok_or_else(|| anyhow!("calc_ode called before initialize_vars"))?;
        let ydot = attrs[y].value() * (-1.0 / attrs.get(tau));
        attrs.observe("ydot", ydot.clone());
        attrs[y].set_derivative(ydot);
        Ok(())
    }

    fn call_method(
        &mut self,
        name: &str,
        args: &MethodArgs,
        _attrs: &mut Attributes,
    ) -> Result<Vec<MethodValue>> {
        match name {
            "single_valued_method" => {
                let ary = args.reals("ary")?;
                let idx = args.integer("idx")?;
                let factor = args.real("factor")?;
                let x = usize::try_from(idx)
                    .ok()
                    .and_then(|i| ary.get(i))
                    .ok_or_else(|| anyhow!("index {idx} out of range for {} elements", ary.len()))?;
                Ok(vec![MethodValue::real(factor * x)])
            }
            "single_array_method" => {
                let ary = args.reals("ary")?;
                let factor = args.real("factor")?;
                Ok(vec![MethodValue::reals(ary.into_iter().map(|v| v * factor))])
            }
            "tuple_method" => {
                let prefix = args.string("prefix")?;
                let strary = args.strings("strary")?;
                let joined: Vec<String> = strary.iter().map(|s| format!("{prefix}{s}")).collect();
                Ok(vec![
                    MethodValue::strings(joined),
                    MethodValue::integer(strary.len() as i64),
                ])
            }
            _ => bail!("model has no method named `{name}`"),
        }
    }
}
