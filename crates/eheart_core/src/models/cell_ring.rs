//! A ring of diffusively coupled cells held in one array-valued variable.
//!
//! `du_i/dt = d * (u_{i-1} - 2 u_i + u_{i+1}) - k * u_i`, with indices taken
//! modulo the ring size and a constant current `stim` injected into cell 0
//! while `t < stim_duration`.

use anyhow::{anyhow, Result};
use ndarray::Axis;

use crate::attributes::{Attributes, ConstId, VarId};
use crate::diffvar::{array, scalar, select, zip_with, Value};
use crate::model::Model;

pub const NAME: &str = "CellRing";

const CELLS: usize = 8;

pub fn create() -> Box<dyn Model> {
    Box::new(CellRing::default())
}

#[derive(Debug, Clone, Copy)]
struct Ids {
    u: VarId,
    d: ConstId,
    k: ConstId,
    stim: ConstId,
    stim_duration: ConstId,
}

#[derive(Debug, Default)]
pub struct CellRing {
    ids: Option<Ids>,
}

impl Model for CellRing {
    fn initialize_vars(&mut self, attrs: &mut Attributes) {
        let mut initial = [0.0; CELLS];
        initial[0] = 1.0;
        self.ids = Some(Ids {
            u: attrs.diffvar("u", array(&initial)),
            d: attrs.constant("d", 0.5),
            k: attrs.constant("k", 0.1),
            stim: attrs.constant("stim", 0.0),
            stim_duration: attrs.constant("stim_duration", 0.0),
        });
    }

    fn calc_ode(&self, t: &Value, attrs: &mut Attributes) -> Result<()> {
        let ids = self
            .ids
            .ok_or_else(|| anyhow!("calc_ode called before initialize_vars"))?;
        let d = attrs.get(ids.d);
        let k = attrs.get(ids.k);
        let duration = attrs.get(ids.stim_duration);
        let on = t.mapv(|t| t < duration);
        let drive = select(&on, &scalar(attrs.get(ids.stim)), &scalar(0.0))?;

        let u = attrs[ids.u].value();
        let n = u.len_of(Axis(0));
        let mut du = Value::zeros(u.raw_dim());
        for i in 0..n {
            let left = u.index_axis(Axis(0), (i + n - 1) % n);
            let center = u.index_axis(Axis(0), i);
            let right = u.index_axis(Axis(0), (i + 1) % n);
            let mut rate = (&left + &right - &center * 2.0) * d - &center * k;
            if i == 0 {
                rate = zip_with(&rate, &drive, |r, s| r + s)?;
            }
            du.index_axis_mut(Axis(0), i).assign(&rate);
        }
        let total = u.sum_axis(Axis(0));

        attrs.observe("total", total);
        attrs[ids.u].set_derivative(du);
        Ok(())
    }
}
