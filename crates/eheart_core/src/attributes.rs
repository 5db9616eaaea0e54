//! Explicit declaration registry for model attributes.
//!
//! `Model::initialize_vars` declares differential variables and constants
//! here instead of having the engine discover them. Once the engine seals the
//! registry the set of variables and their shapes are frozen; they define the
//! state-vector layout handed to the integrator.

use std::collections::BTreeMap;
use std::ops::{Index, IndexMut};

use ndarray::{ArrayD, IxDyn};
use serde::Serialize;

use crate::diffvar::{scalar, DiffVar, Value};
use crate::error::{EngineError, EngineResult};

/// Handle to a declared differential variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(usize);

/// Handle to a declared constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConstId(usize);

/// Position of one variable inside the flat state vector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VarSlot {
    pub name: String,
    pub shape: Vec<usize>,
    pub offset: usize,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateLayout {
    slots: Vec<VarSlot>,
    dimension: usize,
}

impl StateLayout {
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn slots(&self) -> &[VarSlot] {
        &self.slots
    }

    pub fn names(&self) -> Vec<String> {
        self.slots.iter().map(|slot| slot.name.clone()).collect()
    }

    pub fn slot(&self, name: &str) -> Option<&VarSlot> {
        self.slots.iter().find(|slot| slot.name == name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Attributes {
    diffvars: Vec<DiffVar>,
    constants: Vec<(String, f64)>,
    observables: BTreeMap<String, Value>,
    sealed: bool,
    declaration_errors: Vec<String>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a differential variable with its initial value. The shape of
    /// `initial` becomes the variable's fixed shape.
    pub fn diffvar(&mut self, name: &str, initial: Value) -> VarId {
        self.check_declaration(name);
        self.diffvars.push(DiffVar::new(name, initial));
        VarId(self.diffvars.len() - 1)
    }

    /// Declare an externally alterable constant.
    pub fn constant(&mut self, name: &str, value: f64) -> ConstId {
        self.check_declaration(name);
        self.constants.push((name.to_string(), value));
        ConstId(self.constants.len() - 1)
    }

    fn check_declaration(&mut self, name: &str) {
        if self.sealed {
            self.declaration_errors
                .push(format!("`{name}` declared after initialization"));
        } else if name == "t" {
            self.declaration_errors
                .push("`t` is reserved for the time variable".to_string());
        } else if self.is_declared(name) {
            self.declaration_errors
                .push(format!("`{name}` declared more than once"));
        }
    }

    fn is_declared(&self, name: &str) -> bool {
        self.diffvars.iter().any(|var| var.name() == name)
            || self.constants.iter().any(|(n, _)| n == name)
    }

    pub fn get(&self, id: ConstId) -> f64 {
        self.constants[id.0].1
    }

    /// Publish a derived quantity for expressions and watching variables.
    pub fn observe(&mut self, name: &str, value: Value) {
        self.observables.insert(name.to_string(), value);
    }

    pub fn observable(&self, name: &str) -> Option<&Value> {
        self.observables.get(name)
    }

    pub fn diffvars(&self) -> &[DiffVar] {
        &self.diffvars
    }

    pub fn diffvar_by_name(&self, name: &str) -> Option<&DiffVar> {
        self.diffvars.iter().find(|var| var.name() == name)
    }

    pub(crate) fn diffvar_index(&self, name: &str) -> Option<usize> {
        self.diffvars.iter().position(|var| var.name() == name)
    }

    pub fn constant_by_name(&self, name: &str) -> Option<f64> {
        self.constants
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, value)| *value)
    }

    pub(crate) fn constant_index(&self, name: &str) -> Option<usize> {
        self.constants.iter().position(|(n, _)| n == name)
    }

    pub(crate) fn constant_at(&self, index: usize) -> f64 {
        self.constants[index].1
    }

    pub fn constant_names(&self) -> Vec<String> {
        self.constants.iter().map(|(n, _)| n.clone()).collect()
    }

    /// Write a new constant value; models may call this from `call_method`.
    pub fn set_constant(&mut self, name: &str, value: f64) -> EngineResult<()> {
        let index = self
            .constant_index(name)
            .ok_or_else(|| EngineError::UnknownConstant(name.to_string()))?;
        self.constants[index].1 = value;
        Ok(())
    }

    pub(crate) fn constants_snapshot(&self) -> Vec<(String, f64)> {
        self.constants.clone()
    }

    pub(crate) fn restore_constants(&mut self, snapshot: Vec<(String, f64)>) {
        self.constants = snapshot;
    }

    /// Freeze the declarations and compute the state layout.
    pub(crate) fn seal(&mut self) -> EngineResult<(StateLayout, Vec<f64>)> {
        if !self.declaration_errors.is_empty() {
            return Err(EngineError::Declaration(self.declaration_errors.join("; ")));
        }
        if self.diffvars.is_empty() {
            return Err(EngineError::Declaration(
                "model declares no differential variables".to_string(),
            ));
        }
        self.sealed = true;

        let mut slots = Vec::with_capacity(self.diffvars.len());
        let mut initial = Vec::new();
        let mut offset = 0;
        for var in &self.diffvars {
            let len = var.len();
            slots.push(VarSlot {
                name: var.name().to_string(),
                shape: var.shape().to_vec(),
                offset,
                len,
            });
            initial.extend(var.value().iter().copied());
            offset += len;
        }
        Ok((
            StateLayout {
                slots,
                dimension: offset,
            },
            initial,
        ))
    }

    /// Present a single state point to the model.
    pub(crate) fn load_point(&mut self, layout: &StateLayout, y: &[f64]) {
        self.observables.clear();
        for (var, slot) in self.diffvars.iter_mut().zip(layout.slots()) {
            let data = y[slot.offset..slot.offset + slot.len].to_vec();
            let value = if slot.shape.is_empty() {
                scalar(data[0])
            } else {
                ArrayD::from_shape_vec(IxDyn(&slot.shape), data)
                    .expect("slot length matches its shape")
            };
            var.load(value);
        }
    }

    /// Present N state points at once; each variable gains a trailing batch
    /// axis of length N.
    pub(crate) fn load_batch(&mut self, layout: &StateLayout, ys: &[Vec<f64>]) {
        self.observables.clear();
        let n = ys.len();
        for (var, slot) in self.diffvars.iter_mut().zip(layout.slots()) {
            let mut data = vec![0.0; slot.len * n];
            for (lane, y) in ys.iter().enumerate() {
                for j in 0..slot.len {
                    data[j * n + lane] = y[slot.offset + j];
                }
            }
            let mut shape = slot.shape.clone();
            shape.push(n);
            let value = ArrayD::from_shape_vec(IxDyn(&shape), data)
                .expect("batch length matches its shape");
            var.load(value);
        }
    }

    /// Gather the derivatives of a single-point evaluation into `out`.
    pub(crate) fn collect_derivatives(
        &self,
        layout: &StateLayout,
        out: &mut [f64],
    ) -> EngineResult<()> {
        for (var, slot) in self.diffvars.iter().zip(layout.slots()) {
            let der = var.try_derivative().ok_or_else(|| {
                EngineError::Model(anyhow::anyhow!(
                    "calc_ode did not set the derivative of `{}`",
                    slot.name
                ))
            })?;
            if der.shape() != var.value().shape() {
                return Err(EngineError::ShapeMismatch {
                    name: format!("derivative of {}", slot.name),
                    expected: var.value().shape().to_vec(),
                    actual: der.shape().to_vec(),
                });
            }
            for (dst, src) in out[slot.offset..slot.offset + slot.len]
                .iter_mut()
                .zip(der.iter())
            {
                *dst = *src;
            }
        }
        Ok(())
    }
}

impl Index<VarId> for Attributes {
    type Output = DiffVar;

    fn index(&self, id: VarId) -> &DiffVar {
        &self.diffvars[id.0]
    }
}

impl IndexMut<VarId> for Attributes {
    fn index_mut(&mut self, id: VarId) -> &mut DiffVar {
        &mut self.diffvars[id.0]
    }
}
