//! Differential variables and the array values they carry.
//!
//! A differential variable holds its current value and a derivative slot that
//! `Model::calc_ode` fills in. Values are n-dimensional `f64` arrays: a scalar
//! variable is 0-d, an array variable has its declared shape. When the engine
//! evaluates a batch of N points at once, every variable gets a trailing batch
//! axis of length N, so the same model code serves both paths as long as it
//! sticks to elementwise operations and [`select`] for branching.

use ndarray::{arr0, ArrayD, IxDyn, Zip};

use crate::error::{EngineError, EngineResult};

/// Numeric value of a variable, a constant, or an expression.
pub type Value = ArrayD<f64>;

/// Boolean mask used with [`select`].
pub type Mask = ArrayD<bool>;

/// A 0-d value.
pub fn scalar(x: f64) -> Value {
    arr0(x).into_dyn()
}

/// A 1-d value.
pub fn array(values: &[f64]) -> Value {
    ArrayD::from_shape_vec(IxDyn(&[values.len()]), values.to_vec())
        .expect("1-d shape always matches its data length")
}

/// Co-broadcast two shapes using trailing-axis alignment.
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let ndim = a.len().max(b.len());
    let mut shape = Vec::with_capacity(ndim);
    for axis in 0..ndim {
        let da = dim_from_end(a, ndim - axis);
        let db = dim_from_end(b, ndim - axis);
        let d = if da == db {
            da
        } else if da == 1 {
            db
        } else if db == 1 {
            da
        } else {
            return None;
        };
        shape.push(d);
    }
    Some(shape)
}

fn dim_from_end(shape: &[usize], pos: usize) -> usize {
    if pos > shape.len() {
        1
    } else {
        shape[shape.len() - pos]
    }
}

/// Apply `f` elementwise to two broadcast-compatible values.
pub fn zip_with(a: &Value, b: &Value, f: impl Fn(f64, f64) -> f64) -> EngineResult<Value> {
    let shape = broadcast_shape(a.shape(), b.shape()).ok_or_else(|| EngineError::ShapeMismatch {
        name: "operand".to_string(),
        expected: a.shape().to_vec(),
        actual: b.shape().to_vec(),
    })?;
    let a = a.broadcast(shape.as_slice()).ok_or_else(|| mismatch(&shape, a.shape()))?;
    let b = b.broadcast(shape.as_slice()).ok_or_else(|| mismatch(&shape, b.shape()))?;
    Ok(Zip::from(&a).and(&b).map_collect(|&x, &y| f(x, y)))
}

/// Elementwise conditional selection: `if_true` where `mask` holds, `if_false`
/// elsewhere. All three operands broadcast against each other.
pub fn select(mask: &Mask, if_true: &Value, if_false: &Value) -> EngineResult<Value> {
    let shape = broadcast_shape(mask.shape(), if_true.shape())
        .and_then(|s| broadcast_shape(&s, if_false.shape()))
        .ok_or_else(|| EngineError::ShapeMismatch {
            name: "select".to_string(),
            expected: mask.shape().to_vec(),
            actual: if_true.shape().to_vec(),
        })?;
    let mask = mask
        .broadcast(shape.as_slice())
        .ok_or_else(|| mismatch(&shape, mask.shape()))?;
    let if_true = if_true
        .broadcast(shape.as_slice())
        .ok_or_else(|| mismatch(&shape, if_true.shape()))?;
    let if_false = if_false
        .broadcast(shape.as_slice())
        .ok_or_else(|| mismatch(&shape, if_false.shape()))?;
    Ok(Zip::from(&mask)
        .and(&if_true)
        .and(&if_false)
        .map_collect(|&m, &a, &b| if m { a } else { b }))
}

fn mismatch(expected: &[usize], actual: &[usize]) -> EngineError {
    EngineError::ShapeMismatch {
        name: "broadcast".to_string(),
        expected: expected.to_vec(),
        actual: actual.to_vec(),
    }
}

/// A state component of the ODE system.
#[derive(Debug, Clone)]
pub struct DiffVar {
    name: String,
    shape: Vec<usize>,
    value: Value,
    derivative: Option<Value>,
}

impl DiffVar {
    pub(crate) fn new(name: &str, initial: Value) -> Self {
        Self {
            name: name.to_string(),
            shape: initial.shape().to_vec(),
            value: initial,
            derivative: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared shape of a single point (without any batch axis).
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of state-vector entries this variable occupies.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn set_derivative(&mut self, derivative: Value) {
        self.derivative = Some(derivative);
    }

    /// The derivative set by the current evaluation.
    ///
    /// # Panics
    ///
    /// Panics if `calc_ode` has not set it yet during this evaluation.
    pub fn derivative(&self) -> &Value {
        match &self.derivative {
            Some(der) => der,
            None => panic!(
                "derivative of `{}` read before calc_ode set it",
                self.name
            ),
        }
    }

    pub fn try_derivative(&self) -> Option<&Value> {
        self.derivative.as_ref()
    }

    /// Replace the value for a new evaluation and clear the derivative slot.
    pub(crate) fn load(&mut self, value: Value) {
        self.value = value;
        self.derivative = None;
    }
}
