//! Generic argument and return values for model methods invoked by name.

use std::collections::BTreeMap;

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};

/// A single method-call value. Serialized as `{"real": 1.5}`,
/// `{"integer": 3}` or `{"string": "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenericValue {
    Real(f32),
    Integer(i64),
    String(String),
}

impl GenericValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            GenericValue::Real(v) => Some(f64::from(*v)),
            GenericValue::Integer(v) => Some(*v as f64),
            GenericValue::String(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            GenericValue::String(s) => Some(s),
            _ => None,
        }
    }
}

/// A scalar and a one-element array are distinct values.
#[derive(Debug, Clone, PartialEq)]
pub enum MethodValue {
    Scalar(GenericValue),
    Array(Vec<GenericValue>),
}

impl MethodValue {
    pub fn real(value: f64) -> Self {
        MethodValue::Scalar(GenericValue::Real(value as f32))
    }

    pub fn integer(value: i64) -> Self {
        MethodValue::Scalar(GenericValue::Integer(value))
    }

    pub fn string(value: impl Into<String>) -> Self {
        MethodValue::Scalar(GenericValue::String(value.into()))
    }

    pub fn reals(values: impl IntoIterator<Item = f64>) -> Self {
        MethodValue::Array(
            values
                .into_iter()
                .map(|v| GenericValue::Real(v as f32))
                .collect(),
        )
    }

    pub fn strings<S: Into<String>>(values: impl IntoIterator<Item = S>) -> Self {
        MethodValue::Array(
            values
                .into_iter()
                .map(|s| GenericValue::String(s.into()))
                .collect(),
        )
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self, MethodValue::Scalar(_))
    }
}

/// Keyword arguments of a method call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MethodArgs(BTreeMap<String, MethodValue>);

impl MethodArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: MethodValue) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Result<&MethodValue> {
        self.0
            .get(name)
            .ok_or_else(|| anyhow!("missing argument `{name}`"))
    }

    fn scalar(&self, name: &str) -> Result<&GenericValue> {
        match self.get(name)? {
            MethodValue::Scalar(value) => Ok(value),
            MethodValue::Array(_) => bail!("argument `{name}` must be a scalar"),
        }
    }

    fn array(&self, name: &str) -> Result<&[GenericValue]> {
        match self.get(name)? {
            MethodValue::Array(values) => Ok(values),
            MethodValue::Scalar(_) => bail!("argument `{name}` must be an array"),
        }
    }

    pub fn real(&self, name: &str) -> Result<f64> {
        self.scalar(name)?
            .as_f64()
            .ok_or_else(|| anyhow!("argument `{name}` must be numeric"))
    }

    pub fn integer(&self, name: &str) -> Result<i64> {
        match self.scalar(name)? {
            GenericValue::Integer(v) => Ok(*v),
            _ => bail!("argument `{name}` must be an integer"),
        }
    }

    pub fn string(&self, name: &str) -> Result<&str> {
        self.scalar(name)?
            .as_str()
            .ok_or_else(|| anyhow!("argument `{name}` must be a string"))
    }

    pub fn reals(&self, name: &str) -> Result<Vec<f64>> {
        self.array(name)?
            .iter()
            .map(|v| {
                v.as_f64()
                    .ok_or_else(|| anyhow!("argument `{name}` must contain only numbers"))
            })
            .collect()
    }

    pub fn strings(&self, name: &str) -> Result<Vec<&str>> {
        self.array(name)?
            .iter()
            .map(|v| {
                v.as_str()
                    .ok_or_else(|| anyhow!("argument `{name}` must contain only strings"))
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &MethodValue)> {
        self.0.iter()
    }
}

impl FromIterator<(String, MethodValue)> for MethodArgs {
    fn from_iter<I: IntoIterator<Item = (String, MethodValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}
