//! Wire types of the session protocol.
//!
//! A request is an envelope of a [`Command`] and a type-erased JSON
//! parameter whose concrete shape is implied by the command. A response is
//! one of the [`Response`] variants; every failure is a `Status` response.

use std::collections::BTreeMap;
use std::fmt;

use eheart_core::engine::Samples;
use eheart_core::method::{GenericValue, MethodValue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    Init,
    SetDiffvarVal,
    GetDiffvarName,
    GetCurrentVal,
    SetWatchingVar,
    SolveIvp,
    ChangeTime,
    SetModelConst,
    EvalModelVar,
    CallModelMethod,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Command::Init => "INIT",
            Command::SetDiffvarVal => "SET_DIFFVAR_VAL",
            Command::GetDiffvarName => "GET_DIFFVAR_NAME",
            Command::GetCurrentVal => "GET_CURRENT_VAL",
            Command::SetWatchingVar => "SET_WATCHING_VAR",
            Command::SolveIvp => "SOLVE_IVP",
            Command::ChangeTime => "CHANGE_TIME",
            Command::SetModelConst => "SET_MODEL_CONST",
            Command::EvalModelVar => "EVAL_MODEL_VAR",
            Command::CallModelMethod => "CALL_MODEL_METHOD",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed request: {0}")]
    Malformed(serde_json::Error),

    #[error("Invalid parameter for {command}: {source}")]
    Parameter {
        command: Command,
        source: serde_json::Error,
    },

    #[error("Invalid value for argument `{name}`: {message}")]
    Argument { name: String, message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: Command,
    #[serde(default)]
    pub parameter: serde_json::Value,
}

impl Request {
    pub fn new(command: Command, parameter: serde_json::Value) -> Self {
        Self { command, parameter }
    }

    /// Decode a request from one line of text.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Malformed)
    }

    /// Decode the parameter into the type implied by the command. A missing
    /// parameter decodes as an empty object.
    pub fn param<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let value = if self.parameter.is_null() {
            serde_json::Value::Object(serde_json::Map::new())
        } else {
            self.parameter.clone()
        };
        serde_json::from_value(value).map_err(|source| ProtocolError::Parameter {
            command: self.command,
            source,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitParam {
    /// Registered model name.
    pub model: String,
    #[serde(default)]
    pub t: f64,
    /// Integrator options: `init_step`, `min_step`, `max_step`, `rtol`,
    /// `atol`, `max_steps`.
    #[serde(default)]
    pub options: BTreeMap<String, f64>,
}

/// A differential-variable value: a number for scalar variables, a flat
/// row-major list for array variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NumberOrArray {
    Number(f64),
    Array(Vec<f64>),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetDiffvarValParam {
    pub valmap: BTreeMap<String, NumberOrArray>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetWatchingVarParam {
    pub vars: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SolveIVPParam {
    pub tn: f64,
    #[serde(default)]
    pub output_interval: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChangeTimeParam {
    /// New current time; the current time is kept when omitted.
    #[serde(default)]
    pub t: Option<f64>,
    #[serde(default)]
    pub options: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SetModelConstParam {
    pub valmap: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EvalModelVarParam {
    pub vars: Vec<String>,
    #[serde(default)]
    pub t: Option<f64>,
    #[serde(default)]
    pub y: Option<Vec<f64>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallModelMethodParam {
    pub method_name: String,
    #[serde(default)]
    pub args: BTreeMap<String, GenericScalarOrArray>,
}

/// A method argument or return value as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenericScalarOrArray {
    pub isscalar: bool,
    pub value: Vec<GenericValue>,
}

impl GenericScalarOrArray {
    pub fn into_method_value(self, name: &str) -> Result<MethodValue, ProtocolError> {
        if !self.isscalar {
            return Ok(MethodValue::Array(self.value));
        }
        let len = self.value.len();
        let mut values = self.value.into_iter();
        match (values.next(), len) {
            (Some(value), 1) => Ok(MethodValue::Scalar(value)),
            _ => Err(ProtocolError::Argument {
                name: name.to_string(),
                message: format!("a scalar must carry exactly one value, got {len}"),
            }),
        }
    }
}

impl From<MethodValue> for GenericScalarOrArray {
    fn from(value: MethodValue) -> Self {
        match value {
            MethodValue::Scalar(v) => Self {
                isscalar: true,
                value: vec![v],
            },
            MethodValue::Array(values) => Self {
                isscalar: false,
                value: values,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub values: Vec<f64>,
}

impl From<Vec<f64>> for Series {
    fn from(values: Vec<f64>) -> Self {
        Self { values }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Status {
        success: bool,
        message: String,
    },
    DiffvarName {
        names: Vec<String>,
    },
    CurrentVal {
        t: f64,
        y: Vec<f64>,
    },
    Solution {
        t: Series,
        diffvars: Vec<Series>,
        watching_vars: Vec<Series>,
    },
    ValueArray {
        values: Vec<f64>,
    },
    MethodReturn {
        return_value: Vec<GenericScalarOrArray>,
    },
}

impl Response {
    pub fn ok() -> Self {
        Response::Status {
            success: true,
            message: String::new(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Response::Status {
            success: false,
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, Response::Status { success: false, .. })
    }
}

impl From<Samples> for Response {
    fn from(samples: Samples) -> Self {
        Response::Solution {
            t: samples.t.into(),
            diffvars: samples.diffvars.into_iter().map(Series::from).collect(),
            watching_vars: samples.watching.into_iter().map(Series::from).collect(),
        }
    }
}
