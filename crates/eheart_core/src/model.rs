use crate::attributes::Attributes;
use crate::diffvar::Value;
use crate::method::{MethodArgs, MethodValue};

/// A user-defined system of ordinary differential equations.
///
/// `initialize_vars` runs exactly once, when the engine binds the model, and
/// declares every differential variable and constant on `attrs`.
/// `calc_ode` is called by the engine, never by the user during a solve. It
/// reads `t`, the variable values and the constants, and must set the
/// derivative of every declared variable before returning. `t` is either 0-d
/// or a batch of times; variable values carry the same trailing batch axis.
pub trait Model: Send {
    fn initialize_vars(&mut self, attrs: &mut Attributes);

    fn calc_ode(&self, t: &Value, attrs: &mut Attributes) -> anyhow::Result<()>;

    /// Invoke a named auxiliary method. Models without methods keep the default.
    fn call_method(
        &mut self,
        name: &str,
        args: &MethodArgs,
        attrs: &mut Attributes,
    ) -> anyhow::Result<Vec<MethodValue>> {
        let _ = (args, attrs);
        anyhow::bail!("model has no method named `{name}`")
    }
}
