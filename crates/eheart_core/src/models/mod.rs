//! Models shipped with the crate, registered by
//! [`ModelRegistry::with_builtin_models`](crate::registry::ModelRegistry::with_builtin_models).

pub mod cell_ring;
pub mod exp_decay;
pub mod fitzhugh_nagumo;
