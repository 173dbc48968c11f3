//! Built-in kernel modules.

pub mod state;

pub use state::StateModule;
