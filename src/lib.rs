//! declares, synthesizes and deploys the mayoche site as one cloudformation
//! stack, and publishes the frontend into it.
//!
//! the stack is assembled out of the `level2/` modules. each one takes an
//! `Input`, appends its resources to an `aws_cfn_stack::Input`, and hands back
//! the logical names the next module references.

pub mod assets;
pub mod config;
pub mod error;
pub mod stack;
pub mod telemetry;
pub mod variant;

pub use config::StackConfig;
pub use error::{Error, Result};
pub use stack::{build_stack, plan, synth};
pub use variant::{Features, Variant};
