//! The bytecode→circuit frontend: basic-block discovery, dominators, phi
//! placement, and gate emission.

pub mod args;
mod builder;

pub use builder::{BytecodeCircuitBuilder, FrontendInfo};
