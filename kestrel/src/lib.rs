//! Ahead-of-time optimizing compiler core for a dynamic-language bytecode.
//!
//! The crate turns a linear bytecode stream into the sea-of-nodes circuit IR
//! of [`kestrel_ir`] and runs the pass pipeline over it: type inference,
//! type-directed lowering, generator control-flow rebuilding, generic
//! slow-path lowering, sparse conditional constant propagation and a local
//! peephole rewriter. A finalized circuit is handed to an external code
//! generator; executing code, allocating objects and selecting instructions
//! are not this crate's business.

#![allow(clippy::too_many_arguments)]
#![allow(clippy::needless_range_loop)]

pub use kestrel_ir as ir;

pub mod bytecode;
pub mod frontend;
pub mod pass;
pub mod passes;
pub mod ssa;
pub mod stubs;
pub mod type_loader;
