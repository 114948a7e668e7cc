//! The sea-of-nodes intermediate representation of the kestrel compiler.
//!
//! A [`circuit::Circuit`] is a contiguous arena owning every IR node
//! ([`gate`]), wired by state, depend, value and root edges. Passes address
//! gates through stable [`gate::GateRef`] byte offsets and mutate the graph
//! through [`circuit::Circuit`] and [`accessor::GateAccessor`];
//! [`builder::CircuitBuilder`] provides typed constructors and
//! [`verifier::Verifier`] checks the structural contract of every opcode.

#![allow(clippy::too_many_arguments)]
#![allow(clippy::needless_range_loop)]

pub mod accessor;
pub mod builder;
pub mod circuit;
pub mod gate;
pub mod gate_type;
pub mod machine;
pub mod opcode;
pub mod tagged;
pub mod verifier;
pub mod visualizer;
