//! Term representation and definitional-equality engine for a dependently
//! typed kernel: a hash-consed, reference-counted expression DAG (`expr`)
//! together with the weak-head-normalization-based convertibility checker
//! (`converter`) that decides it. The environment, macro, and constraint
//! layers this crate consumes (or emits into) from an embedding elaborator
//! are specified as traits in `env`, `macros`, and `constraint`, so that an
//! elaborator/tactic engine living outside this crate can plug in its own
//! declaration store and metavariable-solving loop without this crate
//! knowing anything about either.

#![forbid(unsafe_code)]

pub mod cli;
pub mod constraint;
pub mod converter;
pub mod env;
pub mod errors;
pub mod expr;
pub mod justification;
pub mod level;
pub mod macros;
pub mod name;
pub mod serial;
