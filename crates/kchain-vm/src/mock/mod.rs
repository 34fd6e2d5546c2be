//! In-memory world and closure-backed engine for exercising the host
//! without real bytecode.

mod engine;
mod world;

pub use engine::{ContractFunction, MockContract, MockEngine};
pub use world::{MockWorld, DCDT_BUILTIN_COST};
