pub mod cell;
pub mod context;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod resource;
pub mod symbol;
pub mod transform;
pub mod value;

#[cfg(test)]
pub mod harness;
