//! Side-effecting collaborators: network, processes, storage, templates.

pub mod config;
pub mod process;
pub mod prompt;
pub mod reasoner;
pub mod renderer;
pub mod run_store;
pub mod sandbox;
pub mod submit;
