//! Autonomous solver for chained quiz tasks.
//!
//! A run starts at one task URL. Each task page is fetched, classified and
//! solved (with a reasoning service writing and running code where needed),
//! the answer is submitted to a judge, and the judge's verdict either points
//! at the next task or ends the chain. The architecture keeps a strict split:
//!
//! - **[`core`]**: Pure, deterministic logic (run records, answer extraction,
//!   classification, escalation, budgets). No I/O.
//! - **[`io`]**: Side-effecting collaborators behind traits (page renderer,
//!   reasoner, sandbox, submitter, run store) so tests can script them.
//!
//! [`solve`] runs one attempt on one task and [`looping`] drives a whole run.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod solve;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
