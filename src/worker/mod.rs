//! Job execution: the single-flight executor and the loop that feeds it.

pub mod driver;
pub mod executor;

pub use driver::WorkerLoop;
pub use executor::{Executor, ExecutorState, JobOutcome, JobResponse};
