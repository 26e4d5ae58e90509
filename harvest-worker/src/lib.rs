//! In-process worker: claims tasks from a `Coordinator`, fetches them
//! through a pluggable `Fetcher`, and reports results back, the same
//! "queue -> process -> report" lifecycle `hook-worker` implements against
//! `PgQueue`, adapted to this substrate's in-process protocol.

pub mod error;
pub mod worker;

pub use error::WorkerError;
pub use worker::{WorkerLoop, WorkerLoopConfig};
