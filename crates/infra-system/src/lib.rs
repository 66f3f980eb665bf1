// Devfleet Infrastructure - System Adapters
// Implements: WorkerPoolFactory over OS processes, plus the worker side of the protocol

pub mod process_pool;
pub mod protocol;
pub mod worker_runtime;

pub use process_pool::{kill_graceful, ProcessPoolConfig, ProcessPoolFactory, ProcessWorkerPool};
pub use protocol::{WorkerInit, WorkerRequest, WorkerResponse};
pub use worker_runtime::{serve, serve_on, FrameWriter};
