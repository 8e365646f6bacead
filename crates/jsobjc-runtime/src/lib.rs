//! JsObjC runtime
//!
//! Drives bridges the way a host application does:
//! - One [`Isolate`] per thread, each with its own bridge and globals
//! - A run loop with microtasks, timers and cross-thread posts
//! - Promises that settle on the thread that created them
//! - Workers: isolates on their own threads, talking by structural copy
//! - JSON configuration and `tracing` bootstrap

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod console;
pub mod error;
pub mod isolate;
pub mod logging;
pub mod promise;
pub mod run_loop;
pub mod worker;

pub use config::{LogConfig, RuntimeConfig};
pub use console::Console;
pub use error::{RuntimeError, RuntimeResult};
pub use isolate::{Isolate, WeakIsolate};
pub use promise::{Promise, PromiseResolver, PromiseState};
pub use run_loop::{KeepAlive, LoopHandle, RemoteTask, TimerId};
pub use worker::{Worker, WorkerBody, WorkerScope};
