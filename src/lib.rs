//! Filament: a trampolined, cancel-correct effect runtime for Rust.
//!
//! # Overview
//!
//! Filament separates *describing* a computation from *running* it. An
//! [`Effect<A, E>`](Effect) is an immutable value describing work that can
//! succeed with an `A`, fail with an `E`, die with a defect, or be
//! interrupted. Nothing happens until a [`Runtime`] interprets the
//! description on a fiber: a lightweight, cooperatively scheduled thread of
//! execution with its own continuation stack.
//!
//! # Core Guarantees
//!
//! - **Stack safety**: the interpreter trampolines; a million chained
//!   `flat_map`s use constant native stack
//! - **No lost failures**: concurrent and sequential failures compose into a
//!   [`Cause`] tree instead of overwriting each other
//! - **Cancel-correctness**: interruption unwinds through `ensuring`
//!   finalizers and scope closes; an interrupted fiber never reports success
//! - **Structured concurrency**: a fiber's children are interrupted and
//!   awaited before its exit becomes observable (daemons opt out)
//! - **No ambient runtime**: all shared state hangs off a [`Runtime`] value;
//!   two runtimes in one process are independent
//!
//! # Module Structure
//!
//! - [`cause`]: The failure algebra (`Fail`/`Die`/`Interrupt`, sequential
//!   and parallel composition)
//! - [`exit`]: Terminal results
//! - [`effect`]: The typed effect surface and its combinators
//! - [`fiber`]: Fiber identity, runtime flags, fiber refs, the interpreter,
//!   and typed handles
//! - [`scope`]: Keyed finalizer registries with LIFO close
//! - [`scheduler`]: The cooperative two-lane scheduler contract
//! - [`supervisor`]: Fiber lifecycle observation hooks
//! - [`runtime`]: The runtime context and blocking entrypoint
//! - [`error`]: Runtime-detected error conditions
//!
//! # Example
//!
//! ```
//! use filament::{Effect, Runtime};
//! use std::convert::Infallible;
//!
//! let runtime = Runtime::new();
//! let effect = Effect::<_, Infallible>::succeed(20).map(|n| n * 2).map(|n| n + 2);
//! assert_eq!(runtime.run(effect).unwrap(), 42);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod cause;
pub mod effect;
pub mod error;
pub mod exit;
pub mod fiber;
pub mod runtime;
pub mod scheduler;
pub mod scope;
pub mod supervisor;

pub use cause::{Branch, Cause, Defect, Squashed};
pub use effect::{Effect, Restore, Resume};
pub use error::RuntimeError;
pub use exit::Exit;
pub use fiber::handle::Fiber;
pub use fiber::id::FiberId;
pub use fiber::refs::{FiberRef, LastWriteWins, RefAlgebra, RefId};
pub use fiber::flags::{FlagsPatch, RuntimeFlag, RuntimeFlags};
pub use runtime::{Runtime, RuntimeConfig};
pub use scope::{ExitStatus, FinalizerKey, Scope};
pub use supervisor::{FiberOutcome, NoopSupervisor, Supervisor};
