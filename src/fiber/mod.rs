//! Fibers: identity, flags, contextual refs, the interpreter, and handles.

pub mod flags;
pub mod handle;
pub mod id;
pub mod refs;
pub(crate) mod runtime;
