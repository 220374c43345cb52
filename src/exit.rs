//! The result of a completed fiber.
//!
//! [`Exit`] is a two-valued outcome: success with a value, or failure with a
//! structured [`Cause`]. The cause side subsumes typed errors, defects, and
//! interruption, so a single `Exit` fully describes how a fiber ended.

use crate::cause::{Cause, Defect};
use crate::fiber::id::FiberId;
use core::fmt;

/// The result of running an effect to completion.
#[derive(Clone, PartialEq, Eq)]
pub enum Exit<A, E> {
    /// The effect produced a value.
    Success(A),
    /// The effect failed with a structured cause.
    Failure(Cause<E>),
}

impl<A, E> Exit<A, E> {
    /// A successful exit.
    #[must_use]
    pub const fn succeed(value: A) -> Self {
        Self::Success(value)
    }

    /// A failed exit from a typed error.
    #[must_use]
    pub const fn fail(error: E) -> Self {
        Self::Failure(Cause::Fail(error))
    }

    /// A failed exit from a cause.
    #[must_use]
    pub const fn failure(cause: Cause<E>) -> Self {
        Self::Failure(cause)
    }

    /// A defect exit.
    #[must_use]
    pub const fn die(defect: Defect) -> Self {
        Self::Failure(Cause::Die(defect))
    }

    /// An interrupted exit attributed to `fiber`.
    #[must_use]
    pub const fn interrupted(fiber: FiberId) -> Self {
        Self::Failure(Cause::Interrupt(fiber))
    }

    /// Returns true if the exit is a success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Returns true if the exit is a failure of any kind.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Returns true if the exit is an interruption (and nothing else).
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Failure(cause) if cause.is_interrupted_only())
    }

    /// Returns the failure cause, if any.
    #[must_use]
    pub const fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Self::Success(_) => None,
            Self::Failure(cause) => Some(cause),
        }
    }

    /// Maps the success value.
    #[must_use]
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<B, E> {
        match self {
            Self::Success(a) => Exit::Success(f(a)),
            Self::Failure(cause) => Exit::Failure(cause),
        }
    }

    /// Maps the typed error values inside the cause.
    #[must_use]
    pub fn map_error<F>(self, f: impl FnMut(E) -> F) -> Exit<A, F> {
        match self {
            Self::Success(a) => Exit::Success(a),
            Self::Failure(cause) => Exit::Failure(cause.map(f)),
        }
    }

    /// Converts to a `Result`, collapsing the cause to its leftmost failure.
    ///
    /// Defect-only and interrupt-only causes become `Err(None)`.
    pub fn into_result(self) -> Result<A, Option<E>>
    where
        E: Clone,
    {
        match self {
            Self::Success(a) => Ok(a),
            Self::Failure(cause) => Err(cause.failure_option().cloned()),
        }
    }

    /// Returns the success value or panics.
    ///
    /// # Panics
    ///
    /// Panics if the exit is a failure. Test helper only.
    #[track_caller]
    pub fn unwrap(self) -> A
    where
        E: fmt::Debug,
    {
        match self {
            Self::Success(a) => a,
            Self::Failure(cause) => {
                panic!("called `Exit::unwrap()` on a failure: {cause:?}")
            }
        }
    }
}

impl<A, E> From<Result<A, E>> for Exit<A, E> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Self::Success(a),
            Err(e) => Self::fail(e),
        }
    }
}

impl<A: fmt::Debug, E: fmt::Debug> fmt::Debug for Exit<A, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(a) => write!(f, "Success({a:?})"),
            Self::Failure(cause) => write!(f, "Failure({cause:?})"),
        }
    }
}
