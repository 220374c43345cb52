//! Public runtime error types.
//!
//! Most failure flows through [`Cause`](crate::cause::Cause); the variants
//! here describe conditions the runtime itself detects. They surface as
//! defects (the caller did not declare them in an error channel) carrying a
//! `RuntimeError` payload inspectable via
//! [`Defect::downcast_ref`](crate::cause::Defect::downcast_ref).

use crate::cause::Defect;
use crate::fiber::id::FiberId;
use crate::fiber::refs::RefId;
use thiserror::Error;

/// Conditions detected by the runtime itself.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    /// The scheduler queue drained while the root fiber was still
    /// suspended: every live fiber is waiting on a resumption that can no
    /// longer arrive.
    #[error("no runnable fibers: fiber {root} is suspended with no pending resumption")]
    Deadlock {
        /// The fiber the blocking entrypoint was waiting on.
        root: FiberId,
    },

    /// A fiber ref's arena slot held a value of an unexpected type.
    #[error("fiber ref {id:?} holds a value of an unexpected type")]
    RefTypeMismatch {
        /// The offending ref.
        id: RefId,
    },

    /// A typed error escaped its declared error channel. The runtime
    /// converts it to a defect at the boundary instead of letting it
    /// impersonate a different error type.
    #[error("an error escaped its typed channel and was converted to a defect")]
    ErrorEscapedChannel,

    /// A fiber's result value was requested after it had already been
    /// consumed by an earlier `await`.
    #[error("fiber {fiber} result already consumed")]
    ResultConsumed {
        /// The fiber whose result was requested.
        fiber: FiberId,
    },
}

impl RuntimeError {
    /// Wraps this error as a defect payload.
    #[must_use]
    pub(crate) fn into_defect(self) -> Defect {
        let message = self.to_string();
        Defect::with_message(message, std::rc::Rc::new(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defect_payload_round_trips() {
        let defect = RuntimeError::Deadlock {
            root: FiberId::NONE,
        }
        .into_defect();
        assert!(defect.message().contains("no runnable fibers"));
        assert!(matches!(
            defect.downcast_ref::<RuntimeError>(),
            Some(RuntimeError::Deadlock { .. })
        ));
    }

    #[test]
    fn display_messages() {
        let e = RuntimeError::RefTypeMismatch { id: RefId(3) };
        assert!(e.to_string().contains("unexpected type"));
        let e = RuntimeError::ErrorEscapedChannel;
        assert!(e.to_string().contains("typed channel"));
    }
}
