//! Fiber identity.
//!
//! Every fiber is assigned a [`FiberId`] at fork time by the owning
//! [`Runtime`](crate::runtime::Runtime). Ids carry a monotonic sequence
//! number (scoped to the runtime instance, never a bare module global), the
//! wall-clock second the fiber started, and the source location of the fork
//! call for diagnostics.

use core::fmt;
use std::panic::Location;

/// A unique identifier for a fiber.
///
/// Ids are minted by the runtime context at fork time. The sequence number
/// is monotonic within one runtime instance; two runtimes may reuse the same
/// sequence values.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId {
    sequence: u64,
    start_time_seconds: u64,
    origin: Option<&'static Location<'static>>,
}

impl FiberId {
    /// The absence sentinel: no fiber.
    ///
    /// Used where an interruption or ownership source is unknown, for
    /// example when a runtime-external caller interrupts a fiber.
    pub const NONE: Self = Self {
        sequence: 0,
        start_time_seconds: 0,
        origin: None,
    };

    /// Creates a fiber id (internal: ids are minted by the runtime).
    #[must_use]
    pub(crate) const fn new(
        sequence: u64,
        start_time_seconds: u64,
        origin: Option<&'static Location<'static>>,
    ) -> Self {
        Self {
            sequence,
            start_time_seconds,
            origin,
        }
    }

    /// Returns the monotonic sequence number assigned at fork time.
    #[must_use]
    pub const fn sequence(self) -> u64 {
        self.sequence
    }

    /// Returns the wall-clock second at which the fiber started.
    #[must_use]
    pub const fn start_time_seconds(self) -> u64 {
        self.start_time_seconds
    }

    /// Returns the source location of the fork call, if known.
    #[must_use]
    pub const fn origin(self) -> Option<&'static Location<'static>> {
        self.origin
    }

    /// Returns true if this is the absence sentinel.
    #[must_use]
    pub const fn is_none(self) -> bool {
        self.sequence == 0 && self.origin.is_none()
    }
}

impl fmt::Debug for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            return write!(f, "FiberId(none)");
        }
        write!(f, "FiberId(#{}", self.sequence)?;
        if let Some(origin) = self.origin {
            write!(f, " @ {}:{}", origin.file(), origin.line())?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "F-none")
        } else {
            write!(f, "F{}", self.sequence)
        }
    }
}

impl Default for FiberId {
    fn default() -> Self {
        Self::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[track_caller]
    fn mint(sequence: u64) -> FiberId {
        FiberId::new(sequence, 7, Some(Location::caller()))
    }

    #[test]
    fn none_sentinel_is_none() {
        assert!(FiberId::NONE.is_none());
        assert!(!mint(1).is_none());
        assert_eq!(FiberId::default(), FiberId::NONE);
    }

    #[test]
    fn sequence_ordering() {
        assert!(mint(1) < mint(2));
        assert_eq!(mint(3).sequence(), 3);
    }

    #[test]
    fn display_forms() {
        assert_eq!(FiberId::NONE.to_string(), "F-none");
        assert_eq!(mint(42).to_string(), "F42");
    }

    #[test]
    fn origin_is_captured() {
        let id = mint(1);
        let origin = id.origin().expect("minted ids carry an origin");
        assert!(origin.file().ends_with("id.rs"));
    }
}
