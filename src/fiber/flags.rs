//! Runtime behavior toggles and their patch algebra.
//!
//! [`RuntimeFlags`] is a bitset of boolean toggles consulted by the
//! interpreter on every turn. Flags are changed for a bounded dynamic extent
//! through [`FlagsPatch`], an associative "which bits changed and to what"
//! encoding; the interpreter snapshots flags before applying a patch and
//! restores the snapshot exactly once when the extent completes, however it
//! completes.

use core::fmt;

/// A single runtime flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum RuntimeFlag {
    /// Interruption may be observed at safe points.
    Interruption = 1 << 0,
    /// The interpreter yields to the scheduler when the per-turn op budget
    /// is exceeded.
    CooperativeYielding = 1 << 1,
    /// Fork and termination events are reported to the installed supervisor.
    FiberSupervision = 1 << 2,
    /// The fiber is winding down: children are being interrupted and the
    /// body no longer runs.
    WindDown = 1 << 3,
}

impl RuntimeFlag {
    const fn mask(self) -> u32 {
        self as u32
    }
}

/// A bitset of active runtime flags.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RuntimeFlags(u32);

impl RuntimeFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);

    /// The default flag set: interruption, cooperative yielding, and fiber
    /// supervision enabled.
    #[must_use]
    pub const fn default_flags() -> Self {
        Self(
            RuntimeFlag::Interruption.mask()
                | RuntimeFlag::CooperativeYielding.mask()
                | RuntimeFlag::FiberSupervision.mask(),
        )
    }

    /// Returns true if `flag` is set.
    #[must_use]
    pub const fn is_enabled(self, flag: RuntimeFlag) -> bool {
        self.0 & flag.mask() != 0
    }

    /// Returns a copy with `flag` set.
    #[must_use]
    pub const fn enable(self, flag: RuntimeFlag) -> Self {
        Self(self.0 | flag.mask())
    }

    /// Returns a copy with `flag` cleared.
    #[must_use]
    pub const fn disable(self, flag: RuntimeFlag) -> Self {
        Self(self.0 & !flag.mask())
    }

    /// True if interruption may currently be observed.
    #[must_use]
    pub const fn interruption(self) -> bool {
        self.is_enabled(RuntimeFlag::Interruption)
    }

    /// True if cooperative yielding is active.
    #[must_use]
    pub const fn cooperative_yielding(self) -> bool {
        self.is_enabled(RuntimeFlag::CooperativeYielding)
    }

    /// True if supervisor reporting is active.
    #[must_use]
    pub const fn fiber_supervision(self) -> bool {
        self.is_enabled(RuntimeFlag::FiberSupervision)
    }

    /// True if the fiber is winding down.
    #[must_use]
    pub const fn wind_down(self) -> bool {
        self.is_enabled(RuntimeFlag::WindDown)
    }

    /// Computes the patch transforming `self` into `target`.
    #[must_use]
    pub const fn diff(self, target: Self) -> FlagsPatch {
        let changed = self.0 ^ target.0;
        FlagsPatch {
            changed,
            target: target.0 & changed,
        }
    }

    /// Applies a patch to this flag set.
    #[must_use]
    pub const fn patch(self, patch: FlagsPatch) -> Self {
        Self((self.0 & !patch.changed) | (patch.target & patch.changed))
    }
}

impl Default for RuntimeFlags {
    fn default() -> Self {
        Self::default_flags()
    }
}

impl fmt::Debug for RuntimeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for (flag, name) in [
            (RuntimeFlag::Interruption, "Interruption"),
            (RuntimeFlag::CooperativeYielding, "CooperativeYielding"),
            (RuntimeFlag::FiberSupervision, "FiberSupervision"),
            (RuntimeFlag::WindDown, "WindDown"),
        ] {
            if self.is_enabled(flag) {
                set.entry(&name);
            }
        }
        set.finish()
    }
}

/// An associative patch over [`RuntimeFlags`].
///
/// Encodes which bits changed and their target values. `combine` is
/// associative with [`FlagsPatch::EMPTY`] as identity; on overlapping bits
/// the second patch wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlagsPatch {
    changed: u32,
    target: u32,
}

impl FlagsPatch {
    /// The identity patch: changes nothing.
    pub const EMPTY: Self = Self {
        changed: 0,
        target: 0,
    };

    /// A patch that sets `flag`.
    #[must_use]
    pub const fn enable(flag: RuntimeFlag) -> Self {
        Self {
            changed: flag.mask(),
            target: flag.mask(),
        }
    }

    /// A patch that clears `flag`.
    #[must_use]
    pub const fn disable(flag: RuntimeFlag) -> Self {
        Self {
            changed: flag.mask(),
            target: 0,
        }
    }

    /// Sequential composition; on overlapping bits `second` wins.
    #[must_use]
    pub const fn combine(self, second: Self) -> Self {
        Self {
            changed: self.changed | second.changed,
            target: (self.target & !second.changed) | second.target,
        }
    }

    /// Returns true if the patch changes nothing.
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.changed == 0
    }

    /// Returns true if the patch touches `flag`.
    #[must_use]
    pub const fn touches(self, flag: RuntimeFlag) -> bool {
        self.changed & flag.mask() != 0
    }
}

impl Default for FlagsPatch {
    fn default() -> Self {
        Self::EMPTY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_flags() {
        let flags = RuntimeFlags::default();
        assert!(flags.interruption());
        assert!(flags.cooperative_yielding());
        assert!(flags.fiber_supervision());
        assert!(!flags.wind_down());
    }

    #[test]
    fn enable_disable_round_trip() {
        let flags = RuntimeFlags::NONE.enable(RuntimeFlag::Interruption);
        assert!(flags.interruption());
        assert!(!flags.disable(RuntimeFlag::Interruption).interruption());
    }

    // =========================================================================
    // Patch Algebra Laws
    // =========================================================================

    #[test]
    fn diff_then_patch_round_trips() {
        let a = RuntimeFlags::default();
        let b = RuntimeFlags::NONE.enable(RuntimeFlag::WindDown);
        assert_eq!(a.patch(a.diff(b)), b);
        assert_eq!(b.patch(b.diff(a)), a);
    }

    #[test]
    fn combine_is_associative() {
        let p1 = FlagsPatch::disable(RuntimeFlag::Interruption);
        let p2 = FlagsPatch::enable(RuntimeFlag::WindDown);
        let p3 = FlagsPatch::enable(RuntimeFlag::Interruption);

        let left = p1.combine(p2).combine(p3);
        let right = p1.combine(p2.combine(p3));
        assert_eq!(left, right);
    }

    #[test]
    fn empty_is_identity_for_combine() {
        let p = FlagsPatch::disable(RuntimeFlag::CooperativeYielding);
        assert_eq!(FlagsPatch::EMPTY.combine(p), p);
        assert_eq!(p.combine(FlagsPatch::EMPTY), p);
        assert!(FlagsPatch::EMPTY.is_empty());
    }

    #[test]
    fn second_patch_wins_on_overlap() {
        let disable = FlagsPatch::disable(RuntimeFlag::Interruption);
        let enable = FlagsPatch::enable(RuntimeFlag::Interruption);

        let flags = RuntimeFlags::default();
        assert!(flags.patch(disable.combine(enable)).interruption());
        assert!(!flags.patch(enable.combine(disable)).interruption());
    }

    #[test]
    fn transitive_diff_law() {
        // patch(combine(diff(a,b), diff(b,c)), a) == patch(diff(a,c), a)
        let a = RuntimeFlags::NONE;
        let b = RuntimeFlags::default();
        let c = RuntimeFlags::NONE.enable(RuntimeFlag::WindDown);

        let via_b = a.patch(a.diff(b).combine(b.diff(c)));
        let direct = a.patch(a.diff(c));
        assert_eq!(via_b, direct);
        assert_eq!(direct, c);
    }

    #[test]
    fn touches_reports_changed_bits() {
        let p = FlagsPatch::disable(RuntimeFlag::Interruption);
        assert!(p.touches(RuntimeFlag::Interruption));
        assert!(!p.touches(RuntimeFlag::WindDown));
    }
}
