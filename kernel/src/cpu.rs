use core::fmt;

use crate::{
    arch::hart_id,
    symbols::{BSP_HART, N_CPUS},
};

/// A hart index known to be below `N_CPUS`.
/// Every per-core array in the kernel is indexed by it, so the bounds
/// check happens once, when the id is made.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct CoreId(usize);

impl CoreId {
    pub const BSP: CoreId = CoreId(BSP_HART);

    pub const fn new(id: usize) -> Option<Self> {
        if id < N_CPUS {
            Some(Self(id))
        } else {
            None
        }
    }

    /// the core executing this call
    pub fn current() -> Self {
        let hartid = hart_id();
        match Self::new(hartid) {
            Some(id) => id,
            None => panic!("CoreId::current: hart {} beyond N_CPUS", hartid),
        }
    }

    pub fn all() -> impl Iterator<Item = CoreId> {
        (0..N_CPUS).map(CoreId)
    }

    pub fn is_bsp(self) -> bool {
        self == Self::BSP
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// whether the calling core is the one that boots the registry
pub fn is_bsp() -> bool {
    CoreId::current().is_bsp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::bind_hart;

    #[test]
    fn ids_beyond_n_cpus_are_unrepresentable() {
        assert!(CoreId::new(N_CPUS - 1).is_some());
        assert!(CoreId::new(N_CPUS).is_none());
        assert_eq!(CoreId::all().count(), N_CPUS);
    }

    #[test]
    fn current_follows_the_bound_hart() {
        bind_hart(3);
        assert_eq!(CoreId::current().as_usize(), 3);
        assert!(!is_bsp());
        bind_hart(BSP_HART);
        assert!(is_bsp());
    }
}
