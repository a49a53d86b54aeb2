//! The table of groups and the lazy group switch.
//!
//! Any core may *propose* a group for another core: it stages the owner's
//! slot in the target group and publishes the target. Only the owner ever
//! *applies* it, from its own `resolve`, once its `can_update` gate is open.
//! Applying is where the owner's address-context register changes, so no
//! core ever writes another core's hardware state.

use core::{
    alloc::Layout,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::{
    addr_context::AddressContext,
    allocator::{AllocError, PhysAlloc},
    arch::hart_id,
    cpu::CoreId,
    debug, info,
    symbols::N_CPUS,
};

use super::{
    group::{DcbSlot, Group, GroupId},
    GroupError,
};

// `cur_group` / `pending` entry holding no group
const NO_GROUP: usize = usize::MAX;

pub struct GroupRegistry {
    groups: [Group; N_CPUS],
    // per core, index into `groups`. written by the owning core only
    cur_group: [AtomicUsize; N_CPUS],
    // per core, proposed next group. any core writes, the owner takes
    pending: [AtomicUsize; N_CPUS],
    // per core, whether the owner may apply its pending group
    can_update: [AtomicBool; N_CPUS],
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self {
            groups: core::array::from_fn(|i| match GroupId::new(i) {
                Some(id) => Group::new(id),
                None => unreachable!(),
            }),
            cur_group: core::array::from_fn(|_| AtomicUsize::new(NO_GROUP)),
            pending: core::array::from_fn(|_| AtomicUsize::new(NO_GROUP)),
            can_update: core::array::from_fn(|_| AtomicBool::new(false)),
        }
    }

    /// Place a fresh registry in memory from `pool`.
    pub fn create_in(pool: &dyn PhysAlloc) -> Result<&'static Self, AllocError> {
        let ptr: NonNull<Self> = pool.allocate(Layout::new::<Self>())?.cast();
        // safety: `PhysAlloc` memory is aligned, exclusive and never reclaimed
        unsafe {
            ptr.as_ptr().write(Self::new());
            Ok(&*ptr.as_ptr())
        }
    }

    pub fn lookup(&self, id: GroupId) -> &Group {
        &self.groups[id.as_usize()]
    }

    /// `None` until `core` has run `init_core`
    pub fn current_group_for(&self, core: CoreId) -> Option<&Group> {
        self.group_at(self.cur_group[core.as_usize()].load(Ordering::Acquire))
    }

    pub fn pending_target(&self, core: CoreId) -> Option<&Group> {
        self.group_at(self.pending[core.as_usize()].load(Ordering::Acquire))
    }

    pub fn can_update(&self, core: CoreId) -> bool {
        self.can_update[core.as_usize()].load(Ordering::Acquire)
    }

    /// let `core` apply its pending group on its next `resolve`
    pub fn grant_update(&self, core: CoreId) {
        self.can_update[core.as_usize()].store(true, Ordering::Release);
    }

    pub fn revoke_update(&self, core: CoreId) {
        self.can_update[core.as_usize()].store(false, Ordering::Release);
    }

    fn group_at(&self, index: usize) -> Option<&Group> {
        GroupId::new(index).map(|id| self.lookup(id))
    }

    /// Put `core` into the group named after it. Runs once, on `core`.
    ///
    /// The group captures whatever address context `core` booted with, and
    /// its lock is allocated from `pool`.
    pub fn init_core(
        &self,
        core: CoreId,
        ctx: &dyn AddressContext,
        pool: &dyn PhysAlloc,
    ) -> Result<&Group, GroupError> {
        let group = self.lookup(GroupId::from(core));
        // a failed allocation leaves the group as it was
        group.init_lock(pool)?;
        group.set_enabled(true);
        // installing the live token hands it straight back
        group.set_addr_token(ctx.install(ctx.read()));
        group.with_core_state(core, |state| state.enabled = true)?;

        // published last: a current group is always a usable one
        self.cur_group[core.as_usize()].store(group.id().as_usize(), Ordering::Release);
        info!(
            "GroupRegistry::init_core: core {} in group {}, addr token {}, lock from {} pool",
            core,
            group.id(),
            group.addr_token(),
            pool.name()
        );
        Ok(group)
    }

    /// Ask `owner` to move into `target`. Does not wait for it.
    ///
    /// Closes `owner`'s gate, so the switch happens only after the owner
    /// grants it. A later proposal replaces an unapplied one.
    pub fn propose_switch(&self, owner: CoreId, target: GroupId) -> Result<(), GroupError> {
        let group = self.lookup(target);
        group.with_core_state(owner, |state| {
            state.dcb_current = DcbSlot::SwitchPending;
            state.kcb_current = None;
        })?;

        let o = owner.as_usize();
        // the gate closes before the target shows up, so an owner that sees
        // the new target also sees the closed gate
        self.can_update[o].store(false, Ordering::Relaxed);
        self.pending[o].store(target.as_usize(), Ordering::Release);
        info!(
            "GroupRegistry::propose_switch: core {} to group {}, token {}, asked by hart {}",
            owner,
            target,
            group.addr_token(),
            hart_id()
        );
        Ok(())
    }

    /// The group `core` should run in right now. Must run on `core`.
    ///
    /// Applies the pending group if the gate is open; otherwise the
    /// current group comes back unchanged.
    pub fn resolve(&self, core: CoreId, ctx: &dyn AddressContext) -> Result<&Group, GroupError> {
        let c = core.as_usize();
        let current = self
            .current_group_for(core)
            .ok_or(GroupError::CoreInactive(core))?;

        let pending = self.pending[c].load(Ordering::Acquire);
        if pending == NO_GROUP {
            return Ok(current);
        }
        if !self.can_update[c].load(Ordering::Acquire) {
            debug!(
                "GroupRegistry::resolve: core {} cannot switch to group {} yet",
                core, pending
            );
            return Ok(current);
        }

        // a proposal that raced in after the gate check closed the gate again;
        // leave it for the next resolve
        if self.pending[c]
            .compare_exchange(pending, NO_GROUP, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(current);
        }

        match self.group_at(pending) {
            Some(target) => {
                self.switch(core, current, target, ctx)?;
                Ok(target)
            }
            None => Ok(current),
        }
    }

    /// Spin on `resolve` until one pending group is applied or `spins` run out.
    ///
    /// Returns as soon as `core` changes group, even if a newer proposal
    /// arrived meanwhile; that one waits for a later `resolve`.
    pub fn wait_for_switch(
        &self,
        core: CoreId,
        ctx: &dyn AddressContext,
        spins: usize,
    ) -> Result<&Group, GroupError> {
        let c = core.as_usize();
        for _ in 0..spins {
            let before = self.cur_group[c].load(Ordering::Acquire);
            let group = self.resolve(core, ctx)?;
            if group.id().as_usize() != before
                || self.pending[c].load(Ordering::Acquire) == NO_GROUP
            {
                return Ok(group);
            }
            core::hint::spin_loop();
        }

        match self.pending_target(core) {
            Some(target) => {
                info!(
                    "GroupRegistry::wait_for_switch: core {} gave up on group {} after {} spins",
                    core,
                    target.id(),
                    spins
                );
                Err(GroupError::SwitchTimeout {
                    core,
                    target: target.id(),
                    spins,
                })
            }
            // applied on the last spin
            None => self.resolve(core, ctx),
        }
    }

    fn switch(
        &self,
        core: CoreId,
        from: &Group,
        to: &Group,
        ctx: &dyn AddressContext,
    ) -> Result<(), GroupError> {
        to.with_core_state(core, |state| {
            state.enabled = true;
            if state.dcb_current == DcbSlot::SwitchPending {
                state.dcb_current = DcbSlot::Idle;
            }
        })?;
        if from.id() != to.id() {
            from.with_core_state(core, |state| {
                state.enabled = false;
                state.dcb_current = DcbSlot::Idle;
                state.kcb_current = None;
            })?;
        }

        ctx.install(to.addr_token());
        self.cur_group[core.as_usize()].store(to.id().as_usize(), Ordering::Release);
        info!(
            "GroupRegistry::switch: core {} from group {} to group {}",
            core,
            from.id(),
            to.id()
        );
        Ok(())
    }
}

impl Default for GroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{cell::Cell, thread};

    use super::*;
    use crate::{
        addr_context::{sim::SimRegister, AddrToken},
        allocator::region_allocator::RegionAllocator,
        group::group::{DcbRef, KcbRef, PerCoreState},
        symbols::SWITCH_SPIN_LIMIT,
    };

    fn core(id: usize) -> CoreId {
        CoreId::new(id).unwrap()
    }

    fn group(id: usize) -> GroupId {
        GroupId::new(id).unwrap()
    }

    fn token_of(core: usize) -> usize {
        0x8010_0000 + core * 0x1000
    }

    /// A registry with cores `0..n` initialised, each with its own register.
    fn booted(n: usize) -> (&'static GroupRegistry, Vec<SimRegister>) {
        let pool: &'static _ = Box::leak(Box::new(RegionAllocator::leaked("Test", 8192)));
        let registry = GroupRegistry::create_in(pool).unwrap();
        let regs: Vec<_> = (0..n).map(|c| SimRegister::new(token_of(c))).collect();
        for (c, reg) in regs.iter().enumerate() {
            registry.init_core(core(c), reg, pool).unwrap();
        }
        (registry, regs)
    }

    #[test]
    fn every_core_starts_in_its_own_group() {
        let (registry, regs) = booted(N_CPUS);
        for c in CoreId::all() {
            let current = registry.current_group_for(c).unwrap();
            assert_eq!(current.id(), GroupId::from(c));
            assert!(current.is_enabled());
            assert_eq!(current.addr_token(), AddrToken::new(token_of(c.as_usize())));
            assert_eq!(current.members().collect::<Vec<_>>(), vec![c]);
            // capturing the token leaves the register alone
            assert_eq!(regs[c.as_usize()].read(), current.addr_token());
        }
    }

    #[test]
    fn uninitialised_cores_have_no_group() {
        let (registry, _regs) = booted(1);
        let reg = SimRegister::new(0);
        assert!(registry.current_group_for(core(1)).is_none());
        assert!(matches!(
            registry.resolve(core(1), &reg),
            Err(GroupError::CoreInactive(c)) if c == core(1)
        ));
        assert!(!registry.lookup(group(1)).is_initialised());
    }

    #[test]
    fn failed_lock_allocation_leaves_the_core_out() {
        let pool = RegionAllocator::leaked("Test", 8192);
        let registry = GroupRegistry::create_in(&pool).unwrap();
        let tiny = RegionAllocator::leaked("Tiny", 8);
        let reg = SimRegister::new(token_of(1));

        assert!(matches!(
            registry.init_core(core(1), &reg, &tiny),
            Err(GroupError::Alloc(AllocError::Exhausted { pool: "Tiny", .. }))
        ));
        let home = registry.lookup(group(1));
        assert!(!home.is_enabled());
        assert!(!home.is_initialised());
        assert_eq!(home.addr_token(), AddrToken::default());
        assert!(registry.current_group_for(core(1)).is_none());

        // a later attempt with enough memory succeeds
        let joined = registry.init_core(core(1), &reg, &pool).unwrap();
        assert_eq!(joined.id(), group(1));
        assert!(joined.is_enabled());
    }

    #[test]
    fn registry_allocation_failure_is_reported() {
        let pool = RegionAllocator::leaked("Tiny", 16);
        assert!(matches!(
            GroupRegistry::create_in(&pool),
            Err(AllocError::Exhausted { pool: "Tiny", .. })
        ));
    }

    #[test]
    fn proposing_to_an_unset_group_fails() {
        let (registry, _regs) = booted(1);
        assert_eq!(
            registry.propose_switch(core(0), group(3)),
            Err(GroupError::Uninitialised(group(3)))
        );
        assert!(registry.pending_target(core(0)).is_none());
    }

    #[test]
    fn proposal_stages_the_slot_and_closes_the_gate() {
        let (registry, regs) = booted(2);
        registry
            .lookup(group(0))
            .with_core_state(core(1), |s| s.kcb_current = Some(KcbRef(0xdead_0000)))
            .unwrap();
        registry.grant_update(core(1));

        registry.propose_switch(core(1), group(0)).unwrap();

        assert!(!registry.can_update(core(1)));
        assert_eq!(registry.pending_target(core(1)).unwrap().id(), group(0));
        assert_eq!(
            registry.lookup(group(0)).core_state(core(1)),
            Some(PerCoreState {
                dcb_current: DcbSlot::SwitchPending,
                kcb_current: None,
                enabled: false,
            })
        );
        // nobody touched core 1's register yet
        assert_eq!(regs[1].read(), AddrToken::new(token_of(1)));
    }

    #[test]
    fn closed_gate_never_moves_the_core() {
        let (registry, regs) = booted(2);
        registry.propose_switch(core(1), group(0)).unwrap();

        for _ in 0..100 {
            let current = registry.resolve(core(1), &regs[1]).unwrap();
            assert_eq!(current.id(), group(1));
        }
        assert_eq!(registry.current_group_for(core(1)).unwrap().id(), group(1));
        assert_eq!(regs[1].read(), AddrToken::new(token_of(1)));
        assert!(registry.pending_target(core(1)).is_some());
    }

    #[test]
    fn granted_switch_applies_once() {
        let (registry, regs) = booted(2);
        registry.propose_switch(core(1), group(0)).unwrap();
        registry.grant_update(core(1));

        let now = registry.resolve(core(1), &regs[1]).unwrap();
        assert_eq!(now.id(), group(0));
        assert_eq!(registry.current_group_for(core(1)).unwrap().id(), group(0));
        assert!(registry.pending_target(core(1)).is_none());
        assert_eq!(regs[1].read(), AddrToken::new(token_of(0)));

        // slots moved with the core
        let joined = registry.lookup(group(0)).core_state(core(1)).unwrap();
        assert!(joined.enabled);
        assert_eq!(joined.dcb_current, DcbSlot::Idle);
        assert!(!registry.lookup(group(1)).core_state(core(1)).unwrap().enabled);
        assert_eq!(
            registry.lookup(group(0)).members().collect::<Vec<_>>(),
            vec![core(0), core(1)]
        );
        assert_eq!(registry.lookup(group(1)).members().count(), 0);

        // nothing pending: further resolves are no-ops
        regs[1].install(AddrToken::new(0x1234));
        for _ in 0..3 {
            assert_eq!(registry.resolve(core(1), &regs[1]).unwrap().id(), group(0));
        }
        assert_eq!(regs[1].read(), AddrToken::new(0x1234));
    }

    #[test]
    fn later_proposal_replaces_an_unapplied_one() {
        let (registry, regs) = booted(3);
        registry.propose_switch(core(2), group(0)).unwrap();
        registry.propose_switch(core(2), group(1)).unwrap();
        registry.grant_update(core(2));

        assert_eq!(registry.resolve(core(2), &regs[2]).unwrap().id(), group(1));
        assert_eq!(regs[2].read(), AddrToken::new(token_of(1)));
    }

    #[test]
    fn switching_back_home_keeps_the_slot_enabled() {
        let (registry, regs) = booted(2);
        registry.propose_switch(core(0), group(0)).unwrap();
        registry.grant_update(core(0));

        assert_eq!(registry.resolve(core(0), &regs[0]).unwrap().id(), group(0));
        assert!(registry.lookup(group(0)).core_state(core(0)).unwrap().enabled);
    }

    #[test]
    fn running_dcb_survives_in_the_group_it_stays_in() {
        let (registry, regs) = booted(2);
        let home = registry.lookup(group(1));
        home.with_core_state(core(1), |s| {
            s.dcb_current = DcbSlot::Running(DcbRef(0x4000))
        })
        .unwrap();

        registry.propose_switch(core(1), group(0)).unwrap();
        assert_eq!(
            home.core_state(core(1)).unwrap().dcb_current,
            DcbSlot::Running(DcbRef(0x4000))
        );

        registry.grant_update(core(1));
        registry.resolve(core(1), &regs[1]).unwrap();
        assert_eq!(home.core_state(core(1)).unwrap().dcb_current, DcbSlot::Idle);
    }

    #[test]
    fn two_core_handshake() {
        let (registry, regs) = booted(2);

        // core 0 asks core 1 to move into group 0
        thread::scope(|s| {
            s.spawn(|| {
                crate::arch::bind_hart(0);
                registry.propose_switch(core(1), group(0)).unwrap();
            });
        });

        for _ in 0..5 {
            let current = registry.resolve(core(1), &regs[1]).unwrap();
            assert_eq!(current.id(), group(1));
        }

        registry.grant_update(core(1));
        let current = registry.resolve(core(1), &regs[1]).unwrap();
        assert_eq!(current.id(), group(0));
        assert_eq!(regs[1].read(), registry.lookup(group(0)).addr_token());
        assert!(registry.pending_target(core(1)).is_none());
    }

    #[test]
    fn wait_gives_up_while_the_gate_stays_closed() {
        let (registry, regs) = booted(2);
        registry.propose_switch(core(1), group(0)).unwrap();

        assert_eq!(
            registry.wait_for_switch(core(1), &regs[1], 64).map(|g| g.id()),
            Err(GroupError::SwitchTimeout {
                core: core(1),
                target: group(0),
                spins: 64,
            })
        );
        assert_eq!(registry.current_group_for(core(1)).unwrap().id(), group(1));
    }

    /// Register that queues another proposal for its core while a switch
    /// is being installed.
    struct ReproposingRegister<'a> {
        reg: SimRegister,
        registry: &'a GroupRegistry,
        owner: CoreId,
        next: Cell<Option<GroupId>>,
    }

    impl AddressContext for ReproposingRegister<'_> {
        fn read(&self) -> AddrToken {
            self.reg.read()
        }

        fn install(&self, token: AddrToken) -> AddrToken {
            if let Some(next) = self.next.take() {
                self.registry.propose_switch(self.owner, next).unwrap();
            }
            self.reg.install(token)
        }
    }

    #[test]
    fn wait_ends_on_the_switch_even_if_another_is_queued() {
        let (registry, _regs) = booted(3);
        let ctx = ReproposingRegister {
            reg: SimRegister::new(token_of(2)),
            registry,
            owner: core(2),
            next: Cell::new(Some(group(1))),
        };
        registry.propose_switch(core(2), group(0)).unwrap();
        registry.grant_update(core(2));

        let now = registry.wait_for_switch(core(2), &ctx, 4).unwrap();
        assert_eq!(now.id(), group(0));
        assert_eq!(ctx.read(), AddrToken::new(token_of(0)));
        // the newer proposal is left for a later resolve, behind a closed gate
        assert_eq!(registry.pending_target(core(2)).unwrap().id(), group(1));
        assert!(!registry.can_update(core(2)));
    }

    #[test]
    fn wait_returns_at_once_with_nothing_pending() {
        let (registry, regs) = booted(1);
        let current = registry.wait_for_switch(core(0), &regs[0], 1).unwrap();
        assert_eq!(current.id(), group(0));
    }

    #[test]
    fn owner_switches_once_another_core_opens_the_gate() {
        let (registry, regs) = booted(2);
        registry.propose_switch(core(1), group(0)).unwrap();

        thread::scope(|s| {
            let owner = s.spawn(|| {
                crate::arch::bind_hart(1);
                registry
                    .wait_for_switch(core(1), &regs[1], SWITCH_SPIN_LIMIT * 100)
                    .map(|g| g.id())
            });
            registry.grant_update(core(1));
            assert_eq!(owner.join().unwrap(), Ok(group(0)));
        });
        assert_eq!(regs[1].read(), AddrToken::new(token_of(0)));
    }
}
