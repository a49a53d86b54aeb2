use core::{
    alloc::Layout,
    fmt,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use spin::{Mutex, Once};

use crate::{
    addr_context::AddrToken,
    allocator::{AllocError, PhysAlloc},
    cpu::CoreId,
    symbols::N_CPUS,
};

use super::GroupError;

/// Groups are named after the core that created them.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct GroupId(CoreId);

impl GroupId {
    pub const fn new(id: usize) -> Option<Self> {
        match CoreId::new(id) {
            Some(core) => Some(Self(core)),
            None => None,
        }
    }

    /// the core the group was created on
    pub const fn founder(self) -> CoreId {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0.as_usize()
    }
}

impl From<CoreId> for GroupId {
    fn from(core: CoreId) -> Self {
        Self(core)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of a domain control block. The group borrows it, the domain owns it.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DcbRef(pub usize);

/// Address of a kernel control block.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct KcbRef(pub usize);

#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum DcbSlot {
    #[default]
    Idle,
    /// staged by a proposal, the owning core has not switched in yet
    SwitchPending,
    Running(DcbRef),
}

/// What a group knows about one core.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PerCoreState {
    pub dcb_current: DcbSlot,
    pub kcb_current: Option<KcbRef>,
    pub enabled: bool,
}

pub type PerCoreTable = [PerCoreState; N_CPUS];

pub struct Group {
    id: GroupId,
    addr_token: AtomicUsize,
    enabled: AtomicBool,
    // the group lock and the table it guards, allocated when the group is set up
    per_core: Once<&'static Mutex<PerCoreTable>>,
}

impl Group {
    pub(super) fn new(id: GroupId) -> Self {
        Self {
            id,
            addr_token: AtomicUsize::new(0),
            enabled: AtomicBool::new(false),
            per_core: Once::new(),
        }
    }

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn addr_token(&self) -> AddrToken {
        AddrToken::new(self.addr_token.load(Ordering::Acquire))
    }

    pub(super) fn set_addr_token(&self, token: AddrToken) {
        self.addr_token.store(token.as_usize(), Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(super) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// whether the lock has been allocated
    pub fn is_initialised(&self) -> bool {
        self.per_core.is_completed()
    }

    /// Allocate the group lock, unlocked, from `pool`. Later calls keep the first lock.
    pub(super) fn init_lock(&self, pool: &dyn PhysAlloc) -> Result<(), AllocError> {
        self.per_core.try_call_once(|| {
            let ptr = pool
                .allocate(Layout::new::<Mutex<PerCoreTable>>())?
                .cast::<Mutex<PerCoreTable>>();
            // safety: `PhysAlloc` memory is aligned, exclusive and never reclaimed
            let lock: &'static Mutex<PerCoreTable> = unsafe {
                ptr.as_ptr()
                    .write(Mutex::new([PerCoreState::default(); N_CPUS]));
                &*ptr.as_ptr()
            };
            Ok::<_, AllocError>(lock)
        })?;
        Ok(())
    }

    /// Run `f` on `core`'s slot with the group lock held.
    pub fn with_core_state<T>(
        &self,
        core: CoreId,
        f: impl FnOnce(&mut PerCoreState) -> T,
    ) -> Result<T, GroupError> {
        let lock = self.per_core.get().ok_or(GroupError::Uninitialised(self.id))?;
        let mut table = lock.lock();
        Ok(f(&mut table[core.as_usize()]))
    }

    pub fn core_state(&self, core: CoreId) -> Option<PerCoreState> {
        self.with_core_state(core, |state| *state).ok()
    }

    /// cores whose slot in this group is enabled, as of the call
    pub fn members(&self) -> impl Iterator<Item = CoreId> {
        let table = self.per_core.get().map(|lock| *lock.lock());
        CoreId::all().filter(move |core| table.is_some_and(|t| t[core.as_usize()].enabled))
    }
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("addr_token", &self.addr_token())
            .field("enabled", &self.is_enabled())
            .field("initialised", &self.is_initialised())
            .finish()
    }
}
