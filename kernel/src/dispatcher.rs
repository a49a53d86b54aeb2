//! The generic dispatcher frame shared between the kernel and a domain's
//! user-level dispatcher.
//!
//! The per-core disabled flags are the only synchronisation between the two
//! sides: the kernel delivers an upcall on a core only if it wins the
//! test-and-set on that core's flag, and the user-level runtime clears the
//! flag when it re-enables itself.

use core::{
    fmt,
    mem::size_of,
    ops::Deref,
    ptr::NonNull,
    sync::atomic::{AtomicU32, AtomicU8, Ordering},
};

use static_assertions::const_assert;

use crate::{
    cpu::CoreId,
    group::GroupId,
    symbols::{DISPATCHER_FRAME_BITS, DISP_NAME_LEN, N_CPUS},
};

/// Field order and widths are ABI: user-level code maps the same frame.
#[repr(C)]
pub struct DispatcherShared {
    disabled_all: [AtomicU32; N_CPUS], // nonzero: no upcalls on that core
    haswork: AtomicU32,                // runnable

    pub udisp: usize, // user-mode pointer to the dispatcher
    pub lmp_delivered: u32,
    pub lmp_seen: u32,
    pub lmp_hint: usize,
    pub dispatcher_run: usize,
    pub dispatcher_lrpc: usize,
    pub dispatcher_pagefault: usize,
    pub dispatcher_pagefault_disabled: usize,
    pub dispatcher_trap: usize,

    pub systime: u64, // when last dispatched/resumed, written by the kernel only
    pub wakeup: u64,  // when to wake from sleep, read by the kernel on yield

    pub name: [u8; DISP_NAME_LEN],
    pub fpu_used: u32,
    pub fpu_trap: u32,

    pub systime_frequency: u64,
    curr_core_id: AtomicU8, // kernel-written
    group_id: AtomicU8,
}

const_assert!(size_of::<DispatcherShared>() <= 1 << DISPATCHER_FRAME_BITS);
// core and group ids are stored in one byte each
const_assert!(N_CPUS <= u8::MAX as usize);

impl DispatcherShared {
    /// A fresh frame: enabled on every core, nothing to do.
    pub fn new(name: &str, group: GroupId) -> Self {
        let mut name_bytes = [0u8; DISP_NAME_LEN];
        let mut len = name.len().min(DISP_NAME_LEN);
        // never cut a character in half
        while !name.is_char_boundary(len) {
            len -= 1;
        }
        name_bytes[..len].copy_from_slice(&name.as_bytes()[..len]);

        Self {
            disabled_all: core::array::from_fn(|_| AtomicU32::new(0)),
            haswork: AtomicU32::new(0),
            udisp: 0,
            lmp_delivered: 0,
            lmp_seen: 0,
            lmp_hint: 0,
            dispatcher_run: 0,
            dispatcher_lrpc: 0,
            dispatcher_pagefault: 0,
            dispatcher_pagefault_disabled: 0,
            dispatcher_trap: 0,
            systime: 0,
            wakeup: 0,
            name: name_bytes,
            fpu_used: 0,
            fpu_trap: 0,
            systime_frequency: 0,
            curr_core_id: AtomicU8::new(0),
            group_id: AtomicU8::new(group.as_usize() as u8),
        }
    }

    /// A stale answer is possible when `core` is not the caller's own core.
    pub fn disabled_on(&self, core: CoreId) -> bool {
        self.disabled_all[core.as_usize()].load(Ordering::Acquire) != 0
    }

    pub fn set_disabled_on(&self, core: CoreId, disabled: bool) {
        self.disabled_all[core.as_usize()].store(disabled as u32, Ordering::SeqCst);
    }

    /// Disable upcalls on `core`.
    /// Returns whether this call is the one that did it (the flag was clear).
    /// The kernel may only deliver an upcall when this returns `true`.
    pub fn try_disable_on(&self, core: CoreId) -> bool {
        self.disabled_all[core.as_usize()].swap(1, Ordering::SeqCst) == 0
    }

    pub fn disabled(&self) -> bool {
        self.disabled_on(CoreId::current())
    }

    pub fn set_disabled(&self, disabled: bool) {
        self.set_disabled_on(CoreId::current(), disabled)
    }

    pub fn try_disable(&self) -> bool {
        self.try_disable_on(CoreId::current())
    }

    pub fn has_work(&self) -> bool {
        self.haswork.load(Ordering::Acquire) != 0
    }

    pub fn set_has_work(&self, haswork: bool) {
        self.haswork.store(haswork as u32, Ordering::Release);
    }

    /// `None` if user level scribbled an out-of-range id over the frame
    pub fn group_id(&self) -> Option<GroupId> {
        GroupId::new(self.group_id.load(Ordering::Acquire) as usize)
    }

    pub fn set_group_id(&self, group: GroupId) {
        self.group_id.store(group.as_usize() as u8, Ordering::Release);
    }

    /// whether the dispatcher runs on the core its group is named after
    pub fn is_in_leader_core(&self) -> bool {
        self.group_id() == Some(GroupId::from(CoreId::current()))
    }

    pub fn curr_core(&self) -> Option<CoreId> {
        CoreId::new(self.curr_core_id.load(Ordering::Acquire) as usize)
    }

    /// kernel only, on dispatch
    pub fn set_curr_core(&self, core: CoreId) {
        self.curr_core_id
            .store(core.as_usize() as u8, Ordering::Release);
    }

    pub fn name(&self) -> &str {
        let len = self
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(DISP_NAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("<non-utf8>")
    }
}

impl fmt::Display for DispatcherShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Dump of dispatcher at address {:p}:", self)?;
        for core in CoreId::all() {
            let disabled = self.disabled_on(core);
            writeln!(
                f,
                "  disabled{}      = {} ({})",
                core,
                disabled as u32,
                if disabled { "RESUME" } else { "UPCALL" }
            )?;
        }
        writeln!(f, "  haswork       = {}", self.has_work() as u32)?;
        writeln!(f, "  udisp         = {:#x}", self.udisp)?;
        writeln!(f, "  lmp_delivered = {}", self.lmp_delivered)?;
        writeln!(f, "  lmp_seen      = {}", self.lmp_seen)?;
        writeln!(f, "  lmp_hint      = {:#x}", self.lmp_hint)?;
        writeln!(f, "  dispatcher_run                = {:#x}", self.dispatcher_run)?;
        writeln!(f, "  dispatcher_lrpc               = {:#x}", self.dispatcher_lrpc)?;
        writeln!(f, "  dispatcher_pagefault          = {:#x}", self.dispatcher_pagefault)?;
        writeln!(
            f,
            "  dispatcher_pagefault_disabled = {:#x}",
            self.dispatcher_pagefault_disabled
        )?;
        writeln!(f, "  dispatcher_trap               = {:#x}", self.dispatcher_trap)?;
        writeln!(f, "  systime      = {:#x}", self.systime)?;
        writeln!(f, "  wakeup       = {:#x}", self.wakeup)?;
        writeln!(f, "  name         = {}", self.name())?;
        writeln!(f, "  fpu_used     = {}", self.fpu_used)?;
        writeln!(f, "  fpu_trap     = {}", self.fpu_trap)?;
        writeln!(
            f,
            "  curr_core_id = {:#x}",
            self.curr_core_id.load(Ordering::Acquire)
        )?;
        write!(f, "  group_id     = {}", self.group_id.load(Ordering::Acquire))
    }
}

/// The address of a mapped dispatcher frame.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DispatcherHandle(NonNull<DispatcherShared>);

impl DispatcherHandle {
    /// # Safety
    /// `vaddr` must point to an aligned `DispatcherShared` that stays mapped
    /// while any copy of the handle is in use.
    pub unsafe fn from_vaddr(vaddr: usize) -> Option<Self> {
        NonNull::new(vaddr as *mut DispatcherShared).map(Self)
    }

    pub fn vaddr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

impl Deref for DispatcherHandle {
    type Target = DispatcherShared;

    fn deref(&self) -> &DispatcherShared {
        // safety: guaranteed by `from_vaddr`
        unsafe { self.0.as_ref() }
    }
}
