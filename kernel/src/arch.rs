//! Hart-local hardware access.
//!
//! On the bare-metal target these touch real registers. Hosted builds
//! (unit tests, tooling) get a thread-per-hart shim instead: each thread
//! binds the hart id it pretends to run on, and time stands still.

use core::time::Duration;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub use self::bare::*;
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub use self::hosted::*;

/// CLINT `mtime`, free running since reset
pub const CLINT_MTIME_BASE: usize = 0x200_bff8;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod bare {
    use super::{Duration, CLINT_MTIME_BASE};
    use core::arch::asm;

    /// `kstart` copies `mhartid` into `tp`, and nothing writes it afterwards
    pub fn hart_id() -> usize {
        let hart_id: usize;
        unsafe {
            asm!("mv {}, tp", out(reg) hart_id);
        }
        hart_id
    }

    pub fn time() -> Duration {
        let mtime = CLINT_MTIME_BASE as *mut u64;
        let time = unsafe { mtime.read_volatile() };
        Duration::from_nanos(time)
    }

    /// run `f` with S-mode interrupts masked, restoring `sstatus.SIE` afterwards
    pub fn without_interrupts<T>(f: impl FnOnce() -> T) -> T {
        riscv::interrupt::supervisor::free(f)
    }

    pub fn read_gp() -> usize {
        let gp: usize;
        unsafe {
            asm!("mv {}, gp", out(reg) gp);
        }
        gp
    }

    /// The kernel is linked without gp relaxation, so it never addresses
    /// its own data through `gp`.
    ///
    /// # Safety
    /// Code resolving globals through `gp` after this call sees `gp`'s new context.
    pub unsafe fn write_gp(gp: usize) {
        asm!("mv gp, {}", in(reg) gp);
    }

    pub fn wait_forever() -> ! {
        loop {
            unsafe {
                asm!("wfi");
            }
        }
    }
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
mod hosted {
    use super::Duration;
    use std::cell::Cell;

    std::thread_local! {
        static HART: Cell<usize> = const { Cell::new(0) };
    }

    pub fn hart_id() -> usize {
        HART.with(|hart| hart.get())
    }

    /// pretend the calling thread runs on `hart`
    pub fn bind_hart(hart: usize) {
        HART.with(|cell| cell.set(hart));
    }

    pub fn time() -> Duration {
        Duration::ZERO
    }

    pub fn without_interrupts<T>(f: impl FnOnce() -> T) -> T {
        f()
    }
}
