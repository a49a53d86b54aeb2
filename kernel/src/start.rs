use core::arch::asm;
use core::sync::atomic::{AtomicBool, Ordering};

use riscv::register::{mepc, mstatus};

use crate::addr_context::GlobalPointer;
use crate::arch::{hart_id, wait_forever};
use crate::{cpu, group, info, uart};

#[no_mangle]
unsafe extern "C" fn kstart() -> ! {
    // we are now in machine mode

    // `mret` to supervisor mode
    mstatus::set_mpp(mstatus::MPP::Supervisor); // M-mode previous privilege bits

    // `mret` to `kmain` function
    mepc::write(kmain as usize); // M-mode exception program counter register

    // no paging
    asm!("csrw satp, zero");

    // designate all interrupts and exceptions to the supervisor mode
    asm!(
        "li {0}, 0xffff",
        "csrw medeleg, {0}",
        "csrw mideleg, {0}",
        out(reg) _,
    );

    // physical memory protection: give S-mode access to all the physical memory
    asm!(
        "li {0}, 0x3fffffffffffff",
        "csrw pmpaddr0, {0}",
        "li {0}, 0xf",
        "csrw pmpcfg0, {0}",
        out(reg) _,
    );

    // save cpuid to tp register
    asm!("csrr tp, mhartid");

    // return to `kmain` in S-Mode
    asm!("mret", options(noreturn));
}

/// Set once the bootstrap hart has created the group registry
/// (the other harts must not join before that)
static BSP_STARTED: AtomicBool = AtomicBool::new(false);

#[no_mangle]
extern "C" fn kmain() -> ! {
    // we are now in supervisor mode
    if cpu::is_bsp() {
        unsafe { uart::init() }; // init uart for printing
        info!("booting coregroup on hart {}...", hart_id());
        info!("UART initialised");

        group::bsp_init(&GlobalPointer);

        BSP_STARTED.store(true, Ordering::Release);
    } else {
        // wait until the bootstrap hart finishes
        while !BSP_STARTED.load(Ordering::Acquire) {
            core::hint::spin_loop();
        }
        info!("hart {} booting...", hart_id());

        group::app_init(&GlobalPointer);
    }

    wait_forever()
}
