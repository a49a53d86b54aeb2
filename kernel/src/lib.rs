// do not use the rust standard library on the board; hosted builds run the unit tests
#![cfg_attr(all(target_arch = "riscv64", target_os = "none"), no_std)]

pub mod addr_context;
pub mod allocator;
pub mod arch;
pub mod cpu;
pub mod dispatcher;
pub mod group;
pub mod print;
pub mod symbols;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod start;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod uart;

/// Panic handler
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    panic_println!("hart {} aborting: ", arch::hart_id());
    if let Some(p) = info.location() {
        panic_println!("line {}, file {}: {}", p.line(), p.file(), info.message());
    } else {
        panic_println!("no information available.");
    }
    abort();
}

/// Abort function
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[no_mangle]
extern "C" fn abort() -> ! {
    arch::wait_forever()
}
