//! Boot-time memory for the group subsystem.
//!
//! The registry and the per-group lock tables are carved out of two static
//! pools: one the bootstrap hart allocates from, one shared by every
//! application hart. Allocations are never returned.

pub mod region_allocator;

use core::{
    alloc::Layout,
    ptr::{addr_of_mut, NonNull},
};

use lazy_static::lazy_static;
use spin::Mutex;
use thiserror::Error;

use crate::symbols::{APP_POOL_SIZE, BSP_POOL_SIZE};

use self::region_allocator::RegionAllocator;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    #[error("{pool} pool exhausted: {requested} bytes requested, {remaining} left")]
    Exhausted {
        pool: &'static str,
        requested: usize,
        remaining: usize,
    },
}

/// "Give me N bytes that stay put".
///
/// # Safety
/// `allocate` must return zeroed memory, aligned as `layout` asks, that
/// nothing else owns and that stays valid for the rest of the kernel's life.
pub unsafe trait PhysAlloc {
    fn allocate(&self, layout: Layout) -> Result<NonNull<u8>, AllocError>;

    /// for logs
    fn name(&self) -> &'static str;
}

// Since they are uninitialised and statically allocated,
// the pools live in the .bss section of the kernel binary
#[cfg_attr(
    all(target_arch = "riscv64", target_os = "none"),
    link_section = ".bss.bsp_pool"
)]
static mut BSP_POOL_SPACE: [u8; BSP_POOL_SIZE] = [0; BSP_POOL_SIZE];

#[cfg_attr(
    all(target_arch = "riscv64", target_os = "none"),
    link_section = ".bss.app_pool"
)]
static mut APP_POOL_SPACE: [u8; APP_POOL_SIZE] = [0; APP_POOL_SIZE];

lazy_static! {
    // safety: each space is handed to exactly one allocator and never touched otherwise
    static ref BSP_POOL: Mutex<RegionAllocator> = Mutex::new(unsafe {
        RegionAllocator::new("Bsp", addr_of_mut!(BSP_POOL_SPACE) as usize, BSP_POOL_SIZE)
    });
    static ref APP_POOL: Mutex<RegionAllocator> = Mutex::new(unsafe {
        RegionAllocator::new("App", addr_of_mut!(APP_POOL_SPACE) as usize, APP_POOL_SIZE)
    });
}

/// pool of the bootstrap hart
pub fn bsp_pool() -> &'static Mutex<RegionAllocator> {
    &BSP_POOL
}

/// pool shared by the application harts
pub fn app_pool() -> &'static Mutex<RegionAllocator> {
    &APP_POOL
}
