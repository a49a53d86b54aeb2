/// Maximum supported CPU on machine
/// Note that it is bounded by the kernel boot stack in
/// `linker.ld` and `entry.S`
pub const N_CPUS: usize = 8;

/// The hart that allocates the group registry
pub const BSP_HART: usize = 0;

/// The dispatcher frame is `1 << DISPATCHER_FRAME_BITS` bytes,
/// a power of two so that a single capability covers it
pub const DISPATCHER_FRAME_BITS: usize = 18;

/// Length of the debug name stored in a dispatcher frame
pub const DISP_NAME_LEN: usize = 16;

/// How many times a core polls its `can_update` gate before
/// giving up on a pending group switch
pub const SWITCH_SPIN_LIMIT: usize = 1_000_000;

// boot pools for registry and group locks, in Bytes
pub const BSP_POOL_SIZE: usize = 16 * 1024;
pub const APP_POOL_SIZE: usize = 16 * 1024;
