//! Core groups: sets of cores sharing one address context.
//!
//! Every core starts in the group named after it. The bootstrap hart creates
//! the registry, every other hart joins it once that is done.

#[allow(clippy::module_inception)]
pub mod group;
pub mod registry;

use spin::Once;
use thiserror::Error;

use crate::{
    addr_context::AddressContext,
    allocator::{app_pool, bsp_pool, AllocError},
    cpu::CoreId,
    info,
};

pub use self::group::{DcbRef, DcbSlot, Group, GroupId, KcbRef, PerCoreState};
pub use self::registry::GroupRegistry;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum GroupError {
    #[error("group {0} has no lock yet")]
    Uninitialised(GroupId),
    #[error("core {0} has not joined a group")]
    CoreInactive(CoreId),
    #[error("core {core} still waiting for group {target} after {spins} spins")]
    SwitchTimeout {
        core: CoreId,
        target: GroupId,
        spins: usize,
    },
    #[error(transparent)]
    Alloc(#[from] AllocError),
}

static REGISTRY: Once<&'static GroupRegistry> = Once::new();

/// `None` before the bootstrap hart has run `bsp_init`
pub fn registry() -> Option<&'static GroupRegistry> {
    REGISTRY.get().copied()
}

/// Create the registry and put the bootstrap hart in its group.
/// Runs once, on the bootstrap hart, before any other hart calls `app_init`.
pub fn bsp_init(ctx: &dyn AddressContext) -> &'static GroupRegistry {
    let core = CoreId::current();
    assert!(core.is_bsp(), "group::bsp_init: called on hart {}", core);

    let registry = *REGISTRY.call_once(|| match GroupRegistry::create_in(bsp_pool()) {
        Ok(registry) => registry,
        Err(e) => panic!("group::bsp_init: {}", e),
    });
    if let Err(e) = registry.init_core(core, ctx, bsp_pool()) {
        panic!("group::bsp_init: {}", e);
    }
    info!("group::bsp_init: registry at {:p}", registry);
    registry
}

/// Put the calling application hart in its group.
pub fn app_init(ctx: &dyn AddressContext) -> &'static GroupRegistry {
    let core = CoreId::current();
    let Some(registry) = registry() else {
        panic!("group::app_init: hart {} ran before bsp_init", core);
    };
    if let Err(e) = registry.init_core(core, ctx, app_pool()) {
        panic!("group::app_init: {}", e);
    }
    registry
}

/// The group the calling core runs in, after applying any granted switch.
pub fn current_group(ctx: &dyn AddressContext) -> Result<&'static Group, GroupError> {
    let core = CoreId::current();
    registry()
        .ok_or(GroupError::CoreInactive(core))?
        .resolve(core, ctx)
}
