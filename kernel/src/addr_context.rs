//! Address context: the per-group base that user code resolves its global
//! data against. It lives in a hart-local register, so only the hart
//! itself can install it.

use core::fmt;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
use crate::arch::{read_gp, without_interrupts, write_gp};

/// Opaque machine value naming a group's global-data base.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AddrToken(usize);

impl AddrToken {
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Debug for AddrToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AddrToken({:#x})", self.0)
    }
}

impl fmt::Display for AddrToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The calling hart's address-context register.
pub trait AddressContext {
    /// token currently installed, no side effects
    fn read(&self) -> AddrToken;

    /// install `token` and return the one it replaced, so callers can restore it
    fn install(&self, token: AddrToken) -> AddrToken;
}

/// `gp` holds the address context on RISC-V.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalPointer;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
impl AddressContext for GlobalPointer {
    fn read(&self) -> AddrToken {
        AddrToken(read_gp())
    }

    fn install(&self, token: AddrToken) -> AddrToken {
        // a trap taken between the read and the write would run its handler
        // against a context that is neither the old nor the new one
        without_interrupts(|| {
            let previous = read_gp();
            unsafe { write_gp(token.0) };
            AddrToken(previous)
        })
    }
}


#[cfg(test)]
mod tests {
    use super::sim::SimRegister;
    use super::*;

    #[test]
    fn install_returns_the_replaced_token() {
        let gp = SimRegister::new(0x8000_1000);
        let original = gp.read();

        let previous = gp.install(AddrToken::new(0x8040_0000));
        assert_eq!(previous, original);
        assert_eq!(gp.read(), AddrToken::new(0x8040_0000));

        gp.install(previous);
        assert_eq!(gp.read(), original);
    }

    #[test]
    fn reinstalling_the_current_token_reads_it() {
        let gp = SimRegister::new(0x8000_2000);
        let token = gp.install(gp.read());
        assert_eq!(token, AddrToken::new(0x8000_2000));
        assert_eq!(gp.read(), token);
    }
}
