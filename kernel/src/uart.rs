//! 16550 console, transmit side only. See http://byterunner.com/16550.html

use core::fmt::Write;
use lazy_static::lazy_static;

use spin::Mutex;

pub const UART_BASE_ADDR: usize = 0x1000_0000;

const THR: usize = 0; // transmit holding register (for output bytes)
const IER: usize = 1; // interrupt enable register
const FCR: usize = 2; // FIFO control register
const LCR: usize = 3; // line control register
const LSR: usize = 5; // line status register

const LCR_EIGHT_BITS: u8 = 0b11;
const LCR_BAUD_LATCH: u8 = 1 << 7; // DLL/DLM replace THR/IER while set
const FCR_FIFO_ENABLE: u8 = 1 << 0;
const LSR_TX_IDLE: u8 = 1 << 5; // THR can accept another character to send

// 22.729 MHz / (2400 baud * 16), rounded up. qemu ignores it
const DIVISOR: u16 = 592;

pub struct Uart {
    base_addr: usize,
}

impl Uart {
    pub fn new(base_addr: usize) -> Self {
        Uart { base_addr }
    }

    fn reg(&self, offset: usize) -> *mut u8 {
        (self.base_addr + offset) as *mut u8
    }

    pub fn put(&self, c: u8) {
        while unsafe { self.reg(LSR).read_volatile() } & LSR_TX_IDLE == 0 {
            core::hint::spin_loop();
        }
        unsafe {
            self.reg(THR).write_volatile(c);
        }
    }

    /// 8N1, FIFO on, no interrupts: the console is polled
    pub fn init(&mut self) {
        unsafe {
            self.reg(IER).write_volatile(0);

            self.reg(LCR).write_volatile(LCR_EIGHT_BITS | LCR_BAUD_LATCH);
            self.reg(0).write_volatile((DIVISOR & 0xff) as u8);
            self.reg(1).write_volatile((DIVISOR >> 8) as u8);
            self.reg(LCR).write_volatile(LCR_EIGHT_BITS);

            self.reg(FCR).write_volatile(FCR_FIFO_ENABLE);
        }
    }
}

impl Write for Uart {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        for c in s.bytes() {
            self.put(c);
        }
        Ok(())
    }
}

lazy_static! {
    pub static ref UART: Mutex<Uart> = Mutex::new(Uart::new(UART_BASE_ADDR));
}

/// # Safety
/// Must run once, on the boot hart, before anything prints.
pub unsafe fn init() {
    UART.lock().init();
}
