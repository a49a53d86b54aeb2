use core::fmt;

pub static INFO_LOCK: spin::Mutex<()> = spin::Mutex::new(());

#[macro_export]
macro_rules! print
{
	($($args:tt)+) => ({
		$crate::print::_print(format_args!($($args)+));
	});
}

#[macro_export]
macro_rules! println
{
	() => ({
		$crate::print!("\r\n")
	});
	($fmt:expr) => ({
		$crate::print!(concat!($fmt, "\r\n"))
	});
	($fmt:expr, $($args:tt)+) => ({
		$crate::print!(concat!($fmt, "\r\n"), $($args)+)
	});
}

#[macro_export]
macro_rules! panic_println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ({
        $crate::print::_panic_print(format_args!($($arg)*));
        $crate::print::_panic_print(format_args!("\n"));
    })
}

#[doc(hidden)]
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn _print(args: fmt::Arguments) {
	use core::fmt::Write;
	let mut uart = crate::uart::UART.lock();
	// `Uart::write_str` never fails
	uart.write_fmt(args).unwrap();
}

#[doc(hidden)]
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn _panic_print(args: fmt::Arguments) {
    use core::fmt::Write;
    use crate::uart::*;
	// the panicking hart may hold `UART`
	let mut uart = Uart::new(UART_BASE_ADDR);
	uart.write_fmt(args).unwrap();
}

#[doc(hidden)]
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn _print(args: fmt::Arguments) {
	std::print!("{}", args);
}

#[doc(hidden)]
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn _panic_print(args: fmt::Arguments) {
	std::eprint!("{}", args);
}

/// Prints an info, with newline.
#[macro_export]
macro_rules! info {
    ($string:expr) => ({
        #[allow(unused_imports)]
        let _info_locker = $crate::print::INFO_LOCK.lock();

        let timestamp = $crate::arch::time();
        let timestamp_subsec_us = timestamp.subsec_micros();

        $crate::print::_print(format_args!(
            concat!("\x1b[0;36m[  {:>3}.{:03}{:03}]\x1b[0m ", $string, "\n"),
            timestamp.as_secs(),
            timestamp_subsec_us / 1_000,
            timestamp_subsec_us % 1_000
        ));
    });
    ($format_string:expr, $($arg:tt)*) => ({
        #[allow(unused_imports)]
        let _info_locker = $crate::print::INFO_LOCK.lock();

        let timestamp = $crate::arch::time();
        let timestamp_subsec_us = timestamp.subsec_micros();

        $crate::print::_print(format_args!(
            concat!("\x1b[0;36m[  {:>3}.{:03}{:03}]\x1b[0m ", $format_string, "\n"),
            timestamp.as_secs(),
            timestamp_subsec_us / 1_000,
            timestamp_subsec_us % 1_000,
            $($arg)*
        ));
    })
}

/// Like `info!`, but only with the `verbose` feature.
/// The arguments are type-checked either way.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => ({
        if cfg!(feature = "verbose") {
            $crate::info!($($arg)*);
        }
    })
}
