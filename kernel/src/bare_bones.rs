//! This module contains some basic functionality that libstd would normally otherwise provide.
//! Most importantly, it defines the panic handler used by `panic!`.

use core::fmt::Write;

use crate::debug::Debug;
use crate::machine;

#[lang = "eh_personality"]
#[no_mangle]
pub extern "C" fn eh_personality() {}

/// This function is used by `panic!` to display an error message and then hang.
///
/// Gated out under `#[cfg(test)]` so that `cargo test` (run against the host target) can supply
/// its own panic handler.
#[cfg(not(test))]
#[panic_handler]
fn rust_begin_panic(info: &core::panic::PanicInfo) -> ! {
    unsafe {
        // We should not be interrupting any more.
        machine::disable_interrupts();
    }

    printk!("\n========{{ PANIC }}========\n");
    if let Some(location) = info.location() {
        printk!("{}:{}:{}\n", location.file(), location.line(), location.column());
    }
    printk!("...........................\n");
    let _ = write!(Debug, "{}", info.message());
    printk!("\n===========================\n");

    loop {
        unsafe { machine::hlt() };
    }
}
