//! The 8253 Programmable Interval Timer, used as the round-robin scheduler's quantum-expiry
//! clock.

use crate::machine;

/// The PIT's own oscillator frequency; dividing it by the desired rate gives the reload count.
const BASE_HZ: u32 = 1_193_182;

const PIT_CMD: u16 = 0x43;
const PIT_CHANNEL_0: u16 = 0x40;

/// Program channel 0 in rate-generator mode to fire at `hz` ticks per second, driving
/// `interrupts::idt::VECTOR_TIMER` once the PIC/IDT/interrupts are all live.
pub fn init(hz: u32) {
    let divisor = BASE_HZ / hz;
    assert!(divisor <= 0xFFFF, "PIT divisor {} does not fit in 16 bits (hz={})", divisor, hz);

    unsafe {
        // channel 0, lobyte/hibyte access, mode 2 (rate generator), binary
        machine::outb(PIT_CMD, 0b0011_0100);
        machine::outb(PIT_CHANNEL_0, (divisor & 0xFF) as u8);
        machine::outb(PIT_CHANNEL_0, ((divisor >> 8) & 0xFF) as u8);
    }
}
