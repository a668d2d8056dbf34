// =============================================================================
// raspvisor - Mini UART Driver
// =============================================================================
// Driver for the BCM2837 auxiliary mini UART on GPIO 14/15 (ALT5), the serial
// console of the Raspberry Pi 3 when Bluetooth keeps the PL011.
//
// Transmit-only polling driver: it is the hypervisor's write-only log sink
// and the byte sink behind the guest console hypercall.
// =============================================================================

use core::fmt::{self, Write};
use spin::Mutex;

use crate::PERIPHERAL_BASE;

// =============================================================================
// Register Definitions
// =============================================================================

/// Base address of the GPIO block
const GPIO_BASE: usize = PERIPHERAL_BASE + 0x0020_0000;

/// Base address of the auxiliary peripherals (mini UART, SPI1, SPI2)
const AUX_BASE: usize = PERIPHERAL_BASE + 0x0021_5000;

/// GPIO register offsets
mod gpio {
    /// Function select for pins 10-19
    pub const GPFSEL1: usize = 0x04;
    /// Pull-up/down enable
    pub const GPPUD: usize = 0x94;
    /// Pull-up/down clock for pins 0-31
    pub const GPPUDCLK0: usize = 0x98;
}

/// AUX / mini UART register offsets
mod regs {
    /// Auxiliary peripheral enables
    pub const ENABLES: usize = 0x04;
    /// I/O data
    pub const MU_IO: usize = 0x40;
    /// Interrupt enable
    pub const MU_IER: usize = 0x44;
    /// Line control
    pub const MU_LCR: usize = 0x4c;
    /// Modem control
    pub const MU_MCR: usize = 0x50;
    /// Line status
    pub const MU_LSR: usize = 0x54;
    /// Extra control
    pub const MU_CNTL: usize = 0x60;
    /// Baud rate
    pub const MU_BAUD: usize = 0x68;
}

/// Line Status Register bits
mod lsr {
    /// Transmitter can accept at least one byte
    pub const TX_EMPTY: u32 = 1 << 5;
}

/// 115200 baud with the 250 MHz core clock: 250e6 / (8 * 115200) - 1
const BAUD_115200: u32 = 270;

// =============================================================================
// UART Driver Implementation
// =============================================================================

/// Mini UART driver
pub struct Uart {
    aux: usize,
    gpio: usize,
}

impl Uart {
    /// Create a new driver instance.
    ///
    /// # Safety
    /// The caller must ensure both bases point to the AUX and GPIO blocks.
    pub const unsafe fn new(aux: usize, gpio: usize) -> Self {
        Self { aux, gpio }
    }

    fn read_reg(&self, offset: usize) -> u32 {
        // SAFETY: self.aux points to valid AUX registers
        unsafe { core::ptr::read_volatile((self.aux + offset) as *const u32) }
    }

    fn write_reg(&self, offset: usize, value: u32) {
        // SAFETY: self.aux points to valid AUX registers
        unsafe { core::ptr::write_volatile((self.aux + offset) as *mut u32, value) }
    }

    fn gpio_read(&self, offset: usize) -> u32 {
        // SAFETY: self.gpio points to valid GPIO registers
        unsafe { core::ptr::read_volatile((self.gpio + offset) as *const u32) }
    }

    fn gpio_write(&self, offset: usize, value: u32) {
        // SAFETY: self.gpio points to valid GPIO registers
        unsafe { core::ptr::write_volatile((self.gpio + offset) as *mut u32, value) }
    }

    /// Initialize the UART: pins 14/15 to ALT5, pulls off, 8N1 at 115200.
    pub fn init(&self) {
        // GPIO14 -> bits 12-14, GPIO15 -> bits 15-17, ALT5 = 0b010
        let mut fsel = self.gpio_read(gpio::GPFSEL1);
        fsel &= !((7 << 12) | (7 << 15));
        fsel |= (2 << 12) | (2 << 15);
        self.gpio_write(gpio::GPFSEL1, fsel);

        // Disable pull-up/down on both pins (BCM2835 ARM Peripherals, p.101)
        self.gpio_write(gpio::GPPUD, 0);
        delay(150);
        self.gpio_write(gpio::GPPUDCLK0, (1 << 14) | (1 << 15));
        delay(150);
        self.gpio_write(gpio::GPPUDCLK0, 0);

        // Enable the mini UART, keep it quiet while configuring
        self.write_reg(regs::ENABLES, 1);
        self.write_reg(regs::MU_CNTL, 0);
        self.write_reg(regs::MU_IER, 0);
        self.write_reg(regs::MU_LCR, 3); // 8-bit mode
        self.write_reg(regs::MU_MCR, 0);
        self.write_reg(regs::MU_BAUD, BAUD_115200);

        // Enable transmitter and receiver
        self.write_reg(regs::MU_CNTL, 3);
    }

    /// Transmit a single byte.
    ///
    /// Blocks until the transmitter has room.
    pub fn putc(&self, c: u8) {
        while self.read_reg(regs::MU_LSR) & lsr::TX_EMPTY == 0 {
            core::hint::spin_loop();
        }
        self.write_reg(regs::MU_IO, c as u32);
    }

    /// Transmit a string.
    pub fn puts(&self, s: &str) {
        for byte in s.bytes() {
            // Convert newlines to CRLF for proper terminal output
            if byte == b'\n' {
                self.putc(b'\r');
            }
            self.putc(byte);
        }
    }
}

impl Write for Uart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.puts(s);
        Ok(())
    }
}

fn delay(cycles: usize) {
    for _ in 0..cycles {
        core::hint::spin_loop();
    }
}

// =============================================================================
// Global UART Instance
// =============================================================================

/// Global UART instance, protected by a spinlock.
///
/// Log output, the panic handler and guest console bytes all go through here.
// SAFETY: the fixed BCM2837 AUX and GPIO blocks.
static UART: Mutex<Uart> = Mutex::new(unsafe { Uart::new(AUX_BASE, GPIO_BASE) });

/// Initialize the global UART.
pub fn init() {
    UART.lock().init();
}

/// Send one raw byte.
pub fn putc(c: u8) {
    UART.lock().putc(c);
}

/// Print a formatted string to the UART.
pub fn _print(args: fmt::Arguments) {
    // Uart::write_str never fails
    let _ = UART.lock().write_fmt(args);
}

/// Run `f` on the console whether or not `UART` is locked.
///
/// For the panic path only. The lock may be held by the code that panicked,
/// which will never release it, so a second handle on the same registers is
/// used instead of spinning.
pub fn with_panic_console<R>(f: impl FnOnce(&mut Uart) -> R) -> R {
    match UART.try_lock() {
        Some(mut uart) => f(&mut uart),
        None => {
            // SAFETY: the same fixed AUX and GPIO blocks as `UART`
            let mut raw = unsafe { Uart::new(AUX_BASE, GPIO_BASE) };
            f(&mut raw)
        }
    }
}

#[doc(hidden)]
pub fn _panic_print(args: fmt::Arguments) {
    with_panic_console(|uart| {
        let _ = uart.write_fmt(args);
    });
}

// =============================================================================
// Print Macros
// =============================================================================

/// Print to the hypervisor console.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::uart::_print(format_args!($($arg)*))
    };
}

/// Print to the hypervisor console with a newline.
#[macro_export]
macro_rules! println {
    () => {
        $crate::print!("\n")
    };
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*))
    };
}

/// `println!` for the panic handler: never waits on the console lock.
#[macro_export]
macro_rules! panic_println {
    () => {
        $crate::uart::_panic_print(format_args!("\n"))
    };
    ($($arg:tt)*) => {
        $crate::uart::_panic_print(format_args!("{}\n", format_args!($($arg)*)))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_console_is_reachable_while_locked() {
        let held = UART.lock();
        let base = with_panic_console(|uart| uart.aux);
        assert_eq!(base, AUX_BASE);
        drop(held);

        // Unlocked, the shared instance is used and released again
        assert_eq!(with_panic_console(|uart| uart.gpio), GPIO_BASE);
        assert!(UART.try_lock().is_some());
    }
}
