// =============================================================================
// raspvisor - BCM2835 ARM Interrupt Controller
// =============================================================================
// Driver for the legacy interrupt controller of the Raspberry Pi 3 (the
// "ARM side" of the BCM2835 controller). GPU peripheral interrupts are routed
// to core 0 IRQ by the firmware default, which is all a single-core
// hypervisor needs.
// =============================================================================

#[cfg(target_os = "none")]
use core::ptr;

use crate::PERIPHERAL_BASE;

const IRQ_BASE: usize = PERIPHERAL_BASE + 0x0000_b000;

// Controller registers
const IRQ_BASIC_PENDING: usize = 0x200;
const IRQ_PENDING_1: usize = 0x204;
const IRQ_PENDING_2: usize = 0x208;
const ENABLE_IRQS_1: usize = 0x210;
const DISABLE_IRQS_1: usize = 0x21c;

/// GPU peripheral interrupt lines in bank 1 (IDs 0-31).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Irq {
    SystemTimer1 = 1,
}

impl Irq {
    const fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Snapshot of the pending registers, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pending {
    pub basic: u32,
    pub bank1: u32,
    pub bank2: u32,
}

impl Pending {
    pub const fn contains(&self, irq: Irq) -> bool {
        self.bank1 & irq.bit() != 0
    }
}

pub struct InterruptController;

impl InterruptController {
    /// Mask every bank-1 source.
    ///
    /// # Safety
    /// Must be called only once on boot.
    pub unsafe fn init() {
        write_reg(DISABLE_IRQS_1, u32::MAX);
    }

    /// Unmask one interrupt line.
    pub fn enable(irq: Irq) {
        unsafe { write_reg(ENABLE_IRQS_1, irq.bit()) }
    }

    /// Read what is currently asserted.
    pub fn pending() -> Pending {
        unsafe {
            Pending {
                basic: read_reg(IRQ_BASIC_PENDING),
                bank1: read_reg(IRQ_PENDING_1),
                bank2: read_reg(IRQ_PENDING_2),
            }
        }
    }
}

unsafe fn read_reg(offset: usize) -> u32 {
    #[cfg(target_os = "none")]
    {
        ptr::read_volatile((IRQ_BASE + offset) as *const u32)
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = (IRQ_BASE, offset);
        0
    }
}

unsafe fn write_reg(offset: usize, value: u32) {
    #[cfg(target_os = "none")]
    ptr::write_volatile((IRQ_BASE + offset) as *mut u32, value);
    #[cfg(not(target_os = "none"))]
    let _ = (offset, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_bank_one_bits_map_to_lines() {
        let p = Pending { basic: 1 << 8, bank1: 1 << 1, bank2: 0 };
        assert!(p.contains(Irq::SystemTimer1));

        // Channel 3 and AUX share the bank but are not the tick
        let p = Pending { basic: 1 << 8, bank1: (1 << 3) | (1 << 29), bank2: 0 };
        assert!(!p.contains(Irq::SystemTimer1));
    }
}
