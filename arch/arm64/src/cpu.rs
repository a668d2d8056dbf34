// =============================================================================
// raspvisor - CPU Utilities
// =============================================================================
// ARM64 CPU control used by the hypervisor at EL2: interrupt masking, the
// EL2 control registers, cache maintenance for freshly loaded guest code.
//
// Every register access is compiled only for the bare-metal target. On the
// host (unit tests) these become no-ops so the pure logic above can be tested.
// =============================================================================

use bitflags::bitflags;

bitflags! {
    /// Hypervisor Configuration Register (HCR_EL2) bits we program.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HcrEl2: u64 {
        /// Set/Way invalidation override
        const SWIO = 1 << 1;
        /// Route physical FIQ to EL2
        const FMO = 1 << 3;
        /// Route physical IRQ to EL2
        const IMO = 1 << 4;
        /// Route physical SError to EL2
        const AMO = 1 << 5;
        /// Trap WFI executed at EL1/EL0
        const TWI = 1 << 13;
        /// Trap WFE executed at EL1/EL0
        const TWE = 1 << 14;
        /// Trap SMC executed at EL1
        const TSC = 1 << 19;
        /// EL1 is AArch64
        const RW = 1 << 31;
    }
}

bitflags! {
    /// DAIF exception mask bits as they appear in SPSR/DAIF.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Daif: u64 {
        const F = 1 << 6;
        const I = 1 << 7;
        const A = 1 << 8;
        const D = 1 << 9;
    }
}

/// HCR_EL2 value for running AArch64 guests at EL1 with every physical
/// interrupt and system error taken by the hypervisor.
pub const HCR_EL2_GUEST: HcrEl2 = HcrEl2::RW
    .union(HcrEl2::SWIO)
    .union(HcrEl2::IMO)
    .union(HcrEl2::FMO)
    .union(HcrEl2::AMO)
    .union(HcrEl2::TWI)
    .union(HcrEl2::TWE)
    .union(HcrEl2::TSC);

/// CPTR_EL2 with only the RES1 bits set: no FP/SIMD or trace traps.
const CPTR_EL2_RES1: u64 = 0x33ff;

/// Halt the CPU in a low-power state.
///
/// This function never returns. It's used when the hypervisor has nothing
/// left to run or when a fatal error occurs.
#[inline(always)]
pub fn halt() -> ! {
    loop {
        #[cfg(target_os = "none")]
        unsafe {
            core::arch::asm!("wfe");
        }
        core::hint::spin_loop();
    }
}

/// Wait for an interrupt.
#[inline(always)]
pub fn wait_for_interrupt() {
    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!("wfi");
    }
}

/// Enable IRQs at the current exception level.
///
/// # Safety
/// Caller must ensure the vector table and every interrupt source are set up.
#[inline(always)]
pub unsafe fn enable_interrupts() {
    #[cfg(target_os = "none")]
    core::arch::asm!("msr daifclr, #2");
}

/// Disable IRQs at the current exception level.
#[inline(always)]
pub fn disable_interrupts() {
    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!("msr daifset, #2");
    }
}

/// Read the DAIF mask bits.
#[inline(always)]
pub fn read_daif() -> Daif {
    #[cfg(target_os = "none")]
    {
        let daif: u64;
        unsafe {
            core::arch::asm!("mrs {}, daif", out(reg) daif);
        }
        Daif::from_bits_truncate(daif)
    }
    #[cfg(not(target_os = "none"))]
    {
        Daif::empty()
    }
}

/// Restore previously read DAIF mask bits.
#[inline(always)]
fn write_daif(_daif: Daif) {
    #[cfg(target_os = "none")]
    unsafe {
        core::arch::asm!("msr daif, {}", in(reg) _daif.bits());
    }
}

/// Interrupt-masked critical section.
///
/// Masks IRQs on creation and restores the previous mask on drop, so nested
/// guards (including one taken inside the trap path, where IRQs are already
/// masked by hardware) leave the mask exactly as they found it.
pub struct IrqGuard {
    saved: Daif,
}

impl IrqGuard {
    pub fn new() -> Self {
        let saved = read_daif();
        disable_interrupts();
        Self { saved }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        write_daif(self.saved);
    }
}

/// Get the current exception level (0-3).
#[inline(always)]
pub fn current_el() -> u8 {
    #[cfg(target_os = "none")]
    {
        let el: u64;
        unsafe {
            core::arch::asm!("mrs {}, CurrentEL", out(reg) el);
        }
        ((el >> 2) & 0x3) as u8
    }
    #[cfg(not(target_os = "none"))]
    {
        2
    }
}

/// Read the stack pointer.
#[inline(always)]
pub fn read_sp() -> u64 {
    #[cfg(target_os = "none")]
    {
        let sp: u64;
        unsafe {
            core::arch::asm!("mov {}, sp", out(reg) sp);
        }
        sp
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

/// Program HCR_EL2 and CPTR_EL2 for hosting EL1 guests.
///
/// # Safety
/// Must run at EL2 before the first guest is entered.
pub unsafe fn configure_el2() {
    #[cfg(target_os = "none")]
    {
        core::arch::asm!("msr hcr_el2, {}", in(reg) HCR_EL2_GUEST.bits());
        core::arch::asm!("msr cptr_el2, {}", in(reg) CPTR_EL2_RES1);
        // No virtual timer offset; guests see the physical counter.
        core::arch::asm!("msr cntvoff_el2, xzr");
        core::arch::asm!("isb");
    }
    #[cfg(not(target_os = "none"))]
    let _ = CPTR_EL2_RES1;
}

/// Invalidate the whole instruction cache.
/// Must be called after writing guest code to memory.
#[inline(always)]
pub unsafe fn flush_instruction_cache() {
    #[cfg(target_os = "none")]
    core::arch::asm!(
        "dsb ish",
        "ic iallu",
        "dsb ish",
        "isb"
    );
}

/// Clean Data Cache by VA to Point of Unification.
/// Ensures that data written to memory is visible to the instruction cache.
pub unsafe fn clean_dcache_range(start: usize, len: usize) {
    #[cfg(target_os = "none")]
    {
        let line_size = 64; // Cortex-A53 cache line
        let end = start + len;
        let mut addr = start & !(line_size - 1);

        while addr < end {
            core::arch::asm!("dc cvau, {}", in(reg) addr);
            addr += line_size;
        }

        core::arch::asm!("dsb ish");
    }
    #[cfg(not(target_os = "none"))]
    let _ = (start, len);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_hcr_routes_interrupts_to_el2() {
        assert!(HCR_EL2_GUEST.contains(HcrEl2::IMO | HcrEl2::FMO | HcrEl2::AMO));
        assert!(HCR_EL2_GUEST.contains(HcrEl2::RW));
        assert_eq!(HCR_EL2_GUEST.bits() & (1 << 31), 1 << 31);
    }

    #[test]
    fn guest_hcr_traps_wfi_and_wfe() {
        assert!(HCR_EL2_GUEST.contains(HcrEl2::TWI));
        assert!(HCR_EL2_GUEST.contains(HcrEl2::TWE));
        assert_eq!(HCR_EL2_GUEST.bits() & (0b11 << 13), 0b11 << 13);
    }

    #[test]
    fn daif_bits_match_spsr_layout() {
        assert_eq!((Daif::D | Daif::A | Daif::I | Daif::F).bits(), 0x3c0);
    }
}
