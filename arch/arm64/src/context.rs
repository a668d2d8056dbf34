// =============================================================================
// raspvisor - Processor Context
// =============================================================================
// The saved-register record of one execution context. The trap entry code in
// exception.rs pushes exactly this structure onto the EL2 stack and pops it
// again before `eret`; the scheduler copies it in and out of task slots.
//
// Layout (bytes):
//   0    x0..x30
//   248  sp_el1
//   256  elr_el2      resume PC
//   264  spsr_el2     PSTATE to return with, selects the target EL
//   272  fpcr
//   280  fpsr
//   288  v0..v31
//   800  El1SysRegs   (18 x u64)
//   944  end
//
// DO NOT reorder. The offsets are asserted below and handed to the assembly
// as `const` operands.
// =============================================================================

use core::mem::{offset_of, size_of};

use crate::cpu::Daif;

/// SPSR mode field for EL1 using SP_EL1.
pub const SPSR_MODE_EL1H: u64 = 0b0101;
/// SPSR mode field for EL2 using SP_EL2.
pub const SPSR_MODE_EL2H: u64 = 0b1001;
/// SPSR M[3:0] mask.
pub const SPSR_MODE_MASK: u64 = 0b1111;

/// Architectural reset value of SCTLR_EL1 RES1 bits, MMU and caches off.
pub const SCTLR_EL1_RESET: u64 = 0x30d0_0800;

/// EL1 system registers a guest kernel owns.
///
/// These are not touched by the hypervisor itself, so they are captured and
/// re-installed around the Rust part of the trap path rather than in the
/// vector assembly.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct El1SysRegs {
    pub sp_el0: u64,
    pub tpidr_el0: u64,
    pub tpidrro_el0: u64,
    pub tpidr_el1: u64,
    pub elr_el1: u64,
    pub spsr_el1: u64,
    pub vbar_el1: u64,
    pub sctlr_el1: u64,
    pub cpacr_el1: u64,
    pub ttbr0_el1: u64,
    pub ttbr1_el1: u64,
    pub tcr_el1: u64,
    pub mair_el1: u64,
    pub amair_el1: u64,
    pub contextidr_el1: u64,
    pub esr_el1: u64,
    pub far_el1: u64,
    pub par_el1: u64,
}

macro_rules! el1_sysregs {
    ($m:ident) => {
        $m!(
            sp_el0, tpidr_el0, tpidrro_el0, tpidr_el1, elr_el1, spsr_el1, vbar_el1,
            sctlr_el1, cpacr_el1, ttbr0_el1, ttbr1_el1, tcr_el1, mair_el1, amair_el1,
            contextidr_el1, esr_el1, far_el1, par_el1
        )
    };
}

impl El1SysRegs {
    /// Register bank a guest starts with: MMU off, everything else zero.
    pub const fn reset() -> Self {
        Self {
            sp_el0: 0,
            tpidr_el0: 0,
            tpidrro_el0: 0,
            tpidr_el1: 0,
            elr_el1: 0,
            spsr_el1: 0,
            vbar_el1: 0,
            sctlr_el1: SCTLR_EL1_RESET,
            cpacr_el1: 0,
            ttbr0_el1: 0,
            ttbr1_el1: 0,
            tcr_el1: 0,
            mair_el1: 0,
            amair_el1: 0,
            contextidr_el1: 0,
            esr_el1: 0,
            far_el1: 0,
            par_el1: 0,
        }
    }

    /// Capture the live EL1 register bank.
    #[cfg(target_os = "none")]
    pub fn save() -> Self {
        let mut regs = Self::default();
        macro_rules! save {
            ($($reg:ident),*) => {
                $(
                    unsafe {
                        core::arch::asm!(
                            concat!("mrs {}, ", stringify!($reg)),
                            out(reg) regs.$reg,
                        );
                    }
                )*
            };
        }
        el1_sysregs!(save);
        regs
    }

    /// Install this bank into the live EL1 registers.
    #[cfg(target_os = "none")]
    pub fn restore(&self) {
        macro_rules! restore {
            ($($reg:ident),*) => {
                $(
                    unsafe {
                        core::arch::asm!(
                            concat!("msr ", stringify!($reg), ", {}"),
                            in(reg) self.$reg,
                        );
                    }
                )*
            };
        }
        el1_sysregs!(restore);
        unsafe {
            core::arch::asm!("isb");
        }
    }

    #[cfg(not(target_os = "none"))]
    pub fn save() -> Self {
        Self::default()
    }

    #[cfg(not(target_os = "none"))]
    pub fn restore(&self) {}
}

/// Complete register state of one execution context.
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessorContext {
    /// General purpose registers x0-x30
    pub gpr: [u64; 31],
    /// Guest kernel stack pointer
    pub sp_el1: u64,
    /// Exception return address
    pub elr_el2: u64,
    /// Saved program status, including the EL to return to
    pub spsr_el2: u64,
    pub fpcr: u64,
    pub fpsr: u64,
    /// SIMD/FP registers v0-v31
    pub vregs: [u128; 32],
    pub sysregs: El1SysRegs,
}

pub const CONTEXT_SIZE: usize = size_of::<ProcessorContext>();
pub const OFFSET_SP_EL1: usize = offset_of!(ProcessorContext, sp_el1);
pub const OFFSET_ELR_EL2: usize = offset_of!(ProcessorContext, elr_el2);
pub const OFFSET_FPCR: usize = offset_of!(ProcessorContext, fpcr);
pub const OFFSET_VREGS: usize = offset_of!(ProcessorContext, vregs);
pub const OFFSET_SYSREGS: usize = offset_of!(ProcessorContext, sysregs);

const _: () = assert!(OFFSET_SP_EL1 == 248);
const _: () = assert!(OFFSET_ELR_EL2 == 256);
const _: () = assert!(offset_of!(ProcessorContext, spsr_el2) == 264);
const _: () = assert!(OFFSET_FPCR == 272);
const _: () = assert!(offset_of!(ProcessorContext, fpsr) == 280);
const _: () = assert!(OFFSET_VREGS == 288);
const _: () = assert!(OFFSET_SYSREGS == 800);
const _: () = assert!(CONTEXT_SIZE == 944);
const _: () = assert!(CONTEXT_SIZE % 16 == 0);

impl ProcessorContext {
    /// Context with every register zero and EL1 at its reset state.
    pub const fn empty() -> Self {
        Self {
            gpr: [0; 31],
            sp_el1: 0,
            elr_el2: 0,
            spsr_el2: 0,
            fpcr: 0,
            fpsr: 0,
            vregs: [0; 32],
            sysregs: El1SysRegs::reset(),
        }
    }

    /// Initial context of a guest that has never run.
    ///
    /// The guest starts in EL1h at `entry` with every exception masked, its
    /// stack pointer at `stack_pointer` and `args` in x0.
    pub const fn new_guest(entry: u64, stack_pointer: u64, args: u64) -> Self {
        let mut ctx = Self::empty();
        ctx.gpr[0] = args;
        ctx.sp_el1 = stack_pointer;
        ctx.elr_el2 = entry;
        ctx.spsr_el2 = Daif::all().bits() | SPSR_MODE_EL1H;
        ctx
    }

    /// Resume address.
    #[inline]
    pub const fn pc(&self) -> u64 {
        self.elr_el2
    }

    /// Exception level this context returns to.
    #[inline]
    pub const fn target_el(&self) -> u8 {
        ((self.spsr_el2 & SPSR_MODE_MASK) >> 2) as u8
    }

    /// True if resuming this context re-enters a guest.
    #[inline]
    pub const fn is_guest(&self) -> bool {
        self.target_el() < 2
    }

    /// Step over the trapping instruction.
    #[inline]
    pub fn skip_instruction(&mut self) {
        self.elr_el2 = self.elr_el2.wrapping_add(4);
    }

    /// Raw byte view of the record, in layout order.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: repr(C), every field is a plain integer and the asserts
        // above prove there is no padding.
        unsafe { core::slice::from_raw_parts(self as *const Self as *const u8, CONTEXT_SIZE) }
    }
}

impl Default for ProcessorContext {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_context_seeds_entry_stack_and_args() {
        let ctx = ProcessorContext::new_guest(0x20_0000, 0x30_0000, 0x20_0000);

        assert_eq!(ctx.pc(), 0x20_0000);
        assert_eq!(ctx.sp_el1, 0x30_0000);
        assert_eq!(ctx.gpr[0], 0x20_0000);
        assert_eq!(ctx.target_el(), 1);
        assert!(ctx.is_guest());
        assert_eq!(ctx.spsr_el2, 0x3c5);
        assert_eq!(ctx.sysregs.sctlr_el1, SCTLR_EL1_RESET);
    }

    #[test]
    fn hypervisor_context_is_not_a_guest() {
        let mut ctx = ProcessorContext::empty();
        ctx.spsr_el2 = SPSR_MODE_EL2H;
        assert_eq!(ctx.target_el(), 2);
        assert!(!ctx.is_guest());
    }

    #[test]
    fn copy_reproduces_identical_bytes() {
        let mut ctx = ProcessorContext::new_guest(0x1000, 0x8000, 7);
        for (i, r) in ctx.gpr.iter_mut().enumerate() {
            *r = 0xdead_0000 + i as u64;
        }
        ctx.vregs[31] = u128::MAX - 1;
        ctx.sysregs.vbar_el1 = 0x4_0000;

        let saved = ctx;
        assert_eq!(saved.as_bytes(), ctx.as_bytes());
        assert_eq!(saved.as_bytes().len(), CONTEXT_SIZE);
    }

    #[test]
    fn byte_view_follows_layout() {
        let mut ctx = ProcessorContext::empty();
        ctx.elr_el2 = 0x1122_3344_5566_7788;
        let bytes = ctx.as_bytes();
        let elr = u64::from_ne_bytes(bytes[OFFSET_ELR_EL2..OFFSET_ELR_EL2 + 8].try_into().unwrap());
        assert_eq!(elr, 0x1122_3344_5566_7788);
    }

    #[test]
    fn skip_instruction_advances_pc() {
        let mut ctx = ProcessorContext::new_guest(0x100, 0, 0);
        ctx.skip_instruction();
        assert_eq!(ctx.pc(), 0x104);
    }
}
