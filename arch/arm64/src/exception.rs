// =============================================================================
// raspvisor - EL2 Exception Vector
// =============================================================================
// The single entry point for every exception taken to EL2: synchronous traps,
// IRQ, FIQ and SError, from the hypervisor itself or from a guest at EL1.
//
// Each vector slot pushes a ProcessorContext onto the EL2 stack, tags it with
// its `kind` (origin << 2 | class) and branches to the common path, which
// calls `hv_handle_exception`. Whatever context sits in the frame when that
// returns is what `eret` resumes: the scheduler switches tasks by replacing
// the frame contents.
// =============================================================================

use core::fmt;

use crate::context::ProcessorContext;
#[cfg(target_os = "none")]
use crate::context::{El1SysRegs, CONTEXT_SIZE, OFFSET_ELR_EL2, OFFSET_FPCR, OFFSET_VREGS};

#[cfg(target_os = "none")]
core::arch::global_asm!(
    r#"
.macro VENTRY kind
    .balign 0x80
    sub     sp, sp, #{ctx_size}
    stp     x0, x1, [sp, #0]
    mov     x1, #\kind
    b       hv_trap_common
.endm

.section .text.vectors, "ax"
.balign 0x800
.global hv_vector_table
hv_vector_table:
    VENTRY 0
    VENTRY 1
    VENTRY 2
    VENTRY 3
    VENTRY 4
    VENTRY 5
    VENTRY 6
    VENTRY 7
    VENTRY 8
    VENTRY 9
    VENTRY 10
    VENTRY 11
    VENTRY 12
    VENTRY 13
    VENTRY 14
    VENTRY 15

.section .text
hv_trap_common:
    stp     x2, x3, [sp, #16]
    stp     x4, x5, [sp, #32]
    stp     x6, x7, [sp, #48]
    stp     x8, x9, [sp, #64]
    stp     x10, x11, [sp, #80]
    stp     x12, x13, [sp, #96]
    stp     x14, x15, [sp, #112]
    stp     x16, x17, [sp, #128]
    stp     x18, x19, [sp, #144]
    stp     x20, x21, [sp, #160]
    stp     x22, x23, [sp, #176]
    stp     x24, x25, [sp, #192]
    stp     x26, x27, [sp, #208]
    stp     x28, x29, [sp, #224]
    mrs     x21, sp_el1
    stp     x30, x21, [sp, #240]
    mrs     x22, elr_el2
    mrs     x23, spsr_el2
    stp     x22, x23, [sp, #{off_elr}]
    mrs     x22, fpcr
    mrs     x23, fpsr
    stp     x22, x23, [sp, #{off_fpcr}]
    add     x2, sp, #{off_vregs}
    stp     q0, q1, [x2, #0]
    stp     q2, q3, [x2, #32]
    stp     q4, q5, [x2, #64]
    stp     q6, q7, [x2, #96]
    stp     q8, q9, [x2, #128]
    stp     q10, q11, [x2, #160]
    stp     q12, q13, [x2, #192]
    stp     q14, q15, [x2, #224]
    stp     q16, q17, [x2, #256]
    stp     q18, q19, [x2, #288]
    stp     q20, q21, [x2, #320]
    stp     q22, q23, [x2, #352]
    stp     q24, q25, [x2, #384]
    stp     q26, q27, [x2, #416]
    stp     q28, q29, [x2, #448]
    stp     q30, q31, [x2, #480]

    mov     x0, sp
    bl      hv_handle_exception

    add     x2, sp, #{off_vregs}
    ldp     q0, q1, [x2, #0]
    ldp     q2, q3, [x2, #32]
    ldp     q4, q5, [x2, #64]
    ldp     q6, q7, [x2, #96]
    ldp     q8, q9, [x2, #128]
    ldp     q10, q11, [x2, #160]
    ldp     q12, q13, [x2, #192]
    ldp     q14, q15, [x2, #224]
    ldp     q16, q17, [x2, #256]
    ldp     q18, q19, [x2, #288]
    ldp     q20, q21, [x2, #320]
    ldp     q22, q23, [x2, #352]
    ldp     q24, q25, [x2, #384]
    ldp     q26, q27, [x2, #416]
    ldp     q28, q29, [x2, #448]
    ldp     q30, q31, [x2, #480]
    ldp     x22, x23, [sp, #{off_fpcr}]
    msr     fpcr, x22
    msr     fpsr, x23
    ldp     x22, x23, [sp, #{off_elr}]
    msr     elr_el2, x22
    msr     spsr_el2, x23
    ldp     x30, x21, [sp, #240]
    msr     sp_el1, x21
    ldp     x0, x1, [sp, #0]
    ldp     x2, x3, [sp, #16]
    ldp     x4, x5, [sp, #32]
    ldp     x6, x7, [sp, #48]
    ldp     x8, x9, [sp, #64]
    ldp     x10, x11, [sp, #80]
    ldp     x12, x13, [sp, #96]
    ldp     x14, x15, [sp, #112]
    ldp     x16, x17, [sp, #128]
    ldp     x18, x19, [sp, #144]
    ldp     x20, x21, [sp, #160]
    ldp     x22, x23, [sp, #176]
    ldp     x24, x25, [sp, #192]
    ldp     x26, x27, [sp, #208]
    ldp     x28, x29, [sp, #224]
    add     sp, sp, #{ctx_size}
    eret
"#,
    ctx_size = const CONTEXT_SIZE,
    off_elr = const OFFSET_ELR_EL2,
    off_fpcr = const OFFSET_FPCR,
    off_vregs = const OFFSET_VREGS,
);

/// Install the EL2 vector table.
///
/// # Safety
/// Must run at EL2 before any interrupt source is enabled.
pub unsafe fn init() {
    #[cfg(target_os = "none")]
    {
        extern "C" {
            static hv_vector_table: u8;
        }

        let vector_addr = &hv_vector_table as *const u8 as u64;
        core::arch::asm!("msr vbar_el2, {}", in(reg) vector_addr);
        core::arch::asm!("isb");
    }
}

/// Which of the four exception types was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionClass {
    Synchronous,
    Irq,
    Fiq,
    SError,
}

/// Where the processor was executing when the exception was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionOrigin {
    /// EL2 using SP_EL0. The hypervisor never runs like this.
    CurrentElSp0,
    /// EL2 using SP_EL2: hypervisor code.
    CurrentElSpx,
    /// A guest at EL1/EL0 in AArch64.
    LowerAArch64,
    /// A guest in AArch32. Not supported.
    LowerAArch32,
}

/// Vector slot that was entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionKind {
    pub class: ExceptionClass,
    pub origin: ExceptionOrigin,
}

impl ExceptionKind {
    /// Decode the tag the vector entry passes in x1.
    pub const fn decode(raw: u64) -> Self {
        let class = match raw & 0b11 {
            0 => ExceptionClass::Synchronous,
            1 => ExceptionClass::Irq,
            2 => ExceptionClass::Fiq,
            _ => ExceptionClass::SError,
        };
        let origin = match (raw >> 2) & 0b11 {
            0 => ExceptionOrigin::CurrentElSp0,
            1 => ExceptionOrigin::CurrentElSpx,
            2 => ExceptionOrigin::LowerAArch64,
            _ => ExceptionOrigin::LowerAArch32,
        };
        Self { class, origin }
    }

    /// Inverse of [`ExceptionKind::decode`].
    pub const fn encode(self) -> u64 {
        let class = match self.class {
            ExceptionClass::Synchronous => 0,
            ExceptionClass::Irq => 1,
            ExceptionClass::Fiq => 2,
            ExceptionClass::SError => 3,
        };
        let origin = match self.origin {
            ExceptionOrigin::CurrentElSp0 => 0,
            ExceptionOrigin::CurrentElSpx => 1,
            ExceptionOrigin::LowerAArch64 => 2,
            ExceptionOrigin::LowerAArch32 => 3,
        };
        (origin << 2) | class
    }

    /// Taken while a guest was executing.
    pub const fn from_guest(&self) -> bool {
        matches!(self.origin, ExceptionOrigin::LowerAArch64)
    }

    /// Taken while the hypervisor itself was executing.
    pub const fn from_hypervisor(&self) -> bool {
        matches!(self.origin, ExceptionOrigin::CurrentElSpx)
    }

    /// Originating exception level.
    pub const fn exception_level(&self) -> u8 {
        match self.origin {
            ExceptionOrigin::CurrentElSp0 | ExceptionOrigin::CurrentElSpx => 2,
            ExceptionOrigin::LowerAArch64 | ExceptionOrigin::LowerAArch32 => 1,
        }
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} from EL{} ({:?})", self.class, self.exception_level(), self.origin)
    }
}

/// ESR_EL2 exception classes the dispatcher distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyndromeClass {
    Unknown,
    WfiWfe,
    Hvc64,
    Smc64,
    SysReg,
    InstructionAbortLower,
    InstructionAbortSame,
    PcAlignment,
    DataAbortLower,
    DataAbortSame,
    SpAlignment,
    SError,
    Brk64,
    Other(u8),
}

/// ESR_EL2 exception class codes
pub mod ec {
    pub const UNKNOWN: u8 = 0x00;
    pub const WFI_WFE: u8 = 0x01;
    pub const HVC64: u8 = 0x16;
    pub const SMC64: u8 = 0x17;
    pub const SYS_REG: u8 = 0x18;
    pub const IABT_LOWER: u8 = 0x20;
    pub const IABT_SAME: u8 = 0x21;
    pub const PC_ALIGN: u8 = 0x22;
    pub const DABT_LOWER: u8 = 0x24;
    pub const DABT_SAME: u8 = 0x25;
    pub const SP_ALIGN: u8 = 0x26;
    pub const SERROR: u8 = 0x2f;
    pub const BRK64: u8 = 0x3c;
}

impl SyndromeClass {
    pub const fn from_ec(code: u8) -> Self {
        match code {
            ec::UNKNOWN => Self::Unknown,
            ec::WFI_WFE => Self::WfiWfe,
            ec::HVC64 => Self::Hvc64,
            ec::SMC64 => Self::Smc64,
            ec::SYS_REG => Self::SysReg,
            ec::IABT_LOWER => Self::InstructionAbortLower,
            ec::IABT_SAME => Self::InstructionAbortSame,
            ec::PC_ALIGN => Self::PcAlignment,
            ec::DABT_LOWER => Self::DataAbortLower,
            ec::DABT_SAME => Self::DataAbortSame,
            ec::SP_ALIGN => Self::SpAlignment,
            ec::SERROR => Self::SError,
            ec::BRK64 => Self::Brk64,
            other => Self::Other(other),
        }
    }
}

/// Fault syndrome captured on entry: ESR_EL2 and FAR_EL2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Syndrome {
    pub esr: u64,
    pub far: u64,
}

impl Syndrome {
    pub const fn new(esr: u64, far: u64) -> Self {
        Self { esr, far }
    }

    /// Read the live ESR_EL2 and FAR_EL2.
    pub fn read() -> Self {
        #[cfg(target_os = "none")]
        {
            let esr: u64;
            let far: u64;
            unsafe {
                core::arch::asm!("mrs {}, esr_el2", out(reg) esr);
                core::arch::asm!("mrs {}, far_el2", out(reg) far);
            }
            Self { esr, far }
        }
        #[cfg(not(target_os = "none"))]
        {
            Self::default()
        }
    }

    /// Raw EC field, ESR bits [31:26].
    #[inline]
    pub const fn ec(&self) -> u8 {
        ((self.esr >> 26) & 0x3f) as u8
    }

    #[inline]
    pub const fn class(&self) -> SyndromeClass {
        SyndromeClass::from_ec(self.ec())
    }

    /// Instruction Specific Syndrome, ESR bits [24:0].
    #[inline]
    pub const fn iss(&self) -> u32 {
        (self.esr & 0x01ff_ffff) as u32
    }

    /// Trapped instruction was 32 bits wide.
    #[inline]
    pub const fn il(&self) -> bool {
        (self.esr >> 25) & 1 != 0
    }

    /// Immediate of an HVC/SMC/BRK instruction.
    #[inline]
    pub const fn imm16(&self) -> u16 {
        (self.esr & 0xffff) as u16
    }
}

/// Everything the dispatcher learns about one exception.
///
/// Lives on the trap path only. `context` is the frame the vector just
/// saved; whatever the dispatcher leaves there is what gets resumed.
#[derive(Debug)]
pub struct TrapRecord<'a> {
    pub kind: ExceptionKind,
    pub syndrome: Syndrome,
    pub context: &'a mut ProcessorContext,
}

impl<'a> TrapRecord<'a> {
    pub fn new(kind: ExceptionKind, syndrome: Syndrome, context: &'a mut ProcessorContext) -> Self {
        Self { kind, syndrome, context }
    }
}

#[cfg(target_os = "none")]
extern "Rust" {
    fn hypervisor_trap(record: TrapRecord<'_>);
}

/// Rust half of the trap path, called by `hv_trap_common` with the saved
/// frame and the vector tag. IRQs stay masked for the whole call.
#[cfg(target_os = "none")]
#[no_mangle]
extern "C" fn hv_handle_exception(ctx: &mut ProcessorContext, kind: u64) {
    ctx.sysregs = El1SysRegs::save();

    let record = TrapRecord::new(ExceptionKind::decode(kind), Syndrome::read(), &mut *ctx);
    unsafe { hypervisor_trap(record) };

    // The frame may now hold a different task; its EL1 bank goes live
    // together with the general registers on `eret`.
    ctx.sysregs.restore();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_tags_decode_in_table_order() {
        let irq_lower = ExceptionKind::decode(9);
        assert_eq!(irq_lower.class, ExceptionClass::Irq);
        assert_eq!(irq_lower.origin, ExceptionOrigin::LowerAArch64);
        assert!(irq_lower.from_guest());
        assert_eq!(irq_lower.exception_level(), 1);

        let sync_current = ExceptionKind::decode(4);
        assert_eq!(sync_current.class, ExceptionClass::Synchronous);
        assert!(sync_current.from_hypervisor());
        assert_eq!(sync_current.exception_level(), 2);

        let serror_a32 = ExceptionKind::decode(15);
        assert_eq!(serror_a32.class, ExceptionClass::SError);
        assert_eq!(serror_a32.origin, ExceptionOrigin::LowerAArch32);
        assert!(!serror_a32.from_guest());
    }

    #[test]
    fn every_vector_tag_survives_encode() {
        for raw in 0..16 {
            assert_eq!(ExceptionKind::decode(raw).encode(), raw);
        }
    }

    #[test]
    fn syndrome_decodes_hvc() {
        // EC=0x16, IL=1, imm16=0x1234
        let s = Syndrome::new((0x16 << 26) | (1 << 25) | 0x1234, 0);
        assert_eq!(s.class(), SyndromeClass::Hvc64);
        assert!(s.il());
        assert_eq!(s.imm16(), 0x1234);
        assert_eq!(s.iss(), 0x1234);
    }

    #[test]
    fn syndrome_decodes_aborts_and_unknown_classes() {
        let dabt = Syndrome::new((0x24 << 26) | (1 << 25), 0xdead_beef);
        assert_eq!(dabt.class(), SyndromeClass::DataAbortLower);
        assert_eq!(dabt.far, 0xdead_beef);

        assert_eq!(Syndrome::new(0x01 << 26, 0).class(), SyndromeClass::WfiWfe);
        assert_eq!(Syndrome::new(0, 0).class(), SyndromeClass::Unknown);
        assert_eq!(Syndrome::new(0x07 << 26, 0).class(), SyndromeClass::Other(0x07));
    }

    #[test]
    fn kind_display_names_level() {
        let text = ExceptionKind::decode(8).to_string();
        assert!(text.contains("Synchronous"));
        assert!(text.contains("EL1"));
    }
}
