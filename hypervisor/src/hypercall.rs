// =============================================================================
// raspvisor - Hypercalls
// =============================================================================
// Guests call into the hypervisor with `hvc #0`: function number in x0,
// arguments in x1.., result returned in x0.
//
//   0  EXIT     terminate the calling task
//   1  YIELD    give up the rest of the time slice
//   2  TASK_ID  x0 <- raw handle of the caller
//   3  PUTC     write the low byte of x1 to the console
// =============================================================================

use raspvisor_arch_arm64::context::ProcessorContext;
use raspvisor_arch_arm64::uart;

use crate::error::HvError;
use crate::sched::Scheduler;

pub const HVC_EXIT: u64 = 0;
pub const HVC_YIELD: u64 = 1;
pub const HVC_TASK_ID: u64 = 2;
pub const HVC_PUTC: u64 = 3;

/// Returned in x0 for an unknown function number.
pub const HVC_UNKNOWN: u64 = u64::MAX;

/// Write-only byte sink behind `PUTC`.
pub trait ConsoleSink {
    fn put_byte(&mut self, byte: u8);
}

/// Guest console on the mini UART.
pub struct UartConsole;

impl ConsoleSink for UartConsole {
    fn put_byte(&mut self, byte: u8) {
        if byte == b'\n' {
            uart::putc(b'\r');
        }
        uart::putc(byte);
    }
}

/// Handle an `hvc` from the running task.
///
/// ELR already points past the `hvc`, so `ctx` resumes at the next
/// instruction. EXIT and YIELD switch tasks by overwriting `ctx` with the
/// context the scheduler picked.
pub fn handle(
    ctx: &mut ProcessorContext,
    scheduler: &mut Scheduler,
    console: &mut impl ConsoleSink,
) -> Result<(), HvError> {
    let function = ctx.gpr[0];
    match function {
        HVC_EXIT => {
            let next = scheduler.exit_current(ctx)?;
            *ctx = *next;
        }
        HVC_YIELD => {
            ctx.gpr[0] = 0;
            let next = scheduler.yield_current(ctx)?;
            *ctx = *next;
        }
        HVC_TASK_ID => {
            ctx.gpr[0] = scheduler.current().map_or(HVC_UNKNOWN, |id| id.as_raw());
        }
        HVC_PUTC => {
            console.put_byte(ctx.gpr[1] as u8);
            ctx.gpr[0] = 0;
        }
        _ => {
            log::warn!(
                "unknown hypercall {} from task {:?} at {:#x}",
                function,
                scheduler.current(),
                ctx.pc()
            );
            ctx.gpr[0] = HVC_UNKNOWN;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskSeed, TaskState};

    #[derive(Default)]
    struct BufferConsole(Vec<u8>);

    impl ConsoleSink for BufferConsole {
        fn put_byte(&mut self, byte: u8) {
            self.0.push(byte);
        }
    }

    fn two_tasks() -> (Scheduler, ProcessorContext) {
        let mut s = Scheduler::new();
        s.create_task(&TaskSeed::bare("A", 0x10_0000, 0x11_0000, 0)).unwrap();
        s.create_task(&TaskSeed::bare("B", 0x20_0000, 0x21_0000, 0)).unwrap();
        let ctx = *s.tick(&ProcessorContext::empty()).unwrap();
        (s, ctx)
    }

    fn call(ctx: &mut ProcessorContext, function: u64, arg: u64) {
        ctx.gpr[0] = function;
        ctx.gpr[1] = arg;
        ctx.elr_el2 += 4;
    }

    #[test]
    fn putc_writes_to_the_console() {
        let (mut s, mut ctx) = two_tasks();
        let mut console = BufferConsole::default();
        for &b in b"hi" {
            call(&mut ctx, HVC_PUTC, b as u64 | 0xff00);
            handle(&mut ctx, &mut s, &mut console).unwrap();
            assert_eq!(ctx.gpr[0], 0);
        }
        assert_eq!(console.0, b"hi");
        assert_eq!(ctx.pc(), 0x10_0008);
    }

    #[test]
    fn task_id_returns_the_callers_handle() {
        let (mut s, mut ctx) = two_tasks();
        let a = s.current().unwrap();
        call(&mut ctx, HVC_TASK_ID, 0);
        handle(&mut ctx, &mut s, &mut BufferConsole::default()).unwrap();
        assert_eq!(ctx.gpr[0], a.as_raw());
    }

    #[test]
    fn exit_switches_to_the_next_task() {
        let (mut s, mut ctx) = two_tasks();
        let a = s.current().unwrap();
        call(&mut ctx, HVC_EXIT, 0);
        handle(&mut ctx, &mut s, &mut BufferConsole::default()).unwrap();

        assert_eq!(s.state(a), Some(TaskState::Terminated));
        assert_eq!(ctx.pc(), 0x20_0000);
        assert_ne!(s.current(), Some(a));
    }

    #[test]
    fn yield_resumes_after_the_hvc_later() {
        let (mut s, mut ctx) = two_tasks();
        call(&mut ctx, HVC_YIELD, 0);
        let after_hvc = ctx.pc();
        handle(&mut ctx, &mut s, &mut BufferConsole::default()).unwrap();
        assert_eq!(ctx.pc(), 0x20_0000);

        // B's slice ends, A comes back right after its hvc with x0 = 0
        let ctx = *s.tick(&ctx).unwrap();
        assert_eq!(ctx.pc(), after_hvc);
        assert_eq!(ctx.gpr[0], 0);
    }

    #[test]
    fn unknown_function_returns_all_ones() {
        let (mut s, mut ctx) = two_tasks();
        call(&mut ctx, 0x1234, 0);
        handle(&mut ctx, &mut s, &mut BufferConsole::default()).unwrap();
        assert_eq!(ctx.gpr[0], HVC_UNKNOWN);
        assert_eq!(s.live_count(), 2);
    }
}
