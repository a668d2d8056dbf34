// =============================================================================
// raspvisor - Trap Dispatcher
// =============================================================================
// Routes every exception taken to EL2. The vector code has already saved the
// interrupted context into `record.context`; whatever is left there when the
// dispatcher returns is what `eret` resumes.
//
// Routing:
//   IRQ                      timer tick -> scheduler, anything else is logged
//   FIQ                      logged and ignored
//   sync from guest          HVC -> hypercall, WFI/WFE -> yield,
//                            anything else terminates the task
//   SError from guest        terminates the task
//   sync/SError from EL2     fatal
//   EL2t or AArch32 vectors  fatal
// =============================================================================

use raspvisor_arch_arm64::context::ProcessorContext;
use raspvisor_arch_arm64::exception::{
    ExceptionClass, ExceptionKind, ExceptionOrigin, SyndromeClass, TrapRecord,
};
use raspvisor_arch_arm64::irq::InterruptController;
use raspvisor_arch_arm64::timer::TickSource;

use crate::error::HvError;
use crate::hypercall::{self, ConsoleSink};
use crate::sched::Scheduler;

/// What the trap path does after dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// `eret` into the context left in the frame.
    Resume,
    /// Stop the core.
    Halt(HvError),
}

/// Route one exception.
pub fn dispatch(
    record: TrapRecord<'_>,
    scheduler: &mut Scheduler,
    timer: &mut impl TickSource,
    console: &mut impl ConsoleSink,
) -> Disposition {
    let TrapRecord { kind, syndrome, context } = record;

    let result = match (kind.origin, kind.class) {
        (ExceptionOrigin::CurrentElSp0 | ExceptionOrigin::LowerAArch32, _)
        | (ExceptionOrigin::CurrentElSpx, ExceptionClass::Synchronous | ExceptionClass::SError) => {
            Err(HvError::HypervisorFault {
                kind,
                esr: syndrome.esr,
                elr: context.elr_el2,
                far: syndrome.far,
            })
        }
        (_, ExceptionClass::Irq) => handle_irq(context, scheduler, timer),
        (_, ExceptionClass::Fiq) => {
            log::warn!("unexpected FIQ ({})", kind);
            Ok(())
        }
        (ExceptionOrigin::LowerAArch64, ExceptionClass::Synchronous) => match syndrome.class() {
            SyndromeClass::Hvc64 => hypercall::handle(context, scheduler, console),
            SyndromeClass::WfiWfe => {
                context.skip_instruction();
                switch_to(context, |s, ctx| s.yield_current(ctx), scheduler)
            }
            class => {
                let err = guest_fault(scheduler, kind, class, syndrome.esr, context.elr_el2, syndrome.far);
                log::error!("{}", err);
                switch_to(context, |s, ctx| s.exit_current(ctx), scheduler)
            }
        },
        (ExceptionOrigin::LowerAArch64, ExceptionClass::SError) => {
            let err = guest_fault(
                scheduler,
                kind,
                SyndromeClass::SError,
                syndrome.esr,
                context.elr_el2,
                syndrome.far,
            );
            log::error!("{}", err);
            switch_to(context, |s, ctx| s.exit_current(ctx), scheduler)
        }
    };

    match result {
        Ok(()) => Disposition::Resume,
        Err(err) if err.is_fatal() => Disposition::Halt(err),
        Err(err) => {
            // Only ResourceExhausted is non-fatal and nothing here allocates
            log::error!("trap: {}", err);
            Disposition::Resume
        }
    }
}

fn handle_irq(
    context: &mut ProcessorContext,
    scheduler: &mut Scheduler,
    timer: &mut impl TickSource,
) -> Result<(), HvError> {
    if !timer.is_pending() {
        log::warn!("spurious IRQ, pending {:x?}", InterruptController::pending());
        return Ok(());
    }

    // Acknowledge first so the same match cannot re-enter after `eret`
    timer.acknowledge();
    switch_to(context, |s, ctx| s.tick(ctx), scheduler)
}

/// Run a scheduler operation on the frame and install the context it picked.
fn switch_to(
    context: &mut ProcessorContext,
    op: impl for<'s> FnOnce(&'s mut Scheduler, &ProcessorContext) -> Result<&'s ProcessorContext, HvError>,
    scheduler: &mut Scheduler,
) -> Result<(), HvError> {
    let next = op(scheduler, context)?;
    *context = *next;
    Ok(())
}

fn guest_fault(
    scheduler: &Scheduler,
    kind: ExceptionKind,
    class: SyndromeClass,
    esr: u64,
    elr: u64,
    far: u64,
) -> HvError {
    match scheduler.current() {
        Some(task) => HvError::UnhandledSynchronousException { task, kind, class, esr, elr, far },
        None => HvError::ContextCorruption("guest trap with no running task"),
    }
}

// =============================================================================
// Hardware Entry
// =============================================================================

/// Log a fatal error and stop the core.
pub fn fatal(err: HvError) -> ! {
    log::error!("FATAL: {}", err);
    if let Some(scheduler) = crate::sched::SCHEDULER.try_lock() {
        scheduler.dump();
    }
    log::error!("System halted.");
    raspvisor_arch_arm64::cpu::halt()
}

/// Called by the arch trap entry for every exception, IRQs masked.
#[cfg(target_os = "none")]
#[no_mangle]
fn hypervisor_trap(record: TrapRecord<'_>) {
    use raspvisor_arch_arm64::timer::TIMER;

    use crate::hypercall::UartConsole;
    use crate::mm::pmm;
    use crate::sched::SCHEDULER;

    // A fault taken while the hypervisor holds the lock must not deadlock
    let Some(mut scheduler) = SCHEDULER.try_lock() else {
        fatal(HvError::HypervisorFault {
            kind: record.kind,
            esr: record.syndrome.esr,
            elr: record.context.elr_el2,
            far: record.syndrome.far,
        });
    };
    let mut timer = TIMER.lock();

    let disposition = dispatch(record, &mut scheduler, &mut *timer, &mut UartConsole);

    // The frame now holds the next context, terminated tasks are unreferenced
    scheduler.reap(pmm::release);

    if let Disposition::Halt(err) = disposition {
        drop(timer);
        drop(scheduler);
        fatal(err);
    }
}
