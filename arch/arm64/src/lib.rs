// =============================================================================
// raspvisor - ARM64 Architecture Module
// =============================================================================
// This module contains all ARM64 / BCM2837 specific code:
// - Boot code (boot.S)
// - CPU utilities and EL2 configuration
// - Processor context layout
// - EL2 exception vector and trap entry
// - Interrupt controller
// - System timer
// - Mini UART console
//
// SPDX-License-Identifier: GPL-2.0
// =============================================================================

#![cfg_attr(not(test), no_std)]

pub mod context;
pub mod cpu;
pub mod exception;
pub mod irq;
pub mod timer;
pub mod uart;

/// BCM2837 peripheral window as seen by the ARM cores.
pub const PERIPHERAL_BASE: usize = 0x3f00_0000;

/// Initialize the ARM64 hardware for hypervisor operation.
///
/// Sets up everything the trap path depends on. Interrupts stay masked; the
/// caller unmasks them once the scheduler holds at least one task.
///
/// # Safety
/// This function must only be called once during boot, at EL2.
pub unsafe fn init(tick_interval: u32) {
    // 1. EL2 controls: route interrupts here, guests are AArch64 EL1
    cpu::configure_el2();

    // 2. Exception vectors
    exception::init();

    // 3. Interrupt controller, only the scheduling tick enabled
    irq::InterruptController::init();
    irq::InterruptController::enable(irq::Irq::SystemTimer1);

    // 4. First tick
    timer::init(tick_interval);
}
