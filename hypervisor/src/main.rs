// =============================================================================
// raspvisor - Hypervisor Entry Point
// =============================================================================
// This is the main Rust entry point for the raspvisor hypervisor.
// Called from boot.S at EL2 after basic hardware initialization.
//
// SPDX-License-Identifier: GPL-2.0
// =============================================================================

#![no_std]
#![no_main]

use core::panic::PanicInfo;

use raspvisor::fs::{FatImageStore, RamDisk};
use raspvisor::loader::RawBinaryLoader;
use raspvisor::{config, logger, mm, sched};
use raspvisor_arch_arm64::{self as arch, cpu, panic_println, println, uart};

// =============================================================================
// Version Information
// =============================================================================

/// raspvisor version
const VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// Hypervisor Entry Point
// =============================================================================

/// Hypervisor main entry point.
///
/// This function is called from assembly boot code after:
/// - CPU 0 is selected (other cores are parked)
/// - The CPU is at EL2
/// - Stack is initialized
/// - BSS section is zeroed
#[no_mangle]
pub extern "C" fn hypervisor_main() -> ! {
    uart::init();
    print_banner();
    print_system_info();
    logger::init();

    // SAFETY: single call on boot, interrupts still masked
    unsafe {
        mm::init();
        arch::init(config::TICK_INTERVAL);
    }

    let loaded = load_guests();
    if loaded == 0 {
        log::error!("no guest could be started");
        cpu::halt();
    }
    log::info!(
        "{} guest(s) loaded, time slice {} us, {} KiB heap free",
        loaded,
        config::TICK_INTERVAL,
        mm::heap::free() / 1024
    );

    // The first tick takes over from here; this loop becomes the idle context
    // SAFETY: vectors, controller and timer are set up, the scheduler holds tasks
    unsafe { cpu::enable_interrupts() };

    idle_loop()
}

/// Load every configured guest from the image volume.
fn load_guests() -> usize {
    // SAFETY: the firmware preloaded the volume there and the page allocator
    // keeps the window reserved
    let disk = unsafe { RamDisk::from_raw(config::RAMDISK_START, config::RAMDISK_SIZE) };
    let mut store = match FatImageStore::new(disk) {
        Ok(store) => store,
        Err(e) => {
            log::error!("image store: {}", e);
            return 0;
        }
    };

    if let Ok(files) = store.list() {
        for (name, size) in files {
            log::info!("fs: {} ({} bytes)", name, size);
        }
    }

    let mut frames = mm::pmm::FRAMES.lock();
    let mut loader = RawBinaryLoader::new(&mut store, &mut *frames);
    let mut loaded = 0;
    for image in config::GUEST_IMAGES {
        match sched::with_scheduler(|s| loader.load(image, s)) {
            Ok(_) => loaded += 1,
            Err(e) => log::error!("failed to start '{}': {}", image.filename, e),
        }
    }
    loaded
}

/// What runs whenever no guest is runnable.
fn idle_loop() -> ! {
    loop {
        cpu::wait_for_interrupt();

        if sched::with_scheduler(|s| s.live_count()) == 0 {
            cpu::disable_interrupts();
            log::info!("all guests terminated");
            sched::with_scheduler(|s| s.dump());
            cpu::halt();
        }
    }
}

// =============================================================================
// Boot Output
// =============================================================================

/// Print the raspvisor boot banner.
fn print_banner() {
    println!();
    println!("=== raspvisor ===");
    println!("raspvisor v{}", VERSION);
    println!("A minimal hypervisor for the Raspberry Pi 3");
    println!();
    println!("============================================================");
}

/// Print system information.
fn print_system_info() {
    let el = cpu::current_el();
    let sp = cpu::read_sp();

    println!("[boot] Hypervisor loaded successfully");
    println!("[boot] Current Exception Level: EL{}", el);
    println!("[boot] Stack Pointer: {:#018x}", sp);
    println!("[boot] UART initialized");
}

// =============================================================================
// Panic Handler
// =============================================================================

/// Panic handler for hypervisor panics.
///
/// Prints diagnostic information and halts the CPU.
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    cpu::disable_interrupts();

    panic_println!();
    panic_println!("!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!");
    panic_println!("!!                   HYPERVISOR PANIC                       !!");
    panic_println!("!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!!");
    panic_println!();

    if let Some(location) = info.location() {
        panic_println!("Location: {}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        );
    }

    if let Some(message) = info.message().as_str() {
        panic_println!("Message: {}", message);
    } else {
        panic_println!("Message: {}", info.message());
    }

    panic_println!();
    panic_println!("System halted.");

    cpu::halt();
}
