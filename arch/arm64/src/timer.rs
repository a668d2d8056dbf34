// =============================================================================
// raspvisor - BCM2837 System Timer
// =============================================================================
// Driver for the free-running 1 MHz system timer of the Raspberry Pi 3.
// The hypervisor uses compare channel 1 (channels 0 and 2 belong to the GPU).
//
// The next deadline is always computed from the previous deadline, never from
// "now", so handler latency does not accumulate into drift.
// =============================================================================

use core::ptr;

use spin::Mutex;

use crate::PERIPHERAL_BASE;

const TIMER_BASE: usize = PERIPHERAL_BASE + 0x0000_3000;

// Register offsets
const TIMER_CS: usize = 0x00; // Control/Status
const TIMER_CLO: usize = 0x04; // Counter lower 32 bits
const TIMER_CHI: usize = 0x08; // Counter higher 32 bits
const TIMER_C1: usize = 0x10; // Compare 1

/// Match flag of compare channel 1 in TIMER_CS. Write 1 to clear.
const TIMER_CS_M1: u32 = 1 << 1;

/// Raw access to one compare channel of a free-running counter.
pub trait TimerRegisters {
    /// Low 32 bits of the free-running counter.
    fn counter(&self) -> u32;
    /// Program the compare register.
    fn set_compare(&mut self, value: u32);
    /// The counter has reached the compare value and the flag is still set.
    fn is_matched(&self) -> bool;
    /// Clear the match flag.
    fn clear_match(&mut self);
}

/// Something that raises the periodic scheduling interrupt.
pub trait TickSource {
    /// The tick interrupt is asserted.
    fn is_pending(&self) -> bool;
    /// Clear the tick and arm the next one.
    fn acknowledge(&mut self);
}

/// Compare channel 1 of the BCM2837 system timer.
pub struct Bcm2837Timer {
    base: usize,
}

impl Bcm2837Timer {
    /// # Safety
    /// `base` must point at the system timer registers.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    fn read_reg(&self, offset: usize) -> u32 {
        // SAFETY: self.base points to the timer block
        unsafe { ptr::read_volatile((self.base + offset) as *const u32) }
    }

    fn write_reg(&mut self, offset: usize, value: u32) {
        // SAFETY: self.base points to the timer block
        unsafe { ptr::write_volatile((self.base + offset) as *mut u32, value) }
    }

    /// Full 64-bit counter value in microseconds.
    pub fn counter64(&self) -> u64 {
        loop {
            let hi = self.read_reg(TIMER_CHI);
            let lo = self.read_reg(TIMER_CLO);
            if hi == self.read_reg(TIMER_CHI) {
                return ((hi as u64) << 32) | lo as u64;
            }
        }
    }
}

impl TimerRegisters for Bcm2837Timer {
    fn counter(&self) -> u32 {
        self.read_reg(TIMER_CLO)
    }

    fn set_compare(&mut self, value: u32) {
        self.write_reg(TIMER_C1, value);
    }

    fn is_matched(&self) -> bool {
        self.read_reg(TIMER_CS) & TIMER_CS_M1 != 0
    }

    fn clear_match(&mut self) {
        self.write_reg(TIMER_CS, TIMER_CS_M1);
    }
}

/// Periodic tick generator on top of a compare channel.
pub struct Timer<R> {
    regs: R,
    interval: u32,
    deadline: u32,
    missed: u64,
}

impl<R: TimerRegisters> Timer<R> {
    pub const fn new(regs: R, interval: u32) -> Self {
        Self { regs, interval, deadline: 0, missed: 0 }
    }

    /// Arm the first deadline one interval from now.
    pub fn init(&mut self) {
        self.deadline = self.regs.counter().wrapping_add(self.interval);
        self.regs.set_compare(self.deadline);
    }

    /// Clear the match and arm `deadline + interval`.
    ///
    /// If the handler ran so late that the new deadline has already passed,
    /// whole intervals are skipped (and counted) so the phase is kept and the
    /// comparator is not left waiting for a 32-bit wrap.
    pub fn acknowledge(&mut self) {
        self.regs.clear_match();
        self.deadline = self.deadline.wrapping_add(self.interval);

        let now = self.regs.counter();
        let mut skipped = 0;
        while (self.deadline.wrapping_sub(now) as i32) <= 0 {
            self.deadline = self.deadline.wrapping_add(self.interval);
            skipped += 1;
        }
        if skipped > 0 {
            self.missed += skipped;
            log::warn!("timer: acknowledged late, {} tick(s) skipped", skipped);
        }

        self.regs.set_compare(self.deadline);
    }

    pub fn deadline(&self) -> u32 {
        self.deadline
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Ticks skipped because acknowledgement came too late.
    pub fn missed(&self) -> u64 {
        self.missed
    }

    pub fn registers(&self) -> &R {
        &self.regs
    }
}

impl<R: TimerRegisters> TickSource for Timer<R> {
    fn is_pending(&self) -> bool {
        self.regs.is_matched()
    }

    fn acknowledge(&mut self) {
        Timer::acknowledge(self);
    }
}

// =============================================================================
// Global Timer Instance
// =============================================================================

/// Scheduling tick, protected by a spinlock. Only touched with IRQs masked.
pub static TIMER: Mutex<Timer<Bcm2837Timer>> =
    // SAFETY: TIMER_BASE is the system timer block on the BCM2837.
    Mutex::new(Timer::new(unsafe { Bcm2837Timer::new(TIMER_BASE) }, 0));

/// Program the tick interval (in 1 MHz counter ticks) and arm the first tick.
pub fn init(interval: u32) {
    let mut timer = TIMER.lock();
    timer.interval = interval;
    timer.init();
}

/// Microseconds since power-on.
pub fn now_us() -> u64 {
    #[cfg(target_os = "none")]
    {
        // SAFETY: read-only access to the counter registers
        unsafe { Bcm2837Timer::new(TIMER_BASE) }.counter64()
    }
    #[cfg(not(target_os = "none"))]
    {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Counter that only moves when the test says so.
    struct FakeRegs {
        now: u32,
        compare: u32,
        matched: bool,
        clears: usize,
    }

    impl FakeRegs {
        fn at(now: u32) -> Self {
            Self { now, compare: 0, matched: false, clears: 0 }
        }
    }

    impl TimerRegisters for FakeRegs {
        fn counter(&self) -> u32 {
            self.now
        }
        fn set_compare(&mut self, value: u32) {
            self.compare = value;
        }
        fn is_matched(&self) -> bool {
            self.matched
        }
        fn clear_match(&mut self) {
            self.matched = false;
            self.clears += 1;
        }
    }

    #[test]
    fn init_arms_one_interval_ahead() {
        let mut timer = Timer::new(FakeRegs::at(1_000), 200_000);
        timer.init();
        assert_eq!(timer.deadline(), 201_000);
        assert_eq!(timer.registers().compare, 201_000);
    }

    #[test]
    fn acknowledged_ticks_advance_by_exact_multiples() {
        const T: u32 = 200_000;
        let mut timer = Timer::new(FakeRegs::at(5), T);
        timer.init();
        let start = timer.deadline();

        for n in 1..=50u32 {
            // Handler runs a little late each time; it must not drift.
            timer.regs.now = timer.deadline().wrapping_add(37);
            timer.regs.matched = true;
            assert!(timer.is_pending());

            TickSource::acknowledge(&mut timer);

            assert!(!timer.is_pending());
            assert_eq!(timer.deadline(), start.wrapping_add(n * T));
            assert_eq!(timer.registers().compare, timer.deadline());
        }
        assert_eq!(timer.missed(), 0);
        assert_eq!(timer.registers().clears, 50);
    }

    #[test]
    fn deadline_wraps_with_the_32_bit_counter() {
        let mut timer = Timer::new(FakeRegs::at(u32::MAX - 50), 100);
        timer.init();
        assert_eq!(timer.deadline(), 49);

        timer.regs.now = 50;
        timer.acknowledge();
        assert_eq!(timer.deadline(), 149);
        assert_eq!(timer.missed(), 0);
    }

    #[test]
    fn late_acknowledge_skips_whole_intervals() {
        let mut timer = Timer::new(FakeRegs::at(0), 100);
        timer.init();

        // Three full intervals went by before the handler ran.
        timer.regs.now = 350;
        timer.acknowledge();

        assert_eq!(timer.deadline(), 400);
        assert_eq!(timer.missed(), 2);
        assert_eq!(timer.deadline() % timer.interval(), 0);
    }

    #[test]
    fn deadline_advance_counts_skipped_intervals() {
        const T: u32 = 100;
        let mut timer = Timer::new(FakeRegs::at(0), T);
        timer.init();
        let start = timer.deadline();

        // Every handler runs 150 late, past the next deadline as well
        for n in 1..=3u32 {
            timer.regs.now = timer.deadline() + 150;
            timer.acknowledge();
            assert_eq!(timer.missed(), n as u64);
            assert!(timer.deadline() > timer.regs.now);
        }

        // Acknowledged plus skipped ticks account for the whole advance
        let ticks = 3 + timer.missed() as u32;
        assert_eq!(timer.deadline(), start + ticks * T);
    }
}
