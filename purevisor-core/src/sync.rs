//! Interrupt-safe locking.
//!
//! State that interrupt handlers touch must be locked with interrupts
//! disabled, or a handler arriving on the lock-holding CPU deadlocks.
//! [`IrqMutex`] wraps `spin::Mutex`: acquire saves the interrupt flag and
//! disables interrupts before spinning, release restores the saved state
//! when the guard drops.

use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

#[cfg(target_arch = "x86_64")]
#[inline]
fn save_and_disable() -> bool {
    let enabled = x86_64_interrupts_enabled();
    if enabled {
        unsafe { core::arch::asm!("cli", options(nomem, nostack)) };
    }
    enabled
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn x86_64_interrupts_enabled() -> bool {
    let rflags: u64;
    unsafe {
        core::arch::asm!("pushfq", "pop {}", out(reg) rflags, options(nomem));
    }
    rflags & (1 << 9) != 0
}

#[cfg(target_arch = "x86_64")]
#[inline]
fn restore(enabled: bool) {
    if enabled {
        unsafe { core::arch::asm!("sti", options(nomem, nostack)) };
    }
}

/// A spinlock whose critical sections run with interrupts disabled.
pub struct IrqMutex<T> {
    inner: Mutex<T>,
}

impl<T> IrqMutex<T> {
    pub const fn new(value: T) -> Self {
        IrqMutex {
            inner: Mutex::new(value),
        }
    }

    /// Acquire: save the interrupt flag, disable interrupts, then spin.
    ///
    /// # Safety
    /// Must only be called in ring 0; CLI/STI fault elsewhere.
    #[cfg(target_arch = "x86_64")]
    pub unsafe fn lock(&self) -> IrqGuard<'_, T> {
        let was_enabled = save_and_disable();
        IrqGuard {
            guard: core::mem::ManuallyDrop::new(self.inner.lock()),
            was_enabled,
        }
    }

    /// Access without touching the interrupt flag, for contexts that have
    /// already masked interrupts (or hosted tests).
    pub fn lock_noirq(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }
}

/// Guard that releases the lock, then restores the saved interrupt state.
#[cfg(target_arch = "x86_64")]
pub struct IrqGuard<'a, T> {
    guard: core::mem::ManuallyDrop<MutexGuard<'a, T>>,
    was_enabled: bool,
}

#[cfg(target_arch = "x86_64")]
impl<T> Deref for IrqGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

#[cfg(target_arch = "x86_64")]
impl<T> DerefMut for IrqGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(target_arch = "x86_64")]
impl<T> Drop for IrqGuard<'_, T> {
    fn drop(&mut self) {
        // The lock must be released before interrupts come back on.
        unsafe { core::mem::ManuallyDrop::drop(&mut self.guard) };
        restore(self.was_enabled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noirq_path_locks_and_unlocks() {
        let m = IrqMutex::new(41);
        {
            let mut v = m.lock_noirq();
            *v += 1;
        }
        assert_eq!(*m.lock_noirq(), 42);
    }
}
