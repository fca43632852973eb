//! Lock-free primitives shared between the control, timer and audio domains.
//!
//! Floating point values travel as IEEE-754 bit patterns inside 32/64-bit
//! atomic cells, so every read observes a value that was actually written.

use atomic_float::{AtomicF32, AtomicF64};
use std::sync::atomic::{AtomicBool, Ordering};

/// Cache-line aligned atomic f32 cell.
#[derive(Debug)]
#[repr(align(64))]
pub struct AtomicFloat {
    bits: AtomicF32,
}

impl AtomicFloat {
    pub fn new(value: f32) -> Self {
        Self {
            bits: AtomicF32::new(value),
        }
    }

    #[inline]
    pub fn get(&self) -> f32 {
        self.bits.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: f32) {
        self.bits.store(value, Ordering::Release);
    }

    #[inline]
    pub fn swap(&self, value: f32) -> f32 {
        self.bits.swap(value, Ordering::AcqRel)
    }

    /// Raise the stored value to `value` if it is larger. Returns the
    /// resulting maximum.
    #[inline]
    pub fn raise_to(&self, value: f32) -> f32 {
        self.bits.fetch_max(value, Ordering::AcqRel).max(value)
    }
}

impl Clone for AtomicFloat {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

impl Default for AtomicFloat {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Cache-line aligned atomic f64 cell, used for beat positions.
#[derive(Debug)]
#[repr(align(64))]
pub struct AtomicDouble {
    bits: AtomicF64,
}

impl AtomicDouble {
    pub fn new(value: f64) -> Self {
        Self {
            bits: AtomicF64::new(value),
        }
    }

    #[inline]
    pub fn get(&self) -> f64 {
        self.bits.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: f64) {
        self.bits.store(value, Ordering::Release);
    }
}

impl Clone for AtomicDouble {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

impl Default for AtomicDouble {
    fn default() -> Self {
        Self::new(0.0)
    }
}

/// Cache-line aligned atomic bool.
#[derive(Debug)]
#[repr(align(64))]
pub struct AtomicFlag {
    value: AtomicBool,
}

impl AtomicFlag {
    pub fn new(value: bool) -> Self {
        Self {
            value: AtomicBool::new(value),
        }
    }

    #[inline]
    pub fn get(&self) -> bool {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set(&self, value: bool) {
        self.value.store(value, Ordering::Release);
    }

    /// Set and return the previous value.
    #[inline]
    pub fn swap(&self, value: bool) -> bool {
        self.value.swap(value, Ordering::AcqRel)
    }
}

impl Clone for AtomicFlag {
    fn clone(&self) -> Self {
        Self::new(self.get())
    }
}

impl Default for AtomicFlag {
    fn default() -> Self {
        Self::new(false)
    }
}
