//! Switches synchronization primitives between `std` and `loom`.
//!
//! Only the lock-free buffers go through this module; the flusher and the
//! sinks always use `std` directly.

#[cfg(not(feature = "loom"))]
pub(crate) mod atomic {
    pub use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
}

#[cfg(feature = "loom")]
pub(crate) mod atomic {
    pub use loom::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
}

#[cfg(not(feature = "loom"))]
pub(crate) mod sync {
    pub use std::sync::Arc;
}

#[cfg(feature = "loom")]
pub(crate) mod sync {
    pub use loom::sync::Arc;
}

#[cfg(not(feature = "loom"))]
pub(crate) mod hint {
    pub use std::hint::spin_loop;
}

#[cfg(feature = "loom")]
pub(crate) mod hint {
    pub use loom::hint::spin_loop;
}

#[cfg(not(feature = "loom"))]
pub(crate) mod thread {
    pub use std::thread::yield_now;
}

#[cfg(feature = "loom")]
pub(crate) mod thread {
    pub use loom::thread::yield_now;
}
