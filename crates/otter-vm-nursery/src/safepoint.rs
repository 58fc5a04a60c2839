//! Stop-the-world proof token
//!
//! Fragment rebuilding, fragment clearing and remembered-set scanning must run
//! while every mutator is parked at a safe point. The safepoint mechanism
//! itself lives outside this crate; it hands the collector a `WorldStopped`
//! value once all mutators have stopped, and every stop-the-world entry point
//! here requires a borrow of it.

use std::marker::PhantomData;

/// Proof that all mutator threads are suspended.
///
/// Not `Send`: the token belongs to the thread that stopped the world.
#[derive(Debug)]
pub struct WorldStopped {
    _not_send: PhantomData<*const ()>,
}

impl WorldStopped {
    /// Assert that the world is stopped.
    ///
    /// # Safety
    ///
    /// Every thread that may allocate from the nursery or run a write barrier
    /// must be parked at a safe point, and must stay parked until the returned
    /// token is dropped.
    #[inline]
    pub unsafe fn assume() -> Self {
        Self {
            _not_send: PhantomData,
        }
    }
}
