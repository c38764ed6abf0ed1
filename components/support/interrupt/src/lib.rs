/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

// Helps manage "interruptable" things across our various crates.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// The error returned by `err_if_interrupted`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("The operation was interrupted")]
pub struct Interrupted;

/// Represents the state of something that may be interrupted. Decoupled from
/// the interrupt mechanics so that things which want to check if they have
/// been interrupted don't need to know how the interrupt arrives.
pub trait Interruptee {
    fn was_interrupted(&self) -> bool;

    fn err_if_interrupted(&self) -> Result<(), Interrupted> {
        if self.was_interrupted() {
            return Err(Interrupted);
        }
        Ok(())
    }
}

/// A convenience implementation, should only be used in tests.
pub struct NeverInterrupts;

impl Interruptee for NeverInterrupts {
    #[inline]
    fn was_interrupted(&self) -> bool {
        false
    }
}

/// A thread-safe interrupt signal. Each in-flight operation opens a scope
/// with `begin_scope`; calling `interrupt` makes every currently open scope
/// report itself interrupted, while scopes opened afterwards start clean.
///
/// The handle is deliberately not tied to a database connection, so callers
/// that open a connection per operation can still hand out one stable
/// handle for the lifetime of the store.
#[derive(Debug, Default)]
pub struct InterruptHandle {
    generation: Arc<AtomicUsize>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interrupt every scope currently open against this handle.
    pub fn interrupt(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn begin_scope(&self) -> InterruptScope {
        InterruptScope {
            start: self.generation.load(Ordering::SeqCst),
            generation: Arc::clone(&self.generation),
        }
    }
}

impl Clone for InterruptHandle {
    fn clone(&self) -> Self {
        Self {
            generation: Arc::clone(&self.generation),
        }
    }
}

/// The per-operation side of an `InterruptHandle`.
#[derive(Debug)]
pub struct InterruptScope {
    start: usize,
    generation: Arc<AtomicUsize>,
}

impl Interruptee for InterruptScope {
    #[inline]
    fn was_interrupted(&self) -> bool {
        self.generation.load(Ordering::SeqCst) != self.start
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_never_interrupts() {
        assert!(!NeverInterrupts.was_interrupted());
        assert!(NeverInterrupts.err_if_interrupted().is_ok());
    }

    #[test]
    fn test_scope_sees_interrupt() {
        let handle = InterruptHandle::new();
        let scope = handle.begin_scope();
        assert!(scope.err_if_interrupted().is_ok());
        handle.interrupt();
        assert!(scope.was_interrupted());
        assert_eq!(scope.err_if_interrupted(), Err(Interrupted));
    }

    #[test]
    fn test_new_scope_starts_clean() {
        let handle = InterruptHandle::new();
        let scope = handle.begin_scope();
        handle.interrupt();
        assert!(scope.was_interrupted());
        let fresh = handle.begin_scope();
        assert!(!fresh.was_interrupted());
    }

    #[test]
    fn test_interrupt_from_another_thread() {
        let handle = InterruptHandle::new();
        let scope = handle.begin_scope();
        let remote = handle.clone();
        std::thread::spawn(move || remote.interrupt())
            .join()
            .unwrap();
        assert!(scope.was_interrupted());
    }
}
