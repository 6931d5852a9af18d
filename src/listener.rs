//! Shared isolated-dispatch helper used by the registry, bus, and CNP
//! manager. Rust has no checked exceptions, so "a listener that throws"
//! is modeled as a listener callback that panics; [`notify_listeners`]
//! catches that panic, logs it, and keeps delivering to the remaining
//! listeners in insertion order. The triggering operation always
//! returns normally.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Invoke `call` once per listener, in order, isolating panics.
pub fn notify_listeners<T, F>(listeners: &[Arc<T>], call: F)
where
    T: ?Sized,
    F: Fn(&T),
{
    for listener in listeners {
        let outcome = catch_unwind(AssertUnwindSafe(|| call(listener.as_ref())));
        if let Err(panic) = outcome {
            let message = panic_message(&panic);
            tracing::error!(error = %message, "listener panicked; isolating and continuing");
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
