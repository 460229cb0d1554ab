//! Context notification surface.
//!
//! Interested subsystems register an observer and receive fire-and-forget
//! notifications with no payload and no acknowledgment.

/// Events pushed to context observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextEvent {
    /// Some system state changed that could affect the security level.
    SecurityChanged,
    /// The process is idle; perform maintenance now.
    Housekeeping,
}

/// Observer trait for receiving context events.
///
/// Implement this in the engine or a helper subsystem to react to
/// notifications without coupling to the context internals.
pub trait ContextObserver: Send + Sync {
    fn on_event(&self, event: ContextEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl ContextObserver for NullObserver {
    fn on_event(&self, _event: ContextEvent) {
        // Do nothing
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl ContextObserver for TracingObserver {
    fn on_event(&self, event: ContextEvent) {
        match event {
            ContextEvent::SecurityChanged => {
                tracing::info!("security state may have changed");
            }
            ContextEvent::Housekeeping => {
                tracing::debug!("housekeeping requested");
            }
        }
    }
}
