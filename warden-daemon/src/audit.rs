//! Audit sinks.

use std::sync::Arc;

use tracing::{info, warn};
use warden_core::{AuditError, AuditEvent, AuditLog};

/// Writes each event as one structured `tracing` record under the
/// `warden::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn emit(&self, event: AuditEvent) -> Result<(), AuditError> {
        let metadata =
            serde_json::to_string(&event.metadata).map_err(|e| AuditError(e.to_string()))?;
        let subject =
            serde_json::to_string(&event.target).map_err(|e| AuditError(e.to_string()))?;
        info!(
            target: "warden::audit",
            ts = %event.ts.to_rfc3339(),
            actor = event.actor.as_deref().unwrap_or("-"),
            action = ?event.action,
            subject = %subject,
            metadata = %metadata,
            "audit"
        );
        Ok(())
    }
}

/// Emit `event`, logging and otherwise ignoring a sink failure.
pub fn emit(log: &Arc<dyn AuditLog>, event: AuditEvent) {
    let action = event.action;
    if let Err(e) = log.emit(event) {
        warn!(?action, error = %e, "failed to write audit event");
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;
    use warden_core::AuditAction;

    /// Keeps every event for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingAuditLog {
        events: Mutex<Vec<AuditEvent>>,
    }

    impl RecordingAuditLog {
        pub fn actions(&self) -> Vec<AuditAction> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|event| event.action)
                .collect()
        }

        pub fn events(&self) -> Vec<AuditEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl AuditLog for RecordingAuditLog {
        fn emit(&self, event: AuditEvent) -> Result<(), AuditError> {
            self.events.lock().unwrap().push(event);
            Ok(())
        }
    }
}
