use tokio::sync::mpsc;

use crate::types::FileChange;

/// Something the consumer of the gateway should hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    /// Previously returned content under these URIs is stale
    FilesChanged(Vec<FileChange>),
    /// A backend call failed and remote activity was suspended
    BackendFailed { service: String, message: String },
    /// Remote activity was suspended (`true`) or resumed (`false`)
    SuspensionChanged(bool),
}

/// Receives notifications emitted by the gateway
pub trait EventSink: Send + Sync {
    fn files_changed(&self, changes: Vec<FileChange>);

    fn backend_failed(&self, service: &str, message: &str) {
        tracing::error!(service, message, "Remote access failed");
    }

    fn suspension_changed(&self, _suspended: bool) {}
}

impl EventSink for mpsc::UnboundedSender<GatewayEvent> {
    fn files_changed(&self, changes: Vec<FileChange>) {
        let _ = self.send(GatewayEvent::FilesChanged(changes));
    }

    fn backend_failed(&self, service: &str, message: &str) {
        let _ = self.send(GatewayEvent::BackendFailed {
            service: service.to_string(),
            message: message.to_string(),
        });
    }

    fn suspension_changed(&self, suspended: bool) {
        let _ = self.send(GatewayEvent::SuspensionChanged(suspended));
    }
}

/// Drops every notification
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardEvents;

impl EventSink for DiscardEvents {
    fn files_changed(&self, _changes: Vec<FileChange>) {}
}
