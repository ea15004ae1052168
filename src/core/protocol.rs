use super::enums::{ConnectionState, Message};
use super::transport::Transport;
use async_trait::async_trait;

/// Delegate for connection lifecycle and traffic. Callbacks are delivered on
/// the notification lane, strictly in the order the events were produced.
#[async_trait]
pub trait WebSocketProtocol: Send {
    /// The upgrade completed; `transport` is the write handle for this
    /// connection.
    async fn on_connect(&mut self, transport: Transport);

    /// Fired at most once per distinct state.
    async fn on_state_change(&mut self, state: ConnectionState);

    async fn on_message(&mut self, message: Message);

    async fn on_viability_change(&mut self, _viable: bool) {}

    async fn on_better_path(&mut self, _available: bool) {}
}
