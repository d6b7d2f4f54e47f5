pub mod broker;
pub mod collab;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod publisher;
pub mod routes;

use std::sync::Arc;

use broker::Broker;
use collab::{ConversationDirectory, TokenValidator};
use config::Config;
use gateway::registry::ConnectionRegistry;
use publisher::EventPublisher;

/// Shared application state available to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub publisher: EventPublisher,
    pub registry: Arc<ConnectionRegistry>,
    pub tokens: Arc<dyn TokenValidator>,
    pub conversations: Arc<dyn ConversationDirectory>,
    pub config: Arc<Config>,
}
