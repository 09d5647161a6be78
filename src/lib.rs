pub mod cli;
pub mod config;
pub mod delivery;
pub mod error;
pub mod infra;
pub mod logging;
pub mod model;
pub mod push;
pub mod queue;
pub mod repository;
pub mod server;

pub use config::ServerConfig;
pub use delivery::{DeliveryDispatcher, DispatchReport, RetryOutcome, RetryScheduler};
pub use error::{Result, ServerError};
pub use infra::{PresenceStore, PresenceTracker};
pub use model::*;
pub use push::{PushDispatchWorker, PushGateway, PushReport};
pub use server::DeliveryServer;
