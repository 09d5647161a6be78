pub mod gateway;
pub mod provider;
pub mod types;
pub mod worker;

pub use gateway::PushGateway;
pub use provider::{ApnsProvider, FcmProvider, MockProvider, PushProvider};
pub use types::{PushMessage, PushOutcome, PushTarget, PushVendor};
pub use worker::{PushDispatchWorker, PushReport};
