// huddle-client: optimistic chat session, offline queue and relay driver

pub mod cache;
pub mod driver;
pub mod error;
pub mod liveness;
pub mod outbox;
pub mod reconcile;
pub mod room;
pub mod session;

pub use cache::{MemoryMessageCache, MessageCache};
pub use driver::{spawn, ClientConfig, SessionHandle};
pub use error::ClientError;
pub use session::{ChatSession, ConnectionState, ReconnectPolicy};
