pub mod catch_up;
pub mod coordinator;
pub mod dedup;
pub mod events;
pub mod ledger;
pub mod lookup;
pub mod lru;
pub mod network;
pub mod registry;
pub mod scheduler;
pub mod session;
pub mod store;
pub mod transport;
pub mod websocket;

pub use catch_up::{CatchUpBatch, CatchUpEngine, CatchUpOutcome};
pub use coordinator::{Applied, DeliveryCoordinator};
pub use events::{EventDispatcher, EventType, SyncEvent};
pub use lookup::{BulkLookup, LookupCache, Resolved};
pub use network::NetworkMonitor;
pub use registry::{ChannelRegistry, ChannelState, StatusChange};
pub use scheduler::{BackoffPolicy, ReconnectOutcome, ReconnectScheduler, Reconnector};
pub use session::{CatchUpReport, ChannelSession, SyncContext};
pub use store::{LocalStore, MemoryStore};
pub use transport::{ChannelTransport, Inbound, InboundSender, PageFetcher};
pub use websocket::WebSocketTransport;
