pub mod cache;
pub mod channel;
pub mod clock;
pub mod config;
pub mod engine;
pub mod limits;
pub mod live;
pub mod model;
pub mod observability;
pub mod orchestrator;
pub mod store;
pub mod wal;

pub use channel::{ChannelError, LogChannel, NotificationChannel};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use engine::{Engine, EngineError, MaterializeOutcome};
pub use live::LiveHub;
pub use orchestrator::{Orchestrator, Tick, TickReport};
pub use store::{DurableStore, MemoryStore, Store, StoreError};
