//! Engine building blocks shared by operations and the runner

pub mod arguments;
pub mod cancellation;
pub mod entity;
pub mod entity_map;
pub mod events;
pub mod expectations;
pub mod matcher;

pub use arguments::Arguments;
pub use cancellation::{cancellation_pair, CancellationSignal, Canceller};
pub use entity::{
    ClientEntity, CollectionEntity, CursorEntity, DatabaseEntity, Entity, EntityKind, EventObserver,
    ObserverOwner, SessionEntity, DEFAULT_CLIENT_NAME,
};
pub use entity_map::EntityMap;
pub use events::{CapturedEvent, EventLog, EventSink, WaitOutcome};
pub use expectations::ExpectedError;
pub use matcher::{EventMatcher, MatchFailure};
