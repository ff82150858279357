pub mod attribution;
pub mod clock;
pub mod delivery;
pub mod http;
pub mod identity;
pub mod kv;
pub mod mouse;
pub mod page;
pub mod tracker;

pub use attribution::AttributionStore;
pub use clock::{Clock, ManualClock, SystemClock};
pub use delivery::{
    BeaconSink, DeliveryConfig, DeliveryResult, Deliverer, DrainReport, FetchRequest, HttpFetch,
    KeepAliveFetch, PendingEvent, PendingQueue, Transport, TransportChain, TransportError,
    UnloadSafe,
};
pub use http::{HttpRuleSource, ReqwestFetch, ThreadBeacon};
pub use identity::{IdentityManager, JourneyStep, SessionConfig};
pub use kv::{FileStore, KeyValueStore, KvError, MemoryStore, ResilientStore};
pub use mouse::{MouseBuffer, MouseConfig, RandomSampler, Sampler};
pub use page::{PageContext, PageSession, PageSignal};
pub use tracker::{RuleSource, SignalOutcome, TrackError, Tracker, TrackerConfig, TrackerDeps};
