//! Admission control: policies, counter stores and the limiters built on them.

mod bypass;
mod clock;
mod key;
mod limiter;
mod policy;
mod registry;
mod result;
mod selector;
pub mod store;

pub use bypass::BypassRegistry;
pub use clock::{Clock, MockClock, SystemClock};
pub use key::RateKey;
pub use limiter::Limiter;
pub use policy::{Policy, PolicyRule, PolicySet, TimeUnit};
pub use registry::{Decision, Limiters, PolicyStats};
pub use result::{AdmissionResult, UNAVAILABLE_REASON};
pub use selector::{Backend, StoreOutcome, StoreSelector};
pub use store::{CounterEntry, CounterSnapshot, CounterStore, MemoryStore};
