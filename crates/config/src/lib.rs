#![forbid(unsafe_code)]

mod error;
mod model;
mod poller;
mod sync_schedule;
mod unreachable;

pub use error::Error;
pub use model::Config;
pub use poller::Poller;
pub use sync_schedule::SyncSchedule;
pub use unreachable::Unreachable;
