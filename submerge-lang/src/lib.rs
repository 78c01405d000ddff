#![allow(dead_code)]

mod filter;
mod name;
mod path;
mod pushid;
mod tsd;

pub use filter::{Bound, Extracted, OrderBy, QueryFilter};
pub use name::Name;
pub use path::Path;
pub use pushid::{ClockSource, PushIdGenerator};
pub use tsd::{Priority, Scalar, ServerSentinel, Tsd};
