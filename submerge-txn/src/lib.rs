#![allow(dead_code)]

mod hash;
mod tree;
mod transaction;

pub use hash::content_hash;
pub use tree::{PendingSend, StageResult, StagedWrite, TransactionsTree};
pub use transaction::{Outcome, TransactionAbort, UpdateFn};
