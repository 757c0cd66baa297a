mod db;
mod dispatcher;
mod merger;
mod moments;
mod scanner;
mod store;
mod types;

#[cfg(test)]
pub(crate) mod memory;
#[cfg(test)]
mod tests;

pub use db::{build_pool, PgAggregateStore};
pub use dispatcher::{DispatchError, DispatchSummary, Dispatcher};
pub use merger::BatchMerger;
pub use scanner::{CatchUpScanner, ScanSummary};
pub use store::{AggregateStore, StoreError};
pub use types::{weekday_from_index, weekday_index, WeekdayAggregate};
