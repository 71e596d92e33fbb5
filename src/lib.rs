pub mod config;
pub mod director;
pub mod error;
pub mod matching;
pub mod matchmaker;
pub mod plugin;
pub mod state;
pub mod ticket;

pub mod api;

/// Upper bound on items per batched state-store call made by the core.
/// Larger workloads are chunked into consecutive batches.
pub const BATCH_LIMIT: usize = 1000;

/// Candidate finding switches to the thread-parallel variant at this
/// many tickets in a single round.
pub const MIN_FOR_PARALLEL: usize = 1000;

/// Cap on how many victims of theft are carried into the reliable
/// (unbounded candidate list) retry of a matching round.
pub const MAX_FOR_RELIABLE: usize = 4000;
