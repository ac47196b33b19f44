//! Cooperative cancellation for build runs.
//!
//! A single [`CancellationToken`] is created per build run and passed by
//! reference into every step. Combinators derive child tokens to scope
//! cancellation (timeouts, fail-fast parallelism) to part of the tree.

mod token;

pub use token::CancellationToken;
