//! Reconciliation loop primitives.
//!
//! This library provides helpers for implementing reconciliation loops
//! that converge an external, eventually-consistent system toward a desired
//! state. Key concepts:
//!
//! - **Clock**: the loop's notion of time. Production code uses
//!   [`SystemClock`]; tests use [`ManualClock`] so waits are instantaneous
//!   and observable.
//! - **Retry policy**: bounded attempts with exponential backoff for calls
//!   that fail transiently ([`retry`]) or that must wait for a change to
//!   propagate ([`poll_until`]).
//! - **Exclusion**: at most one in-flight operation per resource key
//!   ([`KeyedExclusion`]), without a global lock.
//!
//! # Invariants
//!
//! - Retries are bounded; exhaustion is an error returned to the caller
//! - An exclusion token is released exactly once, when it is dropped

mod clock;
mod exclusion;
mod retry;

pub use clock::{Clock, ManualClock, SystemClock};
pub use exclusion::{ExclusionToken, KeyedExclusion};
pub use retry::{poll_until, retry, BackoffPolicy, PollError, RetryPolicy, Retryable};
