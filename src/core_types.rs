//! Core types used throughout the engine
//!
//! Fundamental type aliases shared by all modules. They carry semantic
//! meaning and keep signatures readable.

/// Sequence number assigned per partition by the upstream front-office bus.
///
/// # Constraints:
/// - **Authoritative**: never synthesized locally; absent means the upstream
///   took responsibility for ordering.
/// - **Monotone**: strictly increasing within a partition key.
pub type SeqNum = i64;

/// Optimistic-concurrency version counter on durable partition state.
///
/// Strictly increments on every committed write.
pub type Version = i64;

/// Fencing token attached to a partition lock lease.
///
/// A release or renew is honored only when the token matches the live lease.
pub type FencingToken = u64;

/// Worker index inside one consumer-manager instance.
pub type WorkerId = usize;
