// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Concurrency primitives shared by the Glance preview server.
//!
//! - [`BufferedChannel`]: broadcast channel that remembers everything it has
//!   published and replays that history to late subscribers before switching
//!   them over to live values.
//! - [`DrainLock`]: reader/writer lock where readers are in-flight request
//!   sections and the single writer is the shutdown sequence.
//!
//! Neither primitive holds a lock across an `.await` that waits on a consumer:
//! publishing never blocks on a slow subscriber, and a reader guard can be
//! moved into a streaming response body and released when the body drops.

mod channel;
mod drain;

pub use channel::{BufferedChannel, Subscription};
pub use drain::{DrainLock, DrainReadGuard, DrainWriteGuard, LockTimeout};
