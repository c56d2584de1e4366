//! An in-memory work queue server speaking the classic beanstalkd text
//! protocol: producers `put` jobs with a priority, delay, and time-to-run;
//! workers `reserve` them and either `delete`, `release`, or `bury`.
//!
//! The crate splits into two layers:
//!
//! * [`types`] holds the lifecycle engine: the job entity, the bounded
//!   priority heaps, and the [`Server`](types::server::Server) dispatcher
//!   that owns all queue state and runs the matching and timer steps.
//! * [`wire`] holds the protocol: command parsing, the framed codec, and
//!   response encoding.
//!
//! The engine is synchronous and single-owner; the `hayloftd` binary drives
//! it as a single actor task on a current-thread runtime.

pub mod types;
pub mod wire;
