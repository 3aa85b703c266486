//! Stepping and control engine for a native source-level debugger.
//!
//! The crate drives a stopped-process event loop over an abstract [`debugger::debugee::Debugee`]
//! backend and synthesizes the conditional address breakpoints that realize the source-level
//! operations: continue, step-into, step-over, step-out and single-instruction stepping, in
//! both execution directions. Logical cooperative tasks, deferred calls, inlined call ranges,
//! compiler-generated trampolines, panic unwinds and in-flight call injection are reconciled
//! by the dispatcher in [`debugger`].

pub mod debugger;

pub use debugger::{Debugger, Error, KeepSteppingPolicy, StopReason};
