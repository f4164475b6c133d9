//! Public facade for time-related facilities.
//!
//! Interrupt/timer dispatch plumbing is an out-of-scope collaborator for
//! the core (spec §1); this module is kept minimal — just the monotonic
//! tick counter the scheduler's sleep queue and MLFQS bookkeeping need.

pub mod timer;

pub use timer::{get_monotonic_time, get_ticks, init, timer_interrupt};
