//! Background Tasks Module
//!
//! Contains timers that run on the tokio runtime on behalf of the throttling core.
//!
//! # Tasks
//! - Window cleaner: resets a rate limiter's window once it elapses while callers
//!   are queued on it, and retires when nobody is left waiting

mod cleaner;

pub(crate) use cleaner::spawn_window_cleaner;
