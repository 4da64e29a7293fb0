//! # wavespool
//!
//! UDP capture and offline reconciliation for waveform digitizer fragment
//! streams. The digitizer blasts fixed-format fragments at high rate over
//! unidirectional UDP; this crate receives them, keeps a per-listener
//! ordered archive growing in real time, defers anything that arrived too
//! late to an orphan file, and later merges the two into one fully
//! sequence-sorted record stream.
//!
//! ## Crate Structure
//!
//! - **`wire`**: the fragment frame layout, bounds-checked decoding, and
//!   the fixed-width receive [`wire::Slot`].
//! - **`classify`**: the watermark-driven sequence classifier and its
//!   selectable processor variants (order, fault injection, debug dump,
//!   nop).
//! - **`spool`**: the on-disk ordered/orphan file pair and stripped-record
//!   streaming.
//! - **`merge`**: the offline sort-merge engine that reconciles a closed
//!   file pair into a `.merged` archive.
//! - **`listener`**: one self-contained UDP capture instance per port.
//! - **`stats`**: throughput counters and the periodic rate reporter.
//! - **`config`**: TOML + environment configuration.
//! - **`logging`**: tracing setup shared by the binaries.
//! - **`error`**: the central [`SpoolError`] type.

pub mod classify;
pub mod config;
pub mod error;
pub mod listener;
pub mod logging;
pub mod merge;
pub mod spool;
pub mod stats;
pub mod wire;

pub use error::{Result, SpoolError};
