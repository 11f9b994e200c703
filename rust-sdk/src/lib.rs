//! The Rust SDK for Split, a feature flag and experimentation platform.
//!
//! # Overview
//!
//! The SDK revolves around a [`SplitFactory`] built from an sdk_key. The
//! factory synchronizes feature-flag definitions in the background (polling
//! plus an optional streaming channel) and hands out [`SplitClient`] handles
//! that evaluate flags locally, in-process, without a network round-trip per
//! call.
//!
//! ```no_run
//! use splitio::{build_factory, SplitConfig};
//!
//! let factory = build_factory("YOUR_SDK_KEY", SplitConfig::new()).unwrap();
//! factory
//!     .block_until_ready(std::time::Duration::from_secs(10))
//!     .expect("SDK failed to sync in time");
//!
//! let client = factory.client();
//! match client.get_treatment("user-123", "new_ui", None).as_str() {
//!     "on" => { /* feature code */ }
//!     "off" => { /* default code */ }
//!     _ => { /* control: unknown flag or SDK not ready */ }
//! }
//! ```
//!
//! # Readiness
//!
//! Until the first full synchronization lands, every evaluation returns the
//! `"control"` sentinel. Use [`SplitFactory::block_until_ready`] at startup
//! to bound that window.
//!
//! # Impressions and events
//!
//! Every evaluation queues an impression describing the outcome; the
//! [`SplitClient::track`] call queues application events. Both flow to the
//! backend asynchronously through bounded queues that drop (oldest first)
//! rather than block, so evaluation latency never depends on delivery.
//!
//! # Localhost mode
//!
//! Building a factory with the `"localhost"` sdk_key skips all network I/O
//! and reads flag definitions from `$HOME/.split` (or the file given via
//! [`SplitConfig::split_file`]), reloading it whenever it changes.
//!
//! # Error handling
//!
//! No error escapes a public call: invalid input, an unknown flag, a
//! not-ready or destroyed factory all degrade to `"control"` (or `false`
//! from `track`). The [`Error`] enum surfaces only from factory
//! construction and the readiness wait.
//!
//! # Logging
//!
//! The crate logs through the [`log`](https://docs.rs/log) facade under the
//! `splitio` target.

#![warn(rustdoc::missing_crate_level_docs)]

mod client;
mod config;
mod factory;
mod manager;
mod validation;

#[doc(inline)]
pub use splitio_core::{
    evaluator::CONTROL,
    impressions::{Impression, ImpressionListener, ImpressionsMode},
    storage::SplitView,
    AttributeValue, Attributes, Error, Key, Result,
};

pub use client::{SplitClient, TreatmentWithConfig};
pub use config::SplitConfig;
pub use factory::{build_factory, SplitFactory, LOCALHOST_API_KEY};
pub use manager::SplitManager;
