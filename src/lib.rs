#![cfg_attr(docsrs, feature(doc_auto_cfg))]
#![warn(missing_docs, missing_debug_implementations, rust_2018_idioms)]
// Allow acronyms like CRTC
#![allow(clippy::upper_case_acronyms)]

//! # drmhwc: resource and buffer lifecycle for a DRM hardware composer
//!
//! This crate implements the part of a hardware composer that sits between the
//! per-frame composition entry points and the kernel display driver. It does not
//! render anything itself. Instead it keeps track of which hardware resources exist,
//! who may use them, and when a buffer may be touched by whom.
//!
//! ## Structure of the crate
//!
//! - [`backend::drm`] contains the [`ResourceManager`](backend::drm::ResourceManager), which
//!   opens the display devices, owns one [`DisplayCompositor`](backend::drm::DisplayCompositor)
//!   per CRTC, partitions planes between active displays and drives the writeback capture
//!   session. The per-frame plane assignment policy is the
//!   [`Planner`](backend::drm::Planner).
//! - [`backend::producer`] contains the buffer cache and release-fence timeline of a
//!   video tunnel, used by producers that hand buffers directly to the display.
//! - [`backend::allocator`] contains the buffer abstractions and the queue supplying
//!   writeback capture buffers.
//! - [`utils`] contains geometry, clock and configuration helpers.
//!
//! ## Threading
//!
//! Calls arrive concurrently from a production thread and one commit thread per CRTC.
//! The device registry is immutable after initialization. The writeback session is
//! guarded by one lock per manager and every producer context has its own lock, so
//! writeback management and buffer-cache management never contend.
//!
//! ### Logging
//!
//! drmhwc makes extensive use of [`tracing`] for its internal logging.
//!
//! For release builds it is recommended to limit the log level during compile time.
//! This can be done by adding a dependency to [`tracing`] and enabling the corresponding features.
//! For example to enable `trace` messages for debug builds, but limit release builds to `debug` add
//! the following in your binary crate `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! tracing = { version = "0.1", features = ["max_level_trace", "release_max_level_debug"] }
//! ```

pub mod backend;
pub mod utils;
