//! A transparent Vulkan layer that doubles the present rate of its host.
//!
//! The layer sits between the application and the driver as an implicit
//! layer. It hooks swapchain creation to keep a shadow view of every
//! presentation chain, captures each presented image into a pair of
//! device-local staging images, and turns one host present into two
//! display-visible presents: first a synthesised in-between image (for
//! now, the previous frame pasted back), then the real frame blitted
//! into a freshly acquired swapchain image.
//!
//! # Module map
//!
//! ```text
//! entry     exported extern "system" symbols, layer self-description
//! dispatch  layer-link walk, per-instance/per-device records, registry
//! chain     swapchain tracking + creation-info augmentation
//! mirror    previous/current staging image pair
//! engine    the per-present frame-doubling state machine
//! pacing    adaptive frame-time / thermal controller
//! config    FRAMEPACE_* configuration
//! log       tracing subscriber bootstrap for the injected process
//! ```
//!
//! Nothing here spawns a thread: the whole layer runs on whichever
//! thread the host calls the intercepted entry points from.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

pub mod chain;
pub mod config;
pub mod dispatch;
pub mod engine;
pub mod entry;
pub mod log;
pub mod mirror;
pub mod pacing;

pub use ash;
