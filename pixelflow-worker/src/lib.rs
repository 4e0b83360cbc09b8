//! PixelFlow data plane.
//!
//! Consumes `process_image` tasks from the durable queue with bounded
//! concurrency, runs the fetch/transform/emit pipeline, writes status and
//! usage rows, and delivers signed webhooks.

pub mod metrics;
pub mod server;
