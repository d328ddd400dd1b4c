//! boundq - Bounded Drop-on-Full Queue
//!
//! A fixed-capacity FIFO queue backed by a ring buffer, built for pipelines
//! where many producers must never be stalled by a slow consumer.
//!
//! # Key Features
//!
//! - Non-blocking `push`: when the ring is full the newest item is handed back
//!   to the caller instead of waiting (newest-item drop)
//! - Blocking `pop` with an optional timeout, so a single consumer can react to
//!   both new items and wall-clock deadlines without a timer thread
//! - Strict FIFO ordering across all producers
//! - Plain counters for pushed / dropped / popped items
//!
//! # Example
//!
//! ```
//! use boundq::BoundedQueue;
//! use std::time::Duration;
//!
//! let queue = BoundedQueue::new(2).unwrap();
//!
//! assert!(queue.push("x").is_ok());
//! assert!(queue.push("y").is_ok());
//!
//! // Full: the item comes back to the caller
//! assert_eq!(queue.push("z"), Err("z"));
//!
//! assert_eq!(queue.pop(None), Some("x"));
//! assert_eq!(queue.pop(Some(Duration::from_millis(10))), Some("y"));
//! assert_eq!(queue.pop(Some(Duration::ZERO)), None);
//! ```

mod invariants;
mod metrics;
mod queue;

pub use metrics::QueueMetrics;
pub use queue::{BoundedQueue, QueueError};
