pub mod queue;
pub mod service;

pub use queue::{BoundedQueue, Delivery, FrameSink, FrameSource, QueueCounters, QueueFan};
pub use service::{Completion, Service, StopToken, Worker};

use crate::capture::SharedFrame;

/// Queue of shared frames, the unit every consumer reads from.
pub type FrameQueue = BoundedQueue<SharedFrame>;
