pub mod pacing;
pub mod pattern;
pub mod periodic;
pub mod writer;

pub use pacing::Pacer;
pub use pattern::TargetPattern;
pub use periodic::{PeriodicWriter, PeriodicWriterConfig};
pub use writer::{Writer, WriterConfig};
