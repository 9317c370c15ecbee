pub mod frame;
pub mod reader;

pub use frame::{Frame, PixelFormat, Shape, SharedFrame};
pub use reader::{Backoff, Reader, ReaderConfig};
