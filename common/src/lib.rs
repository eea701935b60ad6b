pub mod types;
pub mod error;
pub mod endpoint;
pub mod ring_buffer;
pub mod signal;

pub use types::*;
pub use error::*;
pub use endpoint::{ensure_fifo, is_fifo, open_endpoint, CaptureInput, EndpointReader};
pub use ring_buffer::{RingBuffer, SharedRing};
pub use signal::shutdown_signal;
