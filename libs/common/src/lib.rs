pub mod code;
pub mod envelope;
pub mod id;

pub use code::{ControlError, MehCode};
pub use envelope::{Envelope, FrameError, CONTROL_CHANNEL};
