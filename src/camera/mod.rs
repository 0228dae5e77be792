pub mod capture;
pub mod source;

pub use capture::{CaptureGate, FrameSource, ScanGates};
pub use source::FfmpegSource;
