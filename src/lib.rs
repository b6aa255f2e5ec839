// THEORY:
// This file is the main entry point for the `pitch_vision` library crate.
// The public face of the engine is the `LiveProcessor`: give it a frame source,
// a detector and the direction team 1 attacks, and pull one `FrameResult` per
// frame. Sessions for several videos are managed through the `SessionRegistry`.
//
// The stages the processor drives live in `core_modules` and are public so that
// callers can swap in their own identity matcher or optical flow, or reuse a
// single stage on its own.

pub mod core_modules;
pub mod error;
pub mod pipeline;
pub mod session;

pub use core_modules::detection::{Detection, Detector, JsonLinesDetector, ObjectClass, RawDetection};
pub use core_modules::frame_source::{Frame, FrameSource, MemorySource};
pub use core_modules::geometry::{BBox, Point};
pub use core_modules::offside::AttackDirection;
pub use error::{Result, VisionError};
pub use pipeline::{FrameResult, LiveProcessor, PipelineConfig, SessionState, TrackRecord};
pub use session::{ControlHandle, SessionCommand, SessionId, SessionRegistry};
