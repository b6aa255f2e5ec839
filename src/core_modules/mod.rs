pub mod ball_tracker;
pub mod color;
pub mod detection;
pub mod event_detector;
pub mod frame_source;
pub mod geometry;
pub mod kick_detector;
pub mod offside;
pub mod optical_flow;
pub mod possession;
pub mod team_assigner;
pub mod tracker;
