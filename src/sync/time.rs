//! Frame time data replicated from the primary.

use serde::{Deserialize, Serialize};

/// Timecode style frame time
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameTime {
    pub frame: i64,
    pub subframe: f32,
    pub rate_numerator: u32,
    pub rate_denominator: u32,
}

/// Time data every node must agree on for a frame
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct TimeData {
    /// Frame delta in seconds
    pub delta_seconds: f64,
    /// Accumulated game time in seconds
    pub game_time: f64,
    /// Optional timecode
    pub frame_time: Option<FrameTime>,
}

impl TimeData {
    pub fn new(delta_seconds: f64, game_time: f64) -> Self {
        Self {
            delta_seconds,
            game_time,
            frame_time: None,
        }
    }

    pub fn with_frame_time(mut self, frame_time: FrameTime) -> Self {
        self.frame_time = Some(frame_time);
        self
    }
}
