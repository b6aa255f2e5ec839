// THEORY:
// A kick is the moment the ball separates from the foot that was touching it.
// Looking at distance alone would fire on every frame the ball is away from a
// player, so the `KickDetector` is a two-state hysteresis machine:
//
//     Idle --(distance <= threshold)--> ArmedTouching
//     ArmedTouching --(distance > threshold)--> Idle, firing a kick
//
// A cooldown measured in frames suppresses a second firing straight after a
// kick (a dribble produces a fast touch/release/touch sequence). A release
// during the cooldown disarms the detector without firing.

use tracing::info;

use crate::core_modules::geometry::BBox;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickState {
    Idle,
    ArmedTouching,
}

#[derive(Debug, Clone)]
pub struct KickDetector {
    touch_threshold: f32,
    cooldown_frames: u64,
    state: KickState,
    last_kick: Option<u64>,
}

impl KickDetector {
    pub fn new(touch_threshold: f32, cooldown_frames: u64) -> Self {
        Self {
            touch_threshold,
            cooldown_frames,
            state: KickState::Idle,
            last_kick: None,
        }
    }

    pub fn state(&self) -> KickState {
        self.state
    }

    /// Feeds the ball-to-possessor distance for `frame`. Returns `true` on the
    /// frame a kick fires.
    pub fn observe(&mut self, distance: f32, frame: u64) -> bool {
        let touching = distance <= self.touch_threshold;
        match (self.state, touching) {
            (KickState::Idle, true) => {
                self.state = KickState::ArmedTouching;
                false
            }
            (KickState::ArmedTouching, false) => {
                self.state = KickState::Idle;
                let cooled = self
                    .last_kick
                    .is_none_or(|last| frame.saturating_sub(last) >= self.cooldown_frames);
                if cooled {
                    self.last_kick = Some(frame);
                    info!(frame, distance, "kick detected");
                }
                cooled
            }
            _ => false,
        }
    }

    /// Edge-to-edge variant of [`observe`](Self::observe).
    pub fn update(&mut self, ball: &BBox, possessor: &BBox, frame: u64) -> bool {
        self.observe(ball.edge_distance(possessor), frame)
    }
}

impl Default for KickDetector {
    fn default() -> Self {
        Self::new(5.0, 5)
    }
}
