// THEORY:
// The ball is a distinguished singleton: the engine never reports more than one
// ball per frame, however many ball-class boxes the detector produces. It is
// also the object the detector loses most often (small, fast, occluded by legs),
// so the `BallTracker` has two ways of knowing where it is:
//
// 1.  **Detection**: every ball-class box is scored by how far it jumped from
//     the last known ball and by how unsure the detector was. The lowest score
//     wins if it is under the reject threshold. A confident detection far away
//     gets a bonus so the tracker can re-acquire after an occlusion instead of
//     clinging to a stale position.
// 2.  **Motion continuation**: with no acceptable detection, the pixel under the
//     last ball centre is followed with sparse optical flow and the previous box
//     is moved by the same displacement. If flow loses the point the ball is
//     simply absent for that frame; a stale box is never re-emitted.

use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core_modules::detection::{Detection, ObjectClass};
use crate::core_modules::geometry::{BBox, Point};
use crate::core_modules::optical_flow::{LucasKanade, PointFlow};
use crate::core_modules::tracker::{Track, TrackHistory, TrackId};

/// Id of the ball track. Person ids start at 1.
pub const BALL_TRACK_ID: TrackId = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BallConfig {
    /// Centres kept for velocity estimation.
    pub history: usize,
    pub distance_weight: f32,
    pub confidence_weight: f32,
    /// Jumps longer than this, by a confident detection, earn the bonus.
    pub reasonable_jump: f32,
    pub confident_jump_bonus: f32,
    pub confident_jump_confidence: f32,
    /// Candidates scoring at or above this are ignored.
    pub reject_threshold: f32,
    /// Frames without any ball before the last known position is forgotten.
    pub max_lost_frames: u32,
}

impl Default for BallConfig {
    fn default() -> Self {
        Self {
            history: 5,
            distance_weight: 1.0,
            confidence_weight: 100.0,
            reasonable_jump: 100.0,
            confident_jump_bonus: 50.0,
            confident_jump_confidence: 0.6,
            reject_threshold: 150.0,
            max_lost_frames: 30,
        }
    }
}

pub struct BallTracker {
    config: BallConfig,
    flow: Box<dyn PointFlow>,
    /// Centre of the last emitted ball, used for candidate scoring.
    last_ball: Option<Point>,
    history: TrackHistory,
    /// Flow reference: the last frame and box the ball was located in.
    previous_gray: Option<GrayImage>,
    previous_bbox: Option<BBox>,
    lost_frames: u32,
}

impl BallTracker {
    pub fn new(config: BallConfig) -> Self {
        Self::with_flow(config, Box::new(LucasKanade::default()))
    }

    pub fn with_flow(config: BallConfig, flow: Box<dyn PointFlow>) -> Self {
        let history = TrackHistory::new(config.history);
        Self {
            config,
            flow,
            last_ball: None,
            history,
            previous_gray: None,
            previous_bbox: None,
            lost_frames: 0,
        }
    }

    /// Lower is better. `None` when the candidate is not a ball.
    fn score(&self, detection: &Detection) -> Option<f32> {
        if detection.class != ObjectClass::Ball {
            return None;
        }
        let c = &self.config;
        let distance = self
            .last_ball
            .map_or(0.0, |last| last.distance(&detection.bbox.centre()));
        let mut score = distance * c.distance_weight + (1.0 - detection.confidence) * c.confidence_weight;
        if self.last_ball.is_some()
            && distance > c.reasonable_jump
            && detection.confidence > c.confident_jump_confidence
        {
            score -= c.confident_jump_bonus;
        }
        Some(score)
    }

    /// The most plausible ball among the detections, if any is acceptable.
    pub fn select_best(&self, detections: &[Detection]) -> Option<Detection> {
        let mut best: Option<(f32, &Detection)> = None;
        for detection in detections {
            let Some(score) = self.score(detection) else { continue };
            if best.is_none_or(|(best_score, _)| score < best_score) {
                best = Some((score, detection));
            }
        }
        match best {
            Some((score, detection)) if score < self.config.reject_threshold => {
                debug!(score, confidence = detection.confidence, "ball candidate accepted");
                Some(detection.clone())
            }
            Some((score, _)) => {
                debug!(score, "best ball candidate rejected");
                None
            }
            None => None,
        }
    }

    /// Zero or one ball track for this frame.
    pub fn update(&mut self, frame: &RgbImage, detections: &[Detection]) -> Vec<Track> {
        let gray = image::imageops::grayscale(frame);

        let located = match self.select_best(detections) {
            Some(detection) => Some(detection.bbox),
            None => self.continue_by_flow(&gray),
        };

        let Some(bbox) = located else {
            self.lost_frames += 1;
            if self.lost_frames > self.config.max_lost_frames && self.last_ball.is_some() {
                debug!(lost_frames = self.lost_frames, "ball lost; forgetting last position");
                self.forget();
            }
            return Vec::new();
        };

        self.lost_frames = 0;
        let centre = bbox.centre();
        self.last_ball = Some(centre);
        self.history.push(centre);
        self.previous_gray = Some(gray);
        self.previous_bbox = Some(bbox);

        vec![Track {
            id: BALL_TRACK_ID,
            class: ObjectClass::Ball,
            bbox,
            velocity: self.history.velocity(),
        }]
    }

    fn continue_by_flow(&mut self, gray: &GrayImage) -> Option<BBox> {
        self.last_ball?;
        let (previous_gray, previous_bbox) = (self.previous_gray.as_ref()?, self.previous_bbox?);
        let from = previous_bbox.centre();
        match self.flow.track_point(previous_gray, gray, from) {
            Some(to) => {
                debug!(dx = to.x - from.x, dy = to.y - from.y, "ball continued by optical flow");
                Some(previous_bbox.translate(to.x - from.x, to.y - from.y))
            }
            None => {
                debug!("optical flow lost the ball");
                None
            }
        }
    }

    fn forget(&mut self) {
        self.last_ball = None;
        self.history.clear();
        self.previous_gray = None;
        self.previous_bbox = None;
    }

    pub fn last_position(&self) -> Option<Point> {
        self.last_ball
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    fn ball(x: f32, y: f32, confidence: f32) -> Detection {
        Detection::new(BBox::centred_at(Point::new(x, y), 10.0, 10.0), ObjectClass::Ball, confidence)
    }

    /// Returns scripted flow results in order.
    struct ScriptedFlow(VecDeque<Option<Point>>);

    impl PointFlow for ScriptedFlow {
        fn track_point(&mut self, _: &GrayImage, _: &GrayImage, _: Point) -> Option<Point> {
            self.0.pop_front().flatten()
        }
    }

    fn tracker_with_flow(results: Vec<Option<Point>>) -> BallTracker {
        BallTracker::with_flow(BallConfig::default(), Box::new(ScriptedFlow(results.into())))
    }

    fn frame() -> RgbImage {
        RgbImage::new(320, 240)
    }

    #[test]
    fn at_most_one_ball_is_emitted() {
        let mut tracker = BallTracker::new(BallConfig::default());
        let tracks = tracker.update(&frame(), &[ball(50.0, 50.0, 0.7), ball(200.0, 80.0, 0.9)]);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].id, BALL_TRACK_ID);
        // No previous ball: confidence decides.
        assert_eq!(tracks[0].bbox.centre(), Point::new(200.0, 80.0));
    }

    #[test]
    fn continuity_beats_a_slightly_more_confident_jump() {
        let mut tracker = BallTracker::new(BallConfig::default());
        tracker.update(&frame(), &[ball(100.0, 100.0, 0.9)]);
        // Near: 5 + 20 = 25. Far (90px, under the jump threshold): 90 + 10 = 100.
        let best = tracker
            .select_best(&[ball(190.0, 100.0, 0.9), ball(105.0, 100.0, 0.8)])
            .unwrap();
        assert_eq!(best.bbox.centre(), Point::new(105.0, 100.0));
    }

    #[test]
    fn confident_long_jumps_are_reacquired() {
        let mut tracker = BallTracker::new(BallConfig::default());
        tracker.update(&frame(), &[ball(100.0, 100.0, 0.9)]);
        // 180 + 10 - 50 = 140, just under the reject threshold.
        assert!(tracker.select_best(&[ball(280.0, 100.0, 0.9)]).is_some());
        // Without the bonus (confidence 0.5): 180 + 50 = 230.
        assert!(tracker.select_best(&[ball(280.0, 100.0, 0.5)]).is_none());
    }

    #[test]
    fn non_ball_detections_are_ignored() {
        let tracker = BallTracker::new(BallConfig::default());
        let person = Detection::new(BBox::new(0.0, 0.0, 10.0, 30.0), ObjectClass::Player, 1.0);
        assert!(tracker.select_best(&[person]).is_none());
    }

    #[test]
    fn missed_detection_falls_back_to_flow() {
        let mut tracker = tracker_with_flow(vec![Some(Point::new(104.0, 97.0))]);
        tracker.update(&frame(), &[ball(100.0, 100.0, 0.9)]);

        let tracks = tracker.update(&frame(), &[]);
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].bbox.centre(), Point::new(104.0, 97.0));
        assert_eq!(tracks[0].bbox.width(), 10.0);
        assert_eq!(tracks[0].velocity, (4.0, -3.0));
    }

    #[test]
    fn lost_flow_emits_no_stale_ball() {
        let mut tracker = tracker_with_flow(vec![None, Some(Point::new(102.0, 100.0))]);
        tracker.update(&frame(), &[ball(100.0, 100.0, 0.9)]);

        assert!(tracker.update(&frame(), &[]).is_empty());
        // The flow reference is kept, so the next frame can still continue.
        let tracks = tracker.update(&frame(), &[]);
        assert_eq!(tracks[0].bbox.centre(), Point::new(102.0, 100.0));
    }

    #[test]
    fn no_history_means_no_flow() {
        let mut tracker = tracker_with_flow(vec![Some(Point::new(1.0, 1.0))]);
        assert!(tracker.update(&frame(), &[]).is_empty());
    }

    #[test]
    fn long_absence_forgets_the_last_position() {
        let config = BallConfig { max_lost_frames: 2, ..Default::default() };
        let mut tracker = BallTracker::with_flow(config, Box::new(ScriptedFlow(VecDeque::new())));
        tracker.update(&frame(), &[ball(100.0, 100.0, 0.9)]);
        for _ in 0..3 {
            tracker.update(&frame(), &[]);
        }
        assert!(tracker.last_position().is_none());
    }
}
