// THEORY:
// The `tracker` module adds "object permanence" to the engine. It takes the
// stateless list of `Detection`s from a single frame and associates them with the
// people it was tracking in previous frames.
//
// It is split into two layers:
// 1.  **Identity Matching**: an `IdentityMatcher` answers the data association
//     problem: which box this frame is which person from last frame. The default
//     `MotionMatcher` predicts each track forward by its velocity, gates candidates
//     by distance and by a coarse colour histogram, and assigns greedily by a
//     blended IoU/distance cost. It owns the track lifecycle:
//     - **Birth**: an unmatched detection becomes a tentative track.
//     - **Confirmation**: after `min_hits` matches the track is reported.
//     - **Death/Occlusion**: a confirmed track survives `max_age` unmatched frames.
// 2.  **Track Bookkeeping**: the `ObjectTracker` wraps any matcher and enforces
//     what downstream stages rely on: ids are unique per frame, a track's class is
//     the one it was first seen with, velocity comes from a bounded centre history,
//     and per-id state is evicted once an id has been gone long enough.
//
// Downstream caches keyed by track id (team assignment) learn about expiries and
// class disputes through `take_invalidations`.

use std::collections::{HashMap, HashSet, VecDeque};

use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core_modules::color::{appearance_histogram, cosine_distance};
use crate::core_modules::detection::{Detection, ObjectClass};
use crate::core_modules::geometry::{BBox, Point};
use crate::error::Result;

pub type TrackId = u64;

/// Centres kept per track for velocity estimation.
pub const POSITION_HISTORY_SIZE: usize = 5;
/// Weight of the previous appearance when blending in a new observation.
const APPEARANCE_MOMENTUM: f32 = 0.9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Unmatched frames a confirmed track survives before it expires.
    pub max_age: u32,
    /// Consecutive matches before a track is reported.
    pub min_hits: u32,
    /// Maximum cosine distance between appearance histograms for a match.
    pub appearance_threshold: f32,
    /// Maximum centre distance in pixels for a match.
    pub match_distance: f32,
    /// Share of the matching cost taken by `1 - IoU`; the rest is normalised distance.
    pub iou_weight: f32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_age: 30,
            min_hits: 2,
            appearance_threshold: 0.3,
            match_distance: 120.0,
            iou_weight: 0.5,
        }
    }
}

/// A person or ball followed across frames.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: TrackId,
    pub class: ObjectClass,
    pub bbox: BBox,
    pub velocity: (f32, f32),
}

impl AsRef<Track> for Track {
    fn as_ref(&self) -> &Track {
        self
    }
}

/// The last few centres of one track.
#[derive(Debug, Clone)]
pub struct TrackHistory {
    centres: VecDeque<Point>,
    capacity: usize,
}

impl TrackHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            centres: VecDeque::with_capacity(capacity),
            capacity: capacity.max(2),
        }
    }

    pub fn push(&mut self, centre: Point) {
        self.centres.push_back(centre);
        while self.centres.len() > self.capacity {
            self.centres.pop_front();
        }
    }

    /// Last centre minus the one before it; zero with fewer than two samples.
    pub fn velocity(&self) -> (f32, f32) {
        let n = self.centres.len();
        if n < 2 {
            return (0.0, 0.0);
        }
        let (new, old) = (self.centres[n - 1], self.centres[n - 2]);
        (new.x - old.x, new.y - old.y)
    }

    pub fn len(&self) -> usize {
        self.centres.len()
    }

    pub fn is_empty(&self) -> bool {
        self.centres.is_empty()
    }

    pub fn clear(&mut self) {
        self.centres.clear();
    }
}

/// One confirmed identity reported by a matcher for the current frame.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchedBox {
    pub id: TrackId,
    pub bbox: BBox,
    pub class: ObjectClass,
}

/// Frame-to-frame box-to-identity association.
pub trait IdentityMatcher: Send {
    /// Returns the confirmed identities among this frame's detections.
    fn track_update(&mut self, detections: &[Detection], frame: &RgbImage) -> Result<Vec<MatchedBox>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Tentative,
    Confirmed,
}

#[derive(Debug, Clone)]
struct Tracklet {
    id: TrackId,
    bbox: BBox,
    class: ObjectClass,
    velocity: (f32, f32),
    appearance: Vec<f32>,
    hits: u32,
    frames_since_seen: u32,
    state: TrackState,
}

impl Tracklet {
    fn new(id: TrackId, detection: &Detection, appearance: Vec<f32>) -> Self {
        Self {
            id,
            bbox: detection.bbox,
            class: detection.class,
            velocity: (0.0, 0.0),
            appearance,
            hits: 1,
            frames_since_seen: 0,
            state: TrackState::Tentative,
        }
    }

    fn predicted_bbox(&self) -> BBox {
        self.bbox.translate(self.velocity.0, self.velocity.1)
    }

    fn update(&mut self, detection: &Detection, appearance: Vec<f32>, min_hits: u32) {
        let (old, new) = (self.bbox.centre(), detection.bbox.centre());
        self.velocity = (new.x - old.x, new.y - old.y);
        self.bbox = detection.bbox;
        self.class = detection.class;
        if self.appearance.len() == appearance.len() {
            for (a, b) in self.appearance.iter_mut().zip(appearance) {
                *a = APPEARANCE_MOMENTUM * *a + (1.0 - APPEARANCE_MOMENTUM) * b;
            }
        } else {
            self.appearance = appearance;
        }
        self.hits += 1;
        self.frames_since_seen = 0;
        if self.state == TrackState::Tentative && self.hits >= min_hits {
            self.state = TrackState::Confirmed;
            debug!(track_id = self.id, class = %self.class, "track confirmed");
        }
    }
}

/// Default identity matcher: motion prediction plus an appearance gate.
pub struct MotionMatcher {
    config: TrackerConfig,
    tracklets: Vec<Tracklet>,
    next_id: TrackId,
}

impl MotionMatcher {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracklets: Vec::new(),
            next_id: 1,
        }
    }

    /// Number of live tracks, tentative ones included.
    pub fn live_tracks(&self) -> usize {
        self.tracklets.len()
    }

    /// Matching cost, or `None` when a gate rejects the pair.
    fn cost(&self, tracklet: &Tracklet, detection: &Detection, appearance: &[f32]) -> Option<f32> {
        let predicted = tracklet.predicted_bbox();
        let distance = predicted.centre().distance(&detection.bbox.centre());
        if distance > self.config.match_distance {
            return None;
        }
        if cosine_distance(&tracklet.appearance, appearance) > self.config.appearance_threshold {
            return None;
        }
        let w = self.config.iou_weight.clamp(0.0, 1.0);
        Some(w * (1.0 - predicted.iou(&detection.bbox)) + (1.0 - w) * distance / self.config.match_distance)
    }
}

impl IdentityMatcher for MotionMatcher {
    fn track_update(&mut self, detections: &[Detection], frame: &RgbImage) -> Result<Vec<MatchedBox>> {
        let appearances: Vec<Vec<f32>> = detections
            .iter()
            .map(|d| appearance_histogram(frame, &d.bbox))
            .collect();

        // --- 1. Matching ---
        let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
        for (i, tracklet) in self.tracklets.iter().enumerate() {
            for (j, detection) in detections.iter().enumerate() {
                if let Some(cost) = self.cost(tracklet, detection, &appearances[j]) {
                    candidates.push((cost, i, j));
                }
            }
        }
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut matched_tracklets = HashSet::new();
        let mut matched_detections = HashSet::new();
        let mut matches = Vec::new();
        for (_, i, j) in candidates {
            if matched_tracklets.contains(&i) || matched_detections.contains(&j) {
                continue;
            }
            matched_tracklets.insert(i);
            matched_detections.insert(j);
            matches.push((i, j));
        }

        // --- 2. State Updating ---
        let min_hits = self.config.min_hits;
        let mut reported = HashSet::new();
        for &(i, j) in &matches {
            let tracklet = &mut self.tracklets[i];
            tracklet.update(&detections[j], appearances[j].clone(), min_hits);
            if tracklet.state == TrackState::Confirmed {
                reported.insert(tracklet.id);
            }
        }

        let max_age = self.config.max_age;
        let mut survivors = Vec::with_capacity(self.tracklets.len());
        for (i, mut tracklet) in self.tracklets.drain(..).enumerate() {
            if !matched_tracklets.contains(&i) {
                tracklet.frames_since_seen += 1;
                let alive = match tracklet.state {
                    TrackState::Tentative => false,
                    TrackState::Confirmed => tracklet.frames_since_seen <= max_age,
                };
                if !alive {
                    debug!(track_id = tracklet.id, state = ?tracklet.state, "track dropped");
                    continue;
                }
            }
            survivors.push(tracklet);
        }
        self.tracklets = survivors;

        // --- 3. Births ---
        for (j, detection) in detections.iter().enumerate() {
            if matched_detections.contains(&j) {
                continue;
            }
            let mut tracklet = Tracklet::new(self.next_id, detection, appearances[j].clone());
            if min_hits <= 1 {
                tracklet.state = TrackState::Confirmed;
                reported.insert(tracklet.id);
            }
            debug!(track_id = tracklet.id, class = %detection.class, "track born");
            self.tracklets.push(tracklet);
            self.next_id += 1;
        }

        Ok(self
            .tracklets
            .iter()
            .filter(|t| reported.contains(&t.id))
            .map(|t| MatchedBox { id: t.id, bbox: t.bbox, class: t.class })
            .collect())
    }
}

/// Per-id state a downstream cache should drop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invalidations {
    /// Ids that have not been reported for longer than `max_age` frames.
    pub expired: Vec<TrackId>,
    /// Ids whose reported class disagreed with their established class.
    pub reclassified: Vec<TrackId>,
}

impl Invalidations {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.reclassified.is_empty()
    }
}

/// Identity-stable tracks for people on the pitch.
pub struct ObjectTracker {
    matcher: Box<dyn IdentityMatcher>,
    max_age: u32,
    frame: u64,
    classes: HashMap<TrackId, ObjectClass>,
    histories: HashMap<TrackId, TrackHistory>,
    last_seen: HashMap<TrackId, u64>,
    pending: Invalidations,
}

impl ObjectTracker {
    pub fn new(config: TrackerConfig) -> Self {
        let max_age = config.max_age;
        Self::with_matcher(Box::new(MotionMatcher::new(config)), max_age)
    }

    pub fn with_matcher(matcher: Box<dyn IdentityMatcher>, max_age: u32) -> Self {
        Self {
            matcher,
            max_age,
            frame: 0,
            classes: HashMap::new(),
            histories: HashMap::new(),
            last_seen: HashMap::new(),
            pending: Invalidations::default(),
        }
    }

    /// Runs one frame. Ball detections are ignored.
    pub fn update(&mut self, detections: &[Detection], frame: &RgbImage) -> Result<Vec<Track>> {
        self.frame += 1;
        let people: Vec<Detection> = detections
            .iter()
            .filter(|d| d.class != ObjectClass::Ball)
            .cloned()
            .collect();

        let matched = match self.matcher.track_update(&people, frame) {
            Ok(matched) => matched,
            Err(err) => {
                self.evict_stale();
                return Err(err);
            }
        };

        let mut seen = HashSet::new();
        let mut tracks = Vec::with_capacity(matched.len());
        for m in matched {
            if !seen.insert(m.id) {
                warn!(track_id = m.id, "identity matcher reported a duplicate id; keeping the first");
                continue;
            }
            let class = self.stable_class(m.id, m.class);
            let history = self
                .histories
                .entry(m.id)
                .or_insert_with(|| TrackHistory::new(POSITION_HISTORY_SIZE));
            history.push(m.bbox.centre());
            self.last_seen.insert(m.id, self.frame);
            tracks.push(Track {
                id: m.id,
                class,
                bbox: m.bbox,
                velocity: history.velocity(),
            });
        }

        self.evict_stale();
        Ok(tracks)
    }

    /// The class an id was first reported with. A disagreeing report is treated
    /// as noise and queued as a reclassification.
    fn stable_class(&mut self, id: TrackId, reported: ObjectClass) -> ObjectClass {
        match self.classes.get(&id) {
            Some(&established) if established != reported => {
                warn!(track_id = id, %established, %reported, "class switch suppressed");
                self.pending.reclassified.push(id);
                established
            }
            Some(&established) => established,
            None => {
                self.classes.insert(id, reported);
                reported
            }
        }
    }

    fn evict_stale(&mut self) {
        let (frame, max_age) = (self.frame, self.max_age as u64);
        let mut expired: Vec<TrackId> = self
            .last_seen
            .iter()
            .filter(|&(_, &seen)| frame - seen > max_age)
            .map(|(&id, _)| id)
            .collect();
        expired.sort_unstable();
        for id in &expired {
            self.last_seen.remove(id);
            self.classes.remove(id);
            self.histories.remove(id);
            debug!(track_id = id, "track expired");
        }
        self.pending.expired.extend(expired);
    }

    /// Drains the ids whose downstream state should be dropped.
    pub fn take_invalidations(&mut self) -> Invalidations {
        std::mem::take(&mut self.pending)
    }

    /// Number of ids with live bookkeeping.
    pub fn known_ids(&self) -> usize {
        self.last_seen.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VisionError;
    use image::Rgb as Pixel;

    fn pitch() -> RgbImage {
        RgbImage::from_pixel(320, 240, Pixel([30, 140, 40]))
    }

    fn player(x: f32, y: f32) -> Detection {
        Detection::new(BBox::new(x, y, x + 20.0, y + 40.0), ObjectClass::Player, 0.9)
    }

    /// Replays a fixed list of matcher outputs, one per frame.
    struct Scripted(VecDeque<Vec<MatchedBox>>);

    impl IdentityMatcher for Scripted {
        fn track_update(&mut self, _: &[Detection], _: &RgbImage) -> Result<Vec<MatchedBox>> {
            self.0
                .pop_front()
                .ok_or_else(|| VisionError::Tracking("script exhausted".into()))
        }
    }

    fn matched(id: TrackId, x: f32, class: ObjectClass) -> MatchedBox {
        MatchedBox { id, bbox: BBox::new(x, 0.0, x + 10.0, 20.0), class }
    }

    #[test]
    fn velocity_needs_two_samples() {
        let mut history = TrackHistory::new(5);
        assert_eq!(history.velocity(), (0.0, 0.0));
        history.push(Point::new(0.0, 0.0));
        assert_eq!(history.velocity(), (0.0, 0.0));
        history.push(Point::new(3.0, -1.0));
        assert_eq!(history.velocity(), (3.0, -1.0));
        for i in 0..10 {
            history.push(Point::new(i as f32, 0.0));
        }
        assert_eq!(history.len(), 5);
    }

    #[test]
    fn tracks_are_reported_after_confirmation() {
        let mut tracker = ObjectTracker::new(TrackerConfig::default());
        let frame = pitch();

        assert!(tracker.update(&[player(50.0, 50.0)], &frame).unwrap().is_empty());
        let second = tracker.update(&[player(53.0, 50.0)], &frame).unwrap();
        assert_eq!(second.len(), 1);
        let third = tracker.update(&[player(56.0, 51.0)], &frame).unwrap();
        assert_eq!(third[0].id, second[0].id);
        assert_eq!(third[0].velocity, (3.0, 1.0));
    }

    #[test]
    fn ball_detections_never_become_people() {
        let mut tracker = ObjectTracker::new(TrackerConfig { min_hits: 1, ..Default::default() });
        let ball = Detection::new(BBox::new(10.0, 10.0, 16.0, 16.0), ObjectClass::Ball, 0.9);
        assert!(tracker.update(&[ball], &pitch()).unwrap().is_empty());
    }

    #[test]
    fn distant_detections_get_new_identities() {
        let mut matcher = MotionMatcher::new(TrackerConfig { min_hits: 1, ..Default::default() });
        let frame = pitch();
        let first = matcher.track_update(&[player(10.0, 10.0)], &frame).unwrap();
        let second = matcher.track_update(&[player(290.0, 190.0)], &frame).unwrap();
        assert_ne!(first[0].id, second[0].id);
        assert_eq!(matcher.live_tracks(), 2);
    }

    #[test]
    fn established_class_wins_over_noisy_reports() {
        let script = vec![
            vec![matched(7, 0.0, ObjectClass::Player)],
            vec![matched(7, 2.0, ObjectClass::Referee)],
            vec![matched(7, 4.0, ObjectClass::Player)],
        ];
        let mut tracker = ObjectTracker::with_matcher(Box::new(Scripted(script.into())), 30);
        let frame = pitch();
        for _ in 0..3 {
            let tracks = tracker.update(&[], &frame).unwrap();
            assert_eq!(tracks[0].class, ObjectClass::Player);
        }
        assert_eq!(tracker.take_invalidations().reclassified, vec![7]);
        assert!(tracker.take_invalidations().is_empty());
    }

    #[test]
    fn duplicate_ids_are_reported_once() {
        let script = vec![vec![
            matched(3, 0.0, ObjectClass::Player),
            matched(3, 50.0, ObjectClass::Player),
        ]];
        let mut tracker = ObjectTracker::with_matcher(Box::new(Scripted(script.into())), 30);
        let tracks = tracker.update(&[], &pitch()).unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].bbox.x1, 0.0);
    }

    #[test]
    fn unseen_ids_expire_after_max_age() {
        let mut script = vec![vec![matched(4, 0.0, ObjectClass::Goalkeeper)]];
        script.extend(std::iter::repeat_n(Vec::new(), 3));
        let mut tracker = ObjectTracker::with_matcher(Box::new(Scripted(script.into())), 2);
        let frame = pitch();

        tracker.update(&[], &frame).unwrap();
        tracker.update(&[], &frame).unwrap();
        tracker.update(&[], &frame).unwrap();
        assert_eq!(tracker.known_ids(), 1);
        tracker.update(&[], &frame).unwrap();
        assert_eq!(tracker.known_ids(), 0);
        assert_eq!(tracker.take_invalidations().expired, vec![4]);
    }

    #[test]
    fn matcher_failures_surface_as_errors() {
        let mut tracker = ObjectTracker::with_matcher(Box::new(Scripted(VecDeque::new())), 30);
        assert!(matches!(tracker.update(&[], &pitch()), Err(VisionError::Tracking(_))));
    }
}
