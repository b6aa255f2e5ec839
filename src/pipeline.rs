// THEORY:
// The `pipeline` module is the top-level API of the engine. A `LiveProcessor`
// owns every stage for one video session and drives them in a fixed order per
// frame:
//
//   detection -> object tracking -> ball tracking -> teams -> possession
//             -> kick -> offside/events
//
// It is a plain `Iterator`: each call to `next` reads exactly one frame from the
// source, so processing is throttled by whoever consumes the results. When the
// consumer stops pulling, dropping the processor releases the source.
//
// Key architectural principles:
// 1.  **Degrade, Don't Die**: a failing stage (detector error, matcher error) is
//     logged and replaced with an empty result for that frame only. The only
//     error that reaches the caller is a source that cannot be opened.
// 2.  **Single Owner**: all session state is mutated here, on the thread pulling
//     the iterator. Control commands from elsewhere arrive through a channel
//     and are applied between frames.
// 3.  **Typed Output**: every frame yields a `FrameResult` with the same fields,
//     ready to be serialised as a JSON line or an SSE message.

use std::fs;
use std::path::Path;

use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::core_modules::ball_tracker::{BallConfig, BallTracker};
use crate::core_modules::color::Rgb;
use crate::core_modules::detection::{sanitize, Detection, Detector, ObjectClass};
use crate::core_modules::event_detector::{BallState, EventDetector, FrameContext};
use crate::core_modules::frame_source::{Frame, FrameSource};
use crate::core_modules::geometry::BBox;
use crate::core_modules::kick_detector::KickDetector;
use crate::core_modules::offside::AttackDirection;
use crate::core_modules::optical_flow::PointFlow;
use crate::core_modules::possession::PossessionAssigner;
use crate::core_modules::team_assigner::{TeamAssigner, TeamConfig, TeamId, TeamTrack};
use crate::core_modules::tracker::{IdentityMatcher, ObjectTracker, TrackId, TrackerConfig};
use crate::error::{Result, VisionError};
use crate::session::{ControlHandle, SessionCommand};

/// Configuration for the LiveProcessor. Every field has a default, so a YAML
/// file only needs to list what it overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub tracker: TrackerConfig,
    pub ball: BallConfig,
    pub team: TeamConfig,
    /// Maximum foot-to-ball distance, in pixels, for possession.
    pub possession_distance: f32,
    /// Ball-to-possessor edge distance at or below which they are touching.
    pub kick_touch_threshold: f32,
    pub kick_cooldown_frames: u64,
    /// Run the detector on every Nth frame and reuse its output in between.
    pub detect_every: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tracker: TrackerConfig::default(),
            ball: BallConfig::default(),
            team: TeamConfig::default(),
            possession_distance: 70.0,
            kick_touch_threshold: 5.0,
            kick_cooldown_frames: 5,
            detect_every: 1,
        }
    }
}

impl PipelineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_yaml_str(&fs::read_to_string(path)?)
    }

    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.detect_every == 0, "detect_every must be at least 1"),
            (self.tracker.min_hits == 0, "tracker.min_hits must be at least 1"),
            (self.tracker.match_distance <= 0.0, "tracker.match_distance must be positive"),
            (!(0.0..=1.0).contains(&self.tracker.iou_weight), "tracker.iou_weight must lie in 0..=1"),
            (self.ball.history < 2, "ball.history must keep at least 2 centres"),
            (self.ball.reject_threshold <= 0.0, "ball.reject_threshold must be positive"),
            (self.team.reevaluate_every == 0, "team.reevaluate_every must be at least 1"),
            (self.team.patch_size == 0, "team.patch_size must be at least 1"),
            (self.possession_distance <= 0.0, "possession_distance must be positive"),
            (self.kick_touch_threshold <= 0.0, "kick_touch_threshold must be positive"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(VisionError::Config((*message).to_string())),
            None => Ok(()),
        }
    }
}

/// Ball-only fields of a track record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BallAnnotations {
    pub possessed_by: Option<TrackId>,
    pub kicked: bool,
}

/// One track as it leaves the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub id: TrackId,
    pub bbox: BBox,
    pub cls: ObjectClass,
    pub team: Option<TeamId>,
    pub color: Rgb,
    pub velocity: [f32; 2],
    #[serde(flatten, default, skip_serializing_if = "Option::is_none")]
    pub ball: Option<BallAnnotations>,
}

impl TrackRecord {
    fn new(tagged: TeamTrack, ball: Option<BallAnnotations>) -> Self {
        let TeamTrack { track, team, color } = tagged;
        let ball = (track.class == ObjectClass::Ball).then_some(ball).flatten();
        Self {
            id: track.id,
            bbox: track.bbox,
            cls: track.class,
            team,
            color,
            velocity: [track.velocity.0, track.velocity.1],
            ball,
        }
    }
}

/// Everything the engine says about one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameResult {
    pub frame_id: u64,
    pub tracks: Vec<TrackRecord>,
    pub event: Option<String>,
    pub event_text: Option<String>,
}

impl FrameResult {
    pub fn empty(frame_id: u64) -> Self {
        Self {
            frame_id,
            tracks: Vec::new(),
            event: None,
            event_text: None,
        }
    }

    pub fn ball(&self) -> Option<&TrackRecord> {
        self.tracks.iter().find(|t| t.cls == ObjectClass::Ball)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// A Server-Sent Events `data:` message.
    pub fn to_sse(&self) -> Result<String> {
        Ok(format!("data: {}\n\n", self.to_json()?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionState {
    pub frame_count: u64,
    pub halftime_mode: bool,
    pub team1_dir: AttackDirection,
    pub team2_dir: AttackDirection,
}

impl SessionState {
    pub fn new(team1_dir: AttackDirection) -> Self {
        Self {
            frame_count: 0,
            halftime_mode: false,
            team1_dir,
            team2_dir: team1_dir.flipped(),
        }
    }

    /// Enters or leaves the halftime pause. Teams swap ends either way.
    pub fn toggle_halftime(&mut self) {
        self.halftime_mode = !self.halftime_mode;
        self.team1_dir = self.team1_dir.flipped();
        self.team2_dir = self.team2_dir.flipped();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PossessionState {
    pub last_player_possession: Option<TrackId>,
}

/// The frame orchestrator for one session.
pub struct LiveProcessor {
    source: Box<dyn FrameSource>,
    source_name: String,
    released: bool,
    detector: Box<dyn Detector>,
    config: PipelineConfig,
    state: SessionState,
    possession: PossessionState,
    detections: Vec<Detection>,
    object_tracker: ObjectTracker,
    ball_tracker: BallTracker,
    team_assigner: TeamAssigner,
    possession_assigner: PossessionAssigner,
    kick_detector: KickDetector,
    event_detector: EventDetector,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    control: mpsc::UnboundedSender<SessionCommand>,
}

impl LiveProcessor {
    /// Opens a session. Fails only if the configuration is invalid or the
    /// source reports no frame size.
    pub fn open<S, D>(source: S, detector: D, team1_direction: AttackDirection, config: PipelineConfig) -> Result<Self>
    where
        S: FrameSource + 'static,
        D: Detector + 'static,
    {
        config.validate()?;

        let mut source: Box<dyn FrameSource> = Box::new(source);
        let source_name = source.name();
        let (width, height) = source.frame_size();
        if width == 0 || height == 0 {
            source.release();
            return Err(VisionError::SourceOpen {
                source_name,
                reason: "source reports no frame size".to_string(),
            });
        }
        info!(source = %source_name, width, height, team1 = %team1_direction, "session opened");

        let (control, commands) = mpsc::unbounded_channel();
        Ok(Self {
            source,
            source_name,
            released: false,
            detector: Box::new(detector),
            state: SessionState::new(team1_direction),
            possession: PossessionState::default(),
            detections: Vec::new(),
            object_tracker: ObjectTracker::new(config.tracker.clone()),
            ball_tracker: BallTracker::new(config.ball.clone()),
            team_assigner: TeamAssigner::new(config.team.clone()),
            possession_assigner: PossessionAssigner::new(config.possession_distance),
            kick_detector: KickDetector::new(config.kick_touch_threshold, config.kick_cooldown_frames),
            event_detector: EventDetector::new(),
            config,
            commands,
            control,
        })
    }

    /// Replaces the default motion matcher.
    pub fn with_identity_matcher(mut self, matcher: Box<dyn IdentityMatcher>) -> Self {
        self.object_tracker = ObjectTracker::with_matcher(matcher, self.config.tracker.max_age);
        self
    }

    /// Replaces the default Lucas-Kanade flow used to follow a lost ball.
    pub fn with_point_flow(mut self, flow: Box<dyn PointFlow>) -> Self {
        self.ball_tracker = BallTracker::with_flow(self.config.ball.clone(), flow);
        self
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn possession(&self) -> &PossessionState {
        &self.possession
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn toggle_halftime(&mut self) {
        self.state.toggle_halftime();
        info!(
            halftime = self.state.halftime_mode,
            team1 = %self.state.team1_dir,
            team2 = %self.state.team2_dir,
            "halftime toggled"
        );
    }

    pub fn reset_teams(&mut self) {
        self.team_assigner.reset();
    }

    /// A handle other threads can use to steer this session.
    pub fn control_handle(&self) -> ControlHandle {
        ControlHandle::new(self.control.clone())
    }

    /// The same frame sequence as an async stream.
    pub fn into_stream(self) -> impl Stream<Item = FrameResult> {
        stream::iter(self)
    }

    fn apply_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                SessionCommand::ToggleHalftime => self.toggle_halftime(),
                SessionCommand::ResetTeams => self.reset_teams(),
            }
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.source.release();
            self.released = true;
            debug!(source = %self.source_name, "frame source released");
        }
    }

    fn run_detection(&mut self, frame: &Frame) {
        if self.state.frame_count % self.config.detect_every != 0 {
            return;
        }
        self.detections = match self.detector.detect(frame) {
            Ok(raw) => {
                let (detections, dropped) = sanitize(&raw);
                if dropped > 0 {
                    warn!(frame = frame.index, dropped, "malformed detections dropped");
                }
                detections
            }
            Err(err) => {
                degraded(frame, "detection", err);
                Vec::new()
            }
        };
    }

    fn process(&mut self, frame: &Frame) -> FrameResult {
        // Stage 1: Detection
        self.run_detection(frame);
        let detections = self.detections.clone();

        // Stage 2: Object Tracking
        let people = self.object_tracker.update(&detections, &frame.image).unwrap_or_else(|err| {
            degraded(frame, "tracking", err);
            Vec::new()
        });
        let invalidations = self.object_tracker.take_invalidations();
        self.team_assigner.forget(&invalidations.expired);
        for id in invalidations.reclassified {
            self.team_assigner.invalidate(id);
        }

        // Stage 3: Ball Tracking
        let mut tracks = people;
        tracks.extend(self.ball_tracker.update(&frame.image, &detections));

        // Stage 4: Teams
        let tracks = self.team_assigner.assign(&frame.image, tracks);
        let ball_bbox = tracks
            .iter()
            .find(|t| t.track.class == ObjectClass::Ball)
            .map(|t| t.track.bbox);

        // Stage 5: Possession
        let possessed_by = ball_bbox.and_then(|ball| self.possession_assigner.assign_ball_to_player(&tracks, &ball));
        if possessed_by.is_some() {
            self.possession.last_player_possession = possessed_by;
        }

        // Stage 6: Kick
        let kicked = match (ball_bbox, self.possession.last_player_possession) {
            (Some(ball), Some(holder)) => tracks
                .iter()
                .find(|t| t.track.id == holder)
                .is_some_and(|t| self.kick_detector.update(&ball, &t.track.bbox, frame.index)),
            _ => false,
        };

        // Stage 7: Events
        let ball = ball_bbox.map(|bbox| BallState { bbox, possessed_by, kicked });
        let event = self.event_detector.detect(&FrameContext {
            frame_index: frame.index,
            tracks: &tracks,
            ball,
            team1_dir: self.state.team1_dir,
            team2_dir: self.state.team2_dir,
            last_player_possession: self.possession.last_player_possession,
        });

        let annotations = BallAnnotations { possessed_by, kicked };
        FrameResult {
            frame_id: frame.index,
            tracks: tracks
                .into_iter()
                .map(|t| TrackRecord::new(t, Some(annotations)))
                .collect(),
            event: event.map(|e| e.name().to_string()),
            event_text: event.map(|e| e.text()),
        }
    }
}

fn degraded(frame: &Frame, stage: &'static str, err: VisionError) {
    let err = VisionError::Stage { stage, reason: err.to_string() };
    warn!(frame = frame.index, %err, "frame degraded");
}

impl Iterator for LiveProcessor {
    type Item = FrameResult;

    fn next(&mut self) -> Option<FrameResult> {
        if self.released {
            return None;
        }
        self.apply_commands();

        let frame = match self.source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!(source = %self.source_name, frames = self.state.frame_count, "end of stream");
                self.release();
                return None;
            }
            Err(err) => {
                warn!(source = %self.source_name, %err, "frame source failed; ending stream");
                self.release();
                return None;
            }
        };

        self.state.frame_count += 1;
        if self.state.halftime_mode {
            return Some(FrameResult::empty(frame.index));
        }
        Some(self.process(&frame))
    }
}

impl Drop for LiveProcessor {
    fn drop(&mut self) {
        self.release();
    }
}
