// THEORY:
// Offside cannot be called at the instant of the pass: it depends on who
// receives the ball, which is only known some frames later. The
// `EventDetector` therefore works in two steps:
//
// 1.  On a kick, it snapshots the attackers that are in an offside position
//     and remembers who made the pass.
// 2.  It waits until a different player gains possession. If that player is in
//     the snapshot, an `Offside` event is raised. Either way the snapshot is
//     then discarded and the detector goes back to idle.
//
// A new kick while waiting simply replaces the snapshot. At most one event is
// produced per frame.

use std::fmt;

use tracing::{debug, info};

use crate::core_modules::geometry::BBox;
use crate::core_modules::offside::{offside_candidates, AttackDirection, OffsideCandidate};
use crate::core_modules::team_assigner::{TeamId, TeamTrack};
use crate::core_modules::tracker::TrackId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchEvent {
    Offside { player: TrackId },
}

impl MatchEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MatchEvent::Offside { .. } => "Offside",
        }
    }

    pub fn text(&self) -> String {
        match self {
            MatchEvent::Offside { player } => format!("Offside by Player {player}"),
        }
    }
}

impl fmt::Display for MatchEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventState {
    Idle,
    WaitingForPossessionChange {
        holder: Option<TrackId>,
        snapshot: Vec<OffsideCandidate>,
    },
}

/// The per-frame ball annotations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BallState {
    pub bbox: BBox,
    pub possessed_by: Option<TrackId>,
    pub kicked: bool,
}

/// Everything the detector looks at for one frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameContext<'a> {
    pub frame_index: u64,
    pub tracks: &'a [TeamTrack],
    pub ball: Option<BallState>,
    pub team1_dir: AttackDirection,
    pub team2_dir: AttackDirection,
    pub last_player_possession: Option<TrackId>,
}

impl FrameContext<'_> {
    fn team_of(&self, id: TrackId) -> Option<TeamId> {
        self.tracks.iter().find(|t| t.track.id == id).and_then(|t| t.team)
    }

    fn direction_of(&self, team: TeamId) -> AttackDirection {
        if team == TeamId::TWO { self.team2_dir } else { self.team1_dir }
    }

    /// The team in possession now, else the team of the last possessor.
    fn attacking_team(&self, ball: &BallState) -> Option<TeamId> {
        ball.possessed_by
            .and_then(|id| self.team_of(id))
            .or_else(|| self.last_player_possession.and_then(|id| self.team_of(id)))
    }
}

#[derive(Debug)]
pub struct EventDetector {
    state: EventState,
}

impl EventDetector {
    pub fn new() -> Self {
        Self { state: EventState::Idle }
    }

    pub fn state(&self) -> &EventState {
        &self.state
    }

    pub fn detect(&mut self, ctx: &FrameContext<'_>) -> Option<MatchEvent> {
        let ball = ctx.ball?;

        if ball.kicked {
            let snapshot = match ctx.attacking_team(&ball) {
                Some(team) => offside_candidates(ctx.tracks, &ball.bbox, team, ctx.direction_of(team)),
                None => Vec::new(),
            };
            let holder = ball.possessed_by.or(ctx.last_player_possession);
            debug!(frame = ctx.frame_index, ?holder, candidates = snapshot.len(), "offside snapshot taken");
            self.state = EventState::WaitingForPossessionChange { holder, snapshot };
        }

        let EventState::WaitingForPossessionChange { holder, snapshot } = &self.state else {
            return None;
        };
        let receiver = ball.possessed_by?;
        if Some(receiver) == *holder {
            return None;
        }

        let event = snapshot
            .iter()
            .find(|c| c.player == receiver)
            .map(|c| MatchEvent::Offside { player: c.player });
        self.state = EventState::Idle;
        if let Some(event) = &event {
            info!(frame = ctx.frame_index, %event, "event raised");
        }
        event
    }
}

impl Default for EventDetector {
    fn default() -> Self {
        Self::new()
    }
}
