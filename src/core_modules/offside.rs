// THEORY:
// Offside is judged in raw screen space. Each team attacks towards one side of
// the frame (`Left` or `Right`), and "ahead" simply means further towards that
// side. The rule is kept as data: `OFFSIDE_RULE` lists every condition a
// candidate has to meet. The positional conditions are measured from the boxes;
// the contextual ones (who played the ball, whether the player interferes) are
// settled later by the event detector when possession changes, so here they
// count as met.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core_modules::detection::ObjectClass;
use crate::core_modules::geometry::BBox;
use crate::core_modules::team_assigner::{TeamId, TeamTrack};
use crate::core_modules::tracker::TrackId;
use crate::error::VisionError;

/// The screen side a team is advancing towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttackDirection {
    Left,
    Right,
}

impl AttackDirection {
    pub fn flipped(self) -> Self {
        match self {
            AttackDirection::Left => AttackDirection::Right,
            AttackDirection::Right => AttackDirection::Left,
        }
    }

    /// The box edge nearest the goal being attacked.
    pub fn far_side(self, bbox: &BBox) -> f32 {
        match self {
            AttackDirection::Right => bbox.x1.max(bbox.x2),
            AttackDirection::Left => bbox.x1.min(bbox.x2),
        }
    }

    /// Whether `x` is strictly further towards the attacked goal than `reference`.
    pub fn is_ahead(self, x: f32, reference: f32) -> bool {
        match self {
            AttackDirection::Right => x > reference,
            AttackDirection::Left => x < reference,
        }
    }
}

impl fmt::Display for AttackDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AttackDirection::Left => "left",
            AttackDirection::Right => "right",
        })
    }
}

impl FromStr for AttackDirection {
    type Err = VisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" => Ok(AttackDirection::Left),
            "right" => Ok(AttackDirection::Right),
            other => Err(VisionError::Config(format!("unknown attack direction {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsideCondition {
    BallPlayedByTeammate,
    InOpponentHalf,
    AheadOfSecondLastDefender,
    AheadOfBall,
    InterferesWithPlay,
}

/// Everything a player must satisfy to be flagged.
pub const OFFSIDE_RULE: [OffsideCondition; 5] = [
    OffsideCondition::BallPlayedByTeammate,
    OffsideCondition::InOpponentHalf,
    OffsideCondition::AheadOfSecondLastDefender,
    OffsideCondition::AheadOfBall,
    OffsideCondition::InterferesWithPlay,
];

/// An attacker in an offside position at the moment of a kick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OffsideCandidate {
    pub player: TrackId,
    pub team: TeamId,
}

struct Line {
    direction: AttackDirection,
    ball_x: f32,
    second_last_defender: f32,
}

impl Line {
    fn holds(&self, condition: OffsideCondition, attacker: &BBox) -> bool {
        let edge = self.direction.far_side(attacker);
        match condition {
            OffsideCondition::AheadOfBall => self.direction.is_ahead(edge, self.ball_x),
            OffsideCondition::AheadOfSecondLastDefender => self.direction.is_ahead(edge, self.second_last_defender),
            // Being ahead of the second-last defender already places the
            // attacker in the opponents' half of the play.
            OffsideCondition::InOpponentHalf => true,
            OffsideCondition::BallPlayedByTeammate | OffsideCondition::InterferesWithPlay => true,
        }
    }
}

/// Attackers currently in an offside position. Empty with fewer than two
/// defending outfield players.
pub fn offside_candidates(
    tracks: &[TeamTrack],
    ball: &BBox,
    attacking_team: TeamId,
    direction: AttackDirection,
) -> Vec<OffsideCandidate> {
    let is_outfield = |t: &&TeamTrack| t.track.class == ObjectClass::Player;

    let mut defenders: Vec<f32> = tracks
        .iter()
        .filter(is_outfield)
        .filter(|t| t.team.is_some_and(|team| team != attacking_team))
        .map(|t| direction.far_side(&t.track.bbox))
        .collect();
    if defenders.len() < 2 {
        return Vec::new();
    }
    match direction {
        AttackDirection::Left => defenders.sort_by(|a, b| b.total_cmp(a)),
        AttackDirection::Right => defenders.sort_by(|a, b| a.total_cmp(b)),
    }

    let line = Line {
        direction,
        ball_x: ball.centre().x,
        second_last_defender: defenders[1],
    };

    tracks
        .iter()
        .filter(is_outfield)
        .filter(|t| t.team == Some(attacking_team))
        .filter(|t| OFFSIDE_RULE.iter().all(|&c| line.holds(c, &t.track.bbox)))
        .map(|t| OffsideCandidate { player: t.track.id, team: attacking_team })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::color::Rgb;
    use crate::core_modules::tracker::Track;

    fn player(id: TrackId, team: u8, x: f32) -> TeamTrack {
        TeamTrack {
            track: Track {
                id,
                class: ObjectClass::Player,
                bbox: BBox::new(x, 100.0, x + 20.0, 160.0),
                velocity: (0.0, 0.0),
            },
            team: Some(TeamId(team)),
            color: Rgb::NEUTRAL,
        }
    }

    fn ball_at(x: f32) -> BBox {
        BBox::new(x - 4.0, 150.0, x + 4.0, 158.0)
    }

    #[test]
    fn directions_parse_and_flip() {
        assert_eq!("Right".parse::<AttackDirection>().unwrap(), AttackDirection::Right);
        assert!("up".parse::<AttackDirection>().is_err());
        assert_eq!(AttackDirection::Left.flipped().flipped(), AttackDirection::Left);
    }

    #[test]
    fn needs_two_defenders() {
        let tracks = vec![player(1, 1, 300.0), player(2, 2, 100.0)];
        assert!(offside_candidates(&tracks, &ball_at(50.0), TeamId(1), AttackDirection::Right).is_empty());
    }

    #[test]
    fn flags_attackers_past_the_line_when_attacking_left() {
        // Defenders' left edges sorted descending: 200, 150, 120.
        let tracks = vec![
            player(2, 2, 120.0),
            player(3, 2, 200.0),
            player(4, 2, 150.0),
            player(17, 1, 140.0),
            player(18, 1, 100.0),
            player(19, 1, 260.0),
        ];
        let candidates = offside_candidates(&tracks, &ball_at(250.0), TeamId(1), AttackDirection::Left);
        let ids: Vec<TrackId> = candidates.iter().map(|c| c.player).collect();
        assert_eq!(ids, vec![17, 18]);
        assert!(candidates.iter().all(|c| c.team == TeamId(1)));
    }

    #[test]
    fn attackers_behind_the_ball_are_onside() {
        let tracks = vec![player(2, 2, 50.0), player(3, 2, 60.0), player(9, 1, 200.0)];
        // Right attack: defenders' right edges ascending 70, 80; line at 80.
        assert_eq!(
            offside_candidates(&tracks, &ball_at(100.0), TeamId(1), AttackDirection::Right).len(),
            1
        );
        assert!(offside_candidates(&tracks, &ball_at(300.0), TeamId(1), AttackDirection::Right).is_empty());
    }

    #[test]
    fn goalkeepers_and_referees_are_not_defenders() {
        let mut keeper = player(2, 2, 50.0);
        keeper.track.class = ObjectClass::Goalkeeper;
        let tracks = vec![keeper, player(3, 2, 60.0), player(9, 1, 200.0)];
        assert!(offside_candidates(&tracks, &ball_at(100.0), TeamId(1), AttackDirection::Right).is_empty());
    }
}
