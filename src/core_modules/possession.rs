use crate::core_modules::detection::ObjectClass;
use crate::core_modules::geometry::BBox;
use crate::core_modules::tracker::{Track, TrackId};

/// Decides which player, if any, has the ball at their feet.
#[derive(Debug, Clone)]
pub struct PossessionAssigner {
    max_distance: f32,
}

impl PossessionAssigner {
    pub fn new(max_distance: f32) -> Self {
        Self { max_distance }
    }

    /// The player whose nearer bottom corner is closest to the ball centre,
    /// if strictly within the proximity threshold. Goalkeepers and referees
    /// are never eligible. Ties keep the first player seen.
    pub fn assign_ball_to_player<T: AsRef<Track>>(&self, tracks: &[T], ball: &BBox) -> Option<TrackId> {
        let centre = ball.centre();
        let mut best: Option<(f32, TrackId)> = None;
        for track in tracks.iter().map(AsRef::as_ref) {
            if track.class != ObjectClass::Player {
                continue;
            }
            let distance = centre
                .distance(&track.bbox.bottom_left())
                .min(centre.distance(&track.bbox.bottom_right()));
            if best.is_none_or(|(d, _)| distance < d) {
                best = Some((distance, track.id));
            }
        }
        best.filter(|&(d, _)| d < self.max_distance).map(|(_, id)| id)
    }
}

impl Default for PossessionAssigner {
    fn default() -> Self {
        Self::new(70.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::geometry::Point;

    fn track(id: TrackId, class: ObjectClass, bbox: [f32; 4]) -> Track {
        Track { id, class, bbox: bbox.into(), velocity: (0.0, 0.0) }
    }

    fn ball_at(x: f32, y: f32) -> BBox {
        BBox::centred_at(Point::new(x, y), 8.0, 8.0)
    }

    #[test]
    fn ball_at_the_feet_is_possessed() {
        let assigner = PossessionAssigner::default();
        let tracks = vec![track(9, ObjectClass::Player, [100.0, 100.0, 150.0, 200.0])];
        assert_eq!(assigner.assign_ball_to_player(&tracks, &ball_at(160.0, 200.0)), Some(9));
        assert_eq!(assigner.assign_ball_to_player(&tracks, &ball_at(400.0, 400.0)), None);
    }

    #[test]
    fn only_outfield_players_are_eligible() {
        let assigner = PossessionAssigner::default();
        let tracks = vec![
            track(1, ObjectClass::Goalkeeper, [100.0, 100.0, 150.0, 200.0]),
            track(2, ObjectClass::Referee, [100.0, 100.0, 150.0, 200.0]),
        ];
        assert_eq!(assigner.assign_ball_to_player(&tracks, &ball_at(150.0, 200.0)), None);
    }

    #[test]
    fn nearest_player_wins_and_ties_keep_the_first() {
        let assigner = PossessionAssigner::default();
        let tracks = vec![
            track(1, ObjectClass::Player, [0.0, 0.0, 40.0, 100.0]),
            track(2, ObjectClass::Player, [80.0, 0.0, 120.0, 100.0]),
            track(3, ObjectClass::Player, [45.0, 0.0, 55.0, 100.0]),
        ];
        assert_eq!(assigner.assign_ball_to_player(&tracks, &ball_at(60.0, 100.0)), Some(3));
        assert_eq!(assigner.assign_ball_to_player(&tracks[..2], &ball_at(60.0, 100.0)), Some(1));
    }

    #[test]
    fn threshold_is_strict() {
        let assigner = PossessionAssigner::new(10.0);
        let tracks = vec![track(1, ObjectClass::Player, [0.0, 0.0, 10.0, 10.0])];
        assert_eq!(assigner.assign_ball_to_player(&tracks, &ball_at(20.0, 10.0)), None);
        assert_eq!(assigner.assign_ball_to_player(&tracks, &ball_at(19.0, 10.0)), Some(1));
    }
}
