// THEORY:
// The `team_assigner` module decides which side each player is on from nothing
// but shirt colour. Two properties matter more than raw accuracy:
//
// 1.  **Determinism**: the two team colours are found once by 2-means clustering
//     with a fixed seed, so the same footage always yields the same team ids.
// 2.  **Stickiness**: shirt samples are noisy (shadows, motion blur, overlapping
//     players). Once an id is mapped to a team the answer is cached and only
//     re-sampled every `reevaluate_every` calls, or when the tracker reports
//     that the id expired or changed class.
//
// Referees are never given a team, and seeing an id as a referee clears its
// cached team in case the tracker later hands that id to a player.

use std::collections::HashMap;

use image::RgbImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::core_modules::color::{color_distance, shirt_sample, ColorSample, Rgb};
use crate::core_modules::detection::ObjectClass;
use crate::core_modules::tracker::{Track, TrackId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamConfig {
    /// Every Nth call re-samples every cached player. Zero never re-samples;
    /// `PipelineConfig::validate` refuses it.
    pub reevaluate_every: u64,
    /// Side of the square patch a shirt region is pooled into.
    pub patch_size: u32,
    pub kmeans_seed: u64,
    pub kmeans_iterations: usize,
}

impl Default for TeamConfig {
    fn default() -> Self {
        Self {
            reevaluate_every: 10,
            patch_size: 10,
            kmeans_seed: 42,
            kmeans_iterations: 50,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TeamId(pub u8);

impl TeamId {
    pub const ONE: TeamId = TeamId(1);
    pub const TWO: TeamId = TeamId(2);
}

/// The two team centroid colours.
#[derive(Debug, Clone, PartialEq)]
pub struct TeamColorModel {
    centroids: [ColorSample; 2],
}

impl TeamColorModel {
    /// 2-means over the samples, seeded with k-means++. Needs at least two samples.
    pub fn fit(samples: &[ColorSample], seed: u64, iterations: usize) -> Option<Self> {
        if samples.len() < 2 {
            return None;
        }
        let mut rng = StdRng::seed_from_u64(seed);

        let first = samples[rng.gen_range(0..samples.len())];
        let weights: Vec<f64> = samples.iter().map(|s| color_distance(s, &first).powi(2)).collect();
        let total: f64 = weights.iter().sum();
        let second = if total > 0.0 {
            let mut target = rng.gen_range(0.0..total);
            let mut chosen = samples.len() - 1;
            for (i, w) in weights.iter().enumerate() {
                if target < *w {
                    chosen = i;
                    break;
                }
                target -= w;
            }
            samples[chosen]
        } else {
            first
        };

        let mut centroids = [first, second];
        for _ in 0..iterations {
            let mut sums = [[0.0f64; 3]; 2];
            let mut counts = [0usize; 2];
            for sample in samples {
                let k = Self::nearest_index(&centroids, sample);
                counts[k] += 1;
                for c in 0..3 {
                    sums[k][c] += sample[c];
                }
            }

            let mut next = centroids;
            for k in 0..2 {
                // An empty cluster keeps its centroid.
                if counts[k] > 0 {
                    next[k] = sums[k].map(|s| s / counts[k] as f64);
                }
            }
            if next == centroids {
                break;
            }
            centroids = next;
        }

        Some(Self { centroids })
    }

    fn nearest_index(centroids: &[ColorSample; 2], sample: &ColorSample) -> usize {
        if color_distance(sample, &centroids[1]) < color_distance(sample, &centroids[0]) { 1 } else { 0 }
    }

    /// Team whose centroid is closest. Ties go to team 1.
    pub fn nearest(&self, sample: &ColorSample) -> TeamId {
        match Self::nearest_index(&self.centroids, sample) {
            0 => TeamId::ONE,
            _ => TeamId::TWO,
        }
    }

    pub fn color(&self, team: TeamId) -> Rgb {
        let index = if team == TeamId::TWO { 1 } else { 0 };
        Rgb::from_sample(&self.centroids[index])
    }
}

/// A track with its team decision attached.
#[derive(Debug, Clone, PartialEq)]
pub struct TeamTrack {
    pub track: Track,
    pub team: Option<TeamId>,
    pub color: Rgb,
}

impl AsRef<Track> for TeamTrack {
    fn as_ref(&self) -> &Track {
        &self.track
    }
}

pub struct TeamAssigner {
    config: TeamConfig,
    model: Option<TeamColorModel>,
    cache: HashMap<TrackId, TeamId>,
    calls: u64,
}

impl TeamAssigner {
    pub fn new(config: TeamConfig) -> Self {
        Self {
            config,
            model: None,
            cache: HashMap::new(),
            calls: 0,
        }
    }

    pub fn color_model(&self) -> Option<&TeamColorModel> {
        self.model.as_ref()
    }

    /// Drops the colour model and every cached decision.
    pub fn reset(&mut self) {
        self.model = None;
        self.cache.clear();
        self.calls = 0;
        info!("team colours reset");
    }

    /// Forces the next sighting of `id` to be re-sampled.
    pub fn invalidate(&mut self, id: TrackId) {
        self.cache.remove(&id);
    }

    pub fn forget(&mut self, ids: &[TrackId]) {
        for id in ids {
            self.cache.remove(id);
        }
    }

    pub fn cached_team(&self, id: TrackId) -> Option<TeamId> {
        self.cache.get(&id).copied()
    }

    fn initialise(&mut self, frame: &RgbImage, tracks: &[Track]) -> bool {
        let samples: Vec<ColorSample> = tracks
            .iter()
            .filter(|t| t.class.wears_team_shirt())
            .map(|t| shirt_sample(frame, &t.bbox, self.config.patch_size))
            .collect();

        match TeamColorModel::fit(&samples, self.config.kmeans_seed, self.config.kmeans_iterations) {
            Some(model) => {
                info!(
                    samples = samples.len(),
                    team1 = ?model.color(TeamId::ONE),
                    team2 = ?model.color(TeamId::TWO),
                    "team colours initialised"
                );
                self.model = Some(model);
                true
            }
            None => {
                warn!(samples = samples.len(), "not enough shirts to initialise team colours");
                false
            }
        }
    }

    /// Attaches a team and a display colour to every track.
    pub fn assign(&mut self, frame: &RgbImage, tracks: Vec<Track>) -> Vec<TeamTrack> {
        self.calls += 1;
        if self.model.is_none() && !self.initialise(frame, &tracks) {
            return tracks
                .into_iter()
                .map(|track| TeamTrack { track, team: None, color: Rgb::NEUTRAL })
                .collect();
        }
        let reevaluate = self.config.reevaluate_every > 0 && self.calls % self.config.reevaluate_every == 0;

        tracks
            .into_iter()
            .map(|track| {
                let (team, color) = match track.class {
                    ObjectClass::Ball => (None, Rgb::BALL),
                    ObjectClass::Referee => {
                        self.cache.remove(&track.id);
                        (None, Rgb::REFEREE)
                    }
                    ObjectClass::Player | ObjectClass::Goalkeeper => self.team_for(frame, &track, reevaluate),
                };
                TeamTrack { track, team, color }
            })
            .collect()
    }

    fn team_for(&mut self, frame: &RgbImage, track: &Track, reevaluate: bool) -> (Option<TeamId>, Rgb) {
        let Some(model) = self.model.as_ref() else {
            return (None, Rgb::NEUTRAL);
        };
        let team = match self.cache.get(&track.id) {
            Some(&team) if !reevaluate => team,
            _ => {
                let sample = shirt_sample(frame, &track.bbox, self.config.patch_size);
                let team = model.nearest(&sample);
                self.cache.insert(track.id, team);
                team
            }
        };
        (Some(team), model.color(team))
    }
}
