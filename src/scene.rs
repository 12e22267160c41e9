//! Static city model: per-instance descriptors computed once at build time.
//!
//! All randomness is drawn from an injected RNG so a seeded run reproduces
//! the exact layout; dynamic per-frame state lives in the scheduler, not here.

use rand::Rng;

use crate::params::SceneLayout;

/// How a building reacts to the spectrum each frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReactiveType {
    /// Height ripples with the mids, phased along Z.
    Wave,
    /// Height spikes randomly with the treble; flashes near-white on peaks.
    Pulse,
    /// No extra height term; rides the bass and ambient sine only.
    Sparkle,
}

/// Static descriptor for one building cell. Height and color are recomputed
/// every tick from this plus the band energies, never stored back.
#[derive(Clone, Copy, Debug)]
pub struct Building {
    pub base_x: f32,
    pub base_z: f32,
    /// Cells inside the street clearing are parked off-scene every frame.
    pub is_street_gap: bool,
    pub reactive: ReactiveType,
    /// Uniform in [0,1); picks this instance's cold/hot hue pair.
    pub color_seed: f32,
    /// Footprint scale; ≈30% of cells get an enlarged one.
    pub width_scale: f32,
}

/// Static descriptor for one painted road-marking line.
#[derive(Clone, Copy, Debug)]
pub struct RoadLine {
    pub base_z: f32,
}

/// The whole static scene: buildings plus road markings.
pub struct SceneModel {
    pub layout: SceneLayout,
    pub buildings: Vec<Building>,
    pub road_lines: Vec<RoadLine>,
}

impl SceneModel {
    /// Build the procedural city from the layout and an injected RNG.
    pub fn build<R: Rng>(layout: SceneLayout, rng: &mut R) -> Self {
        let mut buildings = Vec::with_capacity(layout.building_count());

        for x in 0..layout.grid_size_x {
            for z in 0..layout.grid_size_z {
                let base_x = (x as f32 - layout.grid_size_x as f32 / 2.0) * layout.spacing_m;
                let base_z = (z as f32 - layout.grid_size_z as f32 / 2.0) * layout.spacing_m;

                let reactive = match rng.gen_range(0..3) {
                    0 => ReactiveType::Wave,
                    1 => ReactiveType::Pulse,
                    _ => ReactiveType::Sparkle,
                };
                let color_seed = rng.gen::<f32>();
                let width_scale = if rng.gen::<f32>() > layout.skyscraper_threshold {
                    rng.gen_range(layout.skyscraper_scale.clone())
                } else {
                    1.0
                };

                buildings.push(Building {
                    base_x,
                    base_z,
                    is_street_gap: base_x.abs() < layout.street_half_width_m,
                    reactive,
                    color_seed,
                    width_scale,
                });
            }
        }

        let road_lines = (0..layout.road_line_count)
            .map(|k| RoadLine {
                base_z: k as f32 * layout.road_line_spacing_m
                    - (layout.road_line_count as f32 / 2.0) * layout.road_line_spacing_m,
            })
            .collect();

        Self {
            layout,
            buildings,
            road_lines,
        }
    }
}
