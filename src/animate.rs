//! Per-frame animation: the spectrum-to-city mapping.
//!
//! Each tick pulls the current band energies, recomputes every building's
//! transform and color in place, derives the mirrored reflections, wraps the
//! road markings, and flushes one batched update per mesh to the backend.

use glam::{Mat4, Vec3, Vec4};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;

use crate::audio::BandEnergy;
use crate::bridge::{BatchGeometry, BatchHandle, RendererBridge};
use crate::params::{DriveParams, PaletteParams, HEIGHT_FLOOR_M};
use crate::scene::{Building, ReactiveType, SceneModel};

/// Per-tick scalars the renderer consumes outside the instance batches.
#[derive(Clone, Copy, Debug, Default)]
pub struct FrameStats {
    /// Blended excitation in [0,1]; drives color temperature.
    pub sound_heat: f32,
    /// Floor grid scroll offset in [0, grid_unit).
    pub grid_offset: f32,
}

/// Blended excitation scalar: bass-weighted with a mid contribution.
pub fn sound_heat(bands: &BandEnergy) -> f32 {
    (bands.bass * 0.8 + bands.mid * 0.4).min(1.0)
}

/// Recycle a scrolling Z coordinate into the visible window.
///
/// The result always lies in `(near_clip - depth, near_clip]`: coordinates
/// that scroll past the camera re-enter at the far distance.
pub fn wrap_z(base_z: f32, z_offset: f32, depth: f32, near_clip: f32) -> f32 {
    let mut z = (base_z + z_offset).rem_euclid(depth);
    if z > near_clip {
        z -= depth;
    }
    z
}

/// Building height for this tick, clamped to the visibility floor.
fn building_height<R: Rng>(
    building: &Building,
    bands: &BandEnergy,
    wrapped_z: f32,
    time_s: f32,
    rng: &mut R,
) -> f32 {
    let mut h = 2.0 + bands.bass * 4.0;
    h += match building.reactive {
        ReactiveType::Wave => ((wrapped_z * 0.1 + time_s * 2.0).sin() * bands.mid * 6.0).abs(),
        ReactiveType::Pulse => bands.treble * 5.0 * rng.gen::<f32>(),
        ReactiveType::Sparkle => 0.0,
    };
    h += (building.base_x * 0.2 + time_s).sin() * 1.5;
    h.max(HEIGHT_FLOOR_M)
}

/// Tall instances visually narrow (squash and stretch).
fn width_squash(height: f32) -> f32 {
    (1.0 - height * 0.05).max(0.6)
}

/// This instance's resting hue when the spectrum is silent.
fn cold_hue(building: &Building, palette: &PaletteParams) -> f32 {
    palette.cold_hue_base + building.color_seed * palette.cold_hue_spread
}

/// Primary HSL color for a building at the given excitation.
///
/// The time jitter is scaled by `heat` so a silent spectrum reproduces the
/// cold baseline hue exactly.
fn building_hsl(
    building: &Building,
    palette: &PaletteParams,
    heat: f32,
    treble: f32,
    time_s: f32,
) -> (f32, f32, f32) {
    if building.reactive == ReactiveType::Pulse && treble > palette.flash_treble_threshold {
        // Transient near-white flash on treble peaks.
        return (0.55, 0.2, 1.0);
    }

    let cold = cold_hue(building, palette);
    let hot = (cold + palette.hot_hue_shift + building.color_seed * palette.hot_hue_spread)
        .rem_euclid(1.0);
    let jitter = (time_s * 0.5 + building.base_x).sin() * palette.hue_jitter;
    let hue = (cold + (hot - cold) * heat + jitter * heat).rem_euclid(1.0);

    let sat = 0.6 + heat * 0.4;
    let light = 0.2 + heat * 0.6;
    (hue, sat, light)
}

/// HSL to linear RGB, all components in [0,1].
pub fn hsl_to_rgb(h: f32, s: f32, l: f32) -> [f32; 3] {
    if s == 0.0 {
        return [l, l, l];
    }
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    [
        hue_to_channel(p, q, h + 1.0 / 3.0),
        hue_to_channel(p, q, h),
        hue_to_channel(p, q, h - 1.0 / 3.0),
    ]
}

fn hue_to_channel(p: f32, q: f32, t: f32) -> f32 {
    let t = t.rem_euclid(1.0);
    if t < 1.0 / 6.0 {
        p + (q - p) * 6.0 * t
    } else if t < 0.5 {
        q
    } else if t < 2.0 / 3.0 {
        p + (q - p) * (2.0 / 3.0 - t) * 6.0
    } else {
        p
    }
}

fn rgba(rgb: [f32; 3]) -> Vec4 {
    Vec4::new(rgb[0], rgb[1], rgb[2], 1.0)
}

/// The per-frame control loop over the static scene.
///
/// Owns all dynamic state exclusively; nothing here is shared across threads
/// and nothing survives a tick except the RNG stream for Pulse spikes.
pub struct AnimationScheduler {
    scene: SceneModel,
    drive: DriveParams,
    palette: PaletteParams,
    rng: Pcg64,
    towers: BatchHandle,
    reflections: BatchHandle,
    road_lines: BatchHandle,
}

impl AnimationScheduler {
    /// Create the scheduler and its batches on the backend.
    pub fn new(
        scene: SceneModel,
        drive: DriveParams,
        palette: PaletteParams,
        seed: u64,
        bridge: &mut dyn RendererBridge,
    ) -> Self {
        let building_count = scene.buildings.len();
        let towers = bridge.create_instanced_batch(building_count, BatchGeometry::Tower);
        let reflections = bridge.create_instanced_batch(building_count, BatchGeometry::Tower);
        let road_lines =
            bridge.create_instanced_batch(scene.road_lines.len(), BatchGeometry::RoadLine);

        Self {
            scene,
            drive,
            palette,
            rng: Pcg64::seed_from_u64(seed),
            towers,
            reflections,
            road_lines,
        }
    }

    /// Advance one frame: recompute all instance state and flush each batch
    /// once. Zero band energies (no or silent source) are a valid input; the
    /// ambient sine terms keep the city alive.
    pub fn tick(
        &mut self,
        time_s: f32,
        bands: &BandEnergy,
        bridge: &mut dyn RendererBridge,
    ) -> FrameStats {
        let heat = sound_heat(bands);
        let z_offset = time_s * self.drive.speed_m_per_s;

        for (i, building) in self.scene.buildings.iter().enumerate() {
            if building.is_street_gap {
                // Parked far below the road; zero extent either way.
                let hidden = Mat4::from_translation(Vec3::new(0.0, -1000.0, 0.0))
                    * Mat4::from_scale(Vec3::ZERO);
                bridge.set_instance_transform(self.towers, i, hidden);
                bridge.set_instance_transform(self.reflections, i, hidden);
                continue;
            }

            let z = wrap_z(
                building.base_z,
                z_offset,
                self.drive.depth_m,
                self.drive.near_clip_bound_m,
            );
            let height = building_height(building, bands, z, time_s, &mut self.rng);
            let width = building.width_scale * width_squash(height);

            let translation = Mat4::from_translation(Vec3::new(building.base_x, 0.0, z));
            bridge.set_instance_transform(
                self.towers,
                i,
                translation * Mat4::from_scale(Vec3::new(width, height, width)),
            );

            let (hue, sat, light) = building_hsl(building, &self.palette, heat, bands.treble, time_s);
            bridge.set_instance_color(self.towers, i, rgba(hsl_to_rgb(hue, sat, light)));

            // Reflection: a pure function of the primary instance, inverted
            // and darkened, never independently animated.
            bridge.set_instance_transform(
                self.reflections,
                i,
                translation * Mat4::from_scale(Vec3::new(width, -height, width)),
            );
            bridge.set_instance_color(
                self.reflections,
                i,
                rgba(hsl_to_rgb(hue, sat * 0.8, light * 0.6)),
            );
        }

        for (k, line) in self.scene.road_lines.iter().enumerate() {
            let z = wrap_z(
                line.base_z,
                z_offset,
                self.drive.road_depth_m,
                self.drive.near_clip_bound_m,
            );
            bridge.set_instance_transform(
                self.road_lines,
                k,
                Mat4::from_translation(Vec3::new(0.0, 0.07, z)),
            );
            bridge.set_instance_color(self.road_lines, k, Vec4::ONE);
        }

        bridge.commit(self.towers);
        bridge.commit(self.reflections);
        bridge.commit(self.road_lines);

        FrameStats {
            sound_heat: heat,
            grid_offset: (time_s * self.drive.speed_m_per_s).rem_euclid(self.drive.grid_unit_m),
        }
    }

    pub fn scene(&self) -> &SceneModel {
        &self.scene
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::SceneLayout;

    /// Backend double: records staged writes and counts commits.
    struct CountingBridge {
        batches: Vec<MockBatch>,
    }

    struct MockBatch {
        transforms: Vec<Mat4>,
        colors: Vec<Vec4>,
        commits: usize,
    }

    impl CountingBridge {
        fn new() -> Self {
            Self {
                batches: Vec::new(),
            }
        }
    }

    impl RendererBridge for CountingBridge {
        fn create_instanced_batch(
            &mut self,
            count: usize,
            _geometry: BatchGeometry,
        ) -> BatchHandle {
            self.batches.push(MockBatch {
                transforms: vec![Mat4::IDENTITY; count],
                colors: vec![Vec4::ZERO; count],
                commits: 0,
            });
            BatchHandle(self.batches.len() - 1)
        }

        fn set_instance_transform(&mut self, batch: BatchHandle, index: usize, transform: Mat4) {
            self.batches[batch.0].transforms[index] = transform;
        }

        fn set_instance_color(&mut self, batch: BatchHandle, index: usize, color: Vec4) {
            self.batches[batch.0].colors[index] = color;
        }

        fn commit(&mut self, batch: BatchHandle) {
            self.batches[batch.0].commits += 1;
        }

        fn resize(&mut self, _width: u32, _height: u32) {}
    }

    fn make_scheduler(bridge: &mut CountingBridge) -> AnimationScheduler {
        let mut rng = Pcg64::seed_from_u64(42);
        let scene = SceneModel::build(SceneLayout::default(), &mut rng);
        AnimationScheduler::new(
            scene,
            DriveParams::default(),
            PaletteParams::default(),
            42,
            bridge,
        )
    }

    fn scale_of(m: &Mat4) -> Vec3 {
        // Transforms here are translation * scale with no rotation.
        Vec3::new(m.x_axis.x, m.y_axis.y, m.z_axis.z)
    }

    #[test]
    fn test_sound_heat_blend() {
        let silent = BandEnergy::default();
        assert_eq!(sound_heat(&silent), 0.0);

        let bass_only = BandEnergy {
            bass: 1.0,
            ..Default::default()
        };
        assert!((sound_heat(&bass_only) - 0.8).abs() < 1e-6);

        let loud = BandEnergy {
            bass: 1.0,
            mid: 1.0,
            treble: 1.0,
        };
        assert_eq!(sound_heat(&loud), 1.0);
    }

    #[test]
    fn test_wrap_window_bounds() {
        let depth = 360.0;
        let near = 20.0;
        for base in [-180.0f32, -60.0, 0.0, 54.0, 174.0] {
            for step in 0..2000 {
                let z = wrap_z(base, step as f32 * 0.7, depth, near);
                assert!(z > near - depth, "z = {z}");
                assert!(z <= near, "z = {z}");
            }
        }
    }

    #[test]
    fn test_height_floor_holds_under_all_inputs() {
        let mut bridge = CountingBridge::new();
        let mut scheduler = make_scheduler(&mut bridge);
        let band_cases = [
            BandEnergy::default(),
            BandEnergy {
                bass: 1.0,
                mid: 1.0,
                treble: 1.0,
            },
            BandEnergy {
                bass: 0.1,
                mid: 0.9,
                treble: 0.3,
            },
        ];

        for step in 0..300 {
            let bands = band_cases[step % band_cases.len()];
            let time_s = step as f32 / 60.0;
            scheduler.tick(time_s, &bands, &mut bridge);

            for (i, building) in scheduler.scene().buildings.iter().enumerate() {
                if building.is_street_gap {
                    continue;
                }
                let height = scale_of(&bridge.batches[0].transforms[i]).y;
                assert!(height >= HEIGHT_FLOOR_M, "height = {height}");
            }
        }
    }

    #[test]
    fn test_one_commit_per_batch_per_tick() {
        let mut bridge = CountingBridge::new();
        let mut scheduler = make_scheduler(&mut bridge);
        scheduler.tick(0.5, &BandEnergy::default(), &mut bridge);
        assert_eq!(bridge.batches.len(), 3);
        for batch in &bridge.batches {
            assert_eq!(batch.commits, 1);
        }
        scheduler.tick(1.0, &BandEnergy::default(), &mut bridge);
        for batch in &bridge.batches {
            assert_eq!(batch.commits, 2);
        }
    }

    #[test]
    fn test_street_gaps_parked_off_scene() {
        let mut bridge = CountingBridge::new();
        let mut scheduler = make_scheduler(&mut bridge);
        scheduler.tick(1.0, &BandEnergy::default(), &mut bridge);
        for (i, building) in scheduler.scene().buildings.iter().enumerate() {
            if building.is_street_gap {
                let m = &bridge.batches[0].transforms[i];
                assert_eq!(scale_of(m), Vec3::ZERO);
                assert_eq!(m.w_axis.y, -1000.0);
            }
        }
    }

    #[test]
    fn test_silent_spectrum_renders_cold_hue_exactly() {
        let mut bridge = CountingBridge::new();
        let mut scheduler = make_scheduler(&mut bridge);
        // Arbitrary nonzero time: the jitter term must not leak in at heat 0.
        scheduler.tick(13.7, &BandEnergy::default(), &mut bridge);

        for (i, building) in scheduler.scene().buildings.iter().enumerate() {
            if building.is_street_gap {
                continue;
            }
            let expected = rgba(hsl_to_rgb(
                cold_hue(building, &PaletteParams::default()),
                0.6,
                0.2,
            ));
            let got = bridge.batches[0].colors[i];
            assert!((got - expected).abs().max_element() < 1e-6);
        }
    }

    #[test]
    fn test_pulse_flashes_white_on_treble_peak() {
        let mut bridge = CountingBridge::new();
        let mut scheduler = make_scheduler(&mut bridge);
        let bands = BandEnergy {
            bass: 0.0,
            mid: 0.0,
            treble: 0.7,
        };
        scheduler.tick(2.0, &bands, &mut bridge);

        let flash = rgba(hsl_to_rgb(0.55, 0.2, 1.0));
        for (i, building) in scheduler.scene().buildings.iter().enumerate() {
            if building.is_street_gap {
                continue;
            }
            let got = bridge.batches[0].colors[i];
            if building.reactive == ReactiveType::Pulse {
                assert!((got - flash).abs().max_element() < 1e-6);
            } else {
                assert!((got - flash).abs().max_element() > 1e-3);
            }
        }
    }

    #[test]
    fn test_reflection_is_derived_from_primary() {
        let mut bridge = CountingBridge::new();
        let mut scheduler = make_scheduler(&mut bridge);
        let bands = BandEnergy {
            bass: 0.6,
            mid: 0.4,
            treble: 0.1,
        };
        scheduler.tick(3.3, &bands, &mut bridge);

        for (i, building) in scheduler.scene().buildings.iter().enumerate() {
            if building.is_street_gap {
                continue;
            }
            let primary = scale_of(&bridge.batches[0].transforms[i]);
            let mirror = scale_of(&bridge.batches[1].transforms[i]);
            assert_eq!(mirror.x, primary.x);
            assert_eq!(mirror.y, -primary.y);
            // Same footprint position.
            assert_eq!(
                bridge.batches[0].transforms[i].w_axis,
                bridge.batches[1].transforms[i].w_axis
            );
            // Darkened, never brighter than the primary.
            let p = bridge.batches[0].colors[i];
            let r = bridge.batches[1].colors[i];
            assert!(r.x <= p.x + 1e-6 && r.y <= p.y + 1e-6 && r.z <= p.z + 1e-6);
        }
    }

    #[test]
    fn test_every_instance_wraps_within_45_seconds() {
        let mut bridge = CountingBridge::new();
        let mut scheduler = make_scheduler(&mut bridge);
        let bands = BandEnergy::default();

        let building_count = scheduler.scene().buildings.len();
        let mut wrapped = vec![false; building_count];
        let mut prev_z = vec![f32::NAN; building_count];

        // 45 simulated seconds at 60 fps, speed 8, depth 360.
        for step in 0..=2700 {
            let time_s = step as f32 / 60.0;
            scheduler.tick(time_s, &bands, &mut bridge);
            for i in 0..building_count {
                if scheduler.scene().buildings[i].is_street_gap {
                    continue;
                }
                let z = bridge.batches[0].transforms[i].w_axis.z;
                // A wrap shows as a large backwards jump in Z.
                if !prev_z[i].is_nan() && z < prev_z[i] - 100.0 {
                    wrapped[i] = true;
                }
                prev_z[i] = z;
            }
        }

        for (i, building) in scheduler.scene().buildings.iter().enumerate() {
            if !building.is_street_gap {
                assert!(wrapped[i], "building {i} never wrapped");
            }
        }
    }

    #[test]
    fn test_road_lines_wrap_and_stay_white() {
        let mut bridge = CountingBridge::new();
        let mut scheduler = make_scheduler(&mut bridge);
        scheduler.tick(100.0, &BandEnergy::default(), &mut bridge);

        let drive = DriveParams::default();
        for k in 0..scheduler.scene().road_lines.len() {
            let z = bridge.batches[2].transforms[k].w_axis.z;
            assert!(z > drive.near_clip_bound_m - drive.road_depth_m);
            assert!(z <= drive.near_clip_bound_m);
            assert_eq!(bridge.batches[2].colors[k], Vec4::ONE);
        }
    }

    #[test]
    fn test_grid_offset_wraps_at_unit() {
        let mut bridge = CountingBridge::new();
        let mut scheduler = make_scheduler(&mut bridge);
        for step in 0..240 {
            let stats = scheduler.tick(step as f32 / 60.0, &BandEnergy::default(), &mut bridge);
            assert!(stats.grid_offset >= 0.0 && stats.grid_offset < 2.0);
        }
    }

    #[test]
    fn test_hsl_to_rgb_known_values() {
        // Hue-branch boundaries can land an ulp off after rem_euclid, so
        // channels are compared with a tolerance, never exactly.
        let red = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!(red[0] > 0.99 && red[1] < 1e-6 && red[2] < 1e-6);
        let green = hsl_to_rgb(1.0 / 3.0, 1.0, 0.5);
        assert!(green[1] > 0.99 && green[0] < 0.01 && green[2] < 0.01);
        // Full lightness is white regardless of hue.
        let flash = hsl_to_rgb(0.55, 0.2, 1.0);
        assert!(flash.iter().all(|&c| (c - 1.0).abs() < 1e-6));
        // Zero saturation is pure gray.
        assert_eq!(hsl_to_rgb(0.3, 0.0, 0.4), [0.4, 0.4, 0.4]);
    }
}
