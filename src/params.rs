//! Parameter definitions with physical units and documented semantics.
//!
//! All calibration constants live here with:
//! - Physical units (meters, seconds, bins, etc.)
//! - Documented ranges and meanings
//! - `Default` impls carrying the tuned values

use std::ops::Range;

/// Minimum building height at any tick (meters).
///
/// The ambient sine term can pull the base height down; this floor keeps
/// every instance visible above the road surface.
pub const HEIGHT_FLOOR_M: f32 = 0.5;

/// Spectral analysis configuration.
///
/// The band index ranges are empirically tuned for a 256-point FFT at common
/// audio sample rates. They have no principled derivation; re-tune them if
/// `fft_size` or the capture rate changes.
#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// FFT window size in samples (must be a power of 2).
    /// Tuned value: 256
    pub fft_size: usize,

    /// Gain applied to normalized FFT magnitudes before byte scaling.
    ///
    /// Raw bin magnitudes of typical music sit well below full scale after
    /// the 2/N normalization; this lifts them into the useful byte range.
    pub spectrum_gain: f32,

    /// Spectrum bin range averaged for the bass band.
    /// Tuned value: 0..5
    pub bass_bins: Range<usize>,

    /// Spectrum bin range averaged for the mid band.
    /// Tuned value: 20..60
    pub mid_bins: Range<usize>,

    /// Spectrum bin range averaged for the treble band.
    /// Tuned value: 100..150
    pub treble_bins: Range<usize>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            fft_size: 256,
            spectrum_gain: 4.0,
            bass_bins: 0..5,
            mid_bins: 20..60,
            treble_bins: 100..150,
        }
    }
}

impl AnalyzerConfig {
    /// Number of usable magnitude bins (half the FFT size).
    pub fn spectrum_len(&self) -> usize {
        self.fft_size / 2
    }

    /// Validate configuration (FFT size must be a power of 2, ranges sane).
    pub fn validate(&self) -> Result<(), String> {
        if !self.fft_size.is_power_of_two() {
            return Err(format!(
                "FFT size must be power of 2, got {}",
                self.fft_size
            ));
        }
        for (name, range) in [
            ("bass", &self.bass_bins),
            ("mid", &self.mid_bins),
            ("treble", &self.treble_bins),
        ] {
            if range.is_empty() {
                return Err(format!("{} bin range is empty", name));
            }
        }
        Ok(())
    }
}

/// Static city layout parameters.
#[derive(Debug, Clone)]
pub struct SceneLayout {
    /// Building columns across the road (X axis).
    /// Tuned value: 20
    pub grid_size_x: usize,

    /// Building rows into the distance (Z axis).
    /// Tuned value: 60
    pub grid_size_z: usize,

    /// Spacing between grid cells in both axes (meters).
    /// Tuned value: 6.0
    pub spacing_m: f32,

    /// Cells with |base_x| below this form the street clearing (meters).
    /// Tuned value: 3.0
    pub street_half_width_m: f32,

    /// Uniform draw above this threshold spawns an enlarged footprint.
    /// Tuned value: 0.7 (≈30% of cells)
    pub skyscraper_threshold: f32,

    /// Enlarged footprint scale range, sampled uniformly.
    /// Tuned value: [1.5, 3.5)
    pub skyscraper_scale: Range<f32>,

    /// Number of painted road-marking lines.
    /// Tuned value: 40
    pub road_line_count: usize,

    /// Spacing between consecutive road-marking lines (meters).
    /// Tuned value: 10.0
    pub road_line_spacing_m: f32,
}

impl Default for SceneLayout {
    fn default() -> Self {
        Self {
            grid_size_x: 20,
            grid_size_z: 60,
            spacing_m: 6.0,
            street_half_width_m: 3.0,
            skyscraper_threshold: 0.7,
            skyscraper_scale: 1.5..3.5,
            road_line_count: 40,
            road_line_spacing_m: 10.0,
        }
    }
}

impl SceneLayout {
    /// Total building cell count.
    pub fn building_count(&self) -> usize {
        self.grid_size_x * self.grid_size_z
    }
}

/// Forward-travel illusion parameters.
#[derive(Debug, Clone)]
pub struct DriveParams {
    /// Constant forward scroll speed (meters per second).
    /// Tuned value: 8.0
    pub speed_m_per_s: f32,

    /// Building wrap length along Z (meters).
    /// Tuned value: 360.0
    pub depth_m: f32,

    /// Instances scrolled past this Z bound recycle to the far distance (meters).
    /// Tuned value: 20.0
    pub near_clip_bound_m: f32,

    /// Road-marking wrap length along Z (meters).
    /// Tuned value: 400.0
    pub road_depth_m: f32,

    /// Floor grid cell size; the grid offset wraps at this length (meters).
    /// Tuned value: 2.0
    pub grid_unit_m: f32,
}

impl Default for DriveParams {
    fn default() -> Self {
        Self {
            speed_m_per_s: 8.0,
            depth_m: 360.0,
            near_clip_bound_m: 20.0,
            road_depth_m: 400.0,
            grid_unit_m: 2.0,
        }
    }
}

/// Color response parameters (HSL space).
#[derive(Debug, Clone)]
pub struct PaletteParams {
    /// Base "cold" hue for a color seed of 0.
    /// Tuned value: 0.5 (cyan)
    pub cold_hue_base: f32,

    /// Cold hue spread across color seeds.
    /// Tuned value: 0.25
    pub cold_hue_spread: f32,

    /// Hue shift from cold to hot at full excitation.
    /// Tuned value: 0.4
    pub hot_hue_shift: f32,

    /// Extra per-seed spread of the hot hue.
    /// Tuned value: 0.1
    pub hot_hue_spread: f32,

    /// Amplitude of the time-based hue jitter.
    /// Tuned value: 0.05
    pub hue_jitter: f32,

    /// Treble level above which Pulse instances flash near-white.
    /// Tuned value: 0.6
    pub flash_treble_threshold: f32,
}

impl Default for PaletteParams {
    fn default() -> Self {
        Self {
            cold_hue_base: 0.5,
            cold_hue_spread: 0.25,
            hot_hue_shift: 0.4,
            hot_hue_spread: 0.1,
            hue_jitter: 0.05,
            flash_treble_threshold: 0.6,
        }
    }
}

/// Rendering configuration.
#[derive(Debug, Clone)]
pub struct RenderConfig {
    /// Window width (pixels)
    pub window_width: u32,

    /// Window height (pixels)
    pub window_height: u32,

    /// Field of view (degrees). Wide for the sense of speed.
    /// Tuned value: 80
    pub fov_degrees: f32,

    /// Near clipping plane (meters)
    pub near_plane_m: f32,

    /// Far clipping plane (meters)
    pub far_plane_m: f32,

    /// Camera eye position (meters): low and centered on the road.
    pub camera_eye: [f32; 3],

    /// Camera look-at target (meters): slightly up, deep into the scene.
    pub camera_target: [f32; 3],

    /// Exponential fog density (1/meters).
    /// Tuned value: 0.03
    pub fog_density: f32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            window_width: 1280,
            window_height: 720,
            fov_degrees: 80.0,
            near_plane_m: 0.1,
            far_plane_m: 1000.0,
            camera_eye: [0.0, 1.0, 10.0],
            camera_target: [0.0, 4.0, -50.0],
            fog_density: 0.03,
        }
    }
}

impl RenderConfig {
    pub fn aspect_ratio(&self) -> f32 {
        self.window_width as f32 / self.window_height as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_analyzer_config_validates() {
        assert!(AnalyzerConfig::default().validate().is_ok());

        let mut bad = AnalyzerConfig::default();
        bad.fft_size = 300;
        assert!(bad.validate().is_err());

        let mut empty = AnalyzerConfig::default();
        empty.mid_bins = 10..10;
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_spectrum_len_is_half_fft() {
        let config = AnalyzerConfig::default();
        assert_eq!(config.spectrum_len(), 128);
    }

    #[test]
    fn test_layout_counts() {
        let layout = SceneLayout::default();
        assert_eq!(layout.building_count(), 1200);
    }
}
