//! Audio source lifecycle and FFT analysis.
//!
//! The manager owns exactly one live input (decoded file or microphone) and
//! the sample tap it feeds; the analyzer polls the tap once per frame and
//! derives the band energies that drive the city.

use std::collections::VecDeque;
use std::f32::consts::PI;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::params::AnalyzerConfig;

/// Audio subsystem errors. `PermissionDenied` and `Decode` are recovered
/// locally by the caller; the animation keeps running on zero energy.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("microphone access denied or unavailable")]
    PermissionDenied,

    #[error("failed to decode audio file: {0}")]
    Decode(String),

    #[error("audio stream is suspended and could not be resumed")]
    ContextSuspended,

    #[error("audio device error: {0}")]
    Device(String),
}

/// A selectable audio input.
#[derive(Debug, Clone)]
pub enum AudioSource {
    File(PathBuf),
    Microphone,
}

impl AudioSource {
    fn describe(&self) -> String {
        match self {
            AudioSource::File(path) => path.display().to_string(),
            AudioSource::Microphone => "microphone".to_string(),
        }
    }
}

/// Ring buffer bridging the OS audio callback and the per-frame analyzer.
///
/// The callback pushes, the analyzer copies the newest window out. Neither
/// side ever blocks on the other for longer than the lock hold.
pub struct SampleTap {
    ring: Mutex<VecDeque<f32>>,
    capacity: usize,
}

impl SampleTap {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append samples, discarding the oldest past capacity.
    pub fn push(&self, samples: &[f32]) {
        let mut ring = self.ring.lock().unwrap();
        for &s in samples {
            if ring.len() == self.capacity {
                ring.pop_front();
            }
            ring.push_back(s);
        }
    }

    /// Copy the newest `out.len()` samples into `out`.
    ///
    /// Returns false (leaving `out` untouched) if fewer samples are buffered.
    pub fn latest(&self, out: &mut [f32]) -> bool {
        let ring = self.ring.lock().unwrap();
        if ring.len() < out.len() {
            return false;
        }
        let start = ring.len() - out.len();
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = ring[start + i];
        }
        true
    }

    pub fn clear(&self) {
        self.ring.lock().unwrap().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ring.lock().unwrap().len()
    }
}

/// One attached source: the cpal stream and the tap it feeds.
struct LiveSource {
    // Dropping the stream stops the OS callback.
    stream: cpal::Stream,
    tap: Arc<SampleTap>,
    descriptor: String,
    playing: bool,
}

/// Owns at most one live audio input and its analysis tap.
///
/// Streams are built paused; the first user play gesture calls
/// [`AudioSourceManager::resume_if_suspended`], mirroring host audio policy
/// that requires a gesture before sound is produced.
pub struct AudioSourceManager {
    live: Option<LiveSource>,
    tap_capacity: usize,
}

impl AudioSourceManager {
    pub fn new(config: &AnalyzerConfig) -> Self {
        Self {
            live: None,
            // A few windows of slack so the analyzer never starves between
            // callback bursts.
            tap_capacity: config.fft_size * 4,
        }
    }

    /// Attach a new source, releasing the previous one.
    ///
    /// The replacement is fully constructed before the old source is dropped:
    /// if construction fails the previous source keeps playing, and at no
    /// instant are two streams live (the new stream starts paused and only
    /// plays after `resume_if_suspended`).
    pub fn start(&mut self, source: AudioSource) -> Result<(), AudioError> {
        let was_playing = self.live.as_ref().map(|l| l.playing).unwrap_or(false);

        let next = match &source {
            AudioSource::File(path) => Self::open_file(path, self.tap_capacity)?,
            AudioSource::Microphone => Self::open_microphone(self.tap_capacity)?,
        };

        self.stop();
        info!(source = %next.descriptor, "audio source attached");
        self.live = Some(next);

        // A source swap mid-playback keeps playing; an initial start waits
        // for the user gesture.
        if was_playing {
            self.resume_if_suspended()?;
        }
        Ok(())
    }

    /// Release the live source. Idempotent: a second call changes nothing.
    pub fn stop(&mut self) {
        if let Some(live) = self.live.take() {
            drop(live.stream);
            live.tap.clear();
            debug!(source = %live.descriptor, "audio source released");
        }
    }

    /// Start (or restart) playback after a user gesture.
    pub fn resume_if_suspended(&mut self) -> Result<(), AudioError> {
        if let Some(live) = &mut self.live {
            if !live.playing {
                live.stream.play().map_err(|e| {
                    warn!(error = %e, "stream resume failed");
                    AudioError::ContextSuspended
                })?;
                live.playing = true;
                debug!(source = %live.descriptor, "stream playing");
            }
        }
        Ok(())
    }

    /// Pause the live stream, if any. Best-effort: some backends cannot
    /// pause, in which case the stream keeps running.
    pub fn pause(&mut self) {
        if let Some(live) = &mut self.live {
            if live.playing {
                if let Err(e) = live.stream.pause() {
                    warn!(error = %e, "stream pause not supported");
                    return;
                }
                live.playing = false;
            }
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.is_some()
    }

    pub fn is_playing(&self) -> bool {
        self.live.as_ref().map(|l| l.playing).unwrap_or(false)
    }

    /// The analysis tap of the live source.
    pub fn tap(&self) -> Option<Arc<SampleTap>> {
        self.live.as_ref().map(|l| Arc::clone(&l.tap))
    }

    /// Decode the whole file to mono and play it through the default output
    /// device, tapping every played sample for analysis.
    fn open_file(path: &Path, tap_capacity: usize) -> Result<LiveSource, AudioError> {
        let decoded = decode_file(path)?;
        let tap = Arc::new(SampleTap::new(tap_capacity));
        let tap_cb = Arc::clone(&tap);

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| AudioError::Device("no audio output device found".into()))?;

        // Run the device at the decoded rate when it supports it; otherwise
        // resample the track to the device's default rate so pitch and the
        // calibrated band bins stay correct.
        let (config, samples) = match output_config_at_rate(&device, decoded.sample_rate) {
            Some(config) => (config, decoded.samples),
            None => {
                let config = device
                    .default_output_config()
                    .map_err(|e| AudioError::Device(format!("output config: {e}")))?;
                let samples = resample_linear(
                    &decoded.samples,
                    decoded.sample_rate,
                    config.sample_rate().0,
                );
                (config, samples)
            }
        };

        info!(
            device = %device.name().unwrap_or_else(|_| "unknown".into()),
            rate = config.sample_rate().0,
            track_rate = decoded.sample_rate,
            "audio output"
        );

        let channels = config.channels() as usize;
        let mut cursor = 0usize;

        let stream = device
            .build_output_stream(
                &config.into(),
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for frame in data.chunks_mut(channels) {
                        // Past the end of the track, output silence; the tap
                        // then reads as zero energy and the scene idles.
                        let s = samples.get(cursor).copied().unwrap_or(0.0);
                        cursor = cursor.saturating_add(1);
                        for slot in frame.iter_mut() {
                            *slot = s;
                        }
                        tap_cb.push(&[s]);
                    }
                },
                |err| warn!(error = %err, "output stream error"),
                None,
            )
            .map_err(|e| AudioError::Device(format!("output stream: {e}")))?;

        // Some backends start a stream running as soon as it is built; park
        // it until the play gesture.
        if let Err(e) = stream.pause() {
            warn!(error = %e, "new output stream could not be paused");
        }

        Ok(LiveSource {
            stream,
            tap,
            descriptor: path.display().to_string(),
            playing: false,
        })
    }

    /// Capture the default input device. The captured signal goes to the
    /// analysis tap only and is never routed to an output device, so a live
    /// microphone cannot feed back.
    fn open_microphone(tap_capacity: usize) -> Result<LiveSource, AudioError> {
        let tap = Arc::new(SampleTap::new(tap_capacity));
        let tap_cb = Arc::clone(&tap);

        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or(AudioError::PermissionDenied)?;
        let config = device.default_input_config().map_err(|e| {
            warn!(error = %e, "input config rejected");
            AudioError::PermissionDenied
        })?;

        info!(
            device = %device.name().unwrap_or_else(|_| "unknown".into()),
            rate = config.sample_rate().0,
            "microphone input"
        );

        let channels = config.channels() as usize;
        let stream = device
            .build_input_stream(
                &config.into(),
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for frame in data.chunks(channels) {
                        let mono = frame.iter().sum::<f32>() / channels as f32;
                        tap_cb.push(&[mono]);
                    }
                },
                |err| warn!(error = %err, "input stream error"),
                None,
            )
            .map_err(|e| {
                // OS-level capture denial surfaces as a build failure.
                warn!(error = %e, "input stream rejected");
                AudioError::PermissionDenied
            })?;

        // Same backend caveat as the output path.
        if let Err(e) = stream.pause() {
            warn!(error = %e, "new input stream could not be paused");
        }

        Ok(LiveSource {
            stream,
            tap,
            descriptor: AudioSource::Microphone.describe(),
            playing: false,
        })
    }
}

/// Decoded audio payload: mono samples plus the file's native rate.
struct DecodedTrack {
    samples: Vec<f32>,
    sample_rate: u32,
}

/// A supported f32 output config running exactly at `rate`, if the device
/// offers one.
fn output_config_at_rate(
    device: &cpal::Device,
    rate: u32,
) -> Option<cpal::SupportedStreamConfig> {
    device
        .supported_output_configs()
        .ok()?
        .filter(|range| range.sample_format() == cpal::SampleFormat::F32)
        .find_map(|range| range.try_with_sample_rate(cpal::SampleRate(rate)))
}

/// Linear-interpolation resample for when the output device cannot run at
/// the decoded rate.
fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (samples.len() as f64 / ratio).round() as usize;
    let last = samples.len() - 1;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let pos = i as f64 * ratio;
        let idx = (pos as usize).min(last);
        let frac = (pos - idx as f64) as f32;
        let a = samples[idx];
        let b = samples[(idx + 1).min(last)];
        out.push(a + (b - a) * frac);
    }
    out
}

/// Decode an audio file to mono f32 via symphonia.
fn decode_file(path: &Path) -> Result<DecodedTrack, AudioError> {
    let file = File::open(path).map_err(|e| AudioError::Decode(e.to_string()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension() {
        hint.with_extension(&ext.to_string_lossy());
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| AudioError::Decode(e.to_string()))?;

    let mut format = probed.format;
    let track = format
        .default_track()
        .ok_or_else(|| AudioError::Decode("no audio track found".into()))?;
    let channels = track.codec_params.channels.map(|c| c.count()).unwrap_or(2);
    let sample_rate = track
        .codec_params
        .sample_rate
        .ok_or_else(|| AudioError::Decode("sample rate unknown".into()))?;
    let track_id = track.id;

    let mut decoder = symphonia::default::get_codecs()
        .make(&track.codec_params, &DecoderOptions::default())
        .map_err(|e| AudioError::Decode(e.to_string()))?;

    let mut samples: Vec<f32> = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(_) => break, // End of stream
        };
        if packet.track_id() != track_id {
            continue;
        }
        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(_) => continue, // Skip corrupt packets
        };

        let mut buf = SampleBuffer::<f32>::new(decoded.frames() as u64, *decoded.spec());
        buf.copy_interleaved_ref(decoded);
        for frame in buf.samples().chunks(channels) {
            samples.push(frame.iter().sum::<f32>() / channels as f32);
        }
    }

    if samples.is_empty() {
        return Err(AudioError::Decode("file contained no audio samples".into()));
    }
    Ok(DecodedTrack {
        samples,
        sample_rate,
    })
}

/// Ephemeral per-tick snapshot: byte-scaled waveform and magnitude spectrum.
#[derive(Clone, Debug)]
pub struct AnalysisFrame {
    /// Time-domain amplitudes, `fft_size` entries in [0,255].
    pub waveform: Vec<u8>,
    /// Magnitude bins, `fft_size / 2` entries in [0,255].
    pub spectrum: Vec<u8>,
}

impl AnalysisFrame {
    /// The frame produced when no source is connected.
    pub fn zeroed(config: &AnalyzerConfig) -> Self {
        Self {
            waveform: vec![0; config.fft_size],
            spectrum: vec![0; config.spectrum_len()],
        }
    }
}

/// Normalized band energies, each in [0,1].
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct BandEnergy {
    pub bass: f32,
    pub mid: f32,
    pub treble: f32,
}

/// Windowed FFT over the newest sample window, producing byte-scaled
/// waveform and spectrum snapshots.
pub struct SpectralAnalyzer {
    config: AnalyzerConfig,
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    time_buf: Vec<f32>,
    fft_buf: Vec<Complex<f32>>,
}

impl SpectralAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Result<Self, String> {
        config.validate()?;
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(config.fft_size);
        let window = (0..config.fft_size)
            .map(|i| hann_window(i, config.fft_size))
            .collect();
        Ok(Self {
            fft,
            window,
            time_buf: vec![0.0; config.fft_size],
            fft_buf: vec![Complex::new(0.0, 0.0); config.fft_size],
            config,
        })
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Non-blocking snapshot of the current buffers.
    ///
    /// With no connected source, or before a full window has accumulated,
    /// returns all-zero buffers; this is never an error.
    pub fn sample(&mut self, tap: Option<&SampleTap>) -> AnalysisFrame {
        let Some(tap) = tap else {
            return AnalysisFrame::zeroed(&self.config);
        };
        if !tap.latest(&mut self.time_buf) {
            return AnalysisFrame::zeroed(&self.config);
        }

        let waveform = self
            .time_buf
            .iter()
            .map(|&s| ((s.clamp(-1.0, 1.0) * 0.5 + 0.5) * 255.0) as u8)
            .collect();

        for (i, &s) in self.time_buf.iter().enumerate() {
            self.fft_buf[i] = Complex::new(s * self.window[i], 0.0);
        }
        self.fft.process(&mut self.fft_buf);

        let n = self.config.fft_size as f32;
        let spectrum = self.fft_buf[..self.config.spectrum_len()]
            .iter()
            .map(|c| {
                let mag = c.norm() * 2.0 / n * self.config.spectrum_gain;
                (mag * 255.0).min(255.0) as u8
            })
            .collect();

        AnalysisFrame { waveform, spectrum }
    }

    /// Average the fixed calibration ranges of the spectrum into [0,1]
    /// band energies. Ranges are clamped to the actual bin count.
    pub fn derive_band_energy(&self, frame: &AnalysisFrame) -> BandEnergy {
        BandEnergy {
            bass: band_mean(&frame.spectrum, &self.config.bass_bins),
            mid: band_mean(&frame.spectrum, &self.config.mid_bins),
            treble: band_mean(&frame.spectrum, &self.config.treble_bins),
        }
    }
}

fn band_mean(spectrum: &[u8], range: &std::ops::Range<usize>) -> f32 {
    let start = range.start.min(spectrum.len());
    let end = range.end.min(spectrum.len());
    if start >= end {
        return 0.0;
    }
    let sum: u32 = spectrum[start..end].iter().map(|&b| b as u32).sum();
    (sum as f32 / (end - start) as f32 / 255.0).clamp(0.0, 1.0)
}

/// Hann window function for FFT analysis
fn hann_window(index: usize, size: usize) -> f32 {
    0.5 * (1.0 - ((2.0 * PI * index as f32) / (size as f32 - 1.0)).cos())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyzer() -> SpectralAnalyzer {
        SpectralAnalyzer::new(AnalyzerConfig::default()).unwrap()
    }

    fn frame_with_spectrum(spectrum: Vec<u8>) -> AnalysisFrame {
        AnalysisFrame {
            waveform: vec![0; 256],
            spectrum,
        }
    }

    #[test]
    fn test_band_energy_all_bins_full() {
        let analyzer = analyzer();
        let frame = frame_with_spectrum(vec![255; 128]);
        let bands = analyzer.derive_band_energy(&frame);
        assert_eq!(bands.bass, 1.0);
        assert_eq!(bands.mid, 1.0);
        assert_eq!(bands.treble, 1.0);
    }

    #[test]
    fn test_band_energy_bass_only() {
        let analyzer = analyzer();
        let mut spectrum = vec![0u8; 128];
        for bin in spectrum.iter_mut().take(5) {
            *bin = 255;
        }
        let bands = analyzer.derive_band_energy(&frame_with_spectrum(spectrum));
        assert_eq!(bands.bass, 1.0);
        assert_eq!(bands.mid, 0.0);
        assert_eq!(bands.treble, 0.0);
    }

    #[test]
    fn test_band_energy_zero_spectrum() {
        let analyzer = analyzer();
        let bands = analyzer.derive_band_energy(&frame_with_spectrum(vec![0; 128]));
        assert_eq!(bands, BandEnergy::default());
    }

    #[test]
    fn test_band_range_clamped_to_spectrum_len() {
        // The treble range (100..150) extends past the 128 bins of a
        // 256-point analysis; the mean is taken over the bins that exist.
        let analyzer = analyzer();
        let mut spectrum = vec![0u8; 128];
        for bin in spectrum.iter_mut().skip(100) {
            *bin = 255;
        }
        let bands = analyzer.derive_band_energy(&frame_with_spectrum(spectrum));
        assert_eq!(bands.treble, 1.0);
    }

    #[test]
    fn test_sample_without_source_is_zero() {
        let mut analyzer = analyzer();
        let frame = analyzer.sample(None);
        assert!(frame.waveform.iter().all(|&b| b == 0));
        assert!(frame.spectrum.iter().all(|&b| b == 0));
        assert_eq!(frame.spectrum.len(), 128);
    }

    #[test]
    fn test_sample_with_short_buffer_is_zero() {
        let mut analyzer = analyzer();
        let tap = SampleTap::new(1024);
        tap.push(&[0.5; 100]); // Less than one window
        let frame = analyzer.sample(Some(&tap));
        assert!(frame.spectrum.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_sample_pure_tone_peaks_at_bin() {
        let mut analyzer = analyzer();
        let tap = SampleTap::new(1024);
        let tone: Vec<f32> = (0..256)
            .map(|n| (2.0 * PI * 8.0 * n as f32 / 256.0).sin())
            .collect();
        tap.push(&tone);

        let frame = analyzer.sample(Some(&tap));
        assert!(frame.spectrum[8] > 64);
        assert!(frame.spectrum[8] > frame.spectrum[40]);
        assert!(frame.spectrum[8] > frame.spectrum[64]);
    }

    #[test]
    fn test_tap_keeps_newest_samples() {
        let tap = SampleTap::new(4);
        tap.push(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(tap.len(), 4);
        let mut out = [0.0; 4];
        assert!(tap.latest(&mut out));
        assert_eq!(out, [3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut manager = AudioSourceManager::new(&AnalyzerConfig::default());
        manager.stop();
        manager.stop();
        assert!(!manager.is_live());
        assert!(manager.tap().is_none());
    }

    #[test]
    fn test_start_bad_file_is_decode_error() {
        let mut manager = AudioSourceManager::new(&AnalyzerConfig::default());
        let result = manager.start(AudioSource::File(PathBuf::from(
            "/nonexistent/track.mp3",
        )));
        assert!(matches!(result, Err(AudioError::Decode(_))));
        // The failed switch leaves the manager exactly as it was.
        assert!(!manager.is_live());
    }

    #[test]
    fn test_resample_same_rate_is_identity() {
        let samples = vec![0.1, -0.2, 0.3];
        assert_eq!(resample_linear(&samples, 44100, 44100), samples);
    }

    #[test]
    fn test_resample_ramp_to_device_rate() {
        // A 44.1 kHz linear ramp resampled to 48 kHz keeps its shape and
        // gains length by the rate ratio.
        let samples: Vec<f32> = (0..441).map(|n| n as f32 / 441.0).collect();
        let out = resample_linear(&samples, 44100, 48000);
        assert_eq!(out.len(), 480);
        for (i, &s) in out.iter().enumerate() {
            let expected = i as f32 / 480.0;
            assert!((s - expected).abs() < 1e-3, "sample {i}: {s} vs {expected}");
        }
    }

    #[test]
    fn test_resample_downsample_preserves_constant() {
        let out = resample_linear(&[0.5; 480], 48000, 44100);
        assert_eq!(out.len(), 441);
        assert!(out.iter().all(|&s| (s - 0.5).abs() < 1e-6));
    }

    #[test]
    fn test_hann_window() {
        let size = 256;
        assert!((hann_window(0, size) - 0.0).abs() < 0.01);
        assert!((hann_window(size - 1, size) - 0.0).abs() < 0.01);
        assert!((hann_window(size / 2, size) - 1.0).abs() < 0.01);
    }
}
