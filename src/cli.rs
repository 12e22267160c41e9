//! Command-line argument parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::audio::AudioSource;

/// Command line arguments
#[derive(Parser, Debug)]
#[command(name = "Neondrive")]
#[command(about = "Audio-reactive procedural neon city", long_about = None)]
pub struct Args {
    /// Audio file to visualize (decoded and played back)
    pub audio_file: Option<PathBuf>,

    /// Capture the default microphone instead of playing a file
    #[arg(long, conflicts_with = "audio_file")]
    pub mic: bool,

    /// Scene layout seed; omit for a fresh random layout each run
    #[arg(long, value_name = "SEED")]
    pub seed: Option<u64>,

    /// FFT window size (power of two)
    #[arg(long, value_name = "SIZE", default_value_t = 256)]
    pub fft_size: usize,
}

impl Args {
    /// The audio source selected on the command line, if any.
    ///
    /// Starting with no source is valid: the city idles on ambient motion
    /// until one is attached.
    pub fn audio_source(&self) -> Option<AudioSource> {
        if self.mic {
            Some(AudioSource::Microphone)
        } else {
            self.audio_file.clone().map(AudioSource::File)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_source() {
        let args = Args::try_parse_from(["neondrive", "track.mp3"]).unwrap();
        assert!(matches!(args.audio_source(), Some(AudioSource::File(_))));
        assert_eq!(args.fft_size, 256);
    }

    #[test]
    fn test_parse_microphone_source() {
        let args = Args::try_parse_from(["neondrive", "--mic", "--seed", "7"]).unwrap();
        assert!(matches!(args.audio_source(), Some(AudioSource::Microphone)));
        assert_eq!(args.seed, Some(7));
    }

    #[test]
    fn test_no_source_is_valid() {
        let args = Args::try_parse_from(["neondrive"]).unwrap();
        assert!(args.audio_source().is_none());
    }

    #[test]
    fn test_mic_conflicts_with_file() {
        assert!(Args::try_parse_from(["neondrive", "track.mp3", "--mic"]).is_err());
    }
}
