use clap::Parser;
use std::path::PathBuf;

pub const DEFAULT_RATE: usize = 441;

#[derive(Parser, Debug)]
#[command(name = "waveline", about = "Multi-resolution waveform decimation for audio files")]
pub struct Cli {
    /// Input audio file (WAV, MP3, FLAC, OGG, AAC)
    pub input: PathBuf,

    /// Frames per decimated value; repeat for several resolutions
    #[arg(short, long = "rate")]
    pub rates: Vec<usize>,

    /// Clipping floor in dBFS
    #[arg(long, default_value_t = -50.0, allow_hyphen_values = true)]
    pub floor: f32,

    /// Decimated values per task callback
    #[arg(long, default_value_t = 64)]
    pub chunk_units: usize,

    /// Start of an on-demand range, in seconds
    #[arg(long, requires = "end")]
    pub start: Option<f64>,

    /// End of an on-demand range, in seconds
    #[arg(long, requires = "start")]
    pub end: Option<f64>,

    /// Rate for the on-demand range (defaults to the finest --rate)
    #[arg(long)]
    pub range_rate: Option<usize>,

    /// Write the decimated arrays here as JSON instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Neither read nor write the waveform cache
    #[arg(long)]
    pub no_cache: bool,

    /// Waveform cache directory
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Config file (default: waveline.toml or the user config dir)
    #[arg(long)]
    pub config: Option<PathBuf>,
}
