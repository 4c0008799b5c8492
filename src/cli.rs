//! Command-line interface of whisperq, built on clap.
//!
//! Defines [`Cli`] with the [`Command`] subcommands (run, demo, config) and
//! the global flags (--config, --workers, --verbose).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// whisperq: transcribe audio through a bounded pool of workers.
#[derive(Debug, Parser)]
#[command(name = "whisperq", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Configuration file (defaults to ./whisperq.toml when present).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override the number of concurrent workers.
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Enable debug logging.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Files written for every succeeded job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// SubRip subtitles.
    Srt,
    /// Plain text, one segment per line.
    Txt,
    /// The full transcript as JSON.
    Json,
    /// SRT and plain text.
    All,
}

impl OutputFormat {
    pub fn extensions(self) -> &'static [&'static str] {
        match self {
            OutputFormat::Srt => &["srt"],
            OutputFormat::Txt => &["txt"],
            OutputFormat::Json => &["json"],
            OutputFormat::All => &["srt", "txt"],
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Transcribe every supported audio file in a directory.
    Run {
        /// Directory to scan for audio files.
        input_dir: PathBuf,

        /// Where transcripts are written (defaults to the input directory).
        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Language code; auto-detected when omitted.
        #[arg(long)]
        language: Option<String>,

        /// Prompt biasing the decoder towards domain vocabulary.
        #[arg(long)]
        initial_prompt: Option<String>,

        /// Disable voice-activity filtering.
        #[arg(long, default_value_t = false)]
        no_vad: bool,

        #[arg(long, value_enum, default_value_t = OutputFormat::All)]
        format: OutputFormat,
    },

    /// Run the built-in synthetic engine through submit, poll and cancel.
    Demo {
        /// Jobs to submit.
        #[arg(long, default_value_t = 4)]
        jobs: usize,

        /// Simulated engine time per job, in milliseconds.
        #[arg(long, default_value_t = 800)]
        delay_ms: u64,
    },

    /// Print the effective configuration as TOML.
    Config,
}
