//! Configuration management for sl1-to-photon
//!
//! This module handles CLI argument parsing and application settings.

use crate::error::{ConvertError, Result};
use crate::layers::default_workers;
use crate::photon;
use crate::profile::{MotionOverrides, DEFAULT_LIFT_SPEED, DEFAULT_RETRACT_SPEED};
use anyhow::anyhow;
use clap::builder::styling;
use clap::{value_parser, Arg, ArgMatches, ColorChoice, Command};
use std::ffi::OsString;
use std::path::PathBuf;
use tracing::info;

/// Two-letter short options kept for compatibility, with their long forms
const LEGACY_FLAGS: [(&str, &str); 2] = [("-ls", "--liftspeed"), ("-rs", "--retractspeed")];

/// Build the CLI command
pub fn build_cli() -> Command {
    let styles = styling::Styles::styled()
        .header(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .usage(styling::AnsiColor::Green.on_default() | styling::Effects::BOLD)
        .literal(styling::AnsiColor::Blue.on_default() | styling::Effects::BOLD)
        .placeholder(styling::AnsiColor::Cyan.on_default());

    Command::new("sl1-to-photon")
        .about("Convert an SL1 file to a Photon file")
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("sl1_file")
                .help("SL1 file to convert")
                .value_parser(value_parser!(PathBuf))
                .required(true),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .help("Photon file output path")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("force")
                .short('f')
                .long("force")
                .help("Overwrite existing files")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Print parameters and conversion progress")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("liftspeed")
                .long("liftspeed")
                .help("Lifting speed (-ls)")
                .value_parser(value_parser!(u32))
                .default_value("65"),
        )
        .arg(
            Arg::new("retractspeed")
                .long("retractspeed")
                .help("Retract speed (-rs)")
                .value_parser(value_parser!(u32))
                .default_value("150"),
        )
        .arg(
            Arg::new("threads")
                .short('j')
                .long("threads")
                .help("Number of layer conversion workers (default: all cores)")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("no_progress")
                .long("no-progress")
                .help("Disable progress indicators")
                .action(clap::ArgAction::SetTrue),
        )
}

/// Rewrite `-ls`/`-rs` (and their `=value` forms) to the long options clap understands
pub fn normalize_legacy_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(Into::into)
        .map(|arg| {
            let Some(text) = arg.to_str() else {
                return arg;
            };
            for (short, long) in LEGACY_FLAGS {
                if text == short {
                    return OsString::from(long);
                }
                if let Some(value) = text.strip_prefix(short).and_then(|r| r.strip_prefix('=')) {
                    return OsString::from(format!("{}={}", long, value));
                }
            }
            arg
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct Config {
    /// SL1 archive to convert
    pub input: PathBuf,

    /// Photon file to write
    pub output: PathBuf,

    /// Overwrite an existing output file
    pub force: bool,

    /// Enable verbose logging
    pub verbose: bool,

    pub lift_speed: u32,

    pub retract_speed: u32,

    /// Layer conversion workers
    pub threads: usize,

    /// Disable progress bars
    pub no_progress: bool,
}

impl Config {
    /// Parse process arguments and initialize logging.
    ///
    /// Exits with usage information on invalid arguments, like any clap CLI.
    pub fn from_args() -> Result<Self> {
        let matches = build_cli().get_matches_from(normalize_legacy_args(std::env::args_os()));
        let config = Self::from_matches(&matches)?;

        init_logging(config.verbose);

        if config.verbose {
            info!("Configuration: {:?}", config);
        }

        Ok(config)
    }

    /// Parse an explicit argument list, program name first
    pub fn parse_from<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        let matches = build_cli().try_get_matches_from(normalize_legacy_args(args))?;
        Self::from_matches(&matches)
    }

    fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let input = matches
            .get_one::<PathBuf>("sl1_file")
            .cloned()
            .ok_or_else(|| anyhow!("Input SL1 file is required"))?;

        let output = matches
            .get_one::<PathBuf>("output")
            .cloned()
            .unwrap_or_else(|| default_output_path(&input));

        let lift_speed = matches
            .get_one::<u32>("liftspeed")
            .copied()
            .unwrap_or(DEFAULT_LIFT_SPEED);
        let retract_speed = matches
            .get_one::<u32>("retractspeed")
            .copied()
            .unwrap_or(DEFAULT_RETRACT_SPEED);

        let threads = matches
            .get_one::<usize>("threads")
            .copied()
            .filter(|&n| n > 0)
            .unwrap_or_else(default_workers);

        Ok(Config {
            input,
            output,
            force: matches.get_flag("force"),
            verbose: matches.get_flag("verbose"),
            lift_speed,
            retract_speed,
            threads,
            no_progress: matches.get_flag("no_progress"),
        })
    }

    /// Motion settings handed to the profile mapper
    pub fn motion_overrides(&self) -> MotionOverrides {
        MotionOverrides {
            lift_speed: self.lift_speed,
            retract_speed: self.retract_speed,
        }
    }

    /// Whether progress bars should be drawn
    pub fn show_progress(&self) -> bool {
        self.verbose && !self.no_progress
    }

    /// Check the output path is free and the input exists.
    ///
    /// Runs before any conversion work so a collision never costs a
    /// conversion.
    pub fn validate(&self) -> Result<()> {
        if self.output.exists() && !self.force {
            return Err(ConvertError::OutputCollision {
                path: self.output.clone(),
            }
            .into());
        }

        if !self.input.is_file() {
            return Err(ConvertError::Archive {
                reason: format!("input file does not exist: {}", self.input.display()),
            }
            .into());
        }

        info!("Configuration validation completed successfully");
        Ok(())
    }
}

/// Input path with its extension replaced by `.photon`
pub fn default_output_path(input: &std::path::Path) -> PathBuf {
    input.with_extension(photon::EXTENSION)
}

/// Set up tracing on stdout. `RUST_LOG` takes precedence over the verbose flag.
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "info" } else { "warn" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stdout)
        .with_target(false)
        .init();
}
