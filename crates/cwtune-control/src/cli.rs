//! Command-line arguments.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// How much diagnostic output to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
}

impl Verbosity {
    /// Log filter used when `RUST_LOG` is unset.
    pub fn directive(self) -> &'static str {
        match self {
            Self::Quiet => "cwtune=error",
            Self::Normal => "cwtune=info",
            Self::Verbose => "cwtune=debug",
        }
    }
}

/// Arguments of an experiment run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    pub config: PathBuf,
    pub nodes: PathBuf,
    pub measurements: PathBuf,
    pub logfile: Option<PathBuf>,
    pub verbosity: Verbosity,
}

/// What the command line asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Run(Args),
    Help,
    Version,
}

pub fn usage() -> String {
    "\
cwtune - contention window tuning and CSMA/TDMA switching

Usage:
  cwtune --config <path> --nodes <path> --measurements <path> [options]

Required:
  --config <path>         Controller configuration (YAML)
  --nodes <path>          Node agent roster (YAML)
  --measurements <path>   Measurement subscription (YAML)

Options:
  --logfile <path>        Write diagnostics to a file instead of stderr
  -q, --quiet             Only log errors
  -v, --verbose           Log debug output
  -h, --help              Print this help
  --version               Print the version

Environment:
  RUST_LOG                Overrides the log filter
"
    .to_string()
}

/// Parse arguments, excluding the program name.
pub fn parse<I>(args: I) -> Result<Command>
where
    I: IntoIterator<Item = String>,
{
    let mut config = None;
    let mut nodes = None;
    let mut measurements = None;
    let mut logfile = None;
    let mut quiet = false;
    let mut verbose = false;

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => {
                (flag.to_string(), Some(value.to_string()))
            }
            _ => (arg.clone(), None),
        };

        let mut value = |name: &str| -> Result<PathBuf> {
            match inline.clone().or_else(|| args.next()) {
                Some(v) if !v.is_empty() => Ok(PathBuf::from(v)),
                _ => Err(Error::Usage(format!("{} requires a path", name))),
            }
        };

        match flag.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "--version" => return Ok(Command::Version),
            "--config" => config = Some(value("--config")?),
            "--nodes" => nodes = Some(value("--nodes")?),
            "--measurements" => measurements = Some(value("--measurements")?),
            "--logfile" => logfile = Some(value("--logfile")?),
            "-q" | "--quiet" => quiet = true,
            "-v" | "--verbose" => verbose = true,
            other => return Err(Error::Usage(format!("unexpected argument '{}'", other))),
        }
    }

    let verbosity = match (quiet, verbose) {
        (true, true) => {
            return Err(Error::Usage(
                "--quiet and --verbose cannot be used together".into(),
            ))
        }
        (true, false) => Verbosity::Quiet,
        (false, true) => Verbosity::Verbose,
        (false, false) => Verbosity::Normal,
    };

    let required = |opt: Option<PathBuf>, name: &str| {
        opt.ok_or_else(|| Error::Usage(format!("missing required option {} <path>", name)))
    };

    Ok(Command::Run(Args {
        config: required(config, "--config")?,
        nodes: required(nodes, "--nodes")?,
        measurements: required(measurements, "--measurements")?,
        logfile,
        verbosity,
    }))
}
