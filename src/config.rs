//! Option-string parsing.
//!
//! The enclosing runtime hands the core one comma-separated option string,
//! read either from a launcher flag or from the environment. Recognized
//! options:
//!
//! | option | effect |
//! |---|---|
//! | `useCRS=auto\|force` | enables the subsystem |
//! | `UnlockExperimentalCRS` | required alongside `useCRS` from the environment |
//! | `log=<level>` | global log verbosity |
//! | `log+vm=<level>` | verbosity scoped to this subsystem |
//! | `arenaSize=<bytes>` | size of the reserved record region |
//!
//! Levels are trace, debug, info, warning, error, off. The core never
//! installs a logger; the parsed [`log::LevelFilter`] values are surfaced
//! for the host to apply.

use log::LevelFilter;
use thiserror::Error;

/// Default reservation when `arenaSize` is absent: 8 MiB.
pub const DEFAULT_ARENA_SIZE: usize = 8 * 1024 * 1024;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("unknown option `{0}`")]
    UnknownOption(String),

    #[error("unknown value `{1}` for option `{0}`")]
    UnknownValue(String, String),

    #[error("option `{0}` requires a value")]
    MissingValue(String),

    #[error("useCRS from the environment requires UnlockExperimentalCRS")]
    Locked,
}

/// How the subsystem was enabled.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Enable {
    /// Not requested; the core stays inert.
    #[default]
    Off,
    /// Enabled once launcher detection succeeds.
    Auto,
    /// Enabled unconditionally.
    Force,
}

/// Where the option string came from. Environment-sourced options need the
/// experimental unlock to take effect.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    Flag,
    Environment,
}

#[derive(Clone, Debug)]
pub struct Options {
    pub enable: Enable,
    pub unlock_experimental: bool,
    pub log_level: LevelFilter,
    pub vm_log_level: Option<LevelFilter>,
    pub arena_size: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            enable: Enable::Off,
            unlock_experimental: false,
            log_level: LevelFilter::Warn,
            vm_log_level: None,
            arena_size: DEFAULT_ARENA_SIZE,
        }
    }
}

impl Options {
    /// Parse a comma-separated option string. Empty segments are ignored.
    pub fn parse(s: &str, origin: Origin) -> Result<Options, ParseError> {
        let mut opts = Options::default();

        for item in s.split(',') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (key, value) = match item.split_once('=') {
                Some((k, v)) => (k, Some(v)),
                None => (item, None),
            };

            match key {
                "useCRS" => {
                    opts.enable = match value {
                        Some("auto") => Enable::Auto,
                        Some("force") => Enable::Force,
                        Some(v) => {
                            return Err(ParseError::UnknownValue(key.into(), v.into()));
                        }
                        // A bare `useCRS` means auto.
                        None => Enable::Auto,
                    };
                }
                "UnlockExperimentalCRS" => opts.unlock_experimental = true,
                "log" => opts.log_level = parse_level(key, value)?,
                "log+vm" => opts.vm_log_level = Some(parse_level(key, value)?),
                "arenaSize" => {
                    let v = value.ok_or_else(|| ParseError::MissingValue(key.into()))?;
                    opts.arena_size = v
                        .parse()
                        .map_err(|_| ParseError::UnknownValue(key.into(), v.into()))?;
                }
                _ => return Err(ParseError::UnknownOption(key.into())),
            }
        }

        if origin == Origin::Environment && opts.enable != Enable::Off && !opts.unlock_experimental
        {
            return Err(ParseError::Locked);
        }

        Ok(opts)
    }

    /// The verbosity for this subsystem: the scoped level when given,
    /// otherwise the global one.
    pub fn effective_level(&self) -> LevelFilter {
        self.vm_log_level.unwrap_or(self.log_level)
    }

    pub fn enabled(&self) -> bool {
        self.enable != Enable::Off
    }
}

fn parse_level(key: &str, value: Option<&str>) -> Result<LevelFilter, ParseError> {
    let v = value.ok_or_else(|| ParseError::MissingValue(key.into()))?;
    match v {
        "trace" => Ok(LevelFilter::Trace),
        "debug" => Ok(LevelFilter::Debug),
        "info" => Ok(LevelFilter::Info),
        "warning" => Ok(LevelFilter::Warn),
        "error" => Ok(LevelFilter::Error),
        "off" => Ok(LevelFilter::Off),
        _ => Err(ParseError::UnknownValue(key.into(), v.into())),
    }
}
