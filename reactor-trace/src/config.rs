//! Run configuration
//!
//! Layers, lowest precedence first:
//! 1. built-in defaults
//! 2. TOML file (`--config`, `REACTOR_TRACE_CONFIG`, or `reactor-trace.toml`
//!    found in the current directory or an ancestor)
//! 3. `REACTOR_TRACE_*` environment variables (a `.env` file is loaded first)
//! 4. command-line flags

use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "reactor-trace.toml";
pub const ENV_CONFIG: &str = "REACTOR_TRACE_CONFIG";
pub const ENV_SCHEMA: &str = "REACTOR_TRACE_SCHEMA";
pub const ENV_TRACE: &str = "REACTOR_TRACE_TRACE";
pub const ENV_OUTPUT: &str = "REACTOR_TRACE_OUTPUT";
pub const ENV_INCLUDE: &str = "REACTOR_TRACE_INCLUDE";
pub const ENV_EXCLUDE: &str = "REACTOR_TRACE_EXCLUDE";
pub const ENV_EMIT_UNMATCHED_STARTS: &str = "REACTOR_TRACE_EMIT_UNMATCHED_STARTS";
pub const ENV_CAUSAL_EDGES: &str = "REACTOR_TRACE_CAUSAL_EDGES";
pub const ENV_ORDERING_EDGES: &str = "REACTOR_TRACE_ORDERING_EDGES";
pub const ENV_LOG_FORMAT: &str = "REACTOR_TRACE_LOG_FORMAT";
pub const ENV_PRETTY: &str = "REACTOR_TRACE_PRETTY";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(anyhow::anyhow!(
                "Invalid log format '{other}'. Expected 'text' or 'json'"
            )),
        }
    }
}

/// Command-line flags
#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "reactor-trace",
    version,
    about = "Reconstruct reactor execution timelines and dependency edges from a runtime trace"
)]
pub struct Cli {
    /// TOML configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,
    /// Reactor schema (YAML)
    #[arg(short, long, value_name = "PATH")]
    pub schema: Option<PathBuf>,
    /// Trace file (JSON lines)
    #[arg(short, long, value_name = "PATH")]
    pub trace: Option<PathBuf>,
    /// Report destination; stdout when omitted
    #[arg(short, long, value_name = "PATH")]
    pub output: Option<PathBuf>,
    /// Keep only identifiers matching this regex
    #[arg(long, value_name = "REGEX")]
    pub include: Option<String>,
    /// Drop identifiers matching this regex
    #[arg(long, value_name = "REGEX")]
    pub exclude: Option<String>,
    /// Emit executions still open at end of trace as zero-width rows
    #[arg(long)]
    pub emit_unmatched_starts: bool,
    #[arg(long)]
    pub no_causal_edges: bool,
    #[arg(long)]
    pub no_ordering_edges: bool,
    #[arg(long, value_enum)]
    pub log_format: Option<LogFormat>,
    /// Pretty-print the JSON report
    #[arg(long)]
    pub pretty: bool,
}

/// Optional settings read from the TOML file
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub schema: Option<PathBuf>,
    pub trace: Option<PathBuf>,
    pub output: Option<PathBuf>,
    pub include: Option<String>,
    pub exclude: Option<String>,
    pub emit_unmatched_starts: Option<bool>,
    pub causal_edges: Option<bool>,
    pub ordering_edges: Option<bool>,
    pub log_format: Option<LogFormat>,
    pub pretty: Option<bool>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub schema: PathBuf,
    pub trace: PathBuf,
    /// `None` writes the report to stdout
    pub output: Option<PathBuf>,
    pub include: Option<String>,
    pub exclude: Option<String>,
    pub emit_unmatched_starts: bool,
    pub causal_edges: bool,
    pub ordering_edges: bool,
    pub log_format: LogFormat,
    pub pretty: bool,
    /// Config file that contributed, if any
    pub config_file: Option<PathBuf>,
}

impl Config {
    /// Resolves every layer against the process environment.
    pub fn resolve(cli: &Cli) -> anyhow::Result<Self> {
        Self::resolve_with(cli, |key| std::env::var(key).ok())
    }

    pub fn resolve_with(
        cli: &Cli,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let config_file = cli
            .config
            .clone()
            .or_else(|| env_path(&lookup, ENV_CONFIG))
            .or_else(|| find_default_config_path(DEFAULT_CONFIG_FILE));
        let file = match &config_file {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        Self::from_layers(cli, file, config_file, &lookup)
    }

    fn from_layers(
        cli: &Cli,
        file: FileConfig,
        config_file: Option<PathBuf>,
        lookup: &impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let schema = cli
            .schema
            .clone()
            .or_else(|| env_path(lookup, ENV_SCHEMA))
            .or(file.schema)
            .ok_or_else(|| {
                anyhow::anyhow!("No schema path; pass --schema or set {ENV_SCHEMA}")
            })?;
        let trace = cli
            .trace
            .clone()
            .or_else(|| env_path(lookup, ENV_TRACE))
            .or(file.trace)
            .ok_or_else(|| anyhow::anyhow!("No trace path; pass --trace or set {ENV_TRACE}"))?;

        let emit_unmatched_starts = cli.emit_unmatched_starts
            || env_parse(lookup, ENV_EMIT_UNMATCHED_STARTS)?
                .or(file.emit_unmatched_starts)
                .unwrap_or(false);
        let causal_edges = !cli.no_causal_edges
            && env_parse(lookup, ENV_CAUSAL_EDGES)?
                .or(file.causal_edges)
                .unwrap_or(true);
        let ordering_edges = !cli.no_ordering_edges
            && env_parse(lookup, ENV_ORDERING_EDGES)?
                .or(file.ordering_edges)
                .unwrap_or(true);
        let pretty = cli.pretty
            || env_parse(lookup, ENV_PRETTY)?
                .or(file.pretty)
                .unwrap_or(false);

        Ok(Self {
            schema,
            trace,
            output: cli
                .output
                .clone()
                .or_else(|| env_path(lookup, ENV_OUTPUT))
                .or(file.output),
            include: cli
                .include
                .clone()
                .or_else(|| env_str(lookup, ENV_INCLUDE))
                .or(file.include),
            exclude: cli
                .exclude
                .clone()
                .or_else(|| env_str(lookup, ENV_EXCLUDE))
                .or(file.exclude),
            emit_unmatched_starts,
            causal_edges,
            ordering_edges,
            log_format: match cli.log_format {
                Some(format) => format,
                None => env_parse(lookup, ENV_LOG_FORMAT)?
                    .or(file.log_format)
                    .unwrap_or_default(),
            },
            pretty,
            config_file,
        })
    }
}

fn env_str(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|value| !value.trim().is_empty())
}

fn env_path(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<PathBuf> {
    env_str(lookup, key).map(PathBuf::from)
}

fn env_parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env_str(lookup, key) {
        Some(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        None => Ok(None),
    }
}

fn find_default_config_path(relative_path: &str) -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;
    loop {
        let candidate = current.join(relative_path);
        if candidate.exists() && candidate.is_file() {
            return Some(candidate);
        }
        if !current.pop() {
            break;
        }
    }
    None
}

// ── .env loading ─────────────────────────────────────────────────────────────

/// Outcome of the `.env` search; logged once the subscriber is installed.
#[derive(Debug)]
pub enum EnvFile {
    Loaded(PathBuf),
    Failed { path: PathBuf, error: dotenvy::Error },
    NotFound(PathBuf),
    NoCurrentDir(std::io::Error),
}

impl EnvFile {
    pub fn log(&self) {
        match self {
            Self::Loaded(path) => {
                tracing::info!(path = %path.display(), "Loaded environment from .env");
            }
            Self::Failed { path, error } => {
                tracing::warn!(path = %path.display(), error = %error, "Failed to load .env file");
            }
            Self::NotFound(cwd) => {
                tracing::debug!(
                    cwd = %cwd.display(),
                    "No .env file found in current directory or ancestors; using process environment only"
                );
            }
            Self::NoCurrentDir(error) => {
                tracing::warn!(error = %error, "Could not determine current directory for .env lookup");
            }
        }
    }
}

/// Loads the nearest `.env` from the current directory or an ancestor.
pub fn load_env_file() -> EnvFile {
    let cwd = match std::env::current_dir() {
        Ok(dir) => dir,
        Err(e) => return EnvFile::NoCurrentDir(e),
    };

    let mut current = cwd.clone();
    loop {
        let candidate = current.join(".env");
        if candidate.exists() {
            return match dotenvy::from_path(&candidate) {
                Ok(_) => EnvFile::Loaded(candidate),
                Err(error) => EnvFile::Failed {
                    path: candidate,
                    error,
                },
            };
        }
        if !current.pop() {
            break;
        }
    }
    EnvFile::NotFound(cwd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn cli_with_paths() -> Cli {
        Cli {
            schema: Some(PathBuf::from("cli.yaml")),
            trace: Some(PathBuf::from("cli.jsonl")),
            ..Cli::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config =
            Config::from_layers(&cli_with_paths(), FileConfig::default(), None, &lookup_from(&[]))
                .unwrap();
        assert!(!config.emit_unmatched_starts);
        assert!(config.causal_edges);
        assert!(config.ordering_edges);
        assert!(!config.pretty);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.output, None);
    }

    #[test]
    fn test_missing_schema_is_an_error() {
        let err = Config::from_layers(&Cli::default(), FileConfig::default(), None, &lookup_from(&[]))
            .unwrap_err();
        assert!(err.to_string().contains("--schema"));
    }

    #[test]
    fn test_precedence_cli_over_env_over_file() {
        let file = FileConfig {
            schema: Some(PathBuf::from("file.yaml")),
            trace: Some(PathBuf::from("file.jsonl")),
            output: Some(PathBuf::from("file.json")),
            exclude: Some("file".to_string()),
            causal_edges: Some(false),
            log_format: Some(LogFormat::Json),
            ..FileConfig::default()
        };
        let lookup = lookup_from(&[
            (ENV_TRACE, "env.jsonl"),
            (ENV_EXCLUDE, "env"),
            (ENV_ORDERING_EDGES, "false"),
        ]);
        let cli = Cli {
            schema: Some(PathBuf::from("cli.yaml")),
            log_format: Some(LogFormat::Text),
            ..Cli::default()
        };
        let config = Config::from_layers(&cli, file, None, &lookup).unwrap();
        assert_eq!(config.schema, PathBuf::from("cli.yaml"));
        assert_eq!(config.trace, PathBuf::from("env.jsonl"));
        assert_eq!(config.output, Some(PathBuf::from("file.json")));
        assert_eq!(config.exclude.as_deref(), Some("env"));
        assert!(!config.causal_edges);
        assert!(!config.ordering_edges);
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_invalid_env_value_is_reported() {
        let lookup = lookup_from(&[(ENV_PRETTY, "sometimes")]);
        let err = Config::from_layers(&cli_with_paths(), FileConfig::default(), None, &lookup)
            .unwrap_err();
        assert!(err.to_string().contains(ENV_PRETTY));
    }

    #[test]
    fn test_config_file_from_env_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::write(
            &path,
            "schema = \"s.yaml\"\ntrace = \"t.jsonl\"\nemit_unmatched_starts = true\nlog_format = \"json\"\n",
        )
        .unwrap();
        let lookup = lookup_from(&[(ENV_CONFIG, path.to_str().unwrap())]);
        let config = Config::resolve_with(&Cli::default(), lookup).unwrap();
        assert_eq!(config.schema, PathBuf::from("s.yaml"));
        assert!(config.emit_unmatched_starts);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.config_file, Some(path));
    }

    #[test]
    fn test_unknown_config_key_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "schema = \"s.yaml\"\ncolour = \"red\"\n").unwrap();
        assert!(FileConfig::load(&path).is_err());
    }

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::parse_from([
            "reactor-trace",
            "--schema",
            "s.yaml",
            "-t",
            "t.jsonl",
            "--exclude",
            "startup",
            "--no-ordering-edges",
            "--log-format",
            "json",
        ]);
        assert_eq!(cli.trace, Some(PathBuf::from("t.jsonl")));
        assert!(cli.no_ordering_edges);
        assert_eq!(cli.log_format, Some(LogFormat::Json));
    }
}
