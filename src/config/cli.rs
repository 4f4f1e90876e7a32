use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the stowaway binary.
#[derive(Debug, Parser)]
#[command(name = "stowaway", version, about = "Offline response cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "STOWAWAY_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the caching proxy.
    Serve(Box<ServeArgs>),
    /// Show the entries of a namespace on a running server.
    Status(StatusArgs),
    /// Clear one namespace, or all of them, on a running server.
    Clear(ClearArgs),
    /// Make a waiting install take over immediately.
    Activate(ControlArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the upstream origin requests are forwarded to.
    #[arg(long = "upstream", value_name = "URL", value_hint = ValueHint::Url)]
    pub upstream: Option<String>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the store backend (memory|disk).
    #[arg(long = "store-backend", value_name = "BACKEND")]
    pub store_backend: Option<String>,

    /// Override the disk store directory.
    #[arg(long = "store-directory", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub store_directory: Option<PathBuf>,

    /// Override the cache version tag.
    #[arg(long = "cache-version", value_name = "TAG")]
    pub cache_version: Option<String>,

    /// Override the precache manifest path.
    #[arg(long = "manifest", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub manifest: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ControlArgs {
    /// Control endpoint; defaults to the configured listener.
    #[arg(long = "endpoint", value_name = "URL", value_hint = ValueHint::Url)]
    pub endpoint: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub control: ControlArgs,

    /// Storage name of the namespace; the server default when omitted.
    #[arg(long = "namespace", value_name = "NAME")]
    pub namespace: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ClearArgs {
    #[command(flatten)]
    pub control: ControlArgs,

    /// Storage name of the namespace; every namespace when omitted.
    #[arg(long = "namespace", value_name = "NAME")]
    pub namespace: Option<String>,
}
