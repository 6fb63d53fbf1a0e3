use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "parcel",
    about = "parcel: package files into artifacts and keep them in local or object storage",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file holding a [storage] table (default: parcel.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Storage connection string, e.g. fs:///srv/artifacts or s3://bucket/prefix
    #[arg(long, global = true)]
    pub store: Option<String>,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Package files and directories into an artifact and upload it
    Push(PushArgs),
    /// Download an artifact and extract it into a directory
    Pull(PullArgs),
    /// List stored artifacts
    Ls(LsArgs),
    /// Delete a stored artifact
    Rm(RmArgs),
    /// List the files inside a local .tar.gz artifact
    Show(ShowArgs),
}

#[derive(Args)]
pub struct PushArgs {
    pub name: String,
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,
}

#[derive(Args)]
pub struct PullArgs {
    pub name: String,
    #[arg(default_value = ".")]
    pub dest: PathBuf,
}

#[derive(Args)]
pub struct LsArgs {
    #[arg(default_value = "")]
    pub prefix: String,
}

#[derive(Args)]
pub struct RmArgs {
    pub name: String,
}

#[derive(Args)]
pub struct ShowArgs {
    pub file: PathBuf,
}
