use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "moegen", version, about = "Image generation dashboard backend")]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct ServeArgs {
    /// Bind address; overrides `server.host` and `MOEGEN_HOST`.
    #[arg(long)]
    pub host: Option<String>,

    /// Listen port; overrides `server.port`, `MOEGEN_PORT` and `PORT`.
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory holding tasks, images, state and collection files.
    #[arg(long)]
    pub data_dir: Option<String>,
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct SweepArgs {
    #[arg(long)]
    pub data_dir: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP backend (default).
    Serve(ServeArgs),
    /// Delete image blobs no task or collection references, then exit.
    Sweep(SweepArgs),
}
