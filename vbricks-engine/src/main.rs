use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vbricks_engine::{Engine, Settings};

#[derive(Parser)]
#[command(name = "vbricks")]
#[command(about = "Text console for VDE/QEMU virtual network topologies")]
struct Args {
    /// JSON settings file
    #[arg(short, long)]
    settings: Option<PathBuf>,

    /// Directory for sockets, PID files and disk overlays
    #[arg(short, long)]
    base_dir: Option<PathBuf>,

    /// Install directory of the VDE tools
    #[arg(long)]
    vde_dir: Option<PathBuf>,

    /// Install directory of qemu, kvm and qemu-img
    #[arg(long)]
    qemu_dir: Option<PathBuf>,

    /// Never elevate privileges
    #[arg(long)]
    no_sudo: bool,

    /// Treat network loops as errors
    #[arg(long)]
    erroronloop: bool,

    /// Topology file to load at startup
    topology: Option<PathBuf>,
}

impl Args {
    fn settings(&self) -> anyhow::Result<Settings> {
        let mut settings = match &self.settings {
            Some(path) => Settings::load(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => Settings::default(),
        };
        if let Some(dir) = &self.base_dir {
            settings.base_dir = dir.clone();
        }
        if let Some(dir) = &self.vde_dir {
            settings.vde_dir = dir.clone();
        }
        if let Some(dir) = &self.qemu_dir {
            settings.qemu_dir = dir.clone();
        }
        if self.no_sudo {
            settings.sudo = None;
        }
        if self.erroronloop {
            settings.erroronloop = true;
        }
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::from_default_env().add_directive("vbricks_engine=info".parse()?))
        .init();

    let args = Args::parse();
    let engine = Engine::start(args.settings()?).await?;

    if let Some(path) = &args.topology {
        let line = format!("load {}", path.display());
        match engine.exec(&line).await {
            Ok(report) => info!("{}", report),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to load topology"),
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b"vb> ").await?;
        stdout.flush().await?;

        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                None
            }
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if matches!(line, "quit" | "exit") {
            break;
        }

        match engine.exec(line).await {
            Ok(output) if output.is_empty() => {}
            Ok(output) => {
                stdout.write_all(output.trim_end().as_bytes()).await?;
                stdout.write_all(b"\n").await?;
            }
            Err(e) => {
                stdout.write_all(format!("Error: {e}\n").as_bytes()).await?;
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}
