use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{info, warn};

use mixnode::stats::StatsSnapshot;
use mixnode::{logging, Control, MixNode, NodeConfig};

/// Type III remailer mix node.
#[derive(Parser, Debug)]
#[command(name = "mixnode", version, about, long_about = None)]
struct Cli {
    /// Path to the node configuration file
    #[arg(short, long, default_value = "/etc/mixnode.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the node in the foreground.
    Start,
    /// Ask a running node to shut down (SIGTERM).
    Stop,
    /// Ask a running node to re-read its configuration (SIGHUP).
    Reload,
    /// Print the counters the node last saved.
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = NodeConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Command::Start => start(cli.config, config).await,
        Command::Stop => send_signal(&config.pid_file(), libc::SIGTERM),
        Command::Reload => send_signal(&config.pid_file(), libc::SIGHUP),
        Command::Stats => {
            let path = config.stats_file();
            let snapshot = StatsSnapshot::load(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            println!("{snapshot}");
            Ok(())
        }
    }
}

async fn start(config_path: PathBuf, config: NodeConfig) -> Result<()> {
    logging::init(config.node.log_level, config.node.log_json)
        .map_err(|e| anyhow!("cannot install logger: {e}"))?;

    let node = MixNode::open(config.clone()).context("opening node")?;
    let pid_file = config.pid_file();
    write_pid_file(&pid_file)?;

    let (control, inbox) = mpsc::channel(4);
    tokio::spawn(async move {
        if let Err(e) = forward_signals(config_path, control).await {
            warn!(error = %e, "signal handling stopped");
        }
    });

    let result = node.run(inbox).await;
    remove_pid_file(&pid_file);
    result.context("node stopped with an error")
}

async fn forward_signals(config_path: PathBuf, control: mpsc::Sender<Control>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                info!("received SIGTERM");
                break;
            }
            _ = sigint.recv() => {
                info!("received SIGINT");
                break;
            }
            _ = sighup.recv() => match NodeConfig::load(&config_path) {
                Ok(config) => control.send(Control::Reload(Box::new(config))).await?,
                Err(e) => warn!(error = %e, "SIGHUP ignored: configuration does not load"),
            },
        }
    }
    control.send(Control::Shutdown).await?;
    Ok(())
}

/// Written through a temporary file and a rename.
fn write_pid_file(path: &Path) -> Result<()> {
    let staged = path.with_extension("pid.tmp");
    let mut file = fs::File::create(&staged).context("creating pid file")?;
    write!(file, "{}", std::process::id())?;
    file.sync_all()?;
    fs::rename(&staged, path).context("installing pid file")?;
    info!(path = %path.display(), "pid file written");
    Ok(())
}

fn remove_pid_file(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "could not remove pid file");
    }
}

fn send_signal(pid_file: &Path, signal: libc::c_int) -> Result<()> {
    let raw = fs::read_to_string(pid_file)
        .with_context(|| format!("reading {}; is the node running?", pid_file.display()))?;
    let pid: libc::pid_t = raw.trim().parse().context("pid file is malformed")?;
    if pid <= 0 {
        bail!("pid file names an invalid process id {pid}");
    }
    // SAFETY: kill(2) takes plain integers and touches no memory of ours.
    if unsafe { libc::kill(pid, signal) } != 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("signalling process {pid}"));
    }
    Ok(())
}
