use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{
    Parser, Subcommand,
    builder::styling::{AnsiColor, Effects, Styles},
};
use tokio::sync::broadcast::error::RecvError;

use oraboard::{Observer, RegistryEvent, Settings, convert, logging};

fn clap_cargo_style() -> Styles {
    Styles::styled()
        .header(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::Cyan.on_default() | Effects::BOLD)
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

#[derive(Parser)]
#[command(name = "oraboard")]
#[command(version, about = "Keep PNG snapshots of OpenRaster boards up to date")]
#[command(styles = clap_cargo_style())]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Directory overrides shared by the running commands.
#[derive(clap::Args)]
struct DirArgs {
    /// Directory containing .ora boards (overrides config)
    #[arg(long, env = "ORABOARD_BOARD_DIR")]
    board_dir: Option<PathBuf>,

    /// Directory receiving PNG snapshots (overrides config)
    #[arg(long, env = "ORABOARD_OUT_DIR")]
    out_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .oraboard/settings.toml with defaults
    Init {
        /// Overwrite an existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show the effective configuration
    Config,

    /// Watch the board directory until interrupted
    Watch {
        #[command(flatten)]
        dirs: DirArgs,

        /// Poll modification times (for shared or network file systems)
        #[arg(long)]
        shared_fs: bool,

        /// Poll interval in milliseconds for --shared-fs
        #[arg(long)]
        poll_interval_ms: Option<u64>,

        /// Print registry events as JSON lines on stdout
        #[arg(long)]
        json: bool,
    },

    /// Convert every board once and write a zip snapshot
    Snapshot {
        #[command(flatten)]
        dirs: DirArgs,

        /// Archive to write
        #[arg(short, long)]
        output: PathBuf,

        /// How long to let initial conversions run, in milliseconds
        #[arg(long, default_value_t = 2000)]
        settle_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = Settings::load().unwrap_or_else(|e| {
        eprintln!("Configuration error: {e}");
        eprintln!("Using default configuration for now.");
        Settings::default()
    });

    match cli.command {
        Commands::Init { force } => {
            let path = Settings::init_config_file(force)
                .map_err(|e| anyhow::anyhow!("{e}"))
                .context("cannot write configuration")?;
            println!("Created configuration file at: {}", path.display());
            Ok(())
        }

        Commands::Config => {
            println!("{}", toml::to_string_pretty(&settings)?);
            Ok(())
        }

        Commands::Watch {
            dirs,
            shared_fs,
            poll_interval_ms,
            json,
        } => {
            apply_dirs(&mut settings, dirs);
            settings.observer.shared_fs |= shared_fs;
            if poll_interval_ms.is_some() {
                settings.observer.poll_interval_ms = poll_interval_ms;
            }
            logging::init_with_config(&settings.logging);
            watch(&settings, json).await
        }

        Commands::Snapshot {
            dirs,
            output,
            settle_ms,
        } => {
            apply_dirs(&mut settings, dirs);
            logging::init_with_config(&settings.logging);
            snapshot(&settings, output, Duration::from_millis(settle_ms)).await
        }
    }
}

fn apply_dirs(settings: &mut Settings, dirs: DirArgs) {
    if let Some(dir) = dirs.board_dir {
        settings.board_dir = dir;
    }
    if let Some(dir) = dirs.out_dir {
        settings.out_dir = dir;
    }
}

async fn start(settings: &Settings) -> Result<Observer> {
    let converter = convert::from_config(&settings.converter)?;
    let observer = Observer::builder()
        .board_dir(&settings.board_dir)
        .out_dir(&settings.out_dir)
        .options(settings.observer.to_options())
        .converter(converter)
        .start()
        .await?;
    Ok(observer)
}

async fn watch(settings: &Settings, json: bool) -> Result<()> {
    let observer = start(settings).await?;
    let mut events = observer.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                eprintln!("Received shutdown signal");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => report(&observer, &event, json),
                Err(RecvError::Lagged(n)) => tracing::warn!("[watch] lagged by {n} events"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    observer.shutdown().await;
    Ok(())
}

fn report(observer: &Observer, event: &RegistryEvent, json: bool) {
    let name = event
        .output()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let details = observer
        .registry()
        .watched_files_details()
        .into_iter()
        .find(|d| d.name == name);

    let kind = match event {
        RegistryEvent::Updated { .. } => "update",
        RegistryEvent::Deleted { .. } => "delete",
    };

    if json {
        let line = serde_json::json!({
            "event": kind,
            "name": name,
            "rev": details.as_ref().map(|d| d.rev),
            "deleted": details.as_ref().map(|d| d.deleted),
        });
        println!("{line}");
    } else {
        let rev = details.map(|d| d.rev).unwrap_or_default();
        oraboard::log_event!("watch", kind, "{name} r{rev}");
    }
}

async fn snapshot(settings: &Settings, output: PathBuf, settle: Duration) -> Result<()> {
    let observer = start(settings).await?;
    tokio::time::sleep(settle).await;

    let summary = observer
        .exporter()
        .zip_to(&output)
        .await
        .with_context(|| format!("cannot write {}", output.display()))?;
    observer.shutdown().await;

    println!(
        "Wrote {} ({} files{})",
        output.display(),
        summary.files.len(),
        if summary.missing.is_empty() {
            String::new()
        } else {
            format!(", not yet converted: {}", summary.missing.join(", "))
        }
    );
    Ok(())
}
