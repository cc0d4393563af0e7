//! # NAS Mirror CLI
//!
//! Mirrors media from a NAS File Station share to local disk, archives the
//! originals on the NAS, and re-uploads the mirror to a cloud photo library.
//!
//! ## Usage
//!
//! ```bash
//! # Mirror a folder and move the originals into the archive tree
//! nas-mirror-cli backup /photo/Trip --archive
//!
//! # Upload everything in the mirror that is not in the ledger yet
//! nas-mirror-cli upload
//!
//! # Compare two remote files by checksum
//! nas-mirror-cli verify /photo/a.jpg /archive/a.jpg --strong
//!
//! # Look for NAS hosts on the local network
//! nas-mirror-cli discover 192.168.1
//! ```
//!
//! ## Authentication
//!
//! NAS credentials come from `--url`, `--username`, `--password` or the
//! `NAS_URL`, `NAS_USERNAME`, `NAS_PASSWORD` environment variables. The photo
//! library token comes from `--token` or `PHOTOS_TOKEN`.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use futures::{Stream, StreamExt};
use indicatif::{ProgressBar, ProgressStyle};
use nas_mirror::remote::{file_name, parent_path};
use nas_mirror::space::DiskSpace;
use nas_mirror::task::PollPolicy;
use nas_mirror::{
    discovery, format_size, verify, FileStationClient, Job, Orchestrator, PhotoLibraryClient, RemoteStore,
    Settings, StatusBoard, StatusSnapshot, TransferLedger, UploadPipeline,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Exit code indicating successful completion.
const EXIT_SUCCESS: u8 = 0;
/// Exit code indicating a general error occurred.
const EXIT_ERROR: u8 = 1;

#[derive(Parser)]
#[command(name = "nas-mirror-cli")]
#[command(author, version, about = "Mirror, archive and re-upload NAS media")]
struct Cli {
    /// Enable verbose logging (can also use RUST_LOG env var)
    #[arg(short, long)]
    verbose: bool,

    /// NAS base URL, e.g. http://192.168.1.20:5000
    #[arg(long, env = "NAS_URL", default_value = "http://127.0.0.1:5000")]
    url: String,

    /// NAS account
    #[arg(short, long, env = "NAS_USERNAME")]
    username: Option<String>,

    /// NAS password
    #[arg(short, long, env = "NAS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// JSON settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mirror a remote folder into the local mirror
    Backup {
        /// Remote folder, e.g. /photo/Trip
        source: String,

        /// Move originals into the archive tree after they are mirrored
        #[arg(short, long)]
        archive: bool,

        /// Only these files (names or full paths inside the source folder)
        #[arg(long, num_args = 1..)]
        files: Vec<String>,
    },

    /// Upload mirrored media missing from the ledger
    Upload {
        /// Photo library access token
        #[arg(short, long, env = "PHOTOS_TOKEN", hide_env_values = true)]
        token: String,
    },

    /// Compare two remote files
    Verify {
        first: String,
        second: String,

        /// Use server-side checksums instead of sampled bytes
        #[arg(long)]
        strong: bool,
    },

    /// Split oversized local files into parts
    Split {
        paths: Vec<PathBuf>,
    },

    /// List a remote folder
    List {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Find NAS hosts on a /24 network
    Discover {
        /// Network prefix, e.g. 192.168.1
        prefix: String,

        #[arg(long, default_value_t = discovery::DEFAULT_PORT)]
        port: u16,

        /// Per-host connect timeout in milliseconds
        #[arg(long, default_value = "400")]
        timeout_ms: u64,
    },
}

/// Application entry point.
#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::from(EXIT_SUCCESS),
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("nas_mirror=debug,nas_mirror_cli=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nas_mirror=info,nas_mirror_cli=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).without_time().init();

    let settings = match &cli.config {
        Some(path) => Settings::load_from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => Settings::default(),
    };
    settings.validate()?;

    match cli.command {
        Commands::Backup { source, archive, files } => {
            let client = connect(&cli.url, cli.username, cli.password).await?;
            let store: Arc<dyn RemoteStore> = Arc::new(client);

            let job = if files.is_empty() {
                Job::RecursiveBackup { source_path: source, archive_after_transfer: archive }
            } else {
                let listing = store.list(&source).await?;
                let selected: Vec<_> = listing
                    .into_iter()
                    .filter(|f| !f.is_directory && files.iter().any(|w| *w == f.name || *w == f.path))
                    .collect();
                if selected.is_empty() {
                    bail!("none of the given files exist in {source}");
                }
                Job::SelectedBackup { files: selected, source_path: source, archive_after_transfer: archive }
            };

            let board = Arc::new(StatusBoard::new());
            let orchestrator = Orchestrator::new(store, Arc::new(DiskSpace), settings, board.clone());
            orchestrator.enqueue(job);
            let Some(worker) = orchestrator.start() else {
                bail!("worker did not start");
            };

            let ctrl_c = {
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        eprintln!("\nCancelling after the current file...");
                        orchestrator.cancel_all();
                    }
                })
            };
            render_until_done(board.subscribe(), worker).await?;
            ctrl_c.abort();

            let mut failed = 0;
            for (label, report) in orchestrator.finished() {
                println!("\n✓ {label}");
                println!("  Candidates:      {}", report.candidates);
                println!("  Downloaded:      {}", report.downloaded);
                println!("  Already present: {}", report.skipped_existing);
                println!("  Skipped (space): {}", report.skipped_budget);
                println!("  Archived:        {}", report.relocated);
                println!("  Folders removed: {}", report.cleaned_dirs);
                failed += report.failed + report.relocation_failed;
                if report.aborted {
                    bail!("{}", board.snapshot().status_message);
                }
            }
            if failed > 0 {
                bail!("{failed} file(s) failed");
            }
        }

        Commands::Upload { token } => {
            let library = Arc::new(PhotoLibraryClient::new(settings.photos_api_base.clone(), token));
            let ledger = TransferLedger::open(&settings.ledger_path)?;
            let board = Arc::new(StatusBoard::new());
            let mut pipeline = UploadPipeline::new(library, ledger, board.clone());

            let cancel = CancellationToken::new();
            let ctrl_c = {
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        cancel.cancel();
                    }
                })
            };
            let mirror_root = settings.mirror_root();
            let render = tokio::spawn(render(board.subscribe()));
            let report = pipeline.run(&mirror_root, &cancel).await;
            render.abort();
            ctrl_c.abort();
            let report = report?;

            println!("\n✓ Upload complete: {} uploaded, {} failed, {} already uploaded", report.uploaded, report.failed, report.skipped_in_ledger);
            if report.failed > 0 {
                bail!("{} file(s) failed to upload", report.failed);
            }
        }

        Commands::Verify { first, second, strong } => {
            let client = connect(&cli.url, cli.username, cli.password).await?;
            let verdict = if strong {
                let policy = PollPolicy::new(settings.checksum_poll_interval(), settings.checksum_poll_attempts);
                verify::strong_equal(&client, &first, &second, policy).await?
            } else {
                let a = describe(&client, &first).await?;
                let b = describe(&client, &second).await?;
                verify::partial_equal(&client, &a, &b).await?
            };
            println!("{first} vs {second}: {verdict:?}");
            if verdict.is_different() {
                bail!("files differ");
            }
        }

        Commands::Split { paths } => {
            let report = nas_mirror::split::split_files(&paths, settings.split_threshold, &CancellationToken::new()).await;
            println!(
                "✓ Split {} file(s) into {} parts, {} small enough, {} failed",
                report.split, report.parts_written, report.skipped, report.failed
            );
            if report.failed > 0 {
                bail!("{} file(s) could not be split", report.failed);
            }
        }

        Commands::List { path } => {
            let client = connect(&cli.url, cli.username, cli.password).await?;
            let items = client.list(&path).await?;
            if items.is_empty() {
                println!("Folder '{path}' is empty");
                return Ok(());
            }
            println!("\nContents of '{path}':\n");
            println!("{:<10} {:<40} {:<15}", "Type", "Name", "Size");
            println!("{}", "-".repeat(70));
            for item in items {
                let (kind, size) = if item.is_directory {
                    ("[DIR]", "-".to_string())
                } else {
                    ("[FILE]", format_size(item.size))
                };
                println!("{:<10} {:<40} {:<15}", kind, item.name, size);
            }
            println!();
        }

        Commands::Discover { prefix, port, timeout_ms } => {
            let octets = discovery::parse_prefix(&prefix)?;
            let spinner = ProgressBar::new_spinner();
            spinner.set_message(format!("Probing {prefix}.1-254 on port {port}"));
            spinner.enable_steady_tick(Duration::from_millis(100));
            let hosts = discovery::sweep(octets, port, Duration::from_millis(timeout_ms), 64).await;
            spinner.finish_and_clear();

            if hosts.is_empty() {
                println!("No hosts answered on port {port}");
            }
            for host in hosts {
                println!("http://{host}:{port}");
            }
        }
    }

    Ok(())
}

async fn connect(url: &str, username: Option<String>, password: Option<String>) -> anyhow::Result<FileStationClient> {
    let (Some(user), Some(pass)) = (username, password) else {
        bail!(
            "Authentication required! Provide:\n  \
             • --username and --password, or\n  \
             • Set NAS_USERNAME/NAS_PASSWORD environment variables"
        );
    };
    let mut client = FileStationClient::new(url, None);
    client.login(&user, &pass).await.context("NAS login failed")?;
    tracing::info!("Authenticated as {user}");
    Ok(client)
}

/// Looks up the listing entry for a single remote file.
async fn describe(client: &FileStationClient, path: &str) -> anyhow::Result<nas_mirror::RemoteFileDescriptor> {
    let name = file_name(path);
    client
        .list(parent_path(path))
        .await?
        .into_iter()
        .find(|f| !f.is_directory && f.name == name)
        .with_context(|| format!("{path} not found"))
}

/// Status snapshots as a stream, one per change.
fn snapshots(mut rx: watch::Receiver<StatusSnapshot>) -> impl Stream<Item = StatusSnapshot> {
    async_stream::stream! {
        // Clone out of the borrow before yielding so the channel lock is released.
        let first = rx.borrow_and_update().clone();
        yield first;
        while rx.changed().await.is_ok() {
            let next = rx.borrow_and_update().clone();
            yield next;
        }
    }
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    if let Ok(style) = ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {msg}") {
        bar.set_style(style.progress_chars("=> "));
    }
    bar
}

fn apply(bar: &ProgressBar, snapshot: &StatusSnapshot) {
    bar.set_position(u64::from(snapshot.progress));
    bar.set_message(format!("ETA {}  {}", snapshot.eta, snapshot.status_message));
}

/// Draws snapshots until the channel closes.
async fn render(rx: watch::Receiver<StatusSnapshot>) {
    let bar = progress_bar();
    let stream = snapshots(rx);
    futures::pin_mut!(stream);
    while let Some(snapshot) = stream.next().await {
        apply(&bar, &snapshot);
    }
    bar.finish_and_clear();
}

/// Draws snapshots until `worker` exits.
async fn render_until_done(rx: watch::Receiver<StatusSnapshot>, worker: tokio::task::JoinHandle<()>) -> anyhow::Result<()> {
    let bar = progress_bar();
    let stream = snapshots(rx);
    futures::pin_mut!(stream);
    tokio::pin!(worker);
    loop {
        tokio::select! {
            joined = &mut worker => {
                joined.context("worker task failed")?;
                break;
            }
            Some(snapshot) = stream.next() => apply(&bar, &snapshot),
        }
    }
    bar.finish_and_clear();
    Ok(())
}
