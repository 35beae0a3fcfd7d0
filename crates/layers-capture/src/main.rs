mod config;
mod tracing_setup;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use layers_core::{CoreServices, OfflineCaptureQueue, Session, SessionState, SubmitOutcome};

use crate::config::CaptureConfig;

#[derive(Parser)]
#[command(name = "layers-capture")]
#[command(about = "Quick capture into the Layers inbox, with an offline queue")]
struct Cli {
    /// Path to JSON config file (dataDir, apiBaseUrl, userId, sessionStore)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Override the data directory holding the queue and session files
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Override the backend base URL
    #[arg(long)]
    api_url: Option<String>,

    /// Keep the session in a file instead of the OS keyring
    #[arg(long)]
    file_session: bool,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a thought. The first line becomes the title, the rest notes.
    Add {
        /// Capture text; multiple words are joined with spaces
        #[arg(required = true, trailing_var_arg = true)]
        text: Vec<String>,
    },

    /// Deliver queued captures
    Drain,

    /// Show queue length and session state
    Status,

    /// List captures waiting in the queue
    Pending,

    /// Store a session issued by the backend
    Login {
        #[arg(long)]
        access_token: String,
        #[arg(long)]
        refresh_token: String,
        /// Seconds until the access token expires
        #[arg(long, default_value_t = 3600)]
        expires_in: i64,
    },

    /// Forget the stored session
    Logout,
}

fn main() {
    let cli = Cli::parse();

    if let Err(e) = tracing_setup::init_tracing() {
        eprintln!("Warning: logging disabled: {:#}", e);
    }

    if let Err(e) = run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config = CaptureConfig::resolve(cli.config.as_deref())?;
    config.apply_overrides(cli.data_dir, cli.api_url, cli.file_session);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;

    runtime.block_on(execute(cli.command, &config, cli.json))
}

async fn execute(command: Commands, config: &CaptureConfig, json: bool) -> Result<()> {
    tracing::debug!(
        data_dir = %config.core.data_dir.display(),
        api = %config.core.api_base_url,
        "Capture client starting"
    );
    let services = CoreServices::http(&config.core, config.session_store())?;
    let queue = OfflineCaptureQueue::open(
        config.core.queue_path(),
        services.backend.clone(),
        services.session.clone(),
    );
    if let Some(e) = queue.last_error() {
        eprintln!("Warning: {}", e);
    }

    match command {
        Commands::Add { text } => {
            // Older captures go first when the backend is reachable
            if !queue.is_empty() {
                let report = queue.drain().await;
                tracing::debug!(?report, "Drained backlog before capture");
            }
            let outcome = queue.submit(&text.join(" ")).await?;
            print_submit(&outcome, queue.len(), json);
        }
        Commands::Drain => {
            let report = queue.drain().await;
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "delivered": report.delivered,
                        "remaining": report.remaining,
                        "stopped": report.stopped,
                    })
                );
            } else {
                println!("delivered {}, {} remaining", report.delivered, report.remaining);
                if let Some(reason) = report.stopped {
                    println!("stopped: {}", reason);
                }
            }
        }
        Commands::Status => {
            let state = services.session.state();
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "queued": queue.len(),
                        "session": session_label(state),
                        "dataDir": config.core.data_dir.display().to_string(),
                    })
                );
            } else {
                println!("queued:   {}", queue.len());
                println!("session:  {}", session_label(state));
                println!("data dir: {}", config.core.data_dir.display());
            }
        }
        Commands::Pending => {
            let entries = queue.entries();
            if json {
                println!("{}", serde_json::to_string(&entries)?);
            } else if entries.is_empty() {
                println!("queue is empty");
            } else {
                for entry in entries {
                    println!(
                        "{}  {}",
                        entry.enqueued_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M"),
                        entry.title
                    );
                }
            }
        }
        Commands::Login {
            access_token,
            refresh_token,
            expires_in,
        } => {
            services
                .session
                .sign_in(Session::expiring_in(access_token, refresh_token, expires_in))?;
            println!("signed in");
            if !queue.is_empty() {
                let report = queue.drain().await;
                println!("delivered {} queued capture(s)", report.delivered);
            }
        }
        Commands::Logout => {
            services.session.sign_out()?;
            println!("signed out");
        }
    }
    Ok(())
}

fn print_submit(outcome: &SubmitOutcome, queued: usize, json: bool) {
    if json {
        println!(
            "{}",
            serde_json::json!({
                "queued": outcome.queued,
                "id": outcome.item.as_ref().map(|item| item.id.to_string()),
                "queueLength": queued,
            })
        );
    } else if outcome.queued {
        println!("saved offline ({} queued)", queued);
    } else {
        println!("saved");
    }
}

fn session_label(state: SessionState) -> &'static str {
    match state {
        SessionState::SignedOut => "signed out",
        SessionState::Active => "active",
        SessionState::Expired => "expired, sign in again",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_add_joins_words() {
        let cli = Cli::parse_from(["layers-capture", "add", "buy", "oat", "milk"]);
        match cli.command {
            Commands::Add { text } => assert_eq!(text.join(" "), "buy oat milk"),
            _ => panic!("expected add"),
        }
    }

    #[test]
    fn test_global_overrides_parse() {
        let cli = Cli::parse_from([
            "layers-capture",
            "--data-dir",
            "/tmp/x",
            "--file-session",
            "status",
        ]);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/x")));
        assert!(cli.file_session);
        assert!(matches!(cli.command, Commands::Status));
    }
}
