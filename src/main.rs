use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod auth;
mod config;
mod dedup;
mod error;
mod history;
mod monitor;
mod pager;
mod scheduler;
mod service;
mod session;
mod sink;
#[cfg(test)]
mod testing;
mod track;
mod watermark;

use crate::config::{
    Account, Config, DEFAULT_REDIRECT_URI, add_account, default_config_path, find_account,
    iter_accounts, load_config, remove_account, save_config, token_dir, validate,
};
use crate::history::HistoryPoller;
use crate::scheduler::Scheduler;
use crate::service::{SpotifyClient, SpotifySessions};
use crate::sink::{EventSink, JsonLinesSink, LogSink};

#[derive(Parser)]
#[command(
    name = "turntable",
    version,
    about = "Log what Spotify accounts listen to"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Account {
        #[command(subcommand)]
        command: AccountCommand,
    },
    /// Authorize an account and store its tokens
    Login {
        #[arg(long, help = "Account username")]
        username: String,
        #[arg(long, value_name = "PATH")]
        config_path: Option<PathBuf>,
    },
    /// Emit the listening history the service still remembers, then exit
    History(HistoryArgs),
    /// Keep tracking history and live playback until interrupted
    Watch(WatchArgs),
}

#[derive(Subcommand)]
enum AccountCommand {
    Add {
        #[arg(long, help = "Account username")]
        username: String,
        #[arg(long, help = "Spotify application client id")]
        client_id: String,
        #[arg(long, help = "Spotify application client secret")]
        client_secret: Option<String>,
        #[arg(long, default_value = DEFAULT_REDIRECT_URI)]
        redirect_uri: String,
        #[arg(long, value_name = "PATH")]
        config_path: Option<PathBuf>,
    },
    Remove {
        #[arg(long, help = "Account username")]
        username: String,
        #[arg(long, value_name = "PATH")]
        config_path: Option<PathBuf>,
    },
    List {
        #[arg(long, value_name = "PATH")]
        config_path: Option<PathBuf>,
    },
}

#[derive(Parser)]
struct HistoryArgs {
    #[arg(long, help = "Limit to one username")]
    username: Option<String>,
    #[arg(long, value_name = "PATH", help = "Append events as JSON lines")]
    output: Option<PathBuf>,
    #[arg(long, help = "Log filter, e.g. info or turntable=debug")]
    log_level: Option<String>,
    #[arg(long, value_name = "PATH")]
    config_path: Option<PathBuf>,
}

#[derive(Parser)]
struct WatchArgs {
    #[arg(long, help = "Limit to one username")]
    username: Option<String>,
    #[arg(long, value_name = "SECS", help = "Seconds between playback sweeps")]
    sweep_interval: Option<u64>,
    #[arg(long, value_name = "SECS", help = "Seconds between history polls")]
    history_interval: Option<u64>,
    #[arg(long, value_name = "SECS", help = "Seconds between live playback polls")]
    live_interval: Option<u64>,
    #[arg(
        long,
        default_value_t = false,
        help = "Report a track again when it is replayed after playback stopped"
    )]
    clear_on_stop: bool,
    #[arg(long, value_name = "PATH", help = "Append events as JSON lines")]
    output: Option<PathBuf>,
    #[arg(long, help = "Log filter, e.g. info or turntable=debug")]
    log_level: Option<String>,
    #[arg(long, value_name = "PATH")]
    config_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Account { command } => handle_account(command)?,
        Commands::Login {
            username,
            config_path,
        } => handle_login(&username, config_path).await?,
        Commands::History(args) => handle_history(args).await?,
        Commands::Watch(args) => handle_watch(args).await?,
    }
    Ok(())
}

fn handle_account(command: AccountCommand) -> Result<()> {
    match command {
        AccountCommand::Add {
            username,
            client_id,
            client_secret,
            redirect_uri,
            config_path,
        } => {
            let config_path = config_path.unwrap_or_else(default_config_path);
            let mut config = load_config(&config_path)?;
            let client_secret = match client_secret {
                Some(value) => value,
                None => prompt_secret_confirm()?,
            };
            add_account(
                &mut config,
                Account {
                    username: username.clone(),
                    client_id,
                    client_secret,
                    redirect_uri,
                },
            );
            validate(&config)?;
            save_config(&config, &config_path)?;
            println!("Saved account {username} in {}", config_path.display());
            println!("Run `turntable login --username {username}` to authorize it.");
        }
        AccountCommand::Remove {
            username,
            config_path,
        } => {
            let config_path = config_path.unwrap_or_else(default_config_path);
            let mut config = load_config(&config_path)?;
            if !remove_account(&mut config, &username) {
                bail!("No account found for {username}");
            }
            save_config(&config, &config_path)?;
            let tokens = auth::token_path(&token_dir(&config_path), &username);
            if tokens.exists() {
                std::fs::remove_file(&tokens)
                    .with_context(|| format!("Failed removing {}", tokens.display()))?;
            }
            println!("Removed account {username}");
        }
        AccountCommand::List { config_path } => {
            let config_path = config_path.unwrap_or_else(default_config_path);
            let config = load_config(&config_path)?;
            if config.accounts.is_empty() {
                bail!("No accounts configured.");
            }
            let tokens = token_dir(&config_path);
            for account in &config.accounts {
                let status = if auth::token_path(&tokens, &account.username).exists() {
                    "authorized"
                } else {
                    "not authorized"
                };
                println!("{}\t{status}", account.username);
            }
        }
    }
    Ok(())
}

async fn handle_login(username: &str, config_path: Option<PathBuf>) -> Result<()> {
    let config_path = config_path.unwrap_or_else(default_config_path);
    let config = load_config(&config_path)?;
    let account = find_account(&config, username)
        .with_context(|| format!("No account configured for {username}"))?;
    let url = auth::authorize_url(account)?;

    println!("Open this URL in a browser and allow access for {username}:\n\n  {url}\n");
    print!("Paste the URL you were redirected to: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed reading redirect URL")?;
    let code = auth::code_from_redirect(&line)?;

    let client = SpotifyClient::new(config.polling.request_timeout())?;
    let tokens = auth::exchange_code(client.http(), client.token_url(), account, &code).await?;
    let path = auth::token_path(&token_dir(&config_path), username);
    auth::save_tokens(&path, &tokens)?;
    println!("Authorized {username}, tokens stored in {}", path.display());
    Ok(())
}

async fn handle_history(args: HistoryArgs) -> Result<()> {
    let config_path = args.config_path.unwrap_or_else(default_config_path);
    let config = load_config(&config_path)?;
    validate(&config)?;
    init_logging(args.log_level.as_deref(), &config);

    let accounts = selected_accounts(&config, args.username.as_deref())?;
    let provider = Arc::new(open_sessions(&config_path, &config, &accounts)?);
    let sink = open_sink(args.output.as_deref())?;
    let poller = HistoryPoller::new(
        provider,
        sink,
        config.polling.watermark_skew(),
        config.polling.page_size,
        config.polling.request_timeout(),
    );

    let usernames = usernames(&accounts);
    let report = poller.poll(&usernames).await;
    info!(
        "Emitted {} history entries for {} accounts",
        report.emitted,
        usernames.len()
    );
    if !report.failed.is_empty() {
        bail!("History unavailable for: {}", report.failed.join(", "));
    }
    Ok(())
}

async fn handle_watch(args: WatchArgs) -> Result<()> {
    let config_path = args.config_path.unwrap_or_else(default_config_path);
    let mut config = load_config(&config_path)?;
    let polling = &mut config.polling;
    if let Some(secs) = args.sweep_interval {
        polling.sweep_interval_secs = secs;
    }
    if let Some(secs) = args.history_interval {
        polling.history_interval_secs = secs;
    }
    if let Some(secs) = args.live_interval {
        polling.live_interval_secs = secs;
    }
    if args.clear_on_stop {
        polling.clear_signature_on_stop = true;
    }
    validate(&config)?;
    init_logging(args.log_level.as_deref(), &config);

    let accounts = selected_accounts(&config, args.username.as_deref())?;
    let provider = Arc::new(open_sessions(&config_path, &config, &accounts)?);
    let sink = open_sink(args.output.as_deref())?;
    let scheduler = Scheduler::new(
        usernames(&accounts),
        provider,
        sink,
        config.polling.scheduler_settings(),
    );

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupted, stopping");
                signal.cancel();
            }
            Err(err) => warn!("Cannot listen for Ctrl-C: {err}"),
        }
    });

    scheduler.run(shutdown).await;
    Ok(())
}

/// `--log-level` wins over `RUST_LOG`, which wins over the config file.
fn init_logging(cli_level: Option<&str>, config: &Config) {
    let filter = cli_level
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .or_else(|| {
            config
                .log_level
                .as_deref()
                .and_then(|level| EnvFilter::try_new(level).ok())
        })
        .unwrap_or_else(|| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn selected_accounts(config: &Config, username: Option<&str>) -> Result<Vec<Account>> {
    let accounts: Vec<_> = iter_accounts(config, username).cloned().collect();
    if accounts.is_empty() {
        bail!("No matching accounts configured.");
    }
    Ok(accounts)
}

fn usernames(accounts: &[Account]) -> Vec<String> {
    accounts
        .iter()
        .map(|account| account.username.clone())
        .collect()
}

fn open_sessions(
    config_path: &Path,
    config: &Config,
    accounts: &[Account],
) -> Result<SpotifySessions> {
    let client = SpotifyClient::new(config.polling.request_timeout())?;
    Ok(SpotifySessions::new(
        client,
        accounts.to_vec(),
        token_dir(config_path),
    ))
}

fn open_sink(output: Option<&Path>) -> Result<Arc<dyn EventSink>> {
    Ok(match output {
        Some(path) => Arc::new(JsonLinesSink::open(path)?),
        None => Arc::new(LogSink),
    })
}

fn prompt_secret_confirm() -> Result<String> {
    let secret = rpassword::prompt_password("Client secret: ")?;
    let confirm = rpassword::prompt_password("Confirm client secret: ")?;
    if secret != confirm {
        bail!("Secrets do not match.");
    }
    Ok(secret)
}
