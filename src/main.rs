//! auction-login -- Yahoo account login from the terminal.
//!
//! Wires configuration, the credential store, the OAuth client and the
//! session state machine together. The redirect URL that the browser lands
//! on after consent is pasted back on stdin.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::EnvFilter;

use auction_login::config::Config;
use auction_login::oauth::{LinkRedirectListener, OAuthClient};
use auction_login::session::{AuthSession, SessionEvent, SessionPhase, UrlLauncher};

// ---------------------------------------------------------------------------
// CLI argument parsing (minimal, no clap dependency)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Login,
    Logout,
    Refresh,
    Status,
    Help,
    Version,
}

#[derive(Debug)]
struct CliArgs {
    command: Command,
    config_path: Option<PathBuf>,
}

fn parse_args_from(args: impl IntoIterator<Item = String>) -> Result<CliArgs, String> {
    let mut args = args.into_iter();
    let mut command = None;
    let mut config_path = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => match args.next() {
                Some(path) => config_path = Some(PathBuf::from(path)),
                None => return Err("--config requires a path argument".to_string()),
            },
            "--help" | "-h" => command = Some(Command::Help),
            "--version" | "-V" => command = Some(Command::Version),
            "login" | "logout" | "refresh" | "status" if command.is_some() => {
                return Err(format!("Unexpected extra command: {arg}"));
            }
            "login" => command = Some(Command::Login),
            "logout" => command = Some(Command::Logout),
            "refresh" => command = Some(Command::Refresh),
            "status" => command = Some(Command::Status),
            other => return Err(format!("Unknown argument: {other}")),
        }
    }

    Ok(CliArgs {
        command: command.unwrap_or(Command::Login),
        config_path,
    })
}

fn parse_args() -> CliArgs {
    match parse_args_from(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(msg) => {
            eprintln!("Error: {msg}");
            eprintln!("Run with --help for usage information.");
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!(
        "\
auction-login {version} -- Yahoo account login

USAGE:
    auction-login [OPTIONS] [COMMAND]

COMMANDS:
    login      Resume the stored session, or sign in through the browser [default]
    logout     Forget the stored refresh token
    refresh    Renew the access token from the stored refresh token
    status     Show the current session

OPTIONS:
    -c, --config <PATH>    Path to configuration file [default: auction-login.toml]
    -h, --help             Print this help message
    -V, --version          Print version information

ENVIRONMENT:
    RUST_LOG                        Override log level (e.g. RUST_LOG=debug)
    AUCTION_LOGIN_CONFIG            Alternative to --config flag
    AUCTION_LOGIN_CLIENT_ID         OAuth client id
    AUCTION_LOGIN_CLIENT_SECRET     OAuth client secret
    AUCTION_LOGIN_STORAGE_BACKEND   file | keyring | memory
",
        version = env!("CARGO_PKG_VERSION")
    );
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    let cli = parse_args();
    match cli.command {
        Command::Help => {
            print_usage();
            return Ok(());
        }
        Command::Version => {
            println!("auction-login {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: CliArgs) -> anyhow::Result<()> {
    // --config wins, then AUCTION_LOGIN_CONFIG, then the default file name
    let config_path = cli
        .config_path
        .or_else(|| std::env::var("AUCTION_LOGIN_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("auction-login.toml"));

    let config = Config::load(&config_path)?;
    init_tracing(&config);
    config.validate()?;

    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        backend = %config.storage.backend,
        "Starting auction-login"
    );

    let store = config.build_store()?;
    let client = OAuthClient::new(config.credentials(), config.endpoints(), config.request_timeout())?;
    let listener = LinkRedirectListener::new();
    let session = AuthSession::new(
        client,
        store,
        config.store_key(),
        Arc::new(listener.clone()),
        Arc::new(TerminalLauncher),
    );

    match cli.command {
        Command::Login => login(&session, &listener).await,
        Command::Logout => {
            session.logout();
            println!("Logged out.");
            Ok(())
        }
        Command::Refresh => {
            if session.resume().await? != SessionPhase::LoggedIn {
                anyhow::bail!("No usable stored session; run `auction-login login`");
            }
            print_status(&session)
        }
        Command::Status => {
            session.resume().await?;
            print_status(&session)
        }
        Command::Help | Command::Version => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

async fn login(session: &Arc<AuthSession>, listener: &LinkRedirectListener) -> anyhow::Result<()> {
    if session.resume().await? == SessionPhase::LoggedIn {
        return print_status(session);
    }

    let mut events = session.subscribe();
    session.start_login()?;

    let reader = listener.clone();
    let stdin_task = tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let line = line.trim();
            if !line.is_empty() && !reader.deliver(line) {
                break;
            }
        }
    });

    let outcome = wait_for_login(&mut events).await;
    stdin_task.abort();
    outcome?;
    print_status(session)
}

/// Follow session events until the attempt succeeds or ends.
async fn wait_for_login(events: &mut broadcast::Receiver<SessionEvent>) -> anyhow::Result<()> {
    let mut failure = None;
    loop {
        match events.recv().await {
            Ok(SessionEvent::LoggedIn(profile)) => {
                if profile.is_empty() {
                    eprintln!("Signed in, but the profile could not be loaded.");
                }
                return Ok(());
            }
            Ok(SessionEvent::Error(kind)) => failure = Some(kind),
            Ok(SessionEvent::LoggedOut) => {
                return Err(match failure {
                    Some(kind) => anyhow::anyhow!("Login failed: {kind}"),
                    None => anyhow::anyhow!("Login cancelled"),
                });
            }
            Ok(SessionEvent::Authorizing) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!(skipped = n, "Missed session events");
            }
            Err(broadcast::error::RecvError::Closed) => anyhow::bail!("Session closed"),
        }
    }
}

fn print_status(session: &AuthSession) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&session.status())?);
    Ok(())
}

/// Asks the user to open the authorization URL and paste the redirect back.
struct TerminalLauncher;

impl UrlLauncher for TerminalLauncher {
    fn open(&self, url: &str) -> std::io::Result<()> {
        use std::io::Write;
        let mut out = std::io::stdout().lock();
        writeln!(out, "Open this URL in a browser and sign in:\n\n  {url}\n")?;
        writeln!(out, "Then paste the URL the browser was redirected to:")?;
        out.flush()
    }
}

// ---------------------------------------------------------------------------
// Tracing initialization
// ---------------------------------------------------------------------------

/// Set up the tracing subscriber based on configuration.
fn init_tracing(config: &Config) {
    // RUST_LOG env var takes precedence over config file
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = &config.logging.level;
        EnvFilter::new(format!("auction_login={level},warn"))
    });

    // stdout carries command output
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    if config.logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use auction_login::oauth::{ErrorKind, Profile};

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_print_usage_does_not_panic() {
        print_usage();
    }

    #[test]
    fn test_default_command_is_login() {
        let cli = parse_args_from(args(&[])).unwrap();
        assert_eq!(cli.command, Command::Login);
        assert!(cli.config_path.is_none());
    }

    #[test]
    fn test_parse_command_and_config() {
        let cli = parse_args_from(args(&["-c", "/tmp/x.toml", "status"])).unwrap();
        assert_eq!(cli.command, Command::Status);
        assert_eq!(cli.config_path, Some(PathBuf::from("/tmp/x.toml")));

        let cli = parse_args_from(args(&["logout", "--config", "a.toml"])).unwrap();
        assert_eq!(cli.command, Command::Logout);
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse_args_from(args(&["--config"])).is_err());
        assert!(parse_args_from(args(&["frobnicate"])).is_err());
        assert!(parse_args_from(args(&["login", "logout"])).is_err());
    }

    #[test]
    fn test_parse_help_and_version() {
        assert_eq!(parse_args_from(args(&["-h"])).unwrap().command, Command::Help);
        assert_eq!(parse_args_from(args(&["--version"])).unwrap().command, Command::Version);
    }

    #[tokio::test]
    async fn test_wait_for_login_success() {
        let (tx, mut rx) = broadcast::channel(8);
        tx.send(SessionEvent::Authorizing).unwrap();
        tx.send(SessionEvent::LoggedIn(Profile::default())).unwrap();
        assert!(wait_for_login(&mut rx).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_login_reports_failure_kind() {
        let (tx, mut rx) = broadcast::channel(8);
        tx.send(SessionEvent::Error(ErrorKind::CsrfMismatch)).unwrap();
        tx.send(SessionEvent::LoggedOut).unwrap();
        let err = wait_for_login(&mut rx).await.unwrap_err();
        assert!(err.to_string().contains("csrf_mismatch"));
    }
}
