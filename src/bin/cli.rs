use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use music_provider_auth as lib;
use lib::config::Config;
use lib::{AuthError, DevicePoll, Provider, TokenLifecycleManager};
use std::path::{Path, PathBuf};
use tracing::subscriber as tracing_subscriber_global;
use tracing_appender::rolling::RollingFileAppender;
use tracing_log::LogTracer;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "music-provider-auth", version)]
struct Cli {
    /// Path to config TOML
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate config file and exit
    ConfigValidate,
    /// Print a login URL for a visitor (PKCE authorization code flow)
    LoginUrl {
        #[arg(long)]
        provider: Provider,
        /// Visitor id; a random one is generated when omitted
        #[arg(long)]
        visitor: Option<String>,
        #[arg(long)]
        redirect_uri: Option<String>,
    },
    /// Exchange the code from the redirect for a stored credential
    Complete {
        #[arg(long)]
        provider: Provider,
        #[arg(long)]
        code: String,
        #[arg(long)]
        state: String,
        #[arg(long)]
        redirect_uri: Option<String>,
    },
    /// Print a currently valid access token, refreshing if needed
    Token {
        #[arg(long)]
        provider: Provider,
        #[arg(long)]
        visitor: String,
    },
    /// Show whether a visitor is connected to a provider
    Status {
        #[arg(long)]
        provider: Provider,
        #[arg(long)]
        visitor: String,
    },
    /// Remove a visitor's credential
    Disconnect {
        #[arg(long)]
        provider: Provider,
        #[arg(long)]
        visitor: String,
    },
    /// Start a device authorization (Tidal)
    DeviceInit {
        #[arg(long, default_value = "tidal")]
        provider: Provider,
    },
    /// Poll a device authorization and bind the result to a visitor
    DevicePoll {
        #[arg(long)]
        device_code: String,
        #[arg(long)]
        visitor: String,
        /// Keep polling at the provider's interval until a terminal result
        #[arg(long)]
        wait: bool,
    },
    /// Drop expired handshake contexts
    PurgeContexts,
    /// Drop credentials of visitors inactive past the retention window
    PurgeCredentials,
}

fn resolve_redirect(cfg: &Config, provider: Provider, arg: Option<String>) -> Result<String> {
    arg.or_else(|| cfg.provider(provider).and_then(|p| p.redirect_uri.clone()))
        .ok_or_else(|| anyhow!("no redirect URI for {}: pass --redirect-uri or set it in config", provider))
}

/// Map lifecycle errors to a user-facing hint.
fn explain(e: &AuthError) -> &'static str {
    if e.requires_login() {
        "please (re)connect this provider"
    } else if e.is_transient() {
        "provider temporarily unavailable, try again later"
    } else {
        "request failed"
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    // explicit --config wins; then the system-wide file; then the repo example
    let resolved_config_path: PathBuf = match &cli.config {
        Some(p) => p.clone(),
        None => {
            let etc_path = Path::new("/etc/music-provider-auth/config.toml");
            if etc_path.exists() {
                etc_path.to_path_buf()
            } else {
                PathBuf::from("config/example-config.toml")
            }
        }
    };

    let cfg = Config::from_path(&resolved_config_path)
        .with_context(|| format!("loading config from {}", resolved_config_path.display()))?;

    if let Commands::ConfigValidate = cli.command {
        match cfg.validate() {
            Ok(()) => println!("OK"),
            Err(e) => {
                eprintln!("Config validation failed: {}", e);
                std::process::exit(2);
            }
        }
        return Ok(());
    }

    // Logs go to stderr (stdout carries tokens/URLs) and a daily-rotated file in cfg.log_dir.
    let _ = LogTracer::init();
    let file_appender: RollingFileAppender =
        tracing_appender::rolling::daily(&cfg.log_dir, "music-provider-auth.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(non_blocking))
        .with(fmt::layer().with_writer(std::io::stderr));
    // LogTracer already bridges `log`; install without the subscriber's own bridge.
    tracing_subscriber_global::set_global_default(subscriber)
        .context("installing tracing subscriber")?;

    cfg.validate().context("invalid configuration")?;
    let manager = TokenLifecycleManager::from_config(&cfg)?;

    let command = cli.command;
    let result: Result<(), AuthError> = async move {
        match command {
            Commands::ConfigValidate => {}
            Commands::LoginUrl {
                provider,
                visitor,
                redirect_uri,
            } => {
                let visitor = visitor.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let redirect = resolve_redirect(&cfg, provider, redirect_uri)?;
                let url = manager.get_login_url(provider, &visitor, &redirect).await?;
                println!("visitor: {}", visitor);
                println!("Open this URL in your browser and authorize the application:\n\n{}\n", url);
            }
            Commands::Complete {
                provider,
                code,
                state,
                redirect_uri,
            } => {
                let redirect = resolve_redirect(&cfg, provider, redirect_uri)?;
                let cred = manager
                    .complete_authorization(provider, &code, &state, &redirect)
                    .await?;
                println!(
                    "Connected {} account '{}' ({}) for visitor {}; token valid until {}",
                    provider,
                    cred.provider_display_name,
                    cred.provider_user_id,
                    cred.visitor_id,
                    cred.expires_at
                );
            }
            Commands::Token { provider, visitor } => {
                let token = manager.get_valid_token(provider, &visitor).await?;
                println!("{}", token);
            }
            Commands::Status { provider, visitor } => {
                let connected = manager.is_connected(provider, &visitor).await?;
                println!(
                    "{} / {}: {}",
                    provider,
                    visitor,
                    if connected { "connected" } else { "not connected" }
                );
            }
            Commands::Disconnect { provider, visitor } => {
                manager.disconnect(provider, &visitor).await?;
                println!("Disconnected {} for visitor {}", provider, visitor);
            }
            Commands::DeviceInit { provider } => {
                let session = manager.init_device_authorization(provider).await?;
                println!(
                    "Visit {} and enter code {}",
                    session.verification_uri_complete.as_deref().unwrap_or(&session.verification_uri),
                    session.user_code
                );
                println!("device code: {}", session.device_code);
                println!("expires in {}s, poll every {}s", session.expires_in, session.interval);
            }
            Commands::DevicePoll {
                device_code,
                visitor,
                wait,
            } => loop {
                match manager.poll_device(&device_code, &visitor).await? {
                    DevicePoll::Complete(cred) => {
                        println!(
                            "Connected {} account '{}' for visitor {}",
                            cred.provider, cred.provider_display_name, cred.visitor_id
                        );
                        break;
                    }
                    DevicePoll::Pending { interval } => {
                        if !wait {
                            println!("pending; poll again in {}s", interval);
                            break;
                        }
                        tokio::time::sleep(std::time::Duration::from_secs(interval.max(1) as u64)).await;
                    }
                }
            },
            Commands::PurgeContexts => {
                let removed = manager.purge_expired_contexts().await?;
                println!("Removed {} expired handshake context(s).", removed);
            }
            Commands::PurgeCredentials => {
                let removed = manager.purge_stale_credentials().await?;
                println!("Removed {} credential(s) past retention.", removed);
            }
        }
        Ok(())
    }
    .await;

    if let Err(e) = result {
        eprintln!("{}: {}", explain(&e), e);
        std::process::exit(1);
    }
    Ok(())
}
