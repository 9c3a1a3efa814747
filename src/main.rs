use anyhow::Result;
use clap::{Parser, Subcommand};
use hubd::{
    accounts::AccountStorage, config::GatewayConfig, identity, ipc::event::EventBroadcaster,
    mdns, storage::Storage, AppContext,
};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(
    name = "hubd",
    about = "Agent Hub — personal-agent gateway daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// JSON-RPC WebSocket server port
    #[arg(long, env = "HUBD_PORT")]
    port: Option<u16>,

    /// Data directory for config and the SQLite database
    #[arg(long, env = "HUBD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "HUBD_LOG")]
    log: Option<String>,

    /// Bind address for the WebSocket server (default: 127.0.0.1; use 0.0.0.0 for LAN access)
    #[arg(long, env = "HUBD_BIND")]
    bind_address: Option<String>,

    /// Write logs to this file path (rotated daily). Optional.
    #[arg(long, env = "HUBD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,

    /// Suppress progress and informational output.
    ///
    /// Errors are still printed to stderr. Use this flag when piping output
    /// to other tools.
    #[arg(long, short = 'q', global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start the gateway server (default when no subcommand given).
    ///
    /// Runs hubd in the foreground.
    ///
    /// Examples:
    ///   hubd serve
    ///   hubd
    Serve,
    /// Manage gateway accounts.
    ///
    /// Accounts own paired nodes and authenticate over the WebSocket API with
    /// their API token. The token is printed exactly once, at creation.
    ///
    /// Examples:
    ///   hubd account add alice
    ///   hubd account list
    ///   hubd account revoke <id>
    Account {
        #[command(subcommand)]
        cmd: AccountCmd,
    },
    /// Display instructions for pairing a new device.
    ///
    /// A one-time pairing code is generated from the dashboard by the signed-in
    /// account; this command only explains the flow.
    ///
    /// Examples:
    ///   hubd pair
    Pair,
    /// Render a connect QR code for this gateway.
    ///
    /// Encodes the gateway's LAN address and identity so a device can find it
    /// without typing an IP. The QR carries no credentials — attaching a
    /// device still requires a pairing code.
    ///
    /// Examples:
    ///   hubd qr
    Qr,
}

#[derive(Subcommand)]
enum AccountCmd {
    /// Create an account and print its API token (shown exactly once).
    Add { name: String },
    /// List accounts (no tokens).
    List,
    /// Revoke an account so its token no longer authenticates.
    Revoke { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Some(Command::Account { cmd }) => {
            let config =
                GatewayConfig::new(None, args.data_dir, Some("error".to_string()), None);
            run_account(&config, cmd, args.quiet).await?;
        }
        Some(Command::Pair) => {
            println!("To pair a device:");
            println!("  1. Sign in to the dashboard and open Settings > Nodes > Pair New Node.");
            println!("  2. A one-time code is shown — it expires after 10 minutes.");
            println!("  3. Enter the code on the device (or scan it) and confirm.");
            println!();
            println!("Devices on the same LAN discover the gateway automatically (mDNS);");
            println!("run `hubd qr` to hand the gateway address to a device directly.");
        }
        Some(Command::Qr) => {
            let config =
                GatewayConfig::new(args.port, args.data_dir, Some("error".to_string()), None);
            run_qr(&config).await?;
        }
        None | Some(Command::Serve) => {
            run_server(args.port, args.data_dir, args.log, args.bind_address, args.log_file)
                .await?;
        }
    }

    Ok(())
}

/// Initialize the tracing subscriber.
/// If `log_file` is set, logs go to both stdout and a daily-rolling file.
/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
///
/// `log_format` may be `"pretty"` (default, human-readable compact format) or
/// `"json"` (structured JSON for log aggregators like Loki/Elasticsearch).
///
/// If the log directory cannot be created, falls back to stdout-only logging
/// with a warning — never panics.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
    log_format: &str,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let use_json = log_format == "json";

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path
            .file_name()
            .unwrap_or_else(|| std::ffi::OsStr::new("hubd.log"));

        // Ensure the directory exists before tracing-appender tries to open it.
        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            if use_json {
                tracing_subscriber::fmt().json().with_env_filter(log_level).init();
            } else {
                tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
            }
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        if use_json {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().json())
                .with(fmt::layer().json().with_writer(non_blocking))
                .init();
        } else {
            tracing_subscriber::registry()
                .with(EnvFilter::new(log_level))
                .with(fmt::layer().compact())
                .with(fmt::layer().with_writer(non_blocking))
                .init();
        }

        Some(guard)
    } else if use_json {
        tracing_subscriber::fmt().json().with_env_filter(log_level).init();
        None
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level).compact().init();
        None
    }
}

// ── Panic hook + crash log ────────────────────────────────────────────────────

/// Install a custom panic hook that writes panic info + backtrace to
/// `{data_dir}/crash.log`. The crash log is surfaced and removed on the next
/// startup (`check_crash_log`).
fn install_panic_hook(data_dir: std::path::PathBuf) {
    let original = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        // Call the original hook first (prints to stderr).
        original(info);

        let crash_path = data_dir.join("crash.log");
        let msg = info
            .payload()
            .downcast_ref::<&str>()
            .copied()
            .or_else(|| info.payload().downcast_ref::<String>().map(|s| s.as_str()))
            .unwrap_or("unknown panic");

        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());

        let backtrace = std::backtrace::Backtrace::capture();
        let content = format!(
            "hubd panic at {location}\n\
             message: {msg}\n\
             version: {}\n\
             backtrace:\n{backtrace:#}\n",
            env!("CARGO_PKG_VERSION")
        );

        // Best-effort write — if this fails, we can't do much.
        let _ = std::fs::write(&crash_path, &content);
    }));
}

/// Check for a crash log from the previous run, log it at error level, then delete it.
fn check_crash_log(data_dir: &std::path::Path) {
    let crash_path = data_dir.join("crash.log");
    match std::fs::read_to_string(&crash_path) {
        Ok(content) => {
            tracing::error!(
                crash_report = %content.trim(),
                "previous gateway run ended with a panic — see crash report above"
            );
            let _ = std::fs::remove_file(&crash_path);
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            tracing::warn!(err = %e, "could not read crash.log");
        }
    }
}

// ── hubd account ──────────────────────────────────────────────────────────────

async fn run_account(config: &GatewayConfig, cmd: AccountCmd, quiet: bool) -> Result<()> {
    let storage = Storage::new(&config.data_dir).await?;
    let accounts = AccountStorage::new(storage.pool());

    match cmd {
        AccountCmd::Add { name } => {
            let account = accounts.create_account(&name).await?;
            if quiet {
                // Token only — pipeable.
                println!("{}", account.api_token);
            } else {
                println!("account created: {} ({})", account.name, account.id);
                println!();
                println!("API token (shown once — store it securely):");
                println!("  {}", account.api_token);
            }
        }
        AccountCmd::List => {
            let list = accounts.list_accounts().await?;
            if list.is_empty() {
                println!("no accounts — create one with: hubd account add <name>");
                return Ok(());
            }
            for a in list {
                let state = if a.revoked { "revoked" } else { "active" };
                println!("{}  {}  {}  created {}", a.id, state, a.name, a.created_at);
            }
        }
        AccountCmd::Revoke { id } => {
            if accounts.revoke_account(&id).await? {
                println!("account {id} revoked");
            } else {
                eprintln!("error: no active account with id {id}");
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

// ── hubd qr ───────────────────────────────────────────────────────────────────

async fn run_qr(config: &GatewayConfig) -> Result<()> {
    use std::net::{IpAddr, Ipv4Addr};

    let storage = Storage::new(&config.data_dir).await?;
    let gateway_id = identity::get_or_create(&storage).await?;

    let ip = local_ip_address::local_ip().unwrap_or_else(|_| {
        eprintln!("warning: could not detect local IP — using 127.0.0.1");
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    });

    let short_id = &gateway_id[..8.min(gateway_id.len())];
    let payload = format!(
        "hubd://connect?host={}&port={}&gateway={}",
        ip, config.port, short_id
    );

    let code = qrcode::QrCode::new(payload.as_bytes())
        .map_err(|e| anyhow::anyhow!("failed to generate QR code: {e}"))?;
    let image = code.render::<qrcode::render::unicode::Dense1x2>().build();
    println!("{}", image);
    println!("Scan from the device to connect to {ip}:{} — a pairing code is still required.", config.port);

    Ok(())
}

// ── hubd serve ────────────────────────────────────────────────────────────────

async fn run_server(
    port: Option<u16>,
    data_dir: Option<std::path::PathBuf>,
    log: Option<String>,
    bind_address: Option<String>,
    log_file: Option<std::path::PathBuf>,
) -> Result<()> {
    let config = Arc::new(GatewayConfig::new(port, data_dir, log, bind_address));

    let _log_guard = setup_logging(&config.log, log_file.as_deref(), &config.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), "hubd starting");
    info!(
        data_dir = %config.data_dir.display(),
        port = config.port,
        "config loaded"
    );

    // Panic hook: write crash.log on panic; surface the previous one, if any.
    install_panic_hook(config.data_dir.clone());
    check_crash_log(&config.data_dir);

    let storage = Arc::new(
        Storage::new_with_slow_query(
            &config.data_dir,
            config.observability.slow_query_threshold_ms,
        )
        .await?,
    );

    let gateway_id = match identity::get_or_create(&storage).await {
        Ok(id) => {
            info!(gateway_id = %id, "gateway identity ready");
            id
        }
        Err(e) => {
            warn!("failed to get gateway_id: {e:#}; proceeding without identity");
            String::new()
        }
    };

    let broadcaster = Arc::new(EventBroadcaster::new());

    let ctx = Arc::new(AppContext {
        config: config.clone(),
        storage,
        broadcaster,
        started_at: std::time::Instant::now(),
        gateway_id: gateway_id.clone(),
    });

    // ── mDNS advertisement ────────────────────────────────────────────────
    // Non-blocking: if mDNS fails (e.g. system restriction), the gateway continues.
    let _mdns_guard = mdns::advertise(&gateway_id, config.port);

    hubd::ipc::run(ctx).await
}
