use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use fleetd_protocol::EventType;
use log::{LevelFilter, debug, error, info};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use fleetd::api::{AppState, create_router};
use fleetd::config::{AppConfig, LogFormat, default_config_file};
use fleetd::events::{EventHub, HubSettings, RunMode};
use fleetd::host_api::{
    CredentialResolver, HostApi, HostApiClient, HostApiTimeouts, HostCredentialResolver,
};
use fleetd::hosts::{HostStore, JsonFileHostStore};
use fleetd::orchestrator::{
    ClientSettings, HostHealthHandler, HostLogsHandler, HostOperations, HostStatsHandler,
    HostVmEventHandler, HostWebSocketManager, ReconciliationLoop,
};

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging();
    debug!("configuration file: {}", ctx.config_path.display());

    match cli.command {
        Command::Serve(cmd) => async_main(ctx, cmd),
        Command::Config { command } => handle_config(&ctx, command),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "fleetd - orchestrator for a fleet of virtualization hosts.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true, env = "FLEETD_CONFIG")]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the daemon
    Serve(ServeCommand),
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum ModeArg {
    /// Serve the API and the event hub only
    Api,
    /// Also reconcile hosts and keep their event streams open
    #[default]
    Orchestrator,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Api => RunMode::Api,
            ModeArg::Orchestrator => RunMode::Orchestrator,
        }
    }
}

#[derive(Debug, Clone, Args)]
struct ServeCommand {
    /// Address to listen on (overrides server.bind)
    #[arg(long)]
    bind: Option<SocketAddr>,
    /// Treat every request as coming from an administrator
    #[arg(long)]
    dev_mode: bool,
    #[arg(long, value_enum, default_value_t = ModeArg::Orchestrator)]
    mode: ModeArg,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file path
    Path,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    common: CommonOpts,
    config_path: PathBuf,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let config_path = match common.config.clone() {
            Some(path) => path,
            None => default_config_file()?,
        };
        let config = AppConfig::load(Some(&config_path))
            .with_context(|| format!("loading {}", config_path.display()))?;
        Ok(Self {
            common,
            config_path,
            config,
        })
    }

    fn init_logging(&self) {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return;
        }

        let level = self.effective_log_level();
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            let level = level.to_string().to_lowercase();
            EnvFilter::new(format!("fleetd={level},tower_http={level}"))
        });

        if self.common.json || self.config.logging.format == LogFormat::Json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            let ansi = io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_ansi(ansi))
                .try_init()
                .ok();
        }

        // log macros go through env_logger when tracing-log did not claim the logger
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(level);
        builder.try_init().ok();
    }

    /// CLI flags win over `logging.level`.
    fn effective_log_level(&self) -> LevelFilter {
        if self.common.trace {
            LevelFilter::Trace
        } else if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => self
                    .config
                    .logging
                    .level
                    .parse()
                    .unwrap_or(LevelFilter::Info),
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

fn handle_config(ctx: &RuntimeContext, command: ConfigCommand) -> Result<()> {
    let mut stdout = io::stdout();
    match command {
        ConfigCommand::Show => {
            let rendered =
                toml::to_string_pretty(&ctx.config).context("rendering configuration")?;
            writeln!(stdout, "{rendered}")?;
        }
        ConfigCommand::Path => writeln!(stdout, "{}", ctx.config_path.display())?,
    }
    Ok(())
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    let config = &ctx.config;
    let mode = RunMode::from(cmd.mode);
    let shutdown = CancellationToken::new();

    let store_path = config.store.resolved_path()?;
    let store: Arc<dyn HostStore> = Arc::new(
        JsonFileHostStore::open(&store_path)
            .await
            .with_context(|| format!("opening host store {}", store_path.display()))?,
    );
    info!("host store: {}", store_path.display());

    let hub = Arc::new(EventHub::new(HubSettings::from(&config.events)));
    if config.events.enabled {
        hub.initialize(mode);
    }

    let http = reqwest::Client::builder()
        .build()
        .context("building HTTP client")?;
    let credentials: Arc<dyn CredentialResolver> = Arc::new(HostCredentialResolver::new(
        http.clone(),
        config.orchestrator.token_ttl(),
    ));
    let host_api: Arc<dyn HostApi> = Arc::new(HostApiClient::new(
        http,
        credentials.clone(),
        HostApiTimeouts {
            health: config.orchestrator.health_check_timeout(),
            request: config.orchestrator.request_timeout(),
            operation: config.orchestrator.operation_timeout(),
        },
    ));

    let reconciler = Arc::new(ReconciliationLoop::new(
        store.clone(),
        host_api.clone(),
        config.orchestrator.refresh_interval(),
        shutdown.child_token(),
    ));
    let operations = Arc::new(HostOperations::new(
        store.clone(),
        host_api,
        reconciler.clone(),
    ));

    let connections = Arc::new(HostWebSocketManager::new(
        ClientSettings::from(&config.websocket),
        credentials,
        hub.clone(),
        shutdown.child_token(),
    ));
    connections.register_handler(
        &[EventType::Health],
        Arc::new(HostHealthHandler::new(store.clone())),
    );
    connections.register_handler(
        &[EventType::SystemLogs],
        Arc::new(HostLogsHandler::new(hub.clone())),
    );
    connections.register_handler(
        &[EventType::Stats],
        Arc::new(HostStatsHandler::new(hub.clone())),
    );
    connections.register_handler(
        &[EventType::Pdfm],
        Arc::new(HostVmEventHandler::new(store.clone(), hub.clone())),
    );

    let orchestrating = matches!(mode, RunMode::Orchestrator);
    let (ready_tx, ready_rx) = watch::channel(false);
    if orchestrating && config.orchestrator.enabled {
        tokio::spawn(reconciler.clone().run(Some(ready_rx)));
    }
    if orchestrating && config.websocket.enabled {
        connections.start_connection_monitor(
            store.clone(),
            Duration::from_secs(config.websocket.monitor_interval_secs.max(1)),
        );
    }

    let state = AppState {
        hub: hub.clone(),
        store,
        reconciler,
        operations,
        connections: connections.clone(),
        dev_mode: cmd.dev_mode || config.server.dev_mode,
    };
    if state.dev_mode {
        info!("dev mode: every request is treated as an administrator");
    }
    let app = create_router(state);

    let addr = cmd.bind.unwrap_or(config.server.bind);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    info!("Listening on http://{}", addr);
    ready_tx.send(true).ok();

    let shutdown_signal = {
        let shutdown = shutdown.clone();
        let hub = hub.clone();
        let connections = connections.clone();
        async move {
            wait_for_signal().await;
            info!("Shutdown signal received");
            shutdown.cancel();
            connections.shutdown().await;
            // closes subscriber sockets so the server can drain
            hub.shutdown().await;
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("running server")?;

    info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
