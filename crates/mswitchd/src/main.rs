mod file_poll;
mod http;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use mswitch_core::config::{
    AutoFailoverConfig, CutPolicy, IngestMode, MswitchFileConfig, RevertConfig, RevertPolicy,
    SwitchMode, Thresholds,
};
use mswitch_core::filter_adapter::NullFilterAdapter;
use mswitch_core::source::SourceTable;
use mswitch_core::state::ControllerStateConfig;
use mswitch_core::{Controller, ControllerConfig};

#[derive(Parser, Debug)]
#[command(name = "mswitchd", about = "Multi-source switch controller daemon")]
struct Args {
    /// Optional TOML config file; CLI flags override values it sets.
    #[arg(long)]
    config: Option<PathBuf>,

    /// `id=url(;id=url)*` source table.
    #[arg(long)]
    sources: Option<String>,

    /// `key=value,key=value,...` threshold overrides.
    #[arg(long)]
    thresholds: Option<String>,

    #[arg(long, value_name = "MODE")]
    mode: Option<String>,

    #[arg(long, value_name = "POLICY")]
    on_cut: Option<String>,

    #[arg(long)]
    freeze_ms: Option<u64>,

    #[arg(long)]
    buffer_ms: Option<u64>,

    #[arg(long, value_name = "MODE")]
    ingest_mode: Option<String>,

    #[arg(long, overrides_with = "no_auto_failover")]
    auto_failover: bool,

    #[arg(long, overrides_with = "auto_failover")]
    no_auto_failover: bool,

    #[arg(long, value_name = "POLICY")]
    revert_policy: Option<String>,

    #[arg(long)]
    health_window_ms: Option<u64>,

    #[arg(long)]
    recovery_delay_ms: Option<u64>,

    #[arg(long)]
    base_port: Option<u16>,

    #[arg(long)]
    output_port: Option<u16>,

    #[arg(long)]
    http_listen: Option<String>,

    #[arg(long)]
    cmd_file: Option<String>,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Merge CLI args over an optional file config, returning the concrete
/// values the daemon runs with. CLI flags win when both are present.
struct ResolvedConfig {
    sources: String,
    thresholds: Thresholds,
    mode: SwitchMode,
    on_cut: CutPolicy,
    freeze_ms: u64,
    buffer_ms: u64,
    ingest_mode: IngestMode,
    auto_failover: AutoFailoverConfig,
    revert: RevertConfig,
    base_port: u16,
    output_port: u16,
    http_listen: String,
    cmd_file: String,
}

fn resolve_config(args: &Args, file: Option<MswitchFileConfig>) -> anyhow::Result<ResolvedConfig> {
    let file = file.unwrap_or_default();

    let sources = args
        .sources
        .clone()
        .or(file.sources)
        .ok_or_else(|| anyhow::anyhow!("no sources configured: pass --sources or set it in --config"))?;

    let thresholds = match args.thresholds.as_deref().or(file.thresholds.as_deref()) {
        Some(spec) => Thresholds::parse(spec)?,
        None => Thresholds::default(),
    };

    let mode = match args.mode.as_deref().or(file.mode.as_deref()) {
        Some(s) => SwitchMode::from_str(s)?,
        None => SwitchMode::default(),
    };

    let on_cut = match args.on_cut.as_deref().or(file.on_cut.as_deref()) {
        Some(s) => CutPolicy::from_str(s)?,
        None => CutPolicy::default(),
    };

    let ingest_mode = match args.ingest_mode.as_deref().or(file.ingest_mode.as_deref()) {
        Some(s) => IngestMode::from_str(s)?,
        None => IngestMode::default(),
    };

    let auto_enabled = if args.no_auto_failover {
        false
    } else if args.auto_failover {
        true
    } else {
        file.auto_failover.unwrap_or(true)
    };

    let revert_policy = match args.revert_policy.as_deref().or(file.revert_policy.as_deref()) {
        Some(s) => RevertPolicy::from_str(s)?,
        None => RevertPolicy::default(),
    };

    let health_window_ms = args
        .health_window_ms
        .or(file.health_window_ms)
        .unwrap_or(AutoFailoverConfig::default().health_window_ms);

    let recovery_delay_ms = args
        .recovery_delay_ms
        .or(file.recovery_delay_ms)
        .unwrap_or(mswitch_core::DEFAULT_RECOVERY_DELAY_MS);

    Ok(ResolvedConfig {
        sources,
        thresholds,
        mode,
        on_cut,
        freeze_ms: args.freeze_ms.or(file.freeze_ms).unwrap_or(0),
        buffer_ms: args.buffer_ms.or(file.buffer_ms).unwrap_or(0),
        ingest_mode,
        auto_failover: AutoFailoverConfig {
            enabled: auto_enabled,
            health_window_ms,
            recovery_delay_ms,
        },
        revert: RevertConfig {
            policy: revert_policy,
            health_window_ms: args
                .health_window_ms
                .or(file.health_window_ms)
                .unwrap_or(RevertConfig::default().health_window_ms),
        },
        base_port: args.base_port.or(file.base_port).unwrap_or(mswitch_core::DEFAULT_BASE_PORT),
        output_port: args
            .output_port
            .or(file.output_port)
            .unwrap_or(mswitch_core::DEFAULT_OUTPUT_PORT),
        http_listen: args
            .http_listen
            .clone()
            .or(file.http_listen)
            .unwrap_or_else(|| mswitch_core::DEFAULT_HTTP_LISTEN.to_string()),
        cmd_file: args
            .cmd_file
            .clone()
            .or(file.cmd_file)
            .unwrap_or_else(|| mswitch_core::DEFAULT_CMD_FILE.to_string()),
    })
}

/// Runs the health + failover tick at three cadences raced in one
/// `select!`, mirroring `input_mux::run_health_monitor`'s health-channel
/// vs. activity-ticker race generalized to three plain interval ticks
/// (fine-grained liveness at 1 Hz, failover evaluation at 5 s, a coarser
/// heavy-check cadence at 30 s reserved for future downstream-signal
/// checks).
async fn run_health_and_failover(controller: Arc<Controller>, shutdown: CancellationToken) {
    let mut fine = tokio::time::interval(Duration::from_secs(1));
    let mut failover = tokio::time::interval(Duration::from_secs(5));
    let mut heavy = tokio::time::interval(Duration::from_secs(30));
    fine.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    failover.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    heavy.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(target: mswitch_core::LOG_TARGET, "health monitor shutting down");
                return;
            }
            _ = fine.tick() => {
                controller.health_tick(now_ms());
            }
            _ = failover.tick() => {
                controller.health_tick(now_ms());
            }
            _ = heavy.tick() => {
                // Reserved for downstream pipeline-derived signals
                // (duplicate-frame rate, drop rate, output frame rate)
                // once a real filter graph is attached.
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let file_config = if let Some(path) = &args.config {
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            error!(path = %path.display(), error = %e, "failed to read config file");
            e
        })?;
        let parsed: MswitchFileConfig = toml::from_str(&raw).map_err(|e| {
            error!(error = %e, "failed to parse config file");
            e
        })?;
        Some(parsed)
    } else {
        None
    };

    let resolved = resolve_config(&args, file_config)?;
    let sources = SourceTable::parse(&resolved.sources)?;

    info!(
        sources = resolved.sources.as_str(),
        mode = %resolved.mode,
        auto_failover = resolved.auto_failover.enabled,
        "mswitchd starting"
    );

    let controller = Controller::new(ControllerConfig {
        sources,
        state: ControllerStateConfig {
            initial_active_index: 0,
            mode: resolved.mode,
            on_cut: resolved.on_cut,
            freeze_on_cut_ms: resolved.freeze_ms,
            buffer_ms: resolved.buffer_ms,
            ingest_mode: resolved.ingest_mode,
        },
        queue_capacity: mswitch_core::DEFAULT_QUEUE_CAPACITY,
        thresholds: resolved.thresholds,
        auto_failover: resolved.auto_failover,
        revert: resolved.revert,
        filter: Box::new(NullFilterAdapter),
        startup_grace_ms: mswitch_core::STARTUP_GRACE_MS,
    });

    let shutdown = CancellationToken::new();

    let (receivers, output_socket) =
        mswitch_core::proxy::bind_sockets(&controller.sources, resolved.base_port, resolved.output_port).await?;

    let proxy_handle = {
        let controller = Arc::clone(&controller);
        let shutdown = shutdown.clone();
        tokio::spawn(mswitch_core::proxy::run(receivers, output_socket, controller, shutdown))
    };

    let health_handle = {
        let controller = Arc::clone(&controller);
        let shutdown = shutdown.clone();
        tokio::spawn(run_health_and_failover(controller, shutdown))
    };

    let actuator_handle = {
        let controller = Arc::clone(&controller);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { controller.run_actuator(shutdown).await })
    };

    let cmd_file = PathBuf::from(resolved.cmd_file);
    let file_poll_handle = {
        let controller = Arc::clone(&controller);
        let shutdown = shutdown.clone();
        let cmd_file = cmd_file.clone();
        tokio::spawn(file_poll::run(cmd_file, controller, shutdown))
    };

    let http_handle = {
        let controller = Arc::clone(&controller);
        let listen = resolved.http_listen.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let listener = match tokio::net::TcpListener::bind(&listen).await {
                Ok(l) => l,
                Err(err) => {
                    error!(listen = %listen, error = %err, "failed to bind http listener");
                    return;
                }
            };
            info!(target: mswitch_core::LOG_TARGET, addr = %listen, "http control surface listening");
            let app = http::build_router(controller);
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                shutdown.cancelled().await;
            });
            if let Err(err) = serve.await {
                warn!(target: mswitch_core::LOG_TARGET, error = %err, "http server exited with error");
            }
        })
    };

    tokio::signal::ctrl_c().await?;
    info!(target: mswitch_core::LOG_TARGET, "shutdown signal received");
    shutdown.cancel();

    let join_timeout = Duration::from_secs(5);
    let _ = tokio::time::timeout(join_timeout, proxy_handle).await;
    let _ = tokio::time::timeout(join_timeout, health_handle).await;
    let _ = tokio::time::timeout(join_timeout, actuator_handle).await;
    let _ = tokio::time::timeout(join_timeout, file_poll_handle).await;
    let _ = tokio::time::timeout(join_timeout, http_handle).await;

    controller.queue.drain();

    match tokio::fs::remove_file(&cmd_file).await {
        Ok(()) => info!(target: mswitch_core::LOG_TARGET, path = %cmd_file.display(), "command file unlinked"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(target: mswitch_core::LOG_TARGET, path = %cmd_file.display(), error = %err, "failed to unlink command file"),
    }

    info!(target: mswitch_core::LOG_TARGET, "mswitchd stopped");

    Ok(())
}
