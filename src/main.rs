//! Host entry point: wire the stores, channels, pipeline, and health
//! subsystem together, then run until shutdown.

use message_agent::agent::{AgentDeps, AgentService, AgentSettings};
use message_agent::api::{ApiState, SseManager, start_http_server};
use message_agent::channel::{ChannelManager, TelegramChannel, WebChannel};
use message_agent::config::Config;
use message_agent::health::{ChannelMonitor, Heartbeat, MonitorConfig, RecoveryNotifier, TaskRecovery};
use message_agent::llm::LlmService;
use message_agent::mcp::McpManager;
use message_agent::skills::{SkillRegistry, loader};
use message_agent::storage::{HistoryStore, Journal};
use message_agent::tasks::{ConversationMutex, TaskManager, TaskStore};

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "message-agent", about = "Multi-channel conversational agent host")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Raise the default log level to debug.
    #[arg(long)]
    debug: bool,
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .compact()
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    let config_path = cli
        .config
        .or_else(|| std::env::var("MESSAGE_AGENT_CONFIG").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("config.yaml"));

    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            std::process::exit(1);
        }
    };

    if let Err(error) = run(config).await {
        tracing::error!(%error, "host failed");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    // Uncaught panics are logged, never fatal; the watchdog owns the
    // ultimate failure semantics.
    std::panic::set_hook(Box::new(|info| {
        tracing::error!(panic = %info, "uncaught panic");
    }));

    let data_root = config.data_root();
    std::fs::create_dir_all(&data_root)?;
    tracing::info!(data_root = %data_root.display(), persona = %config.persona.name, "starting host");

    // Storage layer.
    let history = Arc::new(HistoryStore::new(
        data_root.join("history"),
        config.history.max_segment_size_bytes,
        config.history.max_segments,
    ));
    history.migrate_legacy(&PathBuf::from("./data/history"))?;

    let journal = Arc::new(Journal::new(
        data_root.join("journal"),
        config.journal.enabled,
        config.journal.max_segment_size_bytes,
        config.journal.max_segments,
    ));
    let task_store = Arc::new(TaskStore::new(data_root.join("tasks")));

    // LLM backends.
    let http_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(120))
        .build()?;
    let llm = Arc::new(LlmService::from_config(&config.llm, &http_client)?);
    let verifier_llm = Arc::new(LlmService::from_review_config(
        &config.verification.llm_review,
        &config.llm,
        &http_client,
    )?);

    // Tools and skills.
    let mcp = Arc::new(McpManager::new(config.mcp.servers.clone()));
    mcp.connect_all().await;

    let skills = Arc::new(SkillRegistry::new());
    loader::load_skill_directories(&skills, &config.skills.directories).await;

    // Channels.
    let channels = Arc::new(ChannelManager::new());
    let sse = Arc::new(SseManager::new());
    let mut web_channel: Option<Arc<WebChannel>> = None;

    for (id, channel_config) in &config.channels {
        if !channel_config.enabled {
            continue;
        }
        match channel_config.channel_type.as_str() {
            "web" => {
                let channel = Arc::new(WebChannel::new(id.clone(), sse.clone()));
                channels.register(channel.clone()).await;
                web_channel.get_or_insert(channel);
            }
            "telegram" => {
                let token = channel_config.token.clone().unwrap_or_default();
                let channel =
                    Arc::new(TelegramChannel::new(id.clone(), token, http_client.clone()));
                channels.register(channel).await;
            }
            other => {
                tracing::warn!(channel = %id, channel_type = other, "no adapter for channel type, skipping");
            }
        }
    }

    // The web surface needs a web channel even when none is configured.
    let web_channel = match web_channel {
        Some(channel) => channel,
        None => {
            let channel = Arc::new(WebChannel::new("web", sse.clone()));
            channels.register(channel.clone()).await;
            channel
        }
    };

    // Pipeline.
    let tasks = Arc::new(TaskManager::new(
        task_store.clone(),
        journal.clone(),
        channels.clone(),
        config.task_persistence.enabled,
    ));
    let service = AgentService::new(
        AgentDeps {
            llm,
            verifier_llm,
            history: history.clone(),
            journal: journal.clone(),
            tasks: tasks.clone(),
            mutex: Arc::new(ConversationMutex::new()),
            channels: channels.clone(),
            tools: mcp.clone(),
            skills: skills.clone(),
        },
        AgentSettings::from_config(&config),
    );
    service.clone().install_builtin_executors().await;
    channels.set_handler(service.clone().handler()).await;

    channels.connect_all().await;

    // Post-restart recovery, after channels are reachable.
    let recovery_event_file = data_root.join("health").join("recovery-event.json");
    RecoveryNotifier::new(
        recovery_event_file,
        config.health.recovery_targets.clone(),
        channels.clone(),
    )
    .notify_if_restarted()
    .await;
    if config.task_persistence.recover_on_startup {
        TaskRecovery::new(task_store.clone(), journal.clone(), channels.clone())
            .recover()
            .await;
    }

    // Health subsystem.
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let heartbeat = Heartbeat::new(
        channels.clone(),
        data_root.join("health").join("heartbeat.json"),
        Duration::from_secs(config.health.heartbeat_interval_secs),
        config.health.port,
    );
    heartbeat.start(shutdown_rx.clone()).await?;

    let monitor = ChannelMonitor::new(
        channels.clone(),
        MonitorConfig {
            check_interval: Duration::from_secs(config.health.check_interval_secs),
            base_delay: Duration::from_millis(config.health.reconnect_base_delay_ms),
            max_delay: Duration::from_millis(config.health.reconnect_max_delay_ms),
            max_attempts: config.health.max_reconnect_attempts,
        },
    );
    tokio::spawn(monitor.run(shutdown_rx.clone()));

    // Web surface.
    if config.web.enabled {
        let state = Arc::new(ApiState {
            web_channel: web_channel.clone(),
            sse: sse.clone(),
            history: history.clone(),
            journal: journal.clone(),
            tasks: tasks.clone(),
            task_store: task_store.clone(),
            channels: channels.clone(),
            started: Instant::now(),
        });
        let bind = std::net::SocketAddr::from(([0, 0, 0, 0], config.web.port));
        start_http_server(bind, state, shutdown_rx.clone()).await?;
    }

    tracing::info!("host running");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    // Graceful teardown: stop timers and listeners, close transports.
    // In-flight pipelines are not cancelled; orphans reconcile on the
    // next start.
    let _ = shutdown_tx.send(true);
    channels.disconnect_all().await;
    mcp.disconnect_all().await;

    Ok(())
}
