//! idds CLI: runs agents and the broker coordinator, and submits and
//! inspects requests.

use idds_rs::agent::{Agent, AgentContext, AgentDeps, AgentRuntime, Carrier, Clerk, Transformer};
use idds_rs::config::secrets::expose_or_empty;
use idds_rs::config::{AgentConfig, BackendKind, Config, load_settings};
use idds_rs::db::Db;
use idds_rs::eventbus::{
    BrokerBackend, BrokerServer, BrokerSettings, CoalescingBackend, DbBackend, EventBus,
    EventBusBackend, MemoryBackend,
};
use idds_rs::model::{CommandType, NewCommand, NewRequest, RequestStatus, RequestUpdate};
use idds_rs::shutdown::Shutdown;
use idds_rs::store::{Claim, Store};
use idds_rs::telemetry::{TelemetryConfig, init_telemetry};
use idds_rs::workload::panda::PandaClient;
use clap::{Parser, Subcommand, ValueEnum};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "idds", about = "Event-driven request orchestration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run agents until interrupted
    Serve {
        /// Agents to run in this process
        #[arg(long, value_enum, value_delimiter = ',', default_value = "clerk,transformer,carrier")]
        agents: Vec<AgentKind>,
        /// Event bus backend, overriding the settings file
        #[arg(long)]
        backend: Option<String>,
    },
    /// Run the broker coordinator agents connect to
    Coordinator {
        /// Address to bind, overriding the settings file
        #[arg(long)]
        bind: Option<String>,
        /// Queue behind the coordinator: memory, coalescing, database, or
        /// broker to forward to another coordinator
        #[arg(long, default_value = "coalescing")]
        backend: String,
    },
    /// Request operations
    Request {
        #[command(subcommand)]
        action: RequestAction,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum AgentKind {
    Clerk,
    Transformer,
    Carrier,
}

#[derive(Subcommand)]
enum RequestAction {
    /// Submit a new request
    Submit {
        /// Request name
        name: String,
        /// Who is asking
        #[arg(long, default_value = "idds")]
        requester: String,
        /// Site whose throttler applies
        #[arg(long)]
        site: Option<String>,
        /// Priority (higher = polled first)
        #[arg(long, default_value_t = 0)]
        priority: i32,
        /// JSON array of works, one transform each
        #[arg(long)]
        works: Option<String>,
        /// Expire the request this many seconds from now
        #[arg(long)]
        expires_in: Option<i64>,
    },
    /// List requests
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<String>,
        /// Maximum requests to show
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show a request with its transforms and processings
    Show {
        /// Request ID
        id: i64,
    },
    /// Abort a request
    Abort {
        /// Request ID
        id: i64,
    },
    /// Resume a terminated request
    Resume {
        /// Request ID
        id: i64,
    },
    /// Wind a running request down, keeping what already completed
    Finish {
        /// Request ID
        id: i64,
        /// Stop running work too instead of letting it drain
        #[arg(long)]
        force: bool,
    },
    /// Pause a running request; `resume` picks it up again
    Suspend {
        /// Request ID
        id: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { agents, backend } => cmd_serve(agents, backend).await,
        Command::Coordinator { bind, backend } => cmd_coordinator(bind, backend).await,
        Command::Request { action } => {
            let config = Config::from_env()?;
            let db = Db::connect(config.database_url.expose_secret()).await?;
            db.migrate().await?;

            match action {
                RequestAction::Submit {
                    name,
                    requester,
                    site,
                    priority,
                    works,
                    expires_in,
                } => cmd_request_submit(&db, name, requester, site, priority, works, expires_in).await,
                RequestAction::List { status, limit } => cmd_request_list(&db, status, limit).await,
                RequestAction::Show { id } => cmd_request_show(&db, id).await,
                RequestAction::Abort { id } => cmd_request_command(&db, id, CommandType::AbortRequest).await,
                RequestAction::Resume { id } => cmd_request_command(&db, id, CommandType::ResumeRequest).await,
                RequestAction::Finish { id, force } => {
                    let status = if force {
                        RequestStatus::ToForceFinish
                    } else {
                        RequestStatus::ToFinish
                    };
                    cmd_request_status(&db, id, status).await
                }
                RequestAction::Suspend { id } => cmd_request_status(&db, id, RequestStatus::ToSuspend).await,
            }
        }
    }
}

fn stop_on_ctrl_c(shutdown: &Shutdown) {
    let shutdown = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("interrupted, stopping");
        shutdown.trigger();
    });
}

async fn cmd_serve(agents: Vec<AgentKind>, backend: Option<String>) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "idds".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let mut settings = config.settings()?;
    if let Some(backend) = backend {
        settings.eventbus.backend = backend.parse()?;
    }

    let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
    db.migrate().await?;

    let bus = Arc::new(EventBus::from_config(&settings.eventbus, Some(Arc::clone(&db)))?);
    let store: Arc<dyn Store> = db;
    let context = Arc::new(AgentContext::new());
    let deps = |config: &AgentConfig| {
        AgentDeps::new(
            config.clone(),
            Arc::clone(&bus),
            Arc::clone(&store),
            Arc::clone(&context),
        )
    };

    let shutdown = Shutdown::new();
    let mut runtimes = tokio::task::JoinSet::new();
    for kind in agents {
        let agent: Arc<dyn Agent> = match kind {
            AgentKind::Clerk => Arc::new(Clerk::new(deps(&settings.clerk))),
            AgentKind::Transformer => Arc::new(Transformer::new(deps(&settings.transformer))),
            AgentKind::Carrier => Arc::new(Carrier::new(
                deps(&settings.carrier),
                Arc::new(PandaClient::new(&settings.workload)?),
            )),
        };
        runtimes.spawn(AgentRuntime::new(agent, shutdown.clone()).run());
    }
    stop_on_ctrl_c(&shutdown);

    while let Some(joined) = runtimes.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("agent stopped with error: {e}"),
            Err(e) => error!("agent task panicked: {e}"),
        }
    }
    bus.stop().await;
    Ok(())
}

async fn cmd_coordinator(bind: Option<String>, backend: String) -> anyhow::Result<()> {
    let settings_path = std::env::var("IDDS_CONFIG").ok().map(PathBuf::from);
    let settings = load_settings(settings_path.as_deref())?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: std::env::var("OTEL_ENDPOINT").ok(),
        service_name: "idds-coordinator".to_string(),
        log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
    })?;

    let eventbus = &settings.eventbus;
    let shutdown = Shutdown::new();
    let queue: Arc<dyn EventBusBackend> = match backend.parse::<BackendKind>()? {
        BackendKind::Memory => Arc::new(MemoryBackend::new()),
        BackendKind::Coalescing => Arc::new(CoalescingBackend::new(
            eventbus.max_delay(),
            eventbus.clean_interval(),
        )),
        BackendKind::Database => {
            let config = Config::from_env()?;
            let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
            db.migrate().await?;
            Arc::new(
                DbBackend::new(db, eventbus.to_archive)
                    .processing_lease(Duration::from_secs(eventbus.processing_lease_secs)),
            )
        }
        BackendKind::Broker => {
            let (upstream, task) = BrokerBackend::start(BrokerSettings::from_config(eventbus));
            let stop = shutdown.clone();
            tokio::spawn(async move {
                stop.wait().await;
                task.abort();
            });
            upstream
        }
    };

    let listener = BrokerServer::new(bind.unwrap_or_else(|| eventbus.bind_addr.clone()), queue)
        .credentials(
            eventbus.username.clone().unwrap_or_default(),
            expose_or_empty(eventbus.password.as_ref()),
        )
        .bind()
        .await?;
    info!(endpoint = listener.endpoint(), %backend, "coordinator serving");

    stop_on_ctrl_c(&shutdown);
    listener.serve(shutdown).await?;
    Ok(())
}

async fn cmd_request_submit(
    db: &Db,
    name: String,
    requester: String,
    site: Option<String>,
    priority: i32,
    works: Option<String>,
    expires_in: Option<i64>,
) -> anyhow::Result<()> {
    let mut new = NewRequest::new(&name, &requester).priority(priority);
    if let Some(json) = works {
        let works: Vec<serde_json::Value> = serde_json::from_str(&json)?;
        new = new.works(works);
    }
    if let Some(ref site) = site {
        new = new.site(site);
    }
    if let Some(secs) = expires_in {
        new = new.expires_at(chrono::Utc::now() + chrono::Duration::seconds(secs));
    }

    let request = db.insert_request(new).await?;
    println!("Created: {} (status: {})", request.request_id, request.status);
    Ok(())
}

async fn cmd_request_list(db: &Db, status: Option<String>, limit: i64) -> anyhow::Result<()> {
    let status_filter: Option<RequestStatus> = match status {
        Some(s) => Some(
            s.parse()
                .map_err(|_| anyhow::anyhow!("invalid status: {s}"))?,
        ),
        None => None,
    };

    let requests = db.list_requests(status_filter, limit).await?;
    if requests.is_empty() {
        println!("No requests found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<24}  {:<14}  {:<4}  {:<12}  UPDATED",
        "ID", "NAME", "STATUS", "PRI", "SITE"
    );
    println!("{}", "-".repeat(90));

    for request in &requests {
        let name: String = request.name.chars().take(24).collect();
        println!(
            "{:<8}  {:<24}  {:<14}  {:<4}  {:<12}  {}",
            request.request_id,
            name,
            request.status,
            request.priority,
            request.site.as_deref().unwrap_or("-"),
            request.updated_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} request(s)", requests.len());
    Ok(())
}

async fn cmd_request_show(db: &Db, id: i64) -> anyhow::Result<()> {
    let request = db.get_request(id).await?;

    println!("ID:         {}", request.request_id);
    println!("Name:       {}", request.name);
    println!("Requester:  {}", request.requester);
    println!("Type:       {}", request.request_type);
    println!("Status:     {}", request.status);
    println!("Locking:    {}", request.locking);
    println!("Priority:   {}", request.priority);
    println!("Site:       {}", request.site.as_deref().unwrap_or("-"));
    println!(
        "Retries:    new {}/{}  update {}/{}",
        request.poll.new_retries,
        request.poll.max_new_retries,
        request.poll.update_retries,
        request.poll.max_update_retries
    );
    println!("Created:    {}", request.created_at);
    println!("Updated:    {}", request.updated_at);
    println!("Next Poll:  {}", request.next_poll_at);
    if let Some(expires) = request.expired_at {
        println!("Expires:    {expires}");
    }
    if let Some(ref errors) = request.errors {
        println!("Errors:     {}", serde_json::to_string_pretty(errors)?);
    }

    let transforms = db.transforms_of_request(id).await?;
    if transforms.is_empty() {
        return Ok(());
    }
    println!("---");
    for transform in &transforms {
        let processing = match transform.current_processing_id {
            Some(pid) => {
                let processing = db.get_processing(pid).await?;
                format!(
                    "processing {} {} (workload {})",
                    processing.processing_id,
                    processing.status,
                    processing.workload_id.as_deref().unwrap_or("-")
                )
            }
            None => "no processing".to_string(),
        };
        println!(
            "Transform {:<6} {:<20} {:<14} {processing}",
            transform.transform_id, transform.name, transform.status
        );
    }

    Ok(())
}

async fn cmd_request_command(db: &Db, id: i64, cmd_type: CommandType) -> anyhow::Result<()> {
    // Fail early on unknown ids rather than leaving a command nobody can apply.
    let request = db.get_request(id).await?;
    let command = db.insert_command(NewCommand::new(request.request_id, cmd_type)).await?;
    println!(
        "Queued {} as command {} (request status: {})",
        cmd_type, command.command_id, request.status
    );
    Ok(())
}

/// Move a running request into `status`; the clerk hands it down to the
/// transforms on its next poll.
async fn cmd_request_status(db: &Db, id: i64, status: RequestStatus) -> anyhow::Result<()> {
    let running = [
        RequestStatus::Transforming,
        RequestStatus::Building,
        RequestStatus::Resuming,
    ];
    match db.lock_request(id, &running).await? {
        Claim::Claimed(request) => {
            db.update_request(&RequestUpdate::new(id).status(status)).await?;
            println!("Request {id}: {} -> {status}", request.status);
            Ok(())
        }
        Claim::Busy => anyhow::bail!("request {id} is being updated by an agent, try again"),
        Claim::Ineligible => {
            let request = db.get_request(id).await?;
            anyhow::bail!("request {id} is {}, not running", request.status)
        }
    }
}
