use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use remindr::{config::Config, processor::Collaborators, scheduler::SchedulerRunner, Remindr};
use remindr_server::{
    app::{self, AppState},
    auth::CronAuth,
    mailer::SmtpMailer,
    render::HtmlRenderer,
    telemetry,
};
use remindr_sqlx::{PgDirectory, RemindrPgBackend};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "remindr", version, about = "Email notification job queue")]
struct Cli {
    /// TOML configuration file. Environment variables override its values.
    #[arg(short, long, env = "REMINDR_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log as JSON lines.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve the HTTP trigger endpoints.
    Serve(InProcess),
    /// Deliver jobs continuously until interrupted.
    Work {
        /// Also run scheduler passes on `scheduler.cron`.
        #[arg(long)]
        with_scheduler: bool,
    },
    /// Run one scheduler pass and print the report.
    Schedule,
    /// Process one batch and print the report.
    Batch,
    /// Create or update the job table.
    Migrate,
}

#[derive(Args)]
struct InProcess {
    /// Also run a delivery worker.
    #[arg(long)]
    with_worker: bool,
    /// Also run scheduler passes on `scheduler.cron`.
    #[arg(long)]
    with_scheduler: bool,
}

struct Runtime {
    config: Config,
    backend: RemindrPgBackend,
    directory: Arc<PgDirectory>,
}

impl Runtime {
    async fn connect(config: Config) -> anyhow::Result<Self> {
        let backend = RemindrPgBackend::from_db_url(&config.database_url)
            .await
            .context("Failed to connect to the database")?;
        let directory = Arc::new(PgDirectory::from(&*backend));
        Ok(Self {
            config,
            backend,
            directory,
        })
    }

    fn collaborators(&self) -> anyhow::Result<Collaborators> {
        let mailer = SmtpMailer::from_config(&self.config.mail)?;
        Ok(Collaborators {
            users: self.directory.clone(),
            summaries: self.directory.clone(),
            renderer: Arc::new(HtmlRenderer::default()),
            mailer: Arc::new(mailer),
        })
    }

    fn scheduler_runner(&self) -> anyhow::Result<SchedulerRunner<RemindrPgBackend>> {
        let scheduler =
            remindr_server::scheduler(&self.config, self.backend.clone(), self.directory.clone())?;
        Ok(SchedulerRunner::new(scheduler, self.config.schedule()?))
    }

    fn in_process(
        &self,
        token: CancellationToken,
        with_worker: bool,
        with_scheduler: bool,
    ) -> anyhow::Result<Remindr> {
        let mut remindr = Remindr::with_cancellation_token(token);
        if with_worker {
            let processor = remindr_server::job_processor(
                &self.config,
                self.backend.clone(),
                self.collaborators()?,
            )?;
            remindr = remindr.with_worker(remindr_server::worker(&self.config, processor));
            tracing::info!("Started delivery worker");
        }
        if with_scheduler {
            remindr = remindr.with_scheduler(self.scheduler_runner()?);
            tracing::info!(cron = %self.config.scheduler.cron, "Started scheduler");
        }
        Ok(remindr)
    }
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            if let Err(error) = tokio::signal::ctrl_c().await {
                tracing::error!(%error, "Failed to listen for Ctrl-C");
                return;
            }
            tracing::info!("Shutting down");
            token.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init(cli.json_logs);

    let config = Config::load(cli.config.as_deref()).context("Invalid configuration")?;
    let runtime = Runtime::connect(config).await?;

    match cli.command {
        Command::Migrate => {
            runtime.backend.run_migrations().await?;
            tracing::info!("Migrations applied");
        }
        Command::Schedule => {
            let scheduler = remindr_server::scheduler(
                &runtime.config,
                runtime.backend.clone(),
                runtime.directory.clone(),
            )?;
            let report = scheduler.run_once(Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Batch => {
            let processor = remindr_server::job_processor(
                &runtime.config,
                runtime.backend.clone(),
                runtime.collaborators()?,
            )?;
            let report = remindr_server::batch_runner(&runtime.config, processor)
                .run()
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Work { with_scheduler } => {
            let token = shutdown_on_ctrl_c();
            runtime
                .in_process(token, true, with_scheduler)?
                .wait()
                .await?;
        }
        Command::Serve(InProcess {
            with_worker,
            with_scheduler,
        }) => {
            let token = shutdown_on_ctrl_c();
            let background = runtime.in_process(token.clone(), with_worker, with_scheduler)?;

            let config = &runtime.config;
            let auth = CronAuth::new(config.server.cron_secret.clone());
            if !auth.is_enabled() {
                tracing::warn!("server.cron_secret is not set, trigger endpoints are open");
            }
            let state = AppState::new(
                remindr_server::scheduler(
                    config,
                    runtime.backend.clone(),
                    runtime.directory.clone(),
                )?,
                remindr_server::batch_runner(
                    config,
                    remindr_server::job_processor(
                        config,
                        runtime.backend.clone(),
                        runtime.collaborators()?,
                    )?,
                ),
            );

            let address = config.bind_addr()?;
            let listener = tokio::net::TcpListener::bind(address)
                .await
                .with_context(|| format!("Failed to bind {address}"))?;
            tracing::info!(%address, "Listening");
            axum::serve(listener, app::router(state, auth))
                .with_graceful_shutdown(token.clone().cancelled_owned())
                .await?;

            background.graceful_shutdown().await?;
        }
    }
    Ok(())
}
