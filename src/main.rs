use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio::signal::unix::SignalKind;
use uuid::Uuid;

use self::config::Config;
use self::global::Global;
use self::job::{ArchivistJob, Job, Priority};

mod config;
mod drive;
mod global;
mod job;
mod jobgroup;
mod logging;
mod management;
mod metrics;
mod model_api;
mod queue;
mod router;
mod shutdown;
mod store;
mod webhook;
mod worker;

#[derive(Parser)]
#[command(name = "archive-processor", about = "Background processing workers for the digital-asset archival platform")]
struct Cli {
	/// Optional JSON config file; environment variables win over it
	#[arg(long, short)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
	/// Run the roles enabled in configuration (default)
	Serve,
	/// Drain the legacy shared queue keys onto the namespaced keys
	MigrateQueues,
	/// Jobgroup operator tool
	Jobgroup {
		#[command(subcommand)]
		command: JobgroupCommand,
	},
}

#[derive(Subcommand)]
enum JobgroupCommand {
	/// Submit work for every asset in a batch
	Create {
		tenant_id: Uuid,
		batch_id: Uuid,
		/// instant, standard, or jobgroup
		mode: String,
	},
	/// Recent jobgroups, newest first
	List,
	/// One jobgroup as JSON
	Show { id: Uuid },
	/// Cancel a non-terminal jobgroup
	Cancel { id: Uuid },
}

#[tokio::main]
async fn main() {
	let cli = Cli::parse();

	let config = match Config::load(cli.config.as_deref()) {
		Ok(config) => config,
		Err(err) => {
			eprintln!("config error: {err:#}");
			std::process::exit(1);
		}
	};

	if let Err(err) = logging::init(&config.logging) {
		eprintln!("logging error: {err}");
		std::process::exit(1);
	}

	let result = match cli.command.unwrap_or(Command::Serve) {
		Command::Serve => serve(config).await,
		Command::MigrateQueues => migrate_queues(config).await,
		Command::Jobgroup { command } => jobgroup_tool(config, command).await,
	};

	if let Err(err) = result {
		tracing::error!("{err:#}");
		std::process::exit(1);
	}

	std::process::exit(0);
}

async fn serve(config: Config) -> anyhow::Result<()> {
	tracing::info!("starting archive processor");

	let global = Arc::new(Global::new(config).await.context("global setup")?);
	let controller = shutdown::Controller::new();

	let mut handles = Vec::new();

	if global.config().machinist.enabled {
		handles.push(tokio::spawn(worker::run_machinist(global.clone(), controller.subscribe())));
	}

	if global.config().archivist.enabled {
		handles.push(tokio::spawn(worker::run_archivist(global.clone(), controller.subscribe())));
		handles.push(tokio::spawn(jobgroup::poller::run(global.clone(), controller.subscribe())));
	}

	if global.config().management.enabled {
		handles.push(tokio::spawn(management::start(global.clone(), controller.subscribe())));
	}

	if handles.is_empty() {
		anyhow::bail!("no roles enabled; set machinist.enabled, archivist.enabled or management.enabled");
	}

	let mut interrupt = tokio::signal::unix::signal(SignalKind::interrupt()).context("interrupt handler")?;
	let mut terminate = tokio::signal::unix::signal(SignalKind::terminate()).context("terminate handler")?;

	{
		let joined = futures::future::try_join_all(handles.iter_mut().map(|handle| async move {
			handle.await.context("task panicked")?
		}));

		tokio::select! {
			_ = interrupt.recv() => {
				tracing::info!("received SIGINT, shutting down");
			}
			_ = terminate.recv() => {
				tracing::info!("received SIGTERM, shutting down");
			}
			result = joined => {
				match result {
					Ok(_) => tracing::warn!("tasks completed unexpectedly without error"),
					Err(err) => tracing::error!("task failed: {err:#}"),
				}
			}
		}
	}

	// In-flight jobs run to completion; a second signal forces the issue.
	tokio::select! {
		_ = interrupt.recv() => {
			tracing::warn!("received second signal, forcing exit");
		}
		_ = terminate.recv() => {
			tracing::warn!("received second signal, forcing exit");
		}
		result = tokio::time::timeout(std::time::Duration::from_secs(60), controller.shutdown()) => {
			if result.is_err() {
				tracing::warn!("shutdown timed out, forcing exit");
			} else {
				tracing::info!("archive processor stopped");
			}
		}
	}

	Ok(())
}

async fn migrate_queues(config: Config) -> anyhow::Result<()> {
	let list_store = queue::build_list_store(&config::ListStoreConfig::Redis(config.redis.clone()))
		.await
		.context("list store")?;

	let report = queue::migrate::migrate_legacy_queues(&list_store).await.context("migration")?;

	println!("migrated: {}", report.migrated);
	println!("dead-lettered: {}", report.dead_lettered);
	Ok(())
}

async fn jobgroup_tool(config: Config, command: JobgroupCommand) -> anyhow::Result<()> {
	use store::DataStore as _;

	let global = Arc::new(Global::new(config).await.context("global setup")?);

	match command {
		JobgroupCommand::Create {
			tenant_id,
			batch_id,
			mode,
		} => {
			let priority = match mode.as_str() {
				"instant" | "individual" => Priority::Instant,
				"standard" => Priority::Standard,
				"jobgroup" | "batch" => Priority::Jobgroup,
				other => anyhow::bail!("unknown mode {other:?}; expected instant, standard or jobgroup"),
			};

			let assets = global.store().list_batch_assets(tenant_id, batch_id).await.context("list assets")?;
			if assets.is_empty() {
				anyhow::bail!("no assets found for tenant {tenant_id} batch {batch_id}");
			}

			let jobs: Vec<ArchivistJob> = assets
				.iter()
				.map(|asset| ArchivistJob {
					job_type: "archivist".to_owned(),
					processing_type: priority,
					tenant_id,
					asset_id: asset.asset_id,
					batch_id: Some(batch_id),
				})
				.collect();

			if priority == Priority::Jobgroup {
				let submission = jobgroup::run_jobgroup(&global, &jobs).await.context("jobgroup submission")?;
				println!("{}", serde_json::to_string_pretty(&submission)?);
			} else {
				for job in &jobs {
					let job = Job::Archivist(job.clone());
					let key = router::resolve_queue(&job).context("routing")?;
					global.queue().push(key, &job).await.context("enqueue")?;
				}
				println!("enqueued {} jobs for batch {batch_id}", jobs.len());
			}
		}
		JobgroupCommand::List => {
			let jobgroups = global.store().list_jobgroups(50).await.context("list jobgroups")?;
			for jobgroup in jobgroups {
				println!(
					"{}  {:<12} tenant={} requests={} created={}",
					jobgroup.id,
					jobgroup.status.as_str(),
					jobgroup.tenant_id,
					jobgroup.request_count,
					jobgroup.created_at.to_rfc3339(),
				);
			}
		}
		JobgroupCommand::Show { id } => {
			let jobgroup = global
				.store()
				.get_jobgroup(id)
				.await
				.context("get jobgroup")?
				.with_context(|| format!("jobgroup {id} not found"))?;
			println!("{}", serde_json::to_string_pretty(&jobgroup)?);
		}
		JobgroupCommand::Cancel { id } => {
			let jobgroup = jobgroup::cancel(&global, id).await.context("cancel jobgroup")?;
			println!("jobgroup {} is now {}", jobgroup.id, jobgroup.status.as_str());
		}
	}

	Ok(())
}
