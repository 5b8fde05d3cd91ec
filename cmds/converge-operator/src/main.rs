use std::{path::PathBuf, process::ExitCode, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use converge::{
	spawn_watchers, status, DesiredStateProvider, KubeResourceClient, ReconcileConfig,
	ReconcileLoop, Reconciler, ResourceKind, StaticDesiredState, Verifier,
};
use kube::{config::KubeConfigOptions, Client, Config};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};

mod telemetry;

#[derive(Parser)]
#[command(name = "converge-operator")]
#[command(about = "Keep a Deployment and its admission webhook configurations converged", long_about = None)]
#[command(version)]
struct Cli {
	/// YAML stream with the desired Deployment and webhook configurations
	#[arg(long)]
	templates: PathBuf,

	/// Reconcile settings file (YAML)
	#[arg(long)]
	config: Option<PathBuf>,

	/// Kubeconfig context to use instead of in-cluster or current-context discovery
	#[arg(long)]
	context: Option<String>,

	/// Log level (trace, debug, info, warn, error); overrides RUST_LOG
	#[arg(long)]
	log_level: Option<Level>,

	/// Override the periodic resync interval
	#[arg(long)]
	resync_interval_ms: Option<u64>,

	/// Override how many times a conflicting write is retried
	#[arg(long)]
	max_conflict_retries: Option<u32>,

	/// Reconcile every resource once, wait until the cluster matches, then exit
	#[arg(long)]
	once: bool,
}

impl Cli {
	fn reconcile_config(&self) -> Result<ReconcileConfig> {
		let mut config = match &self.config {
			Some(path) => ReconcileConfig::load_from_file(path)?,
			None => ReconcileConfig::default(),
		};
		if let Some(ms) = self.resync_interval_ms {
			config.resync_interval = Duration::from_millis(ms);
		}
		if let Some(retries) = self.max_conflict_retries {
			config.max_conflict_retries = retries;
		}
		Ok(config)
	}

	async fn kube_client(&self) -> Result<Client> {
		let config = match &self.context {
			Some(context) => Config::from_kubeconfig(&KubeConfigOptions {
				context: Some(context.clone()),
				..Default::default()
			})
			.await
			.with_context(|| format!("loading kubeconfig context {context}"))?,
			None => Config::infer().await.context("inferring kube config")?,
		};
		Client::try_from(config).context("building kube client")
	}
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
	let cli = Cli::parse();
	let _telemetry = telemetry::init(cli.log_level)?;

	let config = cli.reconcile_config()?;
	let desired = StaticDesiredState::from_file(&cli.templates)?;
	let managed = desired.managed();
	let client = cli.kube_client().await?;
	info!(
		resources = managed.len(),
		resync = ?config.resync_interval,
		"starting converge-operator"
	);

	let reconciler = Arc::new(Reconciler::new(
		KubeResourceClient::new(client.clone()),
		desired,
		config,
	));

	if cli.once {
		return converge_once(&reconciler).await;
	}

	let shutdown = CancellationToken::new();
	let control = ReconcileLoop::new(Arc::clone(&reconciler));
	let mut watchers = spawn_watchers(&client, &managed, &control.handle(), &shutdown);
	let mut control = tokio::spawn(control.run(shutdown.clone()));

	tokio::select! {
		signal = shutdown_signal() => {
			signal?;
			info!("shutdown requested");
		}
		joined = &mut control => {
			joined.context("reconcile loop panicked")?;
			warn!("reconcile loop exited on its own");
		}
	}
	shutdown.cancel();
	if !control.is_finished() {
		control.await.context("reconcile loop panicked")?;
	}
	while watchers.join_next().await.is_some() {}

	let report = status::collect(reconciler.client(), reconciler.tracker(), &managed).await;
	for component in &report.components {
		info!(
			resource = %component.resource,
			available = component.available,
			state = %component.state,
			"final status"
		);
	}
	Ok(ExitCode::SUCCESS)
}

/// One reconcile pass followed by verification that the cluster settled.
async fn converge_once(
	reconciler: &Reconciler<KubeResourceClient, StaticDesiredState>,
) -> Result<ExitCode> {
	let mut failed = false;
	for (resource, result) in reconciler.reconcile_all().await {
		match result {
			Ok(outcome) => info!(resource = %resource, ?outcome, "reconciled"),
			Err(err) => {
				error!(resource = %resource, error = %err, "reconcile failed");
				failed = true;
			}
		}
	}
	if failed {
		return Ok(ExitCode::FAILURE);
	}

	let verifier = Verifier::new(
		reconciler.client(),
		reconciler.config().wait_options(),
		CancellationToken::new(),
	);
	for resource in reconciler.provider().managed() {
		let desired = reconciler.provider().desired(&resource)?;
		let verified = match resource.kind {
			ResourceKind::Deployment => verifier.wait_until_available(&resource).await,
			_ => verifier.wait_until_synced(&resource, &desired).await,
		};
		if let Err(err) = verified {
			error!(resource = %resource, error = %err, "verification failed");
			failed = true;
		}
	}

	Ok(if failed {
		ExitCode::FAILURE
	} else {
		info!("all resources converged");
		ExitCode::SUCCESS
	})
}

async fn shutdown_signal() -> Result<()> {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{signal, SignalKind};

		let mut terminate =
			signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
		tokio::select! {
			ctrl_c = tokio::signal::ctrl_c() => ctrl_c.context("waiting for SIGINT")?,
			_ = terminate.recv() => {}
		}
	}
	#[cfg(not(unix))]
	tokio::signal::ctrl_c()
		.await
		.context("waiting for Ctrl-C")?;
	Ok(())
}
