//! Long-running loop driving reconciles from ticks, watch events and requests.
//!
//! At most one reconcile per identity runs at a time. A trigger arriving while that
//! identity is busy is remembered and produces exactly one follow-up run, however many
//! triggers piled up in between.

use std::{
	collections::{HashMap, HashSet},
	sync::Arc,
};

use tokio::{
	sync::mpsc,
	task::{Id, JoinSet},
	time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

use crate::{
	client::ResourceClient,
	desired::DesiredStateProvider,
	reconcile::{ReconcileError, ReconcileOutcome, Reconciler},
	resource::ResourceRef,
};

/// Cheap handle for asking the loop to reconcile a resource.
#[derive(Debug, Clone)]
pub struct LoopHandle {
	tx: mpsc::UnboundedSender<ResourceRef>,
}

impl LoopHandle {
	/// Queue a reconcile. Returns `false` once the loop has stopped.
	pub fn request(&self, resource: ResourceRef) -> bool {
		self.tx.send(resource).is_ok()
	}
}

pub struct ReconcileLoop<C, P> {
	reconciler: Arc<Reconciler<C, P>>,
	tx: mpsc::UnboundedSender<ResourceRef>,
	rx: mpsc::UnboundedReceiver<ResourceRef>,
}

impl<C, P> ReconcileLoop<C, P>
where
	C: ResourceClient + 'static,
	P: DesiredStateProvider + 'static,
{
	pub fn new(reconciler: Arc<Reconciler<C, P>>) -> Self {
		let (tx, rx) = mpsc::unbounded_channel();
		Self { reconciler, tx, rx }
	}

	pub fn handle(&self) -> LoopHandle {
		LoopHandle {
			tx: self.tx.clone(),
		}
	}

	pub fn reconciler(&self) -> &Arc<Reconciler<C, P>> {
		&self.reconciler
	}

	/// Run until `shutdown` fires. In-flight reconciles are aborted on the way out.
	#[instrument(skip_all)]
	pub async fn run(self, shutdown: CancellationToken) {
		let Self {
			reconciler,
			tx: _tx,
			mut rx,
		} = self;
		let managed: HashSet<ResourceRef> = reconciler.provider().managed().into_iter().collect();
		let mut ticker = tokio::time::interval(reconciler.config().resync_interval);
		ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
		let mut scheduler = Scheduler::new(reconciler);

		info!(resources = managed.len(), "reconcile loop started");
		loop {
			tokio::select! {
				() = shutdown.cancelled() => break,
				_ = ticker.tick() => {
					debug!("resync");
					for resource in &managed {
						scheduler.schedule(resource.clone());
					}
				}
				Some(resource) = rx.recv() => {
					if managed.contains(&resource) {
						scheduler.schedule(resource);
					} else {
						debug!(resource = %resource, "ignoring request for unmanaged resource");
					}
				}
				Some(joined) = scheduler.tasks.join_next_with_id() => scheduler.finished(joined),
			}
		}

		scheduler.tasks.shutdown().await;
		info!("reconcile loop stopped");
	}
}

type TaskResult = Result<ReconcileOutcome, ReconcileError>;

struct Scheduler<C, P> {
	reconciler: Arc<Reconciler<C, P>>,
	tasks: JoinSet<TaskResult>,
	running: HashMap<Id, ResourceRef>,
	busy: HashSet<ResourceRef>,
	pending: HashSet<ResourceRef>,
}

impl<C, P> Scheduler<C, P>
where
	C: ResourceClient + 'static,
	P: DesiredStateProvider + 'static,
{
	fn new(reconciler: Arc<Reconciler<C, P>>) -> Self {
		Self {
			reconciler,
			tasks: JoinSet::new(),
			running: HashMap::new(),
			busy: HashSet::new(),
			pending: HashSet::new(),
		}
	}

	fn schedule(&mut self, resource: ResourceRef) {
		if self.busy.contains(&resource) {
			self.pending.insert(resource);
			return;
		}
		let reconciler = Arc::clone(&self.reconciler);
		let target = resource.clone();
		let handle = self
			.tasks
			.spawn(async move { reconciler.reconcile(&target).await });
		self.running.insert(handle.id(), resource.clone());
		self.busy.insert(resource);
	}

	fn finished(&mut self, joined: Result<(Id, TaskResult), tokio::task::JoinError>) {
		let id = match &joined {
			Ok((id, _)) => *id,
			Err(err) => err.id(),
		};
		let Some(resource) = self.running.remove(&id) else {
			return;
		};
		self.busy.remove(&resource);

		match joined {
			Ok((_, Ok(outcome))) => debug!(resource = %resource, ?outcome, "reconciled"),
			// already logged and recorded by the reconciler
			Ok((_, Err(_))) => {}
			Err(err) => error!(resource = %resource, error = %err, "reconcile task panicked"),
		}

		if self.pending.remove(&resource) {
			self.schedule(resource);
		}
	}
}
