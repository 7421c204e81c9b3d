/*!
# Completion context

Request completions and other callbacks are never run while the request
table is locked. They are handed to an [`Executor`] instead, which either
runs them right away on the calling thread or pushes them onto a queue
drained by a single tokio task. Either way callbacks submitted to one
executor (and its clones) run one at a time; the queue also keeps
submission order.

An inline executor serializes through a shared lock. A job which submits
further jobs to the same executor runs them nested, on the same thread.
*/
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::request::lock;

pub type Job = Box<dyn FnOnce() + Send>;

thread_local! {
	// inline executors whose lock this thread holds
	static HELD: RefCell<Vec<usize>> = RefCell::new(Vec::new());
}

#[derive(Clone, Debug)]
pub enum Executor {
	/// Run jobs on the submitting thread, after all locks are released,
	/// one at a time across all threads sharing this executor.
	Inline(Arc<Mutex<()>>),
	/// Run jobs on a dedicated task, in submission order.
	Queue(mpsc::UnboundedSender<Job>),
}

fn run_guarded(job: Job) {
	if catch_unwind(AssertUnwindSafe(job)).is_err() {
		warn!("completion callback panicked");
	}
}

fn run_serialized(serial: &Arc<Mutex<()>>, job: Job) {
	let key = Arc::as_ptr(serial) as usize;
	if HELD.with(|held| held.borrow().contains(&key)) {
		run_guarded(job);
		return;
	}
	let _guard = lock(serial);
	HELD.with(|held| held.borrow_mut().push(key));
	run_guarded(job);
	HELD.with(|held| held.borrow_mut().retain(|k| *k != key));
}

impl Default for Executor {
	fn default() -> Self {
		Self::inline()
	}
}

impl Executor {
	pub fn inline() -> Self {
		Self::Inline(Arc::default())
	}

	/// Spawn the draining task on the current tokio runtime.
	///
	/// The task ends once every clone of the returned executor is dropped.
	pub fn spawn_queue() -> (Self, JoinHandle<()>) {
		let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
		let task = tokio::spawn(async move {
			while let Some(job) = rx.recv().await {
				run_guarded(job);
			}
			debug!("completion queue closed");
		});
		(Self::Queue(tx), task)
	}

	pub fn execute<F: FnOnce() + Send + 'static>(&self, f: F) {
		match self {
			Self::Inline(serial) => run_serialized(serial, Box::new(f)),
			Self::Queue(tx) => {
				if let Err(mpsc::error::SendError(job)) = tx.send(Box::new(f)) {
					debug!("completion queue gone, running job inline");
					run_guarded(job);
				}
			}
		}
	}
}
