//! Deferred, CPU-affine execution of interrupt injection and kick work.

use std::{
	collections::{BTreeMap, BTreeSet},
	fmt, io,
	sync::{Arc, Condvar, Mutex, mpsc},
	thread::{self, JoinHandle},
};

use core_affinity::CoreId;

/// A unit of deferred work. Queueing it while it is still pending is a no-op.
pub struct Work {
	name: String,
	func: Box<dyn Fn() + Send + Sync>,
	state: Mutex<WorkState>,
	idle: Condvar,
}

#[derive(Default)]
struct WorkState {
	pending: bool,
	running: bool,
}

impl fmt::Debug for Work {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Work").field("name", &self.name).finish()
	}
}

impl Work {
	pub fn new(name: impl Into<String>, func: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
		Arc::new(Self {
			name: name.into(),
			func: Box::new(func),
			state: Mutex::new(WorkState::default()),
			idle: Condvar::new(),
		})
	}

	/// Returns `false` if the work was already pending.
	fn mark_pending(&self) -> bool {
		let mut state = self.state.lock().unwrap();
		!std::mem::replace(&mut state.pending, true)
	}

	fn run(&self) {
		{
			let mut state = self.state.lock().unwrap();
			state.pending = false;
			state.running = true;
		}
		trace!("Running {}", self.name);
		(self.func)();
		let mut state = self.state.lock().unwrap();
		state.running = false;
		self.idle.notify_all();
	}

	/// Waits until the work is neither queued nor running.
	pub fn flush(&self) {
		let state = self.state.lock().unwrap();
		let _state = self
			.idle
			.wait_while(state, |state| state.pending || state.running)
			.unwrap();
	}

	pub fn is_pending(&self) -> bool {
		self.state.lock().unwrap().pending
	}
}

/// Set of host CPUs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuMask(BTreeSet<usize>);

impl CpuMask {
	pub fn new(cpus: impl IntoIterator<Item = usize>) -> Self {
		Self(cpus.into_iter().collect())
	}

	pub fn contains(&self, cpu: usize) -> bool {
		self.0.contains(&cpu)
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
		self.0.iter().copied()
	}

	/// The first CPU after `prev` (wrapping around) that satisfies `online`.
	///
	/// Starts from the lowest CPU if there is no previous one.
	pub fn next_after(&self, prev: Option<usize>, online: impl Fn(usize) -> bool) -> Option<usize> {
		let start = prev.map_or(0, |prev| prev + 1);
		self.0
			.range(start..)
			.chain(self.0.range(..start))
			.copied()
			.find(|cpu| online(*cpu))
	}
}

impl FromIterator<usize> for CpuMask {
	fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
		Self::new(iter)
	}
}

struct Worker {
	tx: Option<mpsc::Sender<Arc<Work>>>,
	handle: Option<JoinHandle<()>>,
}

impl Worker {
	fn spawn(name: String, cpu: Option<usize>) -> io::Result<Self> {
		let (tx, rx) = mpsc::channel::<Arc<Work>>();
		let handle = thread::Builder::new().name(name).spawn(move || {
			if let Some(cpu) = cpu {
				if !core_affinity::set_for_current(CoreId { id: cpu }) {
					warn!("Could not pin IRQ worker to CPU {cpu}");
				}
			}
			for work in rx {
				work.run();
			}
		})?;
		Ok(Self {
			tx: Some(tx),
			handle: Some(handle),
		})
	}

	fn submit(&self, work: Arc<Work>) {
		if let Some(tx) = &self.tx {
			if let Err(mpsc::SendError(work)) = tx.send(work) {
				// The worker is gone; run inline so flushes cannot hang.
				work.run();
			}
		}
	}
}

impl Drop for Worker {
	fn drop(&mut self) {
		drop(self.tx.take());
		if let Some(handle) = self.handle.take() {
			// The last handle may be dropped by a worker itself.
			if handle.thread().id() == thread::current().id() {
				return;
			}
			if handle.join().is_err() {
				error!("IRQ worker panicked");
			}
		}
	}
}

/// Worker threads executing deferred IRQ injection.
///
/// One thread is pinned to each configured CPU, plus one unbound thread for work without a CPU
/// preference.
pub struct IrqWorkers {
	bound: BTreeMap<usize, Worker>,
	unbound: Worker,
}

impl fmt::Debug for IrqWorkers {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("IrqWorkers")
			.field("cpus", &self.bound.keys().collect::<Vec<_>>())
			.finish()
	}
}

impl IrqWorkers {
	/// Spawns workers on `cpus`, or on every CPU of the host if `None`.
	pub fn new(cpus: Option<&[usize]>) -> io::Result<Self> {
		let cpus: Vec<usize> = match cpus {
			Some(cpus) => cpus.to_vec(),
			None => core_affinity::get_core_ids()
				.unwrap_or_default()
				.into_iter()
				.map(|core| core.id)
				.collect(),
		};
		debug!("Starting IRQ workers on CPUs {cpus:?}");

		let mut bound = BTreeMap::new();
		for cpu in cpus {
			bound.insert(cpu, Worker::spawn(format!("vduse-irq{cpu}"), Some(cpu))?);
		}
		Ok(Self {
			bound,
			unbound: Worker::spawn("vduse-irq".into(), None)?,
		})
	}

	/// CPUs that have a worker.
	pub fn cpus(&self) -> CpuMask {
		self.bound.keys().copied().collect()
	}

	pub fn is_online(&self, cpu: usize) -> bool {
		self.bound.contains_key(&cpu)
	}

	/// Queues `work` on `cpu`, or on the unbound worker.
	///
	/// Returns `false` if the work was already pending.
	pub fn queue(&self, work: &Arc<Work>, cpu: Option<usize>) -> bool {
		if !work.mark_pending() {
			return false;
		}
		let worker = cpu
			.and_then(|cpu| self.bound.get(&cpu))
			.unwrap_or(&self.unbound);
		worker.submit(work.clone());
		true
	}
}
