//! Signalable notification targets: kick sources and IRQ triggers.

use std::{cell::Cell, fmt, io};

#[cfg(target_os = "linux")]
use vmm_sys_util::eventfd::EventFd;

thread_local! {
	/// Nesting depth of notifications delivered by the current thread.
	static SIGNAL_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Something that can be signalled, e.g. an eventfd.
pub trait Notifier: Send + Sync {
	fn notify(&self) -> io::Result<()>;
}

#[cfg(target_os = "linux")]
impl Notifier for EventFd {
	fn notify(&self) -> io::Result<()> {
		self.write(1)
	}
}

/// Adapts a closure into a [`Notifier`].
pub struct FnNotifier<F>(pub F);

impl<F> fmt::Debug for FnNotifier<F> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("FnNotifier").finish_non_exhaustive()
	}
}

impl<F: Fn() + Send + Sync> Notifier for FnNotifier<F> {
	fn notify(&self) -> io::Result<()> {
		(self.0)();
		Ok(())
	}
}

/// Whether the current thread may signal a notifier synchronously.
///
/// Signalling from inside another notification is not allowed, such work has to be deferred.
pub fn signal_allowed() -> bool {
	SIGNAL_DEPTH.with(|depth| depth.get() == 0)
}

/// Signals `notifier`, tracking the nesting for [`signal_allowed`].
pub fn signal(notifier: &dyn Notifier) -> io::Result<()> {
	SIGNAL_DEPTH.with(|depth| depth.set(depth.get() + 1));
	let res = notifier.notify();
	SIGNAL_DEPTH.with(|depth| depth.set(depth.get() - 1));
	res
}

#[cfg(test)]
mod tests {
	use std::sync::{
		Arc,
		atomic::{AtomicBool, AtomicUsize, Ordering},
	};

	use super::*;

	#[test]
	fn test_nested_signal_not_allowed() {
		let inner_allowed = Arc::new(AtomicBool::new(true));
		let flag = inner_allowed.clone();
		let notifier = FnNotifier(move || flag.store(signal_allowed(), Ordering::SeqCst));

		assert!(signal_allowed());
		signal(&notifier).unwrap();
		assert!(!inner_allowed.load(Ordering::SeqCst));
		assert!(signal_allowed());
	}

	#[test]
	fn test_fn_notifier_counts() {
		let count = Arc::new(AtomicUsize::new(0));
		let c = count.clone();
		let notifier = FnNotifier(move || {
			c.fetch_add(1, Ordering::SeqCst);
		});
		signal(&notifier).unwrap();
		signal(&notifier).unwrap();
		assert_eq!(count.load(Ordering::SeqCst), 2);
	}

	#[cfg(target_os = "linux")]
	#[test]
	fn test_eventfd_notifier() {
		let evt = EventFd::new(libc::EFD_NONBLOCK).unwrap();
		signal(&evt).unwrap();
		signal(&evt).unwrap();
		assert_eq!(evt.read().unwrap(), 2);
	}
}
