//! Request/response pairing between the control plane and the userspace device.
//!
//! Requests wait in the send list until userspace reads them, then in the receive list until the
//! matching response arrives. Responses are matched by request id only, so userspace may answer in
//! any order. A request that is not answered in time breaks the device and fails every other
//! in-flight request.

use std::{
	collections::{HashMap, VecDeque},
	mem,
	sync::{
		Arc, Condvar, Mutex, MutexGuard, Weak,
		atomic::{AtomicBool, AtomicU64, Ordering},
	},
	time::{Duration, Instant},
};

use vduse_interface::{RawRequest, RawResponse, Request, ResponseResult};

use crate::{
	error::{Result, VduseError},
	params::MessageTimeout,
	stats::{DeviceEvent, DeviceStats},
};

struct PendingMessage {
	request: RawRequest,
	waker: Arc<Condvar>,
}

enum Completion {
	Responded(RawResponse),
	Failed,
}

#[derive(Default)]
struct MessageLists {
	send_list: VecDeque<PendingMessage>,
	recv_list: VecDeque<PendingMessage>,
	completed: HashMap<u64, Completion>,
	broken: bool,
}

fn take(list: &mut VecDeque<PendingMessage>, request_id: u64) -> Option<PendingMessage> {
	let pos = list
		.iter()
		.position(|msg| msg.request.request_id == request_id)?;
	list.remove(pos)
}

impl MessageLists {
	fn remove(&mut self, request_id: u64) -> Option<PendingMessage> {
		take(&mut self.send_list, request_id).or_else(|| take(&mut self.recv_list, request_id))
	}

	/// Marks the device broken and fails everything in flight.
	fn fail_all(&mut self) {
		self.broken = true;
		let send_list = mem::take(&mut self.send_list);
		let recv_list = mem::take(&mut self.recv_list);
		for msg in send_list.into_iter().chain(recv_list) {
			self.completed
				.insert(msg.request.request_id, Completion::Failed);
			msg.waker.notify_one();
		}
	}
}

/// The message lists of one device.
pub struct MessageQueue {
	lists: Arc<Mutex<MessageLists>>,
	/// Signalled whenever a request is appended to the send list.
	readable: Condvar,
	next_id: AtomicU64,
	/// Zero waits forever.
	timeout_ms: AtomicU64,
	stats: Arc<DeviceStats>,
}

impl MessageQueue {
	pub(crate) fn new(timeout: MessageTimeout, stats: Arc<DeviceStats>) -> Self {
		let queue = Self {
			lists: Default::default(),
			readable: Condvar::new(),
			next_id: AtomicU64::new(0),
			timeout_ms: AtomicU64::new(0),
			stats,
		};
		queue.set_timeout(timeout);
		queue
	}

	fn lock(&self) -> MutexGuard<'_, MessageLists> {
		self.lists.lock().unwrap()
	}

	pub fn timeout(&self) -> MessageTimeout {
		Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed)).into()
	}

	pub fn set_timeout(&self, timeout: MessageTimeout) {
		let ms = timeout
			.get()
			.map_or(0, |t| u64::try_from(t.as_millis().max(1)).unwrap_or(u64::MAX));
		self.timeout_ms.store(ms, Ordering::Relaxed);
	}

	pub fn is_broken(&self) -> bool {
		self.lock().broken
	}

	/// Clears the broken state. Only a fresh connection may do this.
	pub(crate) fn clear_broken(&self) {
		self.lock().broken = false;
	}

	/// Number of requests waiting to be read and waiting for a response.
	pub fn pending(&self) -> (usize, usize) {
		let lists = self.lock();
		(lists.send_list.len(), lists.recv_list.len())
	}

	/// Queues `request` and blocks until it is answered, times out or is cancelled.
	///
	/// Succeeds iff userspace answered with [`ResponseResult::Ok`].
	pub fn send_and_wait(
		&self,
		request: Request,
		cancel: Option<&CancelToken>,
	) -> Result<RawResponse> {
		let mut lists = self.lock();
		if lists.broken {
			return Err(VduseError::Broken);
		}

		let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let waker = Arc::new(Condvar::new());
		lists.send_list.push_back(PendingMessage {
			request: request.encode(request_id),
			waker: waker.clone(),
		});
		self.stats
			.increment_val(DeviceEvent::Request(request.request_type()));
		trace!("Queued request {request_id}: {request:?}");
		self.readable.notify_all();

		let _registration = cancel.map(|token| token.register(&self.lists, &waker));
		let deadline = self
			.timeout()
			.get()
			.and_then(|timeout| Instant::now().checked_add(timeout));

		let completion = loop {
			if let Some(completion) = lists.completed.remove(&request_id) {
				break completion;
			}
			if cancel.is_some_and(CancelToken::is_cancelled) {
				lists.remove(request_id);
				debug!("Request {request_id} interrupted");
				return Err(VduseError::Interrupted(request_id));
			}
			lists = match deadline {
				None => waker.wait(lists).unwrap(),
				Some(deadline) => {
					let now = Instant::now();
					if now >= deadline {
						lists.remove(request_id);
						error!("Request {request_id} ({request:?}) timed out, device is broken");
						self.stats.increment_val(DeviceEvent::RequestTimeout);
						lists.fail_all();
						return Err(VduseError::Timeout(request_id));
					}
					waker.wait_timeout(lists, deadline - now).unwrap().0
				}
			};
		};

		match completion {
			Completion::Responded(resp) if resp.result() == Ok(ResponseResult::Ok) => Ok(resp),
			Completion::Responded(_) => {
				self.stats.increment_val(DeviceEvent::RequestFailed);
				Err(VduseError::RequestFailed(request_id))
			}
			Completion::Failed => Err(VduseError::Broken),
		}
	}

	/// Hands the oldest queued request to `copy_out` and moves it to the receive list.
	///
	/// If `copy_out` fails the request goes back to the head of the send list unchanged.
	pub fn dequeue_request<F>(&self, nonblocking: bool, copy_out: F) -> Result<RawRequest>
	where
		F: FnOnce(&RawRequest) -> std::io::Result<()>,
	{
		let mut lists = self.lock();
		let msg = loop {
			if let Some(msg) = lists.send_list.pop_front() {
				break msg;
			}
			if nonblocking {
				return Err(VduseError::WouldBlock);
			}
			lists = self.readable.wait(lists).unwrap();
		};

		if let Err(err) = copy_out(&msg.request) {
			lists.send_list.push_front(msg);
			return Err(err.into());
		}
		let request = msg.request;
		trace!("Request {} read by userspace", request.request_id);
		lists.recv_list.push_back(msg);
		Ok(request)
	}

	/// Completes the request `resp` answers.
	pub fn complete(&self, resp: RawResponse) -> Result<()> {
		let mut lists = self.lock();
		let Some(msg) = take(&mut lists.recv_list, resp.request_id) else {
			warn!("Response for unknown request {}", resp.request_id);
			self.stats.increment_val(DeviceEvent::StaleResponse);
			return Err(VduseError::UnknownRequest(resp.request_id));
		};
		trace!("Request {} answered with {}", resp.request_id, resp.result);
		lists
			.completed
			.insert(resp.request_id, Completion::Responded(resp));
		msg.waker.notify_one();
		Ok(())
	}

	/// Requeues everything userspace read but did not answer, ahead of unread requests.
	pub(crate) fn release(&self) {
		let mut lists = self.lock();
		let recv_list = mem::take(&mut lists.recv_list);
		if !recv_list.is_empty() {
			debug!("Requeueing {} unanswered requests", recv_list.len());
		}
		for msg in recv_list.into_iter().rev() {
			lists.send_list.push_front(msg);
		}
		self.readable.notify_all();
	}

	/// Waits until a request can be read. `None` waits forever.
	pub fn poll(&self, timeout: Option<Duration>) -> bool {
		let lists = self.lock();
		let lists = match timeout {
			None => self
				.readable
				.wait_while(lists, |lists| lists.send_list.is_empty())
				.unwrap(),
			Some(timeout) => {
				self.readable
					.wait_timeout_while(lists, timeout, |lists| lists.send_list.is_empty())
					.unwrap()
					.0
			}
		};
		!lists.send_list.is_empty()
	}
}

struct CancelInner {
	cancelled: AtomicBool,
	waits: Mutex<Vec<(Weak<Mutex<MessageLists>>, Weak<Condvar>)>>,
}

/// Interrupts blocked [`MessageQueue::send_and_wait`] calls, like a signal would.
///
/// Cancellation fails the waiting calls with [`VduseError::Interrupted`] without breaking the
/// device.
#[derive(Clone)]
pub struct CancelToken {
	inner: Arc<CancelInner>,
}

impl Default for CancelToken {
	fn default() -> Self {
		Self::new()
	}
}

impl CancelToken {
	pub fn new() -> Self {
		Self {
			inner: Arc::new(CancelInner {
				cancelled: AtomicBool::new(false),
				waits: Mutex::new(Vec::new()),
			}),
		}
	}

	pub fn is_cancelled(&self) -> bool {
		self.inner.cancelled.load(Ordering::Acquire)
	}

	pub fn cancel(&self) {
		self.inner.cancelled.store(true, Ordering::Release);
		let waits = self.inner.waits.lock().unwrap().clone();
		for (lists, waker) in waits {
			let (Some(lists), Some(waker)) = (lists.upgrade(), waker.upgrade()) else {
				continue;
			};
			// Taking the lists lock orders the wakeup after the waiter's check.
			let _lists = lists.lock().unwrap();
			waker.notify_all();
		}
	}

	fn register(&self, lists: &Arc<Mutex<MessageLists>>, waker: &Arc<Condvar>) -> Registration {
		self.inner
			.waits
			.lock()
			.unwrap()
			.push((Arc::downgrade(lists), Arc::downgrade(waker)));
		Registration {
			token: self.clone(),
			waker: Arc::downgrade(waker),
		}
	}
}

struct Registration {
	token: CancelToken,
	waker: Weak<Condvar>,
}

impl Drop for Registration {
	fn drop(&mut self) {
		self.token
			.inner
			.waits
			.lock()
			.unwrap()
			.retain(|(_, waker)| !waker.ptr_eq(&self.waker));
	}
}
