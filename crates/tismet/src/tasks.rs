use std::{
	io,
	sync::{
		atomic::{AtomicBool, Ordering},
		Arc,
	},
	thread,
	time::Duration,
};

use futures::executor::ThreadPool;

// Cancellation token for a periodic task; dropping it (or calling `cancel`)
// stops the task at its next wakeup.
pub(crate) struct ScheduledTaskHandle(Arc<AtomicBool>);

impl ScheduledTaskHandle {
	fn cancel(&self) {
		self.0.store(false, Ordering::Relaxed);
	}
}

impl Drop for ScheduledTaskHandle {
	fn drop(&mut self) {
		self.cancel();
	}
}

pub(crate) struct TaskRunner {
	pool: ThreadPool,
}

impl TaskRunner {
	pub fn new() -> Result<Self, io::Error> {
		// Periodic tasks occupy a pool thread for their whole lifetime, so
		// the pool must be larger than the handful of schedules plus the
		// I/O completions running through it.
		let threads = thread::available_parallelism()
			.map(|n| n.get())
			.unwrap_or(4)
			.max(8);
		Ok(Self {
			pool: ThreadPool::builder().pool_size(threads).create()?,
		})
	}

	pub fn run(&self, task: impl FnOnce() + Send + 'static) {
		self.pool.spawn_ok(async move { task() });
	}

	// Fires `task` every `period` until the returned handle is dropped. A
	// slow task delays its own next firing; periods never overlap.
	pub fn schedule(
		&self,
		task: impl Fn() + Send + 'static,
		period: Duration,
	) -> ScheduledTaskHandle {
		let alive = Arc::new(AtomicBool::new(true));
		let flag = Arc::clone(&alive);
		self.pool.spawn_ok(async move {
			loop {
				thread::sleep(period);
				if !flag.load(Ordering::Relaxed) {
					return;
				}
				task();
			}
		});
		ScheduledTaskHandle(alive)
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;
	use std::sync::mpsc;

	use super::*;

	#[test]
	fn run_executes_task() {
		let runner = TaskRunner::new().unwrap();
		let (tx, rx) = mpsc::channel();

		runner.run(move || tx.send(42).unwrap());

		assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);
	}

	#[test]
	fn scheduled_task_stops_when_handle_drops() {
		let runner = TaskRunner::new().unwrap();
		let count = Arc::new(AtomicUsize::new(0));
		let task_count = Arc::clone(&count);

		let handle = runner.schedule(
			move || {
				task_count.fetch_add(1, Ordering::Relaxed);
			},
			Duration::from_millis(10),
		);

		while count.load(Ordering::Relaxed) < 2 {
			thread::sleep(Duration::from_millis(5));
		}
		drop(handle);
		thread::sleep(Duration::from_millis(50));
		let after = count.load(Ordering::Relaxed);
		thread::sleep(Duration::from_millis(50));

		// At most one more firing can slip in after the handle drops.
		assert!(count.load(Ordering::Relaxed) <= after + 1);
	}
}
