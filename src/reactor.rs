//! The reactor: a cooperatively-scheduled worker thread that runs I/O
//! completion handlers for the sessions attached to it.
//!
//! Each reactor owns exactly one worker thread driving a current-thread
//! tokio runtime. Everything a session does — accepts, connects, reads,
//! writes, handshakes — happens as tasks on that runtime, so within one
//! reactor all handlers run serially and never race each other.
//! Multi-core servers compose several reactors and shard sessions across
//! them at accept time.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use futures::FutureExt;
use tokio::sync::mpsc::{self, error::TryRecvError, UnboundedReceiver, UnboundedSender};
use tracing::error;

use crate::config::ReactorConfig;
use crate::error::Error;
use crate::event::{NullHandler, ReactorHandler};

type Job = Box<dyn FnOnce() + Send + 'static>;
type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

enum Work {
    Job(Job),
    Spawn(Task),
    Stop,
}

/// A handle to a reactor. Clones share the same worker.
#[derive(Clone)]
pub struct Reactor {
    shared: Arc<Shared>,
}

struct Shared {
    handler: Arc<dyn ReactorHandler>,
    started: AtomicBool,
    default_polling: bool,
    state: Mutex<State>,
    worker_thread: Mutex<Option<thread::ThreadId>>,
    signal: Mutex<()>,
    cond: Condvar,
}

#[derive(Default)]
struct State {
    queue: Option<UnboundedSender<Work>>,
    worker: Option<thread::JoinHandle<()>>,
    polling: bool,
}

impl Default for Reactor {
    fn default() -> Reactor {
        Reactor::new()
    }
}

impl Reactor {
    pub fn new() -> Reactor {
        Reactor::with_handler(Arc::new(NullHandler))
    }

    pub fn with_handler(handler: Arc<dyn ReactorHandler>) -> Reactor {
        Reactor::with_config(&ReactorConfig::default(), handler)
    }

    pub fn with_config(config: &ReactorConfig, handler: Arc<dyn ReactorHandler>) -> Reactor {
        Reactor {
            shared: Arc::new(Shared {
                handler,
                started: AtomicBool::new(false),
                default_polling: config.polling,
                state: Mutex::new(State::default()),
                worker_thread: Mutex::new(None),
                signal: Mutex::new(()),
                cond: Condvar::new(),
            }),
        }
    }

    /// Start the worker in the configured mode. Returns `false` when the
    /// reactor is already running.
    pub fn start(&self) -> bool {
        self.launch(self.shared.default_polling)
    }

    /// Start the worker in polling mode: a tight non-blocking drain with an
    /// `on_idle` tick per iteration.
    pub fn start_polling(&self) -> bool {
        self.launch(true)
    }

    /// Stop the worker: everything already scheduled still runs, then the
    /// thread exits and is joined. Returns `false` when not running.
    pub fn stop(&self) -> bool {
        let (queue, worker) = {
            let mut state = self.shared.state.lock().unwrap();
            match state.queue.take() {
                Some(queue) => (queue, state.worker.take()),
                None => return false,
            }
        };

        let shared = self.shared.clone();
        let _ = queue.send(Work::Job(Box::new(move || {
            shared.set_started(false);
            shared.handler.on_stopped();
        })));
        let _ = queue.send(Work::Stop);
        drop(queue);

        if let Some(worker) = worker {
            // A handler may stop its own reactor; the worker then unwinds
            // on its own instead of being joined.
            if worker.thread().id() != thread::current().id() {
                let _ = worker.join();
            }
        }
        true
    }

    /// Stop, wait for the worker to wind down, start again in the same mode.
    pub fn restart(&self) -> bool {
        let polling = self.shared.state.lock().unwrap().polling;
        if !self.stop() {
            return false;
        }
        self.wait_stopped();
        self.launch(polling)
    }

    /// Schedule `f` to run on the worker, even when the caller already is
    /// the worker.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.enqueue(Work::Job(Box::new(f)));
    }

    /// Run `f` inline when the caller is the worker, otherwise post it.
    pub fn dispatch<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_worker() {
            f()
        } else {
            self.post(f)
        }
    }

    /// Schedule an I/O chain on the worker's runtime. The task is cancelled
    /// when the reactor stops.
    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.enqueue(Work::Spawn(Box::pin(future)));
    }

    pub fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    /// Block until the `on_started` callback has run.
    pub fn wait_started(&self) {
        self.shared.wait(|shared| shared.started.load(Ordering::SeqCst));
    }

    /// Block until the worker has acknowledged the stop.
    pub fn wait_stopped(&self) {
        self.shared.wait(|shared| !shared.started.load(Ordering::SeqCst));
    }

    pub(crate) fn handler(&self) -> &Arc<dyn ReactorHandler> {
        &self.shared.handler
    }

    fn launch(&self, polling: bool) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if state.queue.is_some() {
            return false;
        }

        let (queue, incoming) = mpsc::unbounded_channel();
        let shared = self.shared.clone();
        let worker = thread::Builder::new()
            .name("zeehond-reactor".into())
            .spawn(move || worker_loop(shared, incoming, polling));
        let worker = match worker {
            Ok(worker) => worker,
            Err(err) => {
                drop(state);
                self.shared.handler.on_error(&Error::from(err));
                return false;
            }
        };

        state.queue = Some(queue.clone());
        state.worker = Some(worker);
        state.polling = polling;
        drop(state);

        let shared = self.shared.clone();
        let _ = queue.send(Work::Job(Box::new(move || {
            shared.set_started(true);
            shared.handler.on_started();
        })));
        true
    }

    fn enqueue(&self, work: Work) {
        let state = self.shared.state.lock().unwrap();
        if let Some(queue) = &state.queue {
            // A send error means the worker is past its drain; the work is
            // dropped, same as scheduling onto a stopped reactor.
            let _ = queue.send(work);
        }
    }

    fn is_worker(&self) -> bool {
        *self.shared.worker_thread.lock().unwrap() == Some(thread::current().id())
    }
}

impl Shared {
    fn set_started(&self, value: bool) {
        let _guard = self.signal.lock().unwrap();
        self.started.store(value, Ordering::SeqCst);
        self.cond.notify_all();
    }

    fn wait<F>(&self, pred: F)
    where
        F: Fn(&Shared) -> bool,
    {
        let mut guard = self.signal.lock().unwrap();
        while !pred(self) {
            guard = self.cond.wait(guard).unwrap();
        }
    }
}

enum Flow {
    Continue,
    Stop,
}

fn worker_loop(shared: Arc<Shared>, mut queue: UnboundedReceiver<Work>, polling: bool) {
    *shared.worker_thread.lock().unwrap() = Some(thread::current().id());
    shared.handler.on_thread_initialize();

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build();
    let runtime = match runtime {
        Ok(runtime) => runtime,
        Err(err) => {
            shared.handler.on_error(&Error::from(err));
            *shared.worker_thread.lock().unwrap() = None;
            shared.handler.on_thread_cleanup();
            return;
        }
    };

    runtime.block_on(async {
        if polling {
            loop {
                loop {
                    match queue.try_recv() {
                        Ok(work) => {
                            if let Flow::Stop = perform(work) {
                                return;
                            }
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => return,
                    }
                }
                shared.handler.on_idle();
                // Let the I/O chains spawned on this runtime make progress.
                tokio::task::yield_now().await;
            }
        } else {
            while let Some(work) = queue.recv().await {
                if let Flow::Stop = perform(work) {
                    break;
                }
            }
        }
    });

    // Anything still queued was scheduled before the stop and is owed a run.
    while let Ok(work) = queue.try_recv() {
        if let Work::Job(job) = work {
            run_job(job);
        }
    }

    // Dropping the runtime cancels whatever I/O chains are still pending.
    drop(runtime);
    *shared.worker_thread.lock().unwrap() = None;
    shared.handler.on_thread_cleanup();
}

fn perform(work: Work) -> Flow {
    match work {
        Work::Job(job) => {
            run_job(job);
            Flow::Continue
        }
        Work::Spawn(task) => {
            tokio::spawn(async move {
                if let Err(panic) = std::panic::AssertUnwindSafe(task).catch_unwind().await {
                    fatality(panic);
                }
            });
            Flow::Continue
        }
        Work::Stop => Flow::Stop,
    }
}

fn run_job(job: Job) {
    if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
        fatality(panic);
    }
}

/// An escaped panic inside the loop is fatal: the engine's state can no
/// longer be trusted, so the process goes down rather than limping on.
fn fatality(panic: Box<dyn std::any::Any + Send>) -> ! {
    let message = panic
        .downcast_ref::<&str>()
        .copied()
        .map(String::from)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "reactor worker terminated".into());
    error!(%message, "fatal error in reactor loop");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Probe {
        started: AtomicUsize,
        stopped: AtomicUsize,
        initialized: AtomicUsize,
        cleaned: AtomicUsize,
        idled: AtomicBool,
    }

    impl ReactorHandler for Probe {
        fn on_started(&self) {
            self.started.fetch_add(1, Ordering::SeqCst);
        }
        fn on_stopped(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
        fn on_idle(&self) {
            self.idled.store(true, Ordering::SeqCst);
        }
        fn on_thread_initialize(&self) {
            self.initialized.fetch_add(1, Ordering::SeqCst);
        }
        fn on_thread_cleanup(&self) {
            self.cleaned.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn start_stop_twice_fires_thread_hooks_twice() {
        let probe = Arc::new(Probe::default());
        let reactor = Reactor::with_handler(probe.clone());

        for _ in 0..2 {
            assert!(reactor.start());
            reactor.wait_started();
            assert!(!reactor.start());
            assert!(reactor.stop());
            assert!(!reactor.is_started());
        }
        assert!(!reactor.stop());

        assert_eq!(probe.started.load(Ordering::SeqCst), 2);
        assert_eq!(probe.stopped.load(Ordering::SeqCst), 2);
        assert_eq!(probe.initialized.load(Ordering::SeqCst), 2);
        assert_eq!(probe.cleaned.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn posted_jobs_run_in_order_on_the_worker() {
        let reactor = Reactor::new();
        assert!(reactor.start());
        reactor.wait_started();

        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..16 {
            let order = order.clone();
            reactor.post(move || order.lock().unwrap().push(n));
        }
        // `stop` drains everything scheduled before it.
        assert!(reactor.stop());
        assert_eq!(*order.lock().unwrap(), (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn dispatch_runs_inline_on_the_worker() {
        let reactor = Reactor::new();
        assert!(reactor.start());
        reactor.wait_started();

        let inline = Arc::new(AtomicBool::new(false));
        let observed = Arc::new(AtomicBool::new(false));
        {
            let reactor = reactor.clone();
            let inline = inline.clone();
            let observed = observed.clone();
            reactor.clone().post(move || {
                // Already on the worker: dispatch must not defer.
                reactor.dispatch({
                    let inline = inline.clone();
                    move || inline.store(true, Ordering::SeqCst)
                });
                observed.store(inline.load(Ordering::SeqCst), Ordering::SeqCst);
            });
        }
        reactor.stop();
        assert!(observed.load(Ordering::SeqCst));
    }

    #[test]
    fn polling_mode_ticks_idle() {
        let probe = Arc::new(Probe::default());
        let reactor = Reactor::with_handler(probe.clone());
        assert!(reactor.start_polling());
        reactor.wait_started();
        while !probe.idled.load(Ordering::SeqCst) {
            thread::yield_now();
        }
        reactor.stop();
    }

    #[test]
    fn restart_is_stop_plus_start() {
        let probe = Arc::new(Probe::default());
        let reactor = Reactor::with_handler(probe.clone());
        assert!(reactor.start());
        reactor.wait_started();
        assert!(reactor.restart());
        reactor.wait_started();
        assert!(reactor.is_started());
        reactor.stop();
        assert_eq!(probe.started.load(Ordering::SeqCst), 2);
        assert_eq!(probe.stopped.load(Ordering::SeqCst), 2);
    }
}
