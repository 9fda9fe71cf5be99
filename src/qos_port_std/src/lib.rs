//! Simulation environment for running `qos_kernel` on a hosted environment.
//!
//! Every task is backed by an OS thread, and every simulated core has an
//! interrupt thread that delivers the periodic tick and the inter-core
//! doorbell. A thread backing a task that is not the current task of its core
//! is parked.
//!
//! A preempted task is stopped where it is. On Unix-like systems the port
//! sends the preempted thread a signal (`SIGUSR1`) whose handler parks the
//! thread until its task is dispatched again; the signal is deferred while
//! the thread has interrupts masked. Elsewhere, a preempted task keeps
//! executing until its next kernel call, where it's held until it's
//! dispatched again.
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(rust_2018_idioms)]
use qos_kernel::{
    ActivateTaskError, CoreId, CreateTaskError, Kernel, Port, Priority, TaskId, TaskState,
};
use spin::Mutex as SpinMutex;
use std::{
    any::Any,
    cell::Cell,
    collections::HashMap,
    fmt, io,
    panic::{self, AssertUnwindSafe},
    ptr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
    thread::{self, JoinHandle, Thread},
    time::{Duration, Instant},
};

#[cfg(unix)]
mod threading_unix;

/// The kernel type driven by [`Simulator`].
pub type StdKernel = Kernel<StdPort>;

/// A request delivered to a core's interrupt thread.
enum Irq {
    Doorbell,
    Shutdown,
}

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    /// The backing thread for the interrupt context of a core.
    Interrupt(CoreId),
    /// The backing thread for a task.
    Task(TaskId),
}

// These are read by the preemption signal handler, so they must not need lazy
// initialization
thread_local! {
    /// The current thread's role. It's assigned when a thread managed by the
    /// port starts.
    static THREAD_ROLE: Cell<ThreadRole> = const { Cell::new(ThreadRole::Unknown) };

    /// The nesting depth of `mask_interrupts`.
    static MASK_DEPTH: Cell<usize> = const { Cell::new(0) };

    /// A preemption arrived while interrupts were masked.
    static PREEMPT_PENDING: Cell<bool> = const { Cell::new(false) };

    /// The [`TaskThread`] of the current thread. Null outside task threads.
    static TASK_THREAD: Cell<*const TaskThread> = const { Cell::new(ptr::null()) };
}

/// The part of a task thread's state other threads can see.
struct TaskThread {
    task: TaskId,
    kernel: &'static StdKernel,
    /// The thread's `pthread_t`. Zero before the thread starts and after it
    /// exits.
    #[cfg(unix)]
    pthread: AtomicUsize,
    /// Set by a preempting thread until the preempted thread acknowledges the
    /// preemption signal.
    #[cfg(unix)]
    preempt_requested: std::sync::atomic::AtomicBool,
}

impl TaskThread {
    fn new(task: TaskId, kernel: &'static StdKernel) -> Self {
        Self {
            task,
            kernel,
            #[cfg(unix)]
            pthread: AtomicUsize::new(0),
            #[cfg(unix)]
            preempt_requested: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Park the current thread, which must be the one backing `self`, until
    /// its task stops being preempted.
    fn hold_while_preempted(&self) {
        while self.kernel.task_state(self.task) == Some(TaskState::Ready) {
            mask();
            thread::park();
            // Whatever arrived meanwhile is covered by the next check
            MASK_DEPTH.with(|x| x.set(x.get() - 1));
            PREEMPT_PENDING.with(|x| x.set(false));
        }
    }
}

/// Get the [`TaskThread`] of the current thread.
fn current_task_thread() -> Option<&'static TaskThread> {
    // Safety: A task thread keeps its `TaskThread` alive until it clears
    // `TASK_THREAD`
    TASK_THREAD.with(|x| unsafe { x.get().as_ref() })
}

fn mask() {
    MASK_DEPTH.with(|x| x.set(x.get() + 1));
}

/// Leave a masked section. Leaving the outermost one carries out a deferred
/// preemption.
fn unmask() {
    let depth = MASK_DEPTH.with(|x| {
        assert_ne!(x.get(), 0, "unbalanced unmask_interrupts");
        x.set(x.get() - 1);
        x.get()
    });

    if depth == 0 && PREEMPT_PENDING.with(|x| x.replace(false)) {
        if let Some(thread) = current_task_thread() {
            thread.hold_while_preempted();
        }
    }
}

/// Run `f` with interrupts masked. Spin locks shared with other threads are
/// only taken this way so that a thread is never stopped while holding one.
fn masked<R>(f: impl FnOnce() -> R) -> R {
    mask();
    let ret = f();
    unmask();
    ret
}

/// The global logger. Records are written with interrupts masked so that a
/// preempted thread doesn't hold the output stream.
struct MaskedLogger(env_logger::Logger);

impl log::Log for MaskedLogger {
    fn enabled(&self, metadata: &log::Metadata<'_>) -> bool {
        self.0.enabled(metadata)
    }

    fn log(&self, record: &log::Record<'_>) {
        masked(|| self.0.log(record));
    }

    fn flush(&self) {
        masked(|| self.0.flush());
    }
}

fn init_logger() {
    let logger = env_logger::Builder::from_env(env_logger::Env::default()).build();
    let max_level = logger.filter();
    if log::set_boxed_logger(Box::new(MaskedLogger(logger))).is_ok() {
        log::set_max_level(max_level);
    }
}

/// An entry of [`StdPort::threads`].
struct TaskHandle {
    thread: Thread,
    shared: Arc<TaskThread>,
}

/// The [`Port`] implementation of the simulator.
pub struct StdPort {
    origin: Instant,
    /// The threads backing tasks, by task.
    threads: SpinMutex<HashMap<TaskId, TaskHandle>>,
    /// The interrupt request queue of each core. `None` while the simulator
    /// isn't running.
    irq_send: [SpinMutex<Option<mpsc::Sender<Irq>>>; qos_kernel::NUM_CORES],
}

impl StdPort {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            threads: SpinMutex::new(HashMap::new()),
            irq_send: std::array::from_fn(|_| SpinMutex::new(None)),
        }
    }

    fn send_irq(&self, core: CoreId, irq: Irq) {
        let sent = masked(|| match &*self.irq_send[core.index()].lock() {
            Some(send) => {
                // The receiver only goes away during shutdown
                let _ = send.send(irq);
                true
            }
            None => false,
        });
        if !sent {
            log::warn!("{:?}: interrupt raised while the simulator is stopped", core);
        }
    }

    fn set_irq_sender(&self, core: CoreId, send: Option<mpsc::Sender<Irq>>) {
        masked(|| *self.irq_send[core.index()].lock() = send);
    }
}

impl Port for StdPort {
    fn current_core(&self) -> CoreId {
        match THREAD_ROLE.with(Cell::get) {
            ThreadRole::Interrupt(core) => core,
            ThreadRole::Task(task) => task.core(),
            ThreadRole::Unknown => CoreId::CORE0,
        }
    }

    fn current_task(&self) -> Option<TaskId> {
        match THREAD_ROLE.with(Cell::get) {
            ThreadRole::Task(task) => Some(task),
            _ => None,
        }
    }

    fn now(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    fn mask_interrupts(&self) {
        // The kernel lock already excludes the interrupt threads; masking
        // only defers the preemption of the current thread
        mask();
    }

    fn unmask_interrupts(&self) {
        unmask();
    }

    fn wait_for_dispatch(&self, task: TaskId) {
        debug_assert_eq!(THREAD_ROLE.with(Cell::get), ThreadRole::Task(task));
        log::trace!("{:?}: waiting for dispatch", task);
        masked(thread::park);
    }

    fn notify_dispatch(&self, task: TaskId) {
        // The thread is registered before the task is activated
        masked(|| {
            if let Some(handle) = self.threads.lock().get(&task) {
                handle.thread.unpark();
            }
        });
    }

    fn notify_preempt(&self, task: TaskId) {
        let shared = masked(|| {
            self.threads
                .lock()
                .get(&task)
                .map(|handle| Arc::clone(&handle.shared))
        });

        #[cfg(unix)]
        if let Some(shared) = shared {
            log::trace!("stopping {:?}", task);
            threading_unix::stop(&shared);
        }

        // The task stops at its next kernel call
        #[cfg(not(unix))]
        drop(shared);
    }

    fn ring_doorbell(&self, core: CoreId) {
        log::trace!("ringing the doorbell of {:?}", core);
        self.send_irq(core, Irq::Doorbell);
    }
}

/// Parameters of [`Simulator`].
#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    /// The tick period of the kernel, which the interrupt threads follow.
    pub tick_period_us: u64,
    /// [`Simulator::run`] gives up if the tasks haven't all exited by then.
    pub watchdog: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            tick_period_us: qos_kernel::DEFAULT_TICK_PERIOD_US,
            watchdog: Duration::from_secs(10),
        }
    }
}

/// Error type for [`Simulator`].
#[derive(Debug)]
pub enum SimError {
    CreateTask(CreateTaskError),
    ActivateTask(ActivateTaskError),
    /// Failed to spawn a backing thread.
    Spawn(io::Error),
    /// Some tasks didn't exit before the watchdog fired.
    Deadlock { remaining: usize },
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateTask(e) => write!(f, "failed to create a task: {}", e),
            Self::ActivateTask(e) => write!(f, "failed to activate a task: {}", e),
            Self::Spawn(e) => write!(f, "failed to spawn a thread: {}", e),
            Self::Deadlock { remaining } => {
                write!(f, "{} task(s) did not exit before the watchdog fired", remaining)
            }
        }
    }
}

impl std::error::Error for SimError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CreateTaskError> for SimError {
    fn from(e: CreateTaskError) -> Self {
        Self::CreateTask(e)
    }
}

impl From<ActivateTaskError> for SimError {
    fn from(e: ActivateTaskError) -> Self {
        Self::ActivateTask(e)
    }
}

/// Bookkeeping shared with the task threads.
struct Progress {
    exited: AtomicUsize,
    /// The payload of the first panic in a task.
    panic: SpinMutex<Option<Box<dyn Any + Send>>>,
}

impl Default for Progress {
    fn default() -> Self {
        Self {
            exited: AtomicUsize::new(0),
            panic: SpinMutex::new(None),
        }
    }
}

/// Runs a kernel whose cores are simulated by OS threads.
///
/// Spawn the initial tasks with [`Self::spawn`], then call [`Self::run`],
/// which starts the kernel and returns once every task has exited.
pub struct Simulator {
    kernel: &'static StdKernel,
    cfg: SimConfig,
    progress: Arc<Progress>,
    num_tasks: usize,
}

impl Simulator {
    pub fn new(cfg: SimConfig) -> Self {
        init_logger();

        let kernel = Kernel::build()
            .tick_period_us(cfg.tick_period_us)
            .finish(StdPort::new());

        Self {
            kernel: Box::leak(Box::new(kernel)),
            cfg,
            progress: Arc::default(),
            num_tasks: 0,
        }
    }

    #[inline]
    pub fn kernel(&self) -> &'static StdKernel {
        self.kernel
    }

    /// Create a task running `body` on `core` and activate it. The task exits
    /// when `body` returns.
    pub fn spawn(
        &mut self,
        core: CoreId,
        priority: Priority,
        body: impl FnOnce(&'static StdKernel) + Send + 'static,
    ) -> Result<TaskId, SimError> {
        let kernel = self.kernel;
        let task = kernel.create_task(core, priority)?;
        let progress = Arc::clone(&self.progress);
        let shared = Arc::new(TaskThread::new(task, kernel));
        let shared2 = Arc::clone(&shared);

        let join_handle = thread::Builder::new()
            .name(format!("{:?}", task))
            .spawn(move || {
                THREAD_ROLE.with(|role| role.set(ThreadRole::Task(task)));
                TASK_THREAD.with(|x| x.set(Arc::as_ptr(&shared2)));
                #[cfg(unix)]
                threading_unix::attach(&shared2);

                kernel.wait_until_dispatched(task);
                log::debug!("{:?} is now running", task);

                if let Err(e) = panic::catch_unwind(AssertUnwindSafe(|| body(kernel))) {
                    log::error!("{:?} panicked", task);
                    masked(|| {
                        progress.panic.lock().get_or_insert(e);
                    });
                }

                kernel.exit_task();

                masked(|| kernel.port().threads.lock().remove(&task));
                #[cfg(unix)]
                threading_unix::detach(&shared2);
                TASK_THREAD.with(|x| x.set(ptr::null()));
                progress.exited.fetch_add(1, Ordering::Release);
            })
            .map_err(SimError::Spawn)?;

        let handle = TaskHandle {
            thread: join_handle.thread().clone(),
            shared,
        };
        masked(|| kernel.port().threads.lock().insert(task, handle));

        kernel.activate_task(task)?;
        self.num_tasks += 1;
        Ok(task)
    }

    /// Start the kernel and wait until every spawned task exits.
    ///
    /// A panic in a task is propagated to the caller.
    pub fn run(self) -> Result<(), SimError> {
        let irq_threads = self.start_interrupt_threads()?;

        self.kernel.start();

        let deadline = Instant::now() + self.cfg.watchdog;
        let result = loop {
            if masked(|| self.progress.panic.lock().is_some()) {
                break Ok(());
            }
            let exited = self.progress.exited.load(Ordering::Acquire);
            if exited == self.num_tasks {
                break Ok(());
            }
            if Instant::now() >= deadline {
                break Err(SimError::Deadlock {
                    remaining: self.num_tasks - exited,
                });
            }
            thread::sleep(Duration::from_millis(1));
        };

        self.stop_interrupt_threads(irq_threads);

        if let Some(e) = masked(|| self.progress.panic.lock().take()) {
            panic::resume_unwind(e);
        }

        result
    }

    fn start_interrupt_threads(&self) -> Result<Vec<JoinHandle<()>>, SimError> {
        let period = Duration::from_micros(self.cfg.tick_period_us);

        CoreId::ALL
            .into_iter()
            .map(|core| {
                let kernel = self.kernel;
                let (send, recv) = mpsc::channel();
                kernel.port().set_irq_sender(core, Some(send));

                log::trace!("starting the interrupt thread of {:?}", core);
                thread::Builder::new()
                    .name(format!("{:?} irq", core))
                    .spawn(move || {
                        THREAD_ROLE.with(|role| role.set(ThreadRole::Interrupt(core)));
                        let mut next_tick = Instant::now() + period;
                        loop {
                            let timeout = next_tick.saturating_duration_since(Instant::now());
                            match recv.recv_timeout(timeout) {
                                Err(mpsc::RecvTimeoutError::Timeout) => {
                                    kernel.tick(core);
                                    next_tick += period;
                                }
                                Ok(Irq::Doorbell) => kernel.handle_doorbell(core),
                                Ok(Irq::Shutdown) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                                    break;
                                }
                            }
                        }
                    })
                    .map_err(SimError::Spawn)
            })
            .collect()
    }

    fn stop_interrupt_threads(&self, irq_threads: Vec<JoinHandle<()>>) {
        for core in CoreId::ALL {
            self.kernel.port().send_irq(core, Irq::Shutdown);
            self.kernel.port().set_irq_sender(core, None);
        }
        for join_handle in irq_threads {
            if join_handle.join().is_err() {
                log::error!("an interrupt thread panicked");
            }
        }
        log::trace!("stopped the interrupt threads");
    }
}
