//! Request/response handshake between requester threads and the scheduler.
//!
//! One slot, one atomic state word:
//!
//! ```text
//! RESET -> WAKEUP -> IDLE <-> BUSY -> {CREATE|JOIN|SETPRIO|REPORT|SHUTDOWN} -> DONE -> IDLE
//! ```
//!
//! The first caller wins `RESET -> WAKEUP` and spawns the scheduler thread,
//! which probes the devices and publishes `IDLE`. A requester wins
//! `IDLE -> BUSY`, writes its command into the slot and publishes the request
//! state; the scheduler serves it, writes the response and publishes `DONE`;
//! the requester takes the response and hands the slot back with
//! `DONE -> IDLE`. Only one request is in flight at any instant.
//!
//! Acquiring the slot may time out. Once a request is posted the caller
//! waits for `DONE`, unless the scheduler thread has exited, in which case it
//! gets [`InterfaceError::SchedulerGone`].

use crate::config::{SchedulerConfig, WaitStrategy};
use crate::device::DeviceProbe;
use crate::error::{AllocError, InterfaceError};
use crate::invariant_ppt::{assert_invariant, HANDSHAKE_TURNAROUND};
use crate::request::{Priority, RequestId, VirtualRequest};
use crate::scheduler::{InventoryReport, Scheduler};
use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, trace, warn};

/// Longest single park before state is polled again.
const PARK_SLICE: Duration = Duration::from_millis(1);

/// Observable handshake state.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceState {
    Reset = 0,
    Wakeup = 1,
    Idle = 2,
    Busy = 3,
    Create = 4,
    Join = 5,
    SetPrio = 6,
    Report = 7,
    Shutdown = 8,
    Done = 9,
}

impl InterfaceState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Reset,
            1 => Self::Wakeup,
            2 => Self::Idle,
            3 => Self::Busy,
            4 => Self::Create,
            5 => Self::Join,
            6 => Self::SetPrio,
            7 => Self::Report,
            8 => Self::Shutdown,
            _ => Self::Done,
        }
    }

    /// A posted request waiting for the scheduler.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Self::Create | Self::Join | Self::SetPrio | Self::Report | Self::Shutdown
        )
    }
}

enum Command {
    Create(VirtualRequest),
    Join(RequestId),
    SetPrio(RequestId, Priority),
    Report,
    Shutdown,
}

impl Command {
    fn state(&self) -> InterfaceState {
        match self {
            Command::Create(_) => InterfaceState::Create,
            Command::Join(_) => InterfaceState::Join,
            Command::SetPrio(..) => InterfaceState::SetPrio,
            Command::Report => InterfaceState::Report,
            Command::Shutdown => InterfaceState::Shutdown,
        }
    }
}

enum Response {
    Granted(VirtualRequest),
    Released,
    PrioritySet,
    Report(InventoryReport),
    ShutDown,
    Failed(AllocError),
}

#[derive(Default)]
struct Slot {
    command: Option<Command>,
    response: Option<Response>,
}

struct Shared {
    state: AtomicU8,
    gone: AtomicBool,
    shut_down: AtomicBool,
    slot: UnsafeCell<Slot>,
    wait: WaitStrategy,
    acquire_timeout: Option<Duration>,
    park_lock: Mutex<()>,
    park: Condvar,
}

// SAFETY: `slot` is only touched by the thread the state word currently hands
// it to: the requester between winning BUSY and publishing its request state,
// the scheduler between observing a request state and publishing DONE, and
// the requester again between observing DONE and storing IDLE. Every hand-off
// is a release store observed with acquire ordering.
unsafe impl Sync for Shared {}

impl Shared {
    fn new(wait: WaitStrategy, acquire_timeout: Option<Duration>) -> Self {
        Self {
            state: AtomicU8::new(InterfaceState::Reset as u8),
            gone: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
            slot: UnsafeCell::new(Slot::default()),
            wait,
            acquire_timeout,
            park_lock: Mutex::new(()),
            park: Condvar::new(),
        }
    }

    fn load_state(&self) -> InterfaceState {
        InterfaceState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: InterfaceState, to: InterfaceState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn publish(&self, state: InterfaceState) {
        self.state.store(state as u8, Ordering::Release);
        self.notify();
    }

    fn notify(&self) {
        if self.wait == WaitStrategy::Park {
            let _guard = self.park_lock.lock();
            self.park.notify_all();
        }
    }

    /// Poll `ready` until it holds or `deadline` passes.
    fn wait_for(&self, deadline: Option<Instant>, mut ready: impl FnMut() -> bool) -> bool {
        match self.wait {
            WaitStrategy::Spin => {
                let backoff = Backoff::new();
                loop {
                    if ready() {
                        return true;
                    }
                    if deadline.map_or(false, |d| Instant::now() >= d) {
                        return false;
                    }
                    backoff.snooze();
                }
            }
            WaitStrategy::Park => {
                let mut guard = self.park_lock.lock();
                loop {
                    if ready() {
                        return true;
                    }
                    let slice = match deadline {
                        Some(d) => {
                            let now = Instant::now();
                            if now >= d {
                                return false;
                            }
                            (d - now).min(PARK_SLICE)
                        }
                        None => PARK_SLICE,
                    };
                    self.park.wait_for(&mut guard, slice);
                }
            }
        }
    }
}

/// Raises `gone` when the scheduler thread exits, including by panic.
struct GoneGuard(Arc<Shared>);

impl Drop for GoneGuard {
    fn drop(&mut self) {
        self.0.gone.store(true, Ordering::Release);
        self.0.notify();
    }
}

struct Startup {
    config: SchedulerConfig,
    probe: Box<dyn DeviceProbe>,
}

struct HandleInner {
    shared: Arc<Shared>,
    startup: Mutex<Option<Startup>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl HandleInner {
    fn ensure_started(&self) -> Result<(), InterfaceError> {
        let shared = &self.shared;
        if !shared.transition(InterfaceState::Reset, InterfaceState::Wakeup) {
            return Ok(());
        }
        let Some(Startup { config, probe }) = self.startup.lock().take() else {
            shared.gone.store(true, Ordering::Release);
            return Err(InterfaceError::SchedulerGone);
        };
        let thread_shared = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name("accel-scheduler".to_string())
            .spawn(move || run_scheduler(thread_shared, config, probe));
        match spawned {
            Ok(handle) => {
                *self.thread.lock() = Some(handle);
                Ok(())
            }
            Err(err) => {
                error!(%err, "failed to spawn scheduler thread");
                shared.gone.store(true, Ordering::Release);
                shared.notify();
                Err(InterfaceError::SchedulerGone)
            }
        }
    }

    fn call(&self, command: Command) -> Result<Response, InterfaceError> {
        self.call_within(command, self.shared.acquire_timeout)
    }

    fn call_within(
        &self,
        command: Command,
        acquire_timeout: Option<Duration>,
    ) -> Result<Response, InterfaceError> {
        let shared = &self.shared;
        if shared.shut_down.load(Ordering::Acquire) {
            return Err(InterfaceError::ShutDown);
        }
        self.ensure_started()?;

        let deadline = acquire_timeout.map(|t| Instant::now() + t);
        let mut acquired = false;
        shared.wait_for(deadline, || {
            if shared.gone.load(Ordering::Acquire) || shared.shut_down.load(Ordering::Acquire) {
                return true;
            }
            acquired = shared.transition(InterfaceState::Idle, InterfaceState::Busy);
            acquired
        });
        if !acquired {
            return Err(if shared.shut_down.load(Ordering::Acquire) {
                InterfaceError::ShutDown
            } else if shared.gone.load(Ordering::Acquire) {
                InterfaceError::SchedulerGone
            } else {
                InterfaceError::Timeout
            });
        }
        if shared.shut_down.load(Ordering::Acquire) {
            shared.publish(InterfaceState::Idle);
            return Err(InterfaceError::ShutDown);
        }

        let kind = command.state();
        // SAFETY: BUSY hands the slot to this thread.
        unsafe { (*shared.slot.get()).command = Some(command) };
        shared.publish(kind);
        trace!(?kind, "request posted");

        let mut done = false;
        shared.wait_for(None, || {
            done = shared.load_state() == InterfaceState::Done;
            done || shared.gone.load(Ordering::Acquire)
        });
        if !done {
            return Err(InterfaceError::SchedulerGone);
        }
        // SAFETY: DONE hands the slot back to this thread until IDLE is stored.
        let response = unsafe { (*shared.slot.get()).response.take() };
        let released = shared.transition(InterfaceState::Done, InterfaceState::Idle);
        shared.notify();
        assert_invariant(
            HANDSHAKE_TURNAROUND,
            released,
            "only the posting requester leaves DONE",
            Some("call"),
        );
        response.ok_or(InterfaceError::SchedulerGone)
    }

    fn shutdown(&self) -> Result<(), InterfaceError> {
        let shared = &self.shared;
        if shared.load_state() == InterfaceState::Reset {
            // Never started: nothing to stop.
            shared.shut_down.store(true, Ordering::Release);
            return Ok(());
        }
        // Shutdown waits out a slow start instead of timing out.
        let result = match self.call_within(Command::Shutdown, None) {
            Ok(Response::ShutDown) => Ok(()),
            Ok(Response::Failed(err)) => Err(err.into()),
            Ok(_) => Err(InterfaceError::SchedulerGone),
            Err(err) => Err(err),
        };
        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                warn!("scheduler thread panicked");
            }
        }
        result
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        if !self.shared.shut_down.load(Ordering::Acquire) {
            let _ = self.shutdown();
        }
    }
}

fn run_scheduler(shared: Arc<Shared>, config: SchedulerConfig, mut probe: Box<dyn DeviceProbe>) {
    let _gone = GoneGuard(Arc::clone(&shared));
    let mut scheduler = Scheduler::new(config);
    if let Err(err) = scheduler.probe(probe.as_mut()) {
        warn!(%err, "device probe failed, continuing without hardware");
    }
    info!("scheduler thread ready");
    shared.publish(InterfaceState::Idle);

    loop {
        let mut kind = InterfaceState::Idle;
        shared.wait_for(None, || {
            kind = shared.load_state();
            kind.is_request()
        });
        // SAFETY: a request state hands the slot to the scheduler until DONE.
        let Some(command) = (unsafe { (*shared.slot.get()).command.take() }) else {
            error!(?kind, "request state without a command");
            break;
        };
        let stop = matches!(command, Command::Shutdown);
        let response = serve(&mut scheduler, command);
        // SAFETY: as above.
        unsafe { (*shared.slot.get()).response = Some(response) };
        assert_invariant(
            HANDSHAKE_TURNAROUND,
            shared.load_state() == kind,
            "request state is stable while served",
            Some("scheduler"),
        );
        if stop {
            shared.shut_down.store(true, Ordering::Release);
        }
        shared.publish(InterfaceState::Done);
        trace!(?kind, "request served");
        if stop {
            break;
        }
    }
    info!("scheduler thread exiting");
}

fn serve(scheduler: &mut Scheduler, command: Command) -> Response {
    let outcome = match command {
        Command::Create(mut request) => scheduler
            .search(&mut request)
            .map(|()| Response::Granted(request)),
        Command::Join(id) => scheduler.release(id).map(|()| Response::Released),
        Command::SetPrio(id, priority) => scheduler
            .set_priority(id, priority)
            .map(|()| Response::PrioritySet),
        Command::Report => Ok(Response::Report(scheduler.report())),
        Command::Shutdown => {
            scheduler.shutdown_all();
            Ok(Response::ShutDown)
        }
    };
    outcome.unwrap_or_else(Response::Failed)
}

/// Cloneable entry point to one scheduler.
///
/// The scheduler thread is spawned by the first request. Dropping the last
/// clone shuts it down, releasing every live grant.
#[derive(Clone)]
pub struct SchedulerHandle {
    inner: Arc<HandleInner>,
}

impl SchedulerHandle {
    pub fn new(config: SchedulerConfig, probe: impl DeviceProbe + 'static) -> Self {
        let shared = Shared::new(config.wait_strategy, config.acquire_timeout);
        Self {
            inner: Arc::new(HandleInner {
                shared: Arc::new(shared),
                startup: Mutex::new(Some(Startup {
                    config,
                    probe: Box::new(probe),
                })),
                thread: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> InterfaceState {
        self.inner.shared.load_state()
    }

    /// Ask for a grant. On success `request` carries its assignment.
    pub fn create(&self, request: &mut VirtualRequest) -> Result<(), InterfaceError> {
        if request.is_granted() {
            return Err(AllocError::AlreadyGranted(request.id).into());
        }
        match self.inner.call(Command::Create(request.clone()))? {
            Response::Granted(granted) => {
                *request = granted;
                Ok(())
            }
            Response::Failed(err) => Err(err.into()),
            _ => Err(InterfaceError::SchedulerGone),
        }
    }

    /// Give the grant back. The request is ungranted afterwards even if a
    /// device failed while releasing.
    pub fn release(&self, request: &mut VirtualRequest) -> Result<(), InterfaceError> {
        if !request.is_granted() {
            return Err(AllocError::UnknownRequest(request.id).into());
        }
        let response = self.inner.call(Command::Join(request.id))?;
        request.assignment = None;
        match response {
            Response::Released => Ok(()),
            Response::Failed(err) => Err(err.into()),
            _ => Err(InterfaceError::SchedulerGone),
        }
    }

    /// Store the new priority; a granted request is re-prioritized live.
    pub fn set_priority(
        &self,
        request: &mut VirtualRequest,
        priority: Priority,
    ) -> Result<(), InterfaceError> {
        request.priority = priority;
        if !request.is_granted() {
            return Ok(());
        }
        match self.inner.call(Command::SetPrio(request.id, priority))? {
            Response::PrioritySet => Ok(()),
            Response::Failed(err) => Err(err.into()),
            _ => Err(InterfaceError::SchedulerGone),
        }
    }

    pub fn report(&self) -> Result<InventoryReport, InterfaceError> {
        match self.inner.call(Command::Report)? {
            Response::Report(report) => Ok(report),
            Response::Failed(err) => Err(err.into()),
            _ => Err(InterfaceError::SchedulerGone),
        }
    }

    /// Release every grant and stop the scheduler thread.
    pub fn shutdown(&self) -> Result<(), InterfaceError> {
        self.inner.shutdown()
    }
}

impl std::fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("state", &self.state())
            .finish()
    }
}
