//! Stopping a preempted task thread from another thread
//!
//! The preempting thread raises [`SIGNAL_PREEMPT`] on the target thread and
//! waits until the target's signal handler acknowledges it. The handler parks
//! the target until its task is dispatched again, or leaves a note for
//! [`super::unmask`] if the target has interrupts masked.
use std::{
    os::raw::c_int,
    ptr::null_mut,
    sync::{
        atomic::{AtomicBool, Ordering},
        Once,
    },
    thread,
};

use super::{current_task_thread, TaskThread, MASK_DEPTH, PREEMPT_PENDING};

const SIGNAL_PREEMPT: c_int = libc::SIGUSR1;

static SIGNAL_HANDLER_ONCE: Once = Once::new();
static SIGNAL_HANDLER_READY: AtomicBool = AtomicBool::new(false);

/// Record the current thread's `pthread_t` so that it can be stopped.
pub(super) fn attach(thread: &TaskThread) {
    let pthread = unsafe { libc::pthread_self() } as usize;
    thread.pthread.store(pthread, Ordering::SeqCst);
}

/// Make the current thread unreachable by [`stop`]. Called by the thread
/// before it exits.
pub(super) fn detach(thread: &TaskThread) {
    thread.pthread.store(0, Ordering::SeqCst);

    // A signal might already be on its way
    while thread.preempt_requested.load(Ordering::SeqCst) {
        thread::yield_now();
    }
}

/// Stop the thread backing `thread`'s task and return once it has received
/// the signal.
pub(super) fn stop(thread: &TaskThread) {
    SIGNAL_HANDLER_ONCE.call_once(register_preempt_signal_handler);
    if !SIGNAL_HANDLER_READY.load(Ordering::Acquire) {
        return;
    }

    // Pairs with `detach`: either the thread sees the request and waits for
    // the signal, or we see that it's gone
    thread.preempt_requested.store(true, Ordering::SeqCst);
    let pthread = thread.pthread.load(Ordering::SeqCst);

    let current = unsafe { libc::pthread_self() } as usize;
    if pthread == 0 || pthread == current {
        thread.preempt_requested.store(false, Ordering::SeqCst);
        return;
    }

    if let Err(e) =
        ok_or_errno(unsafe { libc::pthread_kill(pthread as libc::pthread_t, SIGNAL_PREEMPT) })
    {
        thread.preempt_requested.store(false, Ordering::SeqCst);
        log::warn!("failed to stop {:?}: {}", thread.task, e);
        return;
    }

    // Wait until the signal is delivered
    while thread.preempt_requested.load(Ordering::SeqCst) {
        thread::yield_now();
    }
}

/// Register the signal handler for [`SIGNAL_PREEMPT`].
#[cold]
fn register_preempt_signal_handler() {
    let result = ok_or_errno(unsafe {
        libc::sigaction(
            SIGNAL_PREEMPT,
            &libc::sigaction {
                sa_sigaction: preempt_signal_handler as libc::sighandler_t,
                // `SA_SIGINFO`: The handler uses the three-parameter signature.
                // `SA_NODEFER`: A thread held by the handler must still be
                // able to acknowledge the next preemption.
                sa_flags: libc::SA_SIGINFO | libc::SA_NODEFER | libc::SA_RESTART,
                ..std::mem::zeroed()
            },
            null_mut(),
        )
    });

    match result {
        Ok(_) => SIGNAL_HANDLER_READY.store(true, Ordering::Release),
        Err(e) => log::error!(
            "failed to install the preemption signal handler: {}; \
             preempted tasks will run until their next kernel call",
            e
        ),
    }

    /// The signal handler for [`SIGNAL_PREEMPT`].
    extern "C" fn preempt_signal_handler(
        _signo: c_int,
        _: *mut libc::siginfo_t,
        _: *mut libc::ucontext_t,
    ) {
        let Some(current) = current_task_thread() else {
            return;
        };
        let saved_errno = errno::errno();

        current.preempt_requested.store(false, Ordering::SeqCst);

        if MASK_DEPTH.with(|x| x.get()) > 0 {
            PREEMPT_PENDING.with(|x| x.set(true));
        } else {
            current.hold_while_preempted();
        }

        errno::set_errno(saved_errno);
    }
}

fn ok_or_errno(x: c_int) -> Result<c_int, errno::Errno> {
    if x == 0 {
        Ok(x)
    } else if x > 0 {
        // `pthread_kill` returns the error number
        Err(errno::Errno(x))
    } else {
        Err(errno::errno())
    }
}
