use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Process-wide interrupt flag set from the signal handler. Signal
/// handlers may only touch async-signal-safe state, hence the static.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Run-level cancellation signal, observable by every waiting action.
///
/// Wait loops poll `is_cancelled` between bounded sleeps; the handler
/// installed by [`install_interrupt_handler`] trips every token.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    local: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.local.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.local.load(Ordering::SeqCst) || INTERRUPTED.load(Ordering::SeqCst)
    }

    /// Sleep up to `duration`, waking early on cancellation. Returns
    /// false if cancelled before the full duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.is_cancelled() {
                return false;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            std::thread::sleep(remaining.min(Duration::from_millis(200)));
        }
        !self.is_cancelled()
    }
}

extern "C" fn handle_interrupt(_signal: nix::libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install a SIGINT handler that flips the shared interrupt flag.
/// Safe to call more than once.
pub fn install_interrupt_handler() {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    let action = SigAction::new(
        SigHandler::Handler(handle_interrupt),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // Registration failure leaves the default handler; the run then
    // terminates on interrupt instead of unwinding cleanly.
    unsafe {
        let _ = sigaction(Signal::SIGINT, &action);
    }
}
