use std::sync::atomic::{AtomicBool, Ordering};

static QUIT_REQUESTED: AtomicBool = AtomicBool::new(false);
static HALT_REQUESTED: AtomicBool = AtomicBool::new(false);
static HALT_ON_INTERRUPT: AtomicBool = AtomicBool::new(false);

pub fn should_quit() -> bool {
    QUIT_REQUESTED.load(Ordering::SeqCst)
}

pub fn request_quit() {
    QUIT_REQUESTED.store(true, Ordering::SeqCst);
}

/// Asynchronous debug-halt entry point. Sets a flag only; the execution
/// engine consumes it at the next instruction boundary.
pub fn request_halt() {
    // An interrupt arriving while a previous halt request is still pending
    // escalates to quit, so a wedged session stays killable.
    if HALT_REQUESTED.swap(true, Ordering::SeqCst) {
        request_quit();
    }
}

pub fn take_halt_request() -> bool {
    HALT_REQUESTED.swap(false, Ordering::SeqCst)
}

fn on_interrupt() {
    if HALT_ON_INTERRUPT.load(Ordering::SeqCst) {
        request_halt();
    } else {
        request_quit();
    }
}

/// Install SIGINT/SIGTERM handlers. With `halt_on_interrupt` an interrupt
/// breaks into the debugger instead of quitting (a second one quits).
#[cfg(unix)]
pub fn install(halt_on_interrupt: bool) {
    use std::os::raw::c_int;
    const SIGINT: c_int = 2;
    const SIGTERM: c_int = 15;

    HALT_ON_INTERRUPT.store(halt_on_interrupt, Ordering::SeqCst);

    extern "C" fn handler(sig: c_int) {
        // Set a flag only; do not perform IO in signal context
        if sig == 15 {
            request_quit();
        } else {
            on_interrupt();
        }
    }

    extern "C" {
        fn signal(sig: c_int, handler: extern "C" fn(c_int)) -> usize;
    }

    unsafe {
        // Best-effort; ignore returns
        let _ = signal(SIGINT, handler);
        let _ = signal(SIGTERM, handler);
    }
}

#[cfg(not(unix))]
pub fn install(halt_on_interrupt: bool) {
    HALT_ON_INTERRUPT.store(halt_on_interrupt, Ordering::SeqCst);

    // Windows console Ctrl+C handler via SetConsoleCtrlHandler
    #[cfg(target_os = "windows")]
    unsafe {
        type HandlerRoutine = extern "system" fn(u32) -> i32;
        extern "system" {
            fn SetConsoleCtrlHandler(handler: Option<HandlerRoutine>, add: i32) -> i32;
        }
        extern "system" fn handler(ctrl_type: u32) -> i32 {
            let _ = ctrl_type;
            on_interrupt();
            1 // handled
        }
        let _ = SetConsoleCtrlHandler(Some(handler), 1);
    }
}
