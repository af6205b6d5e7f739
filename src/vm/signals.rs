//! The signal side of the runtime.
//!
//! One handler covers four signals. SEGV is how the tape grows: generated
//! code runs without bounds checks and the guard pages fault, after which
//! the handler grows the tape and patches the saved head register (the tape
//! may have moved) and the saved zero flag (the restarted instruction is
//! typically a zero probe). INT breaks into the debugger, directly when it
//! interrupts generated code and via a pending flag when it interrupts a
//! callback. TERM exits cleanly. VTALRM drives the sampling profiler.

use std::mem;
use std::process;
use std::ptr;
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::debugger;
use crate::vm::{active, arch};

static PENDING_INTERRUPT: AtomicBool = AtomicBool::new(false);

/// Consume the pending-interrupt flag. Callbacks check this on their way
/// back into generated code.
pub(crate) fn take_pending_interrupt() -> bool {
    PENDING_INTERRUPT.swap(false, Ordering::Relaxed)
}

pub(crate) fn install() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handler as usize;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&raw mut action.sa_mask);
        for signal in [libc::SIGSEGV, libc::SIGINT, libc::SIGTERM, libc::SIGVTALRM] {
            libc::sigaction(signal, &raw const action, ptr::null_mut());
        }
    });
}

pub(crate) fn start_profile_timer() {
    let tick = libc::timeval {
        tv_sec: 0,
        tv_usec: 10_000,
    };
    let timer = libc::itimerval {
        it_interval: tick,
        it_value: tick,
    };
    unsafe {
        libc::setitimer(libc::ITIMER_VIRTUAL, &raw const timer, ptr::null_mut());
    }
}

pub(crate) fn stop_profile_timer() {
    let timer: libc::itimerval = unsafe { mem::zeroed() };
    unsafe {
        libc::setitimer(libc::ITIMER_VIRTUAL, &raw const timer, ptr::null_mut());
    }
}

unsafe extern "C" fn handler(signum: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
    let uc = context.cast::<libc::ucontext_t>();
    match signum {
        libc::SIGSEGV => unsafe { fault(info, uc) },
        libc::SIGINT => unsafe { interrupt(uc) },
        // Exit normally so cleanups registered with the runtime still run.
        libc::SIGTERM => process::exit(0),
        libc::SIGVTALRM => unsafe { profile_tick(uc) },
        _ => {}
    }
}

/// A fault from generated code is a tape bounds event; anything else is
/// unrecoverable.
unsafe fn fault(info: *mut libc::siginfo_t, uc: *mut libc::ucontext_t) {
    let in_generated_code = active()
        .is_some_and(|vm| vm.code_offset(unsafe { arch::instruction_pointer(uc) }).is_some());
    if !in_generated_code {
        eprintln!("segmentation fault occured!");
        process::abort();
    }

    let vm = active().unwrap();
    let offset = vm
        .code_offset(unsafe { arch::instruction_pointer(uc) })
        .unwrap();
    let cell = unsafe { (*info).si_addr().cast::<u8>() };
    let mut head = unsafe { arch::head(uc) };
    vm.range_check(cell, &mut head, Some(offset));

    // Growth may have moved the tape; restart the faulting instruction with
    // the relocated head and a zero flag matching the cell it now sees.
    unsafe {
        arch::set_head(uc, head);
        arch::set_zero_flag(uc, *head == 0);
    }
}

unsafe fn interrupt(uc: *mut libc::ucontext_t) {
    if let Some(vm) = active()
        && let Some(offset) = vm.code_offset(unsafe { arch::instruction_pointer(uc) })
    {
        let mut head = unsafe { arch::head(uc) };
        debugger::debug_break(vm, &mut head, Some(offset));
        unsafe { arch::set_head(uc, head) };
    } else {
        // Interrupted a callback (or nothing is running): break at the next
        // safe point instead of in the middle of foreign frames.
        PENDING_INTERRUPT.store(true, Ordering::Relaxed);
    }
}

unsafe fn profile_tick(uc: *mut libc::ucontext_t) {
    if let Some(vm) = active() {
        vm.profile_sample(unsafe { arch::instruction_pointer(uc) });
    }
}
