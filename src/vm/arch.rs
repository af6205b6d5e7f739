//! Access to the saved register state a signal handler receives.
//!
//! The fault handler needs three things from the interrupted context: the
//! instruction pointer (to decide whether generated code faulted), the head
//! register (to relocate it when the tape moves) and the zero flag (so a
//! restarted zero probe observes the grown tape correctly). Everything else
//! in the signal path is architecture-independent.

#[cfg(not(all(target_arch = "x86_64", target_os = "linux")))]
compile_error!("the code generator targets x86-64 Linux only");

use libc::{REG_EFL, REG_RAX, REG_RIP, ucontext_t};

/// Zero flag bit in RFLAGS.
const ZF: i64 = 1 << 6;

pub unsafe fn instruction_pointer(uc: *const ucontext_t) -> usize {
    unsafe { (*uc).uc_mcontext.gregs[REG_RIP as usize] as usize }
}

/// The tape head register (`rax`) as saved in the context.
pub unsafe fn head(uc: *const ucontext_t) -> *mut u8 {
    unsafe { (*uc).uc_mcontext.gregs[REG_RAX as usize] as *mut u8 }
}

pub unsafe fn set_head(uc: *mut ucontext_t, head: *mut u8) {
    unsafe {
        (*uc).uc_mcontext.gregs[REG_RAX as usize] = head as i64;
    }
}

pub unsafe fn set_zero_flag(uc: *mut ucontext_t, zero: bool) {
    unsafe {
        let flags = &mut (*uc).uc_mcontext.gregs[REG_EFL as usize];
        if zero {
            *flags |= ZF;
        } else {
            *flags &= !ZF;
        }
    }
}
