mod arch;
pub(crate) mod code_buf;
mod code_gen;
mod signals;
pub(crate) mod tape;

use std::io::{self, Read, Write};
use std::mem;
use std::process;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::debugger;
use crate::parser::{CALL_COUNT, Node};

use self::code_buf::CodeBuf;
use self::tape::Tape;

pub type Cell = u8;

/// Entry in the callback vector consumed by generated code. Callbacks may
/// grow (and thereby move) the tape, so each returns the possibly-updated
/// head pointer.
pub type Callback = extern "C" fn(*mut Cell) -> *mut Cell;

/// The virtual machine: the guard-paged tape, the code buffer, the loaded
/// program and the I/O the generated code calls back into.
pub struct Vm {
    tape: Tape,
    code: CodeBuf,
    program: Vec<Node>,
    input: Box<dyn Read>,
    output: Box<dyn Write>,
    eof_value: Option<Cell>,
    wrap_check: bool,
    profiling: bool,
    profile: Option<Vec<usize>>,
    page_size: usize,
}

/// The machine the generated code currently executing belongs to. Signal
/// handlers and the extern callbacks cannot carry Rust state, so execution
/// registers the machine here. Execution is single-threaded throughout.
static ACTIVE: AtomicPtr<Vm> = AtomicPtr::new(ptr::null_mut());

pub(crate) fn active() -> Option<&'static mut Vm> {
    let vm = ACTIVE.load(Ordering::Relaxed);
    if vm.is_null() { None } else { Some(unsafe { &mut *vm }) }
}

impl Vm {
    pub fn new() -> Self {
        let page_size = usize::try_from(unsafe { libc::sysconf(libc::_SC_PAGESIZE) })
            .expect("page size must be positive");
        signals::install();
        Self {
            tape: Tape::new(page_size),
            code: CodeBuf::new(page_size),
            program: Vec::new(),
            input: Box::new(io::stdin()),
            output: Box::new(io::stdout()),
            eof_value: None,
            wrap_check: false,
            profiling: false,
            profile: None,
            page_size,
        }
    }

    pub fn set_input(&mut self, input: Box<dyn Read>) {
        self.input = input;
    }

    pub fn set_output(&mut self, output: Box<dyn Write>) {
        self.output = output;
    }

    /// Value stored in the cell when a read hits end of input. Without one,
    /// the cell is left unchanged.
    pub fn set_eof_value(&mut self, value: Cell) {
        self.eof_value = Some(value);
    }

    pub fn set_memory_limit(&mut self, bytes: usize) {
        self.tape.set_limit(bytes);
    }

    /// Break to the debugger whenever a cell wraps around. Affects code
    /// generation; set before loading.
    pub fn set_wrap_check(&mut self, enable: bool) {
        self.wrap_check = enable;
    }

    /// Allocate sample counters at load time and start the virtual-time
    /// sampler during execution.
    pub fn set_profiling(&mut self, enable: bool) {
        self.profiling = enable;
    }

    /// Generate native code for `nodes`, writing each node's code span.
    pub fn load(&mut self, mut nodes: Vec<Node>) {
        self.code.truncate();
        code_gen::emit_program(&mut self.code, &mut nodes, self.page_size, self.wrap_check);
        self.program = nodes;
        if self.profiling {
            // One counter per code byte, plus a sentinel so prefix sums can
            // be differenced at span ends.
            self.profile = Some(vec![0; self.code.len() + 1]);
        }
    }

    pub fn program(&self) -> &[Node] {
        &self.program
    }

    pub fn code_bytes(&self) -> &[u8] {
        self.code.bytes()
    }

    /// Run the loaded program to completion.
    pub fn exec(&mut self) {
        assert!(!self.code.is_empty(), "no program loaded");
        type Entry = extern "C" fn(*mut Cell, *const Callback) -> *mut Cell;
        let entry: Entry = unsafe { mem::transmute(self.code.base()) };
        let callbacks: [Callback; CALL_COUNT] = [cb_read, cb_write, cb_debug, cb_wrapped];

        ACTIVE.store(ptr::from_mut(self), Ordering::SeqCst);
        if self.profile.is_some() {
            signals::start_profile_timer();
        }

        let head = entry(self.tape.base(), callbacks.as_ptr());

        if self.profile.is_some() {
            signals::stop_profile_timer();
        }
        let mut head = head;
        self.range_check(head, &mut head, None);
        ACTIVE.store(ptr::null_mut(), Ordering::SeqCst);

        let _ = self.output.flush();
    }

    /// The profile counters, converted to prefix sums: a node's inclusive
    /// sample count is `counts[code.end] - counts[code.begin]`.
    pub fn take_profile(&mut self) -> Option<Vec<usize>> {
        let mut counts = self.profile.take()?;
        let mut total = 0;
        for count in &mut counts {
            let ticks = *count;
            *count = total;
            total += ticks;
        }
        Some(counts)
    }

    /// Decide what an out-of-bounds cell access means: one page right of the
    /// tape is demand growth, anything left of the tape is a bounds error
    /// that lands in the debugger, anything else is a programming error.
    ///
    /// Growth may move the tape; `head`'s logical offset is preserved.
    pub(crate) fn range_check(&mut self, cell: *const Cell, head: &mut *mut Cell, offset: Option<usize>) {
        let base = self.tape.base() as usize;
        let cell = cell as usize;
        if cell < base {
            eprintln!("tape head exceeds left bound!");
            debugger::debug_break(self, head, offset);
            assert!(base - cell < self.page_size);
            process::exit(1);
        }
        let end = base + self.tape.size();
        if cell >= end {
            assert!(cell - end < self.page_size, "fault beyond the right guard page");
            self.tape.grow(head);
        }
    }

    pub(crate) const fn tape(&self) -> &Tape {
        &self.tape
    }

    pub(crate) fn grow_tape(&mut self, head: &mut *mut Cell) {
        self.tape.grow(head);
    }

    pub(crate) fn code_offset(&self, addr: usize) -> Option<usize> {
        self.code.offset_of(addr)
    }

    pub(crate) fn flush_output(&mut self) {
        let _ = self.output.flush();
    }

    /// Record one profiler tick at the sampled instruction pointer.
    pub(crate) fn profile_sample(&mut self, ip: usize) {
        if let Some(offset) = self.code.offset_of(ip)
            && let Some(counts) = &mut self.profile
        {
            counts[offset] += 1;
        }
    }

    /// Walk a native stack sample and translate the first return address
    /// inside the code buffer to a code offset. Return addresses point one
    /// past the call, so back up by one byte before mapping.
    pub(crate) fn backtrace_offset(&self) -> Option<usize> {
        let mut frames = [ptr::null_mut::<libc::c_void>(); 64];
        let depth = unsafe { libc::backtrace(frames.as_mut_ptr(), 64) };
        frames[..usize::try_from(depth).unwrap_or(0)]
            .iter()
            .find_map(|&frame| self.code.offset_of(frame as usize))
            .map(|offset| offset.saturating_sub(1))
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

fn check_pending_interrupt(vm: &mut Vm, head: &mut *mut Cell) {
    if signals::take_pending_interrupt() {
        let offset = vm.backtrace_offset();
        debugger::debug_break(vm, head, offset);
    }
}

extern "C" fn cb_read(head: *mut Cell) -> *mut Cell {
    let vm = active().expect("read callback outside execution");
    let mut head = head;
    vm.range_check(head, &mut head, None);
    let mut buffer = [0u8];
    match vm.input.read_exact(&mut buffer) {
        Ok(()) => unsafe { *head = buffer[0] },
        Err(_) => {
            if let Some(value) = vm.eof_value {
                unsafe { *head = value };
            }
        }
    }
    check_pending_interrupt(vm, &mut head);
    head
}

extern "C" fn cb_write(head: *mut Cell) -> *mut Cell {
    let vm = active().expect("write callback outside execution");
    let mut head = head;
    vm.range_check(head, &mut head, None);
    let byte = unsafe { *head };
    if let Err(error) = vm.output.write_all(&[byte]) {
        panic!("failed to write program output: {error}");
    }
    check_pending_interrupt(vm, &mut head);
    head
}

extern "C" fn cb_debug(head: *mut Cell) -> *mut Cell {
    let vm = active().expect("debug callback outside execution");
    let mut head = head;
    vm.range_check(head, &mut head, None);
    let offset = vm.backtrace_offset();
    debugger::debug_break(vm, &mut head, offset);
    head
}

extern "C" fn cb_wrapped(head: *mut Cell) -> *mut Cell {
    let vm = active().expect("wrap callback outside execution");
    eprintln!("cell value wrapped around!");
    let mut head = head;
    vm.range_check(head, &mut head, None);
    let offset = vm.backtrace_offset();
    debugger::debug_break(vm, &mut head, offset);
    head
}
