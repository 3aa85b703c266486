pub mod disasm;
pub mod dwarf;
pub mod unwind;

#[cfg(test)]
pub(crate) mod mock;

use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::debugee::disasm::Instruction;
use crate::debugger::debugee::dwarf::{Function, FunctionClass, Place};
use crate::debugger::debugee::unwind::Stackframe;
use crate::debugger::error::Error;
use crate::debugger::StopReason;
use gimli::Range;
use nix::unistd::Pid;
use std::path::Path;

/// Thread position.
/// Contains pid of thread, relocated and global address of instruction where thread stop.
#[derive(Clone, Copy, Debug)]
pub struct Location {
    pub pc: RelocatedAddress,
    pub global_pc: GlobalAddress,
    pub pid: Pid,
}

/// Identifier of a task - a cooperatively-scheduled execution unit inside the debugee.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct TaskId(pub u64);

/// Task runtime state: which thread (if any) it is scheduled on and where it resumes.
#[derive(Clone, Debug)]
pub struct Task {
    pub id: TaskId,
    /// Thread the task currently runs on, `None` if the task is parked.
    pub thread: Option<Pid>,
    /// Saved resume pc; for a running task this is its current pc.
    pub pc: RelocatedAddress,
}

impl Task {
    pub fn is_parked(&self) -> bool {
        self.thread.is_none()
    }
}

/// Execution direction of the debugee, reverse is available on record-replay backends.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

/// Result of one resume-until-trap cycle.
#[derive(Clone, Copy, Debug)]
pub struct TrapEvent {
    /// Thread that received the trap.
    pub pid: Pid,
    /// Coarse stop classification, refined later by the dispatcher.
    pub reason: StopReason,
}

/// Architecture facts the dispatcher needs around the trap instruction.
#[derive(Clone, Copy, Debug)]
pub struct ArchInfo {
    pub break_instruction: &'static [u8],
    /// Whether hitting the trap instruction leaves the pc after it.
    pub break_moves_pc: bool,
    pub max_instruction_len: usize,
}

pub const X86_64: ArchInfo = ArchInfo {
    break_instruction: &[0xCC],
    break_moves_pc: true,
    max_instruction_len: 15,
};

pub const AARCH64: ArchInfo = ArchInfo {
    break_instruction: &[0x00, 0x00, 0x20, 0xD4],
    break_moves_pc: false,
    max_instruction_len: 4,
};

/// Description of the frame a stepping operation will return from,
/// used to read the call's return value once the return breakpoint hits.
#[derive(Debug, Clone)]
pub struct ReturnCapture {
    pub function: Function,
    pub frame_offset: i64,
}

/// One value returned by a stepped-over call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnValue {
    pub name: String,
    pub value: u64,
}

/// The debugged process as seen by the stepping engine.
///
/// Implementations wrap a concrete execution backend (ptrace, record-replay, a core dump
/// replayer) together with its debug information, disassembler and stack unwinder. All
/// methods are called from the single control thread.
pub trait Debugee {
    // ---------------------------------- process control ------------------------------------------

    /// Resume every stopped thread and block until the next trap.
    ///
    /// Threads stopped on an engine breakpoint must report their pc rewound to the
    /// breakpoint address. Returns [`Error::ProcessExit`] when the debugee is gone.
    fn resume_and_wait(&mut self) -> Result<TrapEvent, Error>;

    /// Live threads of the debugee.
    fn threads(&self) -> Vec<Pid>;

    /// Execute exactly one instruction on one thread
    /// (one instruction backwards when the direction is reverse).
    fn single_step(&mut self, pid: Pid) -> Result<(), Error>;

    fn direction(&self) -> Direction;

    /// Drop memory and line caches, the address space may have changed since the last stop.
    fn invalidate_caches(&mut self);

    fn arch(&self) -> ArchInfo;

    // ---------------------------------- registers and memory -------------------------------------

    fn pc(&self, pid: Pid) -> Result<RelocatedAddress, Error>;

    fn set_pc(&mut self, pid: Pid, pc: RelocatedAddress) -> Result<(), Error>;

    fn read_memory(&self, addr: RelocatedAddress, len: usize) -> Result<Vec<u8>, Error>;

    // ---------------------------------- breakpoint patching --------------------------------------

    /// Patch the trap instruction in at `addr`.
    fn arm_breakpoint(&mut self, addr: RelocatedAddress) -> Result<(), Error>;

    /// Restore the original bytes at `addr`.
    fn disarm_breakpoint(&mut self, addr: RelocatedAddress) -> Result<(), Error>;

    // ---------------------------------- address mapping ------------------------------------------

    fn relocate(&self, addr: GlobalAddress) -> RelocatedAddress;

    fn globalize(&self, addr: RelocatedAddress) -> GlobalAddress;

    // ---------------------------------- tasks and live state -------------------------------------

    /// Task currently scheduled on a thread, `None` for threads outside the task runtime.
    fn task_of_thread(&self, pid: Pid) -> Option<Task>;

    /// Current frame offset of a thread, input of frame-offset breakpoint conditions.
    fn frame_offset(&self, pid: Pid) -> Result<i64, Error>;

    // ---------------------------------- debug information ----------------------------------------

    fn find_place_from_pc(&self, pc: GlobalAddress) -> Option<Place>;

    /// Innermost (inline-resolved) function at an address.
    fn find_function_by_pc(&self, pc: GlobalAddress) -> Option<Function>;

    /// Every line-table address inside `func` belonging to `file` with a line
    /// number of at least `from_line`.
    fn line_addresses(
        &self,
        func: &Function,
        file: &Path,
        from_line: u64,
    ) -> Result<Vec<GlobalAddress>, Error>;

    /// Address ranges of the calls inlined into the frame's function, the frame's own
    /// logical body excluded: for an inlined frame its body ranges survive, for a physical
    /// frame every nested inlined call is reported.
    fn inlined_ranges(&self, frame: &Stackframe) -> Vec<Range>;

    /// First address after the function prologue.
    fn skip_prologue(&self, func: &Function) -> Result<GlobalAddress, Error>;

    fn classify_function(&self, func: &Function) -> FunctionClass;

    /// Whether a source point belongs to compiler-generated code (trampolines,
    /// synthesized wrappers).
    fn is_compiler_generated(&self, place: &Place) -> bool;

    // ---------------------------------- disassembler ---------------------------------------------

    /// Linear instruction listing of `[from, to)`.
    fn disasm_range(
        &self,
        from: RelocatedAddress,
        to: RelocatedAddress,
    ) -> Result<Vec<Instruction>, Error>;

    // ---------------------------------- stack unwinder -------------------------------------------

    /// Top `depth` frames of a thread.
    fn unwind_thread(&self, pid: Pid, depth: usize) -> Result<Vec<Stackframe>, Error>;

    /// Top `depth` frames of a task, usable for parked tasks too.
    fn unwind_task(&self, task: TaskId, depth: usize) -> Result<Vec<Stackframe>, Error>;

    // ---------------------------------- call injection -------------------------------------------

    /// Run one step of the call-injection protocol.
    ///
    /// Returns whether an injected call just completed, and an error to surface once the
    /// dispatcher finished thread selection.
    fn call_injection_protocol(&mut self) -> (bool, Option<Error>);

    /// Read the values a frame described by `capture` returned.
    fn read_return_values(
        &self,
        pid: Pid,
        capture: &ReturnCapture,
    ) -> Result<Vec<ReturnValue>, Error>;
}
