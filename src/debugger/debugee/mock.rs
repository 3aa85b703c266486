//! Scriptable fake process for engine tests: a handful of threads, tasks, functions and
//! instructions plus a programmable trap schedule, standing in for a real traced debugee.

use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::debugee::disasm::{CallDestination, Instruction, InstructionKind};
use crate::debugger::debugee::dwarf::{Function, FunctionClass, Place};
use crate::debugger::debugee::unwind::Stackframe;
use crate::debugger::debugee::{
    ArchInfo, Debugee, Direction, ReturnCapture, ReturnValue, Task, TaskId, TrapEvent, X86_64,
};
use crate::debugger::error::Error;
use crate::debugger::StopReason;
use anyhow::anyhow;
use gimli::Range;
use indexmap::IndexMap;
use nix::unistd::Pid;
use std::cell::{Ref, RefCell, RefMut};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub(crate) struct FunctionSpec {
    function: Function,
    file: PathBuf,
    lines: Vec<(usize, u64)>,
    prologue_end: usize,
    class: FunctionClass,
    generated: bool,
}

impl FunctionSpec {
    pub fn new(name: impl Into<String>, entry: usize, end: usize) -> Self {
        Self {
            function: Function::new(name, entry.into(), end.into()),
            file: PathBuf::from("unknown.rs"),
            lines: vec![],
            prologue_end: entry,
            class: FunctionClass::Ordinary,
            generated: false,
        }
    }

    pub fn file(mut self, file: &str) -> Self {
        self.file = PathBuf::from(file);
        self
    }

    /// Mark the function body as compiler-generated code attributed to `file`.
    pub fn generated_entry(mut self, file: &str) -> Self {
        self.file = PathBuf::from(file);
        self.generated = true;
        self
    }

    pub fn prologue_end(mut self, addr: usize) -> Self {
        self.prologue_end = addr;
        self
    }

    pub fn class(mut self, class: FunctionClass) -> Self {
        self.class = class;
        self
    }

    pub fn line(mut self, addr: usize, line: u64) -> Self {
        self.lines.push((addr, line));
        self
    }
}

struct MockInstr {
    addr: usize,
    kind: InstructionKind,
    dest_name: Option<String>,
    place: Option<Place>,
}

enum ResumeAction {
    Trap {
        pid: Pid,
        reason: StopReason,
        set_pcs: Vec<(Pid, usize)>,
        rebinds: Vec<(TaskId, Option<Pid>, usize)>,
    },
    Exit(i32),
}

#[derive(Default)]
pub(crate) struct MockState {
    offset: usize,
    arch: Option<ArchInfo>,
    direction: Direction,

    threads: IndexMap<Pid, RelocatedAddress>,
    tasks: HashMap<TaskId, Task>,
    thread_tasks: HashMap<Pid, TaskId>,
    frame_offsets: HashMap<Pid, i64>,
    frame_offset_errors: HashMap<Pid, String>,

    functions: Vec<FunctionSpec>,
    instructions: Vec<MockInstr>,
    inlined_ranges: HashMap<String, Vec<(u64, u64)>>,
    generated_files: HashSet<PathBuf>,

    task_frames: HashMap<TaskId, Vec<Stackframe>>,
    thread_frames: HashMap<Pid, Vec<Stackframe>>,

    memory: HashMap<usize, Vec<u8>>,
    return_values: Vec<ReturnValue>,

    resume_script: VecDeque<ResumeAction>,
    injection_script: VecDeque<(bool, Option<Error>)>,
    step_script: VecDeque<(Pid, usize)>,
    stop_flag_on_resume: Option<Arc<AtomicBool>>,

    armed: HashSet<RelocatedAddress>,
    arm_log: Vec<RelocatedAddress>,
    single_steps: Vec<Pid>,
    invalidations: usize,
}

impl MockState {
    // ---- scene building ----

    pub fn set_offset(&mut self, offset: usize) {
        self.offset = offset;
    }

    pub fn set_arch(&mut self, arch: ArchInfo) {
        self.arch = Some(arch);
    }

    pub fn set_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    pub fn add_thread(&mut self, pid: Pid, pc: RelocatedAddress) {
        self.threads.insert(pid, pc);
    }

    pub fn bind_task(&mut self, id: TaskId, thread: Option<Pid>, pc: RelocatedAddress) {
        if let Some(pid) = thread {
            self.thread_tasks.insert(pid, id);
        }
        self.tasks.insert(id, Task { id, thread, pc });
    }

    pub fn set_frame_offset(&mut self, pid: Pid, offset: i64) {
        self.frame_offsets.insert(pid, offset);
    }

    pub fn fail_frame_offset(&mut self, pid: Pid, message: &str) {
        self.frame_offset_errors.insert(pid, message.to_string());
    }

    pub fn add_function(&mut self, spec: FunctionSpec) {
        if spec.generated {
            self.generated_files.insert(spec.file.clone());
        }
        self.functions.push(spec);
    }

    pub fn rename_function(&mut self, from: &str, to: &str) {
        for spec in self.functions.iter_mut() {
            if spec.function.name == from {
                spec.function.name = to.to_string();
            }
        }
        for instr in self.instructions.iter_mut() {
            if instr.dest_name.as_deref() == Some(from) {
                instr.dest_name = Some(to.to_string());
            }
        }
    }

    pub fn function(&self, name: &str) -> Function {
        self.functions
            .iter()
            .find(|spec| spec.function.name == name)
            .map(|spec| spec.function.clone())
            .expect("unknown function in test scene")
    }

    pub fn add_call(&mut self, addr: usize, dest: Option<&str>) {
        self.instructions.push(MockInstr {
            addr,
            kind: InstructionKind::Call,
            dest_name: dest.map(ToString::to_string),
            place: None,
        });
    }

    pub fn add_instr(&mut self, addr: usize, file: &str, line: u64) {
        self.instructions.push(MockInstr {
            addr,
            kind: InstructionKind::Other,
            dest_name: None,
            place: Some(Place::new(file, line)),
        });
    }

    pub fn set_inlined_ranges(&mut self, func: &str, ranges: Vec<(u64, u64)>) {
        self.inlined_ranges.insert(func.to_string(), ranges);
    }

    pub fn frame_at(
        &self,
        pc: usize,
        func: Option<&str>,
        ret_addr: Option<usize>,
        frame_offset: i64,
    ) -> Stackframe {
        let pc = RelocatedAddress::from(pc);
        let global_pc = pc.into_global(self.offset);
        let mut frame = Stackframe::new(pc, global_pc);
        frame.function = func.map(|name| self.function(name));
        frame.place = self.place_for(global_pc);
        frame.ret_addr = ret_addr.map(RelocatedAddress::from);
        frame.frame_offset = frame_offset;
        frame
    }

    pub fn set_task_frames(&mut self, id: TaskId, frames: Vec<Stackframe>) {
        self.task_frames.insert(id, frames);
    }

    pub fn set_thread_frames(&mut self, pid: Pid, frames: Vec<Stackframe>) {
        self.thread_frames.insert(pid, frames);
    }

    pub fn set_memory(&mut self, addr: usize, bytes: Vec<u8>) {
        self.memory.insert(addr, bytes);
    }

    pub fn set_return_values(&mut self, values: Vec<ReturnValue>) {
        self.return_values = values;
    }

    // ---- scripting ----

    pub fn push_trap(&mut self, pid: Pid, reason: StopReason, set_pcs: Vec<(Pid, usize)>) {
        self.resume_script.push_back(ResumeAction::Trap {
            pid,
            reason,
            set_pcs,
            rebinds: vec![],
        });
    }

    pub fn push_trap_rebinding(
        &mut self,
        pid: Pid,
        reason: StopReason,
        set_pcs: Vec<(Pid, usize)>,
        rebinds: Vec<(TaskId, Option<Pid>, usize)>,
    ) {
        self.resume_script.push_back(ResumeAction::Trap {
            pid,
            reason,
            set_pcs,
            rebinds,
        });
    }

    pub fn push_exit(&mut self, code: i32) {
        self.resume_script.push_back(ResumeAction::Exit(code));
    }

    pub fn push_injection(&mut self, done: bool, error: Option<Error>) {
        self.injection_script.push_back((done, error));
    }

    pub fn push_step(&mut self, pid: Pid, pc: usize) {
        self.step_script.push_back((pid, pc));
    }

    pub fn set_stop_flag_on_resume(&mut self, flag: Arc<AtomicBool>) {
        self.stop_flag_on_resume = Some(flag);
    }

    // ---- observation ----

    pub fn arm_count(&self, addr: RelocatedAddress) -> usize {
        self.arm_log.iter().filter(|a| **a == addr).count()
    }

    pub fn is_armed(&self, addr: RelocatedAddress) -> bool {
        self.armed.contains(&addr)
    }

    pub fn armed_log(&self) -> Vec<RelocatedAddress> {
        self.arm_log.clone()
    }

    pub fn single_steps(&self) -> Vec<Pid> {
        self.single_steps.clone()
    }

    pub fn invalidations(&self) -> usize {
        self.invalidations
    }

    pub fn instructions_in(&self, from: usize, to: usize) -> Vec<Instruction> {
        let mut instructions: Vec<_> = self
            .instructions
            .iter()
            .filter(|instr| instr.addr >= from && instr.addr < to)
            .map(|instr| self.materialize(instr))
            .collect();
        instructions.sort_by_key(|instr| instr.addr);
        instructions
    }

    // ---- internals ----

    fn materialize(&self, instr: &MockInstr) -> Instruction {
        let dest = match &instr.dest_name {
            Some(name) => {
                let function = self.function(name);
                Some(CallDestination {
                    pc: function.entry.relocate(self.offset),
                    function: Some(function),
                })
            }
            None => None,
        };
        let place = instr
            .place
            .clone()
            .or_else(|| self.place_for(RelocatedAddress::from(instr.addr).into_global(self.offset)));
        Instruction {
            addr: RelocatedAddress::from(instr.addr),
            kind: instr.kind,
            place,
            dest,
        }
    }

    fn spec_by_pc(&self, pc: GlobalAddress) -> Option<&FunctionSpec> {
        self.functions.iter().find(|spec| spec.function.contains(pc))
    }

    fn spec_by_name(&self, name: &str) -> Option<&FunctionSpec> {
        self.functions.iter().find(|spec| spec.function.name == name)
    }

    fn place_for(&self, pc: GlobalAddress) -> Option<Place> {
        let spec = self.spec_by_pc(pc)?;
        if spec.generated {
            return Some(Place::new(spec.file.clone(), 1));
        }
        spec.lines
            .iter()
            .filter(|(addr, _)| GlobalAddress::from(*addr) <= pc)
            .max_by_key(|(addr, _)| *addr)
            .map(|(_, line)| Place::new(spec.file.clone(), *line))
    }
}

/// Shared-handle mock: tests keep a clone to script and observe the state while the
/// debugger owns the other.
#[derive(Clone)]
pub(crate) struct MockDebugee {
    state: Rc<RefCell<MockState>>,
}

impl MockDebugee {
    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(MockState::default())),
        }
    }

    pub fn state(&self) -> Ref<'_, MockState> {
        self.state.borrow()
    }

    pub fn state_mut(&self) -> RefMut<'_, MockState> {
        self.state.borrow_mut()
    }
}

impl Debugee for MockDebugee {
    fn resume_and_wait(&mut self) -> Result<TrapEvent, Error> {
        let mut state = self.state.borrow_mut();
        if let Some(flag) = &state.stop_flag_on_resume {
            flag.store(true, Ordering::SeqCst);
        }
        match state.resume_script.pop_front() {
            None => Err(Error::Backend(anyhow!("resume script exhausted"))),
            Some(ResumeAction::Exit(code)) => Err(Error::ProcessExit(code)),
            Some(ResumeAction::Trap {
                pid,
                reason,
                set_pcs,
                rebinds,
            }) => {
                for (pid, pc) in set_pcs {
                    state.threads.insert(pid, pc.into());
                }
                for (id, thread, pc) in rebinds {
                    state.thread_tasks.retain(|_, task| *task != id);
                    if let Some(pid) = thread {
                        state.thread_tasks.insert(pid, id);
                    }
                    state.tasks.insert(
                        id,
                        Task {
                            id,
                            thread,
                            pc: pc.into(),
                        },
                    );
                }
                Ok(TrapEvent { pid, reason })
            }
        }
    }

    fn threads(&self) -> Vec<Pid> {
        self.state.borrow().threads.keys().copied().collect()
    }

    fn single_step(&mut self, pid: Pid) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        state.single_steps.push(pid);
        if let Some((step_pid, pc)) = state.step_script.pop_front() {
            assert_eq!(step_pid, pid, "single step scripted for another thread");
            state.threads.insert(pid, pc.into());
        }
        Ok(())
    }

    fn direction(&self) -> Direction {
        self.state.borrow().direction
    }

    fn invalidate_caches(&mut self) {
        self.state.borrow_mut().invalidations += 1;
    }

    fn arch(&self) -> ArchInfo {
        self.state.borrow().arch.unwrap_or(X86_64)
    }

    fn pc(&self, pid: Pid) -> Result<RelocatedAddress, Error> {
        self.state
            .borrow()
            .threads
            .get(&pid)
            .copied()
            .ok_or(Error::ThreadNotFound(pid))
    }

    fn set_pc(&mut self, pid: Pid, pc: RelocatedAddress) -> Result<(), Error> {
        self.state.borrow_mut().threads.insert(pid, pc);
        Ok(())
    }

    fn read_memory(&self, addr: RelocatedAddress, len: usize) -> Result<Vec<u8>, Error> {
        let state = self.state.borrow();
        let mut bytes = state
            .memory
            .get(&addr.as_usize())
            .cloned()
            .unwrap_or_else(|| vec![0; len]);
        bytes.truncate(len);
        Ok(bytes)
    }

    fn arm_breakpoint(&mut self, addr: RelocatedAddress) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        state.armed.insert(addr);
        state.arm_log.push(addr);
        Ok(())
    }

    fn disarm_breakpoint(&mut self, addr: RelocatedAddress) -> Result<(), Error> {
        self.state.borrow_mut().armed.remove(&addr);
        Ok(())
    }

    fn relocate(&self, addr: GlobalAddress) -> RelocatedAddress {
        addr.relocate(self.state.borrow().offset)
    }

    fn globalize(&self, addr: RelocatedAddress) -> GlobalAddress {
        addr.into_global(self.state.borrow().offset)
    }

    fn task_of_thread(&self, pid: Pid) -> Option<Task> {
        let state = self.state.borrow();
        let id = state.thread_tasks.get(&pid)?;
        state.tasks.get(id).cloned()
    }

    fn frame_offset(&self, pid: Pid) -> Result<i64, Error> {
        let state = self.state.borrow();
        if let Some(message) = state.frame_offset_errors.get(&pid) {
            return Err(Error::Backend(anyhow!("{message}")));
        }
        state
            .frame_offsets
            .get(&pid)
            .copied()
            .ok_or_else(|| Error::Backend(anyhow!("frame offset unset for {pid}")))
    }

    fn find_place_from_pc(&self, pc: GlobalAddress) -> Option<Place> {
        self.state.borrow().place_for(pc)
    }

    fn find_function_by_pc(&self, pc: GlobalAddress) -> Option<Function> {
        self.state
            .borrow()
            .spec_by_pc(pc)
            .map(|spec| spec.function.clone())
    }

    fn line_addresses(
        &self,
        func: &Function,
        file: &Path,
        from_line: u64,
    ) -> Result<Vec<GlobalAddress>, Error> {
        let state = self.state.borrow();
        let Some(spec) = state.spec_by_name(&func.name) else {
            return Ok(vec![]);
        };
        if spec.file != file {
            return Ok(vec![]);
        }
        let mut addresses: Vec<GlobalAddress> = spec
            .lines
            .iter()
            .filter(|(addr, line)| {
                *line >= from_line && func.contains(GlobalAddress::from(*addr))
            })
            .map(|(addr, _)| GlobalAddress::from(*addr))
            .collect();
        addresses.sort();
        Ok(addresses)
    }

    fn inlined_ranges(&self, frame: &Stackframe) -> Vec<Range> {
        let state = self.state.borrow();
        let Some(func) = &frame.function else {
            return vec![];
        };
        state
            .inlined_ranges
            .get(&func.name)
            .map(|ranges| {
                ranges
                    .iter()
                    .map(|(begin, end)| Range {
                        begin: *begin,
                        end: *end,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn skip_prologue(&self, func: &Function) -> Result<GlobalAddress, Error> {
        let state = self.state.borrow();
        Ok(state
            .spec_by_name(&func.name)
            .map(|spec| GlobalAddress::from(spec.prologue_end))
            .unwrap_or(func.entry))
    }

    fn classify_function(&self, func: &Function) -> FunctionClass {
        self.state
            .borrow()
            .spec_by_name(&func.name)
            .map(|spec| spec.class)
            .unwrap_or(FunctionClass::Ordinary)
    }

    fn is_compiler_generated(&self, place: &Place) -> bool {
        self.state.borrow().generated_files.contains(&place.file)
    }

    fn disasm_range(
        &self,
        from: RelocatedAddress,
        to: RelocatedAddress,
    ) -> Result<Vec<Instruction>, Error> {
        Ok(self
            .state
            .borrow()
            .instructions_in(from.as_usize(), to.as_usize()))
    }

    fn unwind_thread(&self, pid: Pid, depth: usize) -> Result<Vec<Stackframe>, Error> {
        let state = self.state.borrow();
        if let Some(frames) = state.thread_frames.get(&pid) {
            return Ok(frames.iter().take(depth).cloned().collect());
        }
        let task = state.thread_tasks.get(&pid);
        if let Some(frames) = task.and_then(|id| state.task_frames.get(id)) {
            return Ok(frames.iter().take(depth).cloned().collect());
        }
        Ok(vec![])
    }

    fn unwind_task(&self, task: TaskId, depth: usize) -> Result<Vec<Stackframe>, Error> {
        let state = self.state.borrow();
        Ok(state
            .task_frames
            .get(&task)
            .map(|frames| frames.iter().take(depth).cloned().collect())
            .unwrap_or_default())
    }

    fn call_injection_protocol(&mut self) -> (bool, Option<Error>) {
        self.state
            .borrow_mut()
            .injection_script
            .pop_front()
            .unwrap_or((false, None))
    }

    fn read_return_values(
        &self,
        _pid: Pid,
        _capture: &ReturnCapture,
    ) -> Result<Vec<ReturnValue>, Error> {
        Ok(self.state.borrow().return_values.clone())
    }
}
