pub mod address;
pub mod breakpoint;
pub mod condition;
pub mod debugee;
mod defers;
pub mod error;
mod step;
mod wrapper;

pub use error::Error;

use crate::debugger::breakpoint::{
    Breakpoint, BreakpointHit, BreakpointRegistry, BreakletKind, UNRECOVERED_PANIC,
};
use crate::debugger::condition::BreakCondition;
use crate::debugger::debugee::dwarf::FunctionClass;
use crate::debugger::debugee::{Debugee, Direction, Location, ReturnValue, Task, TaskId};
use crate::debugger::address::RelocatedAddress;
use crate::{muted_error, weak_error};
use log::debug;
use nix::unistd::Pid;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Why the debugee is currently stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, strum_macros::Display)]
pub enum StopReason {
    #[default]
    #[strum(serialize = "unknown")]
    Unknown,
    /// The process just reached its entry point.
    #[strum(serialize = "launched")]
    Launched,
    #[strum(serialize = "breakpoint")]
    Breakpoint,
    #[strum(serialize = "watchpoint")]
    Watchpoint,
    /// A trap instruction compiled into the debugee itself.
    #[strum(serialize = "hardcoded breakpoint")]
    HardcodedBreakpoint,
    #[strum(serialize = "manual stop")]
    ManualStop,
    /// A step/next/step-out operation ran to completion.
    #[strum(serialize = "next finished")]
    NextFinished,
    /// An injected function call returned.
    #[strum(serialize = "call returned")]
    CallReturned,
}

/// When to leave the stepping breakpoints of an operation in progress alive.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeepSteppingPolicy {
    /// A manual stop suspends the step instead of cancelling it.
    pub on_manual_stop: bool,
    /// A tracepoint hit reports the stop without cancelling the step.
    pub on_tracepoint: bool,
}

/// Debug session: drives the stopped-process event loop and the source-level stepping
/// operations over an abstract [`Debugee`] backend.
///
/// All state transitions happen on the single control thread, the only suspension point
/// is [`Debugee::resume_and_wait`]. The manual-stop flag is the one piece of state a
/// concurrent party (a signal handler, a UI thread) is allowed to touch.
pub struct Debugger<D: Debugee> {
    debugee: D,
    breakpoints: BreakpointRegistry,
    /// Per-thread breakpoint-hit states, recalculated after every trap.
    hits: HashMap<Pid, BreakpointHit>,
    thread_on_focus: Option<Pid>,
    selected_task: Option<Task>,
    stop_reason: StopReason,
    exit_status: Option<i32>,
    stop_request: Arc<AtomicBool>,
    keep_stepping: KeepSteppingPolicy,
    /// Tasks with an injected function call in flight.
    injections: HashSet<TaskId>,
    /// Return values captured by the last completed step-over/step-out.
    captured_return: Vec<ReturnValue>,
}

impl<D: Debugee> Debugger<D> {
    pub fn new(debugee: D) -> Self {
        Self {
            debugee,
            breakpoints: BreakpointRegistry::default(),
            hits: HashMap::new(),
            thread_on_focus: None,
            selected_task: None,
            stop_reason: StopReason::default(),
            exit_status: None,
            stop_request: Arc::new(AtomicBool::new(false)),
            keep_stepping: KeepSteppingPolicy::default(),
            injections: HashSet::new(),
            captured_return: vec![],
        }
    }

    pub fn debugee(&self) -> &D {
        &self.debugee
    }

    pub fn debugee_mut(&mut self) -> &mut D {
        &mut self.debugee
    }

    pub fn breakpoints(&self) -> &BreakpointRegistry {
        &self.breakpoints
    }

    pub fn stop_reason(&self) -> StopReason {
        self.stop_reason
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    pub fn focused_thread(&self) -> Option<Pid> {
        self.thread_on_focus
    }

    /// Position of the thread on focus.
    pub fn current_location(&self) -> Result<Location, Error> {
        let pid = self.ensure_thread_on_focus()?;
        let pc = self.debugee.pc(pid)?;
        Ok(Location {
            pc,
            global_pc: self.debugee.globalize(pc),
            pid,
        })
    }

    pub fn selected_task(&self) -> Option<&Task> {
        self.selected_task.as_ref()
    }

    /// Explicitly select a task, subsequent stepping operations drive it.
    pub fn select_task(&mut self, task: Task) {
        self.selected_task = Some(task);
    }

    /// Make `pid` the thread on focus, re-binding the selected task to whatever task
    /// currently runs there.
    pub fn switch_thread(&mut self, pid: Pid) {
        self.thread_on_focus = Some(pid);
        self.selected_task = self.debugee.task_of_thread(pid);
    }

    /// Handle to the asynchronously-settable manual-stop flag.
    pub fn stop_request_handle(&self) -> Arc<AtomicBool> {
        self.stop_request.clone()
    }

    pub fn set_keep_stepping_policy(&mut self, policy: KeepSteppingPolicy) {
        self.keep_stepping = policy;
    }

    /// Values the last stepped-over call returned.
    pub fn captured_return_values(&self) -> &[ReturnValue] {
        &self.captured_return
    }

    pub fn set_user_breakpoint(
        &mut self,
        addr: RelocatedAddress,
        cond: Option<BreakCondition>,
    ) -> Result<&mut Breakpoint, Error> {
        self.breakpoints
            .set(&mut self.debugee, addr, BreakletKind::User, cond)
    }

    pub fn remove_breakpoint(&mut self, addr: RelocatedAddress) -> Result<(), Error> {
        self.breakpoints.remove(&mut self.debugee, addr)
    }

    /// Register an injected call in flight on `task`, hardcoded traps on its threads
    /// belong to the injection executor until [`Debugger::injection_finished`].
    pub fn injection_started(&mut self, task: TaskId) {
        self.injections.insert(task);
    }

    pub fn injection_finished(&mut self, task: TaskId) {
        self.injections.remove(&task);
    }

    pub fn has_active_injection(&self, task: TaskId) -> bool {
        self.injections.contains(&task)
    }

    pub(super) fn ensure_running(&self) -> Result<(), Error> {
        match self.exit_status {
            Some(code) => Err(Error::ProcessExit(code)),
            None => Ok(()),
        }
    }

    pub(super) fn ensure_thread_on_focus(&self) -> Result<Pid, Error> {
        self.thread_on_focus.ok_or(Error::ProcessNotStarted)
    }

    fn check_and_clear_stop_request(&self) -> bool {
        self.stop_request.swap(false, Ordering::SeqCst)
    }

    /// Continue execution of the debugee until a breakpoint hit or another qualifying stop.
    ///
    /// Returns the stop reason, the session is left stopped at a well-defined location.
    pub fn continue_execution(&mut self) -> Result<StopReason, Error> {
        self.ensure_running()?;
        self.captured_return.clear();
        // a request raised before the resume is stale, drop it
        self.check_and_clear_stop_request();
        let res = self.dispatch();
        // a manual stop racing with a qualifying stop still cancels the step
        if self.check_and_clear_stop_request() {
            self.stop_reason = StopReason::ManualStop;
            if !self.keep_stepping.on_manual_stop {
                weak_error!(self.breakpoints.clear_stepping(&mut self.debugee));
            }
        }
        res.map(|_| self.stop_reason)
    }

    /// The trap dispatcher: resume, wait, classify, repeat until a stop qualifies.
    fn dispatch(&mut self) -> Result<(), Error> {
        loop {
            if self.check_and_clear_stop_request() {
                self.stop_reason = StopReason::ManualStop;
                if !self.keep_stepping.on_manual_stop {
                    self.breakpoints.clear_stepping(&mut self.debugee)?;
                }
                return Ok(());
            }

            self.debugee.invalidate_caches();
            let trap = match self.debugee.resume_and_wait() {
                Ok(trap) => trap,
                Err(e) => {
                    if let Error::ProcessExit(status) = &e {
                        self.exit_status = Some(*status);
                    }
                    // refresh the selected task before surfacing the failure so the
                    // session stays consistent for the frontend
                    if let Some(pid) = self.thread_on_focus {
                        if let Some(task) = self.debugee.task_of_thread(pid) {
                            self.selected_task = Some(task);
                        }
                    }
                    return Err(e);
                }
            };

            self.stop_reason = trap.reason;
            debug!(target: "debugger", "thread {} trapped, coarse reason `{}`", trap.pid, trap.reason);

            if trap.reason == StopReason::Launched {
                self.breakpoints.clear_stepping(&mut self.debugee)?;
            }

            self.refresh_hit_states();

            let (injection_done, injection_err) = self.debugee.call_injection_protocol();
            // the error report is delayed until after thread selection, the session
            // state must stay consistent
            let pid = self.pick_current_thread(trap.pid);
            if let Some(e) = injection_err {
                return Err(e);
            }

            let hit = self
                .hits
                .get(&pid)
                .map(|hit| (hit.addr, hit.active, hit.stepping, hit.stepping_into));

            match hit {
                None => {
                    // a hardcoded trap, a manual stop or an injection-protocol stop
                    let pc = self.debugee.pc(pid)?;
                    let Some(func) = self.debugee.find_function_by_pc(self.debugee.globalize(pc))
                    else {
                        return self.condition_errors_result();
                    };

                    if self.debugee.classify_function(&func) == FunctionClass::SelfBreak {
                        let arch = self.debugee.arch();
                        if !arch.break_moves_pc {
                            self.debugee
                                .set_pc(pid, pc.offset(arch.break_instruction.len() as isize))?;
                        }
                        self.step_instruction_out(pid)?;
                        self.stop_reason = StopReason::HardcodedBreakpoint;
                        return self.condition_errors_result();
                    }

                    let task = self.debugee.task_of_thread(pid);
                    let injection_active = task
                        .map(|task| self.injections.contains(&task.id))
                        .unwrap_or(false);
                    if !injection_active {
                        self.fixup_pc_past_trap(pid, pc)?;
                        return self.condition_errors_result();
                    }
                    // the injection executor owns this trap, fall through
                }
                Some((_, true, true, true)) => {
                    if self.debugee.direction() == Direction::Forward {
                        self.condition_errors_result()?;
                        // the call instruction is reached, resolve its destination and
                        // break inside the callee (or resume and let the per-line
                        // breakpoints catch up)
                        let pc = self.debugee.pc(pid)?;
                        let arch = self.debugee.arch();
                        let text = self
                            .debugee
                            .disasm_range(pc, pc.offset(arch.max_instruction_len as isize))?;
                        let curfn =
                            self.debugee.find_function_by_pc(self.debugee.globalize(pc));
                        let same_task = BreakCondition::same_task(self.selected_task.as_ref());
                        if let Some(instr) = text.first() {
                            let instr = instr.clone();
                            self.set_step_into_breakpoint(curfn.as_ref(), &instr, same_task)?;
                        }
                    } else {
                        self.breakpoints.clear_stepping(&mut self.debugee)?;
                        return self.step_instruction_inner();
                    }
                }
                Some((addr, true, true, false)) => {
                    let capture = self
                        .breakpoints
                        .get(addr)
                        .and_then(|bp| bp.return_capture.clone());
                    if let Some(capture) = capture {
                        if let Some(values) =
                            weak_error!(self.debugee.read_return_values(pid, &capture))
                        {
                            self.captured_return = values;
                        }
                    }
                    self.breakpoints.clear_stepping(&mut self.debugee)?;
                    self.stop_reason = StopReason::NextFinished;
                    return self.condition_errors_result();
                }
                Some((addr, true, false, _)) => {
                    let on_step_task = self.on_step_task(pid)?;
                    let (tracepoint, unrecovered_panic, watchpoint, exhausted) =
                        match self.breakpoints.get(addr) {
                            Some(bp) => (
                                bp.is_tracepoint(),
                                bp.name.as_deref() == Some(UNRECOVERED_PANIC),
                                bp.watch_type.is_some(),
                                bp.hit_cond_exhausted(),
                            ),
                            None => (false, false, false, false),
                        };

                    if on_step_task && (!tracepoint || !self.keep_stepping.on_tracepoint) {
                        self.breakpoints.clear_stepping(&mut self.debugee)?;
                    }
                    if unrecovered_panic {
                        self.breakpoints.clear_stepping(&mut self.debugee)?;
                    }
                    self.stop_reason = if watchpoint {
                        StopReason::Watchpoint
                    } else {
                        StopReason::Breakpoint
                    };
                    if exhausted {
                        self.breakpoints
                            .remove_exhausted_user(&mut self.debugee, addr)?;
                    }
                    return self.condition_errors_result();
                }
                // a breakpoint whose conditions all failed, just repeat
                Some((_, false, _, _)) => {}
            }

            if injection_done {
                // a call injection was finished, don't let a breakpoint with a failed
                // condition or a step breakpoint shadow this
                self.stop_reason = StopReason::CallReturned;
                return self.condition_errors_result();
            }
        }
    }

    /// Advance the pc past a hardcoded trap instruction on platforms that leave it
    /// pointing at the trap.
    fn fixup_pc_past_trap(&mut self, pid: Pid, pc: RelocatedAddress) -> Result<(), Error> {
        let arch = self.debugee.arch();
        if arch.break_moves_pc {
            return Ok(());
        }
        let len = arch.break_instruction.len();
        if let Some(bytes) = muted_error!(self.debugee.read_memory(pc, len)) {
            if bytes == arch.break_instruction {
                self.debugee.set_pc(pid, pc.offset(len as isize))?;
            }
        }
        Ok(())
    }

    /// Single-step `pid` until execution leaves the runtime's self-break helper.
    fn step_instruction_out(&mut self, pid: Pid) -> Result<(), Error> {
        loop {
            self.debugee.single_step(pid)?;
            let Ok(pc) = self.debugee.pc(pid) else {
                break;
            };
            let inside = self
                .debugee
                .find_function_by_pc(self.debugee.globalize(pc))
                .map(|func| self.debugee.classify_function(&func) == FunctionClass::SelfBreak)
                .unwrap_or(false);
            if !inside {
                break;
            }
        }
        if let Some(task) = self.debugee.task_of_thread(pid) {
            let drives_selected = self
                .selected_task
                .as_ref()
                .map(|selected| selected.id == task.id)
                .unwrap_or(false);
            if drives_selected {
                self.selected_task = Some(task);
            }
        }
        self.refresh_hit_state(pid);
        self.debugee.invalidate_caches();
        Ok(())
    }

    /// Pick a new thread on focus with the following priority:
    ///  - a thread on an active stepping breaklet;
    ///  - the trapped thread if it holds an active breakpoint;
    ///  - any other thread with an active breakpoint;
    ///  - the trapped thread.
    fn pick_current_thread(&mut self, trap: Pid) -> Pid {
        let mut chosen = self
            .hits
            .iter()
            .find(|(_, hit)| hit.active && hit.stepping)
            .map(|(pid, _)| *pid);
        if chosen.is_none() {
            let trapped_active = self
                .hits
                .get(&trap)
                .map(|hit| hit.active)
                .unwrap_or(false);
            if trapped_active {
                chosen = Some(trap);
            }
        }
        if chosen.is_none() {
            chosen = self
                .hits
                .iter()
                .find(|(_, hit)| hit.active)
                .map(|(pid, _)| *pid);
        }

        let chosen = chosen.unwrap_or(trap);
        self.switch_thread(chosen);
        chosen
    }

    /// Whether `pid` currently runs the task that drives the step in progress.
    fn on_step_task(&self, pid: Pid) -> Result<bool, Error> {
        let Some(clause) = self.breakpoints.stepping_task_clause() else {
            return Ok(false);
        };
        clause.evaluate(&self.debugee, pid)
    }

    /// Recalculate breakpoint-hit states of every live thread.
    fn refresh_hit_states(&mut self) {
        self.hits.clear();
        for pid in self.debugee.threads() {
            self.refresh_hit_state(pid);
        }
    }

    pub(super) fn refresh_hit_state(&mut self, pid: Pid) {
        self.hits.remove(&pid);
        let Ok(pc) = self.debugee.pc(pid) else {
            return;
        };
        if let Some(bp) = self.breakpoints.get_mut(pc) {
            let hit = bp.check_condition(&self.debugee, pid);
            self.hits.insert(pid, hit);
        }
    }

    /// Aggregate per-thread condition evaluation failures: a single report is surfaced
    /// as-is, two or more distinct reports cannot be attributed to one culprit and
    /// collapse into [`Error::MultipleCondErrors`].
    fn condition_errors_result(&mut self) -> Result<(), Error> {
        let mut first = None;
        for hit in self.hits.values_mut() {
            if let Some(e) = hit.cond_error.take() {
                if first.is_some() {
                    return Err(Error::MultipleCondErrors);
                }
                first = Some(e);
            }
        }
        match first {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
