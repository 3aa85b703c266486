use crate::debugger::address::RelocatedAddress;
use crate::debugger::breakpoint::BreakletKind;
use crate::debugger::condition::BreakCondition;
use crate::debugger::debugee::disasm::Instruction;
use crate::debugger::debugee::dwarf::{Function, FunctionClass};
use crate::debugger::debugee::unwind::Stackframe;
use crate::debugger::debugee::{Debugee, Direction, ReturnCapture};
use crate::debugger::defers::{defer_return_call_site, find_defer_return_calls, panic_frame_index};
use crate::debugger::error::Error;
use crate::debugger::{Debugger, StopReason};
use crate::weak_error;
use itertools::Itertools;

impl<D: Debugee> Debugger<D> {
    /// Continue execution until the next source line of the current function,
    /// stepping over subroutine calls.
    pub fn step_over(&mut self) -> Result<StopReason, Error> {
        self.ensure_running()?;
        if self.breakpoints.has_stepping() {
            return Err(Error::StepInProgress);
        }
        self.plan_step(false, false)?;
        self.continue_execution()
    }

    /// Continue execution until another source line is reached,
    /// stepping into functions called on the current line.
    pub fn step_into(&mut self) -> Result<StopReason, Error> {
        self.ensure_running()?;
        if self.breakpoints.has_stepping() {
            return Err(Error::StepInProgress);
        }
        self.plan_step(true, false)?;

        if self.debugee.direction() == Direction::Reverse {
            // already standing right after a call: one reverse instruction step
            // lands inside the callee
            let on_step_into = self
                .thread_on_focus
                .and_then(|pid| self.hits.get(&pid))
                .map(|hit| hit.active && hit.stepping_into)
                .unwrap_or(false);
            if on_step_into {
                self.breakpoints.clear_stepping(&mut self.debugee)?;
                self.step_instruction_inner()?;
                return Ok(self.stop_reason);
            }
        }

        self.continue_execution()
    }

    /// Continue execution until the selected task exits the function currently
    /// being executed or a deferred call of that function runs.
    pub fn step_out(&mut self) -> Result<StopReason, Error> {
        self.ensure_running()?;
        if self.breakpoints.has_stepping() {
            return Err(Error::StepInProgress);
        }
        if let Err(e) = self.plan_step_out() {
            weak_error!(self.breakpoints.clear_stepping(&mut self.debugee));
            return Err(e);
        }
        self.continue_execution()
    }

    /// Execute exactly one instruction on the selected task's thread.
    ///
    /// A parked task has no thread to step: a one-shot same-task breakpoint at its saved
    /// pc runs the process until the task is scheduled again.
    pub fn step_instruction(&mut self) -> Result<StopReason, Error> {
        self.ensure_running()?;
        if let Some(task) = self.selected_task.clone() {
            if task.is_parked() {
                let cond = BreakCondition::same_task(Some(&task));
                self.breakpoints
                    .set(&mut self.debugee, task.pc, BreakletKind::StepNext, cond)?;
                return self.continue_execution();
            }
        }
        self.step_instruction_inner()?;
        Ok(self.stop_reason)
    }

    pub(super) fn step_instruction_inner(&mut self) -> Result<(), Error> {
        let pid = match self.selected_task.as_ref().and_then(|task| task.thread) {
            Some(pid) => pid,
            None => self.ensure_thread_on_focus()?,
        };
        self.debugee.invalidate_caches();
        self.ensure_running()?;
        self.debugee.single_step(pid)?;
        self.hits.remove(&pid);
        self.refresh_hit_state(pid);
        // the task may migrate between threads while the instruction executes
        if let Some(task) = self.debugee.task_of_thread(pid) {
            self.selected_task = Some(task);
        }
        Ok(())
    }

    /// Compute and set the breakpoints realizing one step operation, rolling every
    /// stepping breakpoint back if planning fails half-way.
    ///
    /// `step_into` extends the set with callee breakpoints for calls on the current line,
    /// `inlined_step_out` turns the plan into a step-out of an inlined frame: inlined
    /// ranges are subtracted relative to the caller frame instead of the top frame.
    pub(super) fn plan_step(&mut self, step_into: bool, inlined_step_out: bool) -> Result<(), Error> {
        let res = self.plan_step_inner(step_into, inlined_step_out);
        if res.is_err() {
            weak_error!(self.breakpoints.clear_stepping(&mut self.debugee));
        }
        res
    }

    fn plan_step_inner(&mut self, step_into: bool, inlined_step_out: bool) -> Result<(), Error> {
        let backward = self.debugee.direction() == Direction::Reverse;
        let (mut topframe, retframe) = self.top_frame_pair()?;
        let top_fn = topframe
            .function
            .clone()
            .ok_or(Error::NoSourceForPC(topframe.pc))?;
        let same_task = BreakCondition::same_task(self.selected_task.as_ref());

        let mut post_prologue = None;
        if backward {
            let ret_fn = retframe
                .function
                .clone()
                .ok_or(Error::NoSourceForPC(retframe.pc))?;
            let prologue_end = self.debugee.skip_prologue(&top_fn)?;
            let prologue_end = self.debugee.relocate(prologue_end);
            if prologue_end == topframe.pc {
                // nothing precedes the prologue to step through
                return self.plan_step_out_reverse(&topframe, &retframe, same_task);
            }
            post_prologue = Some(prologue_end);
            if let Some(ret) = topframe.ret_addr {
                topframe.ret_addr = Some(self.find_call_instr_for_ret(ret, &ret_fn)?);
            }
        }

        let fn_start = self.debugee.relocate(top_fn.entry);
        let fn_end = self.debugee.relocate(top_fn.end);
        let text = match self.debugee.disasm_range(fn_start, fn_end) {
            Ok(text) => text,
            Err(e) if step_into => return Err(e),
            Err(_) => vec![],
        };

        let same_frame = same_task
            .clone()
            .map(|cond| cond.and(BreakCondition::same_frame(&topframe)));

        if step_into && !backward {
            self.set_step_into_breakpoints(&top_fn, &text, &topframe, same_task.clone())?;
        }
        if !backward {
            self.set_defer_breakpoint(Some(&text), &topframe, same_task.clone(), step_into)?;
        }

        let place = topframe
            .place
            .clone()
            .ok_or(Error::NoSourceForPC(topframe.pc))?;
        let mut pcs = self
            .debugee
            .line_addresses(&top_fn, &place.file, place.line_number)?;

        if backward {
            if let Some(prologue_end) = post_prologue {
                let global = self.debugee.globalize(prologue_end);
                if !pcs.contains(&global) {
                    pcs.push(global);
                }
            }
        }

        if !step_into {
            let frame = if inlined_step_out { &retframe } else { &topframe };
            let ranges = self.debugee.inlined_ranges(frame);
            pcs.retain(|pc| !pc.in_ranges(&ranges));
        }

        let covered = pcs.iter().any(|pc| top_fn.contains(*pc));
        if !covered && self.selected_task.is_some() {
            let ret_fn = topframe
                .ret_addr
                .and_then(|ret| self.debugee.find_function_by_pc(self.debugee.globalize(ret)));
            if let Some(func) = ret_fn {
                if self.debugee.classify_function(&func) == FunctionClass::TaskExit {
                    // the task's bottom frame, there is nothing to step to
                    self.breakpoints.clear_stepping(&mut self.debugee)?;
                    return Ok(());
                }
            }
        }

        for pc in pcs.into_iter().unique() {
            let addr = self.debugee.relocate(pc);
            self.breakpoints
                .set(&mut self.debugee, addr, BreakletKind::StepNext, same_frame.clone())?;
        }

        if step_into && backward {
            self.set_step_into_breakpoints_reverse(&text, &topframe, same_task.clone())?;
        }

        if !topframe.inlined {
            let (wrapped_top, wrapped_ret) = self.skip_wrappers_out(&topframe, &retframe);
            let ret_cond = same_task.map(|cond| cond.and(BreakCondition::same_frame(&wrapped_ret)));
            let capture = wrapped_top.function.clone().map(|function| ReturnCapture {
                function,
                frame_offset: wrapped_top.frame_offset,
            });
            // the return address may be wrong, failing to break there is not an error
            if let Ok(bp) = self.breakpoints.set(
                &mut self.debugee,
                wrapped_ret.pc,
                BreakletKind::StepNext,
                ret_cond,
            ) {
                bp.return_capture = capture;
            }
        }

        if let Some(pid) = self.thread_on_focus {
            if !self.hits.contains_key(&pid) {
                self.refresh_hit_state(pid);
            }
        }
        Ok(())
    }

    pub(super) fn plan_step_out(&mut self) -> Result<(), Error> {
        let (topframe, retframe) = self.top_frame_pair()?;

        if topframe.inlined {
            // an inlined frame has no own return address, its caller's line
            // enumeration covers the step-out
            return self.plan_step(false, true);
        }

        let same_task = BreakCondition::same_task(self.selected_task.as_ref());

        if self.debugee.direction() == Direction::Reverse {
            return self.plan_step_out_reverse(&topframe, &retframe, same_task);
        }

        let defer_pc = self.set_defer_breakpoint(None, &topframe, same_task.clone(), false)?;
        if topframe.ret_addr.is_none() && defer_pc.is_none() {
            return Err(Error::NoStepOutTarget);
        }

        if topframe.ret_addr.is_some() {
            let (wrapped_top, wrapped_ret) = self.skip_wrappers_out(&topframe, &retframe);
            let ret_cond = same_task.map(|cond| cond.and(BreakCondition::same_frame(&wrapped_ret)));
            let capture = wrapped_top.function.clone().map(|function| ReturnCapture {
                function,
                frame_offset: wrapped_top.frame_offset,
            });
            let bp = self.breakpoints.set(
                &mut self.debugee,
                wrapped_ret.pc,
                BreakletKind::StepNext,
                ret_cond,
            )?;
            bp.return_capture = capture;
        }

        if let Some(pid) = self.thread_on_focus {
            if !self.hits.contains_key(&pid) {
                self.refresh_hit_state(pid);
            }
        }
        Ok(())
    }

    /// Set a breakpoint on the call instruction that created the current frame: the call
    /// preceding the return address, the deferred-return trampoline call that ran the
    /// frame, or the call preceding the panic frame's return address when the stack is
    /// unwinding through a panic.
    pub(super) fn plan_step_out_reverse(
        &mut self,
        topframe: &Stackframe,
        retframe: &Stackframe,
        same_task: Option<BreakCondition>,
    ) -> Result<(), Error> {
        let ret_fn = retframe
            .function
            .clone()
            .ok_or(Error::NoSourceForPC(retframe.pc))?;
        let caller_start = self.debugee.relocate(ret_fn.entry);
        let caller_end = self.debugee.relocate(ret_fn.end);
        let caller_text = self.debugee.disasm_range(caller_start, caller_end)?;
        let defer_returns = find_defer_return_calls(&self.debugee, &caller_text);

        let frames = match &self.selected_task {
            Some(task) => self.debugee.unwind_task(task.id, 5)?,
            None => {
                let pid = self.ensure_thread_on_focus()?;
                self.debugee.unwind_thread(pid, 5)?
            }
        };

        let call_pc = match panic_frame_index(&self.debugee, &frames) {
            Some(idx) => {
                let panic_frame = &frames[idx];
                let Some(caller_fn) = frames.get(idx + 1).and_then(|f| f.function.clone()) else {
                    return Err(Error::NoSourceForPC(panic_frame.pc));
                };
                let ret = panic_frame
                    .ret_addr
                    .ok_or(Error::NoSourceForPC(panic_frame.pc))?;
                self.find_call_instr_for_ret(ret, &caller_fn)?
            }
            None => {
                let ret = topframe.ret_addr.ok_or(Error::NoStepOutTarget)?;
                let mut call_pc = self.find_call_instr_for_ret(ret, &ret_fn)?;
                if let Some(site) = defer_return_call_site(call_pc, &defer_returns) {
                    // the frame was run by the deferred-return trampoline,
                    // reverse to its call site
                    call_pc = site;
                }
                call_pc
            }
        };

        self.breakpoints
            .set(&mut self.debugee, call_pc, BreakletKind::StepNext, same_task)?;
        Ok(())
    }

    /// Breakpoints realizing a forward step-into: the resolved target of every call on the
    /// current source line, or the call instruction itself when the target resolves only
    /// at execution time.
    fn set_step_into_breakpoints(
        &mut self,
        curfn: &Function,
        text: &[Instruction],
        topframe: &Stackframe,
        cond: Option<BreakCondition>,
    ) -> Result<(), Error> {
        let Some(place) = &topframe.place else {
            return Ok(());
        };
        for instr in text {
            let on_current_line = instr
                .place
                .as_ref()
                .map(|p| p.file == place.file && p.line_number == place.line_number)
                .unwrap_or(false);
            if !on_current_line || !instr.is_call() {
                continue;
            }
            if instr.dest.is_some() {
                self.set_step_into_breakpoint(Some(curfn), instr, cond.clone())?;
            } else {
                self.breakpoints.set(
                    &mut self.debugee,
                    instr.addr,
                    BreakletKind::StepInto,
                    cond.clone(),
                )?;
            }
        }
        Ok(())
    }

    /// Reverse step-into: break right after every resolved, non-runtime-private call of
    /// the function, reverse execution stops there just before entering a callee.
    fn set_step_into_breakpoints_reverse(
        &mut self,
        text: &[Instruction],
        topframe: &Stackframe,
        cond: Option<BreakCondition>,
    ) -> Result<(), Error> {
        let Some(place) = &topframe.place else {
            return Ok(());
        };
        for (idx, instr) in text.iter().enumerate() {
            let same_file = instr
                .place
                .as_ref()
                .map(|p| p.file == place.file)
                .unwrap_or(false);
            if !same_file || !instr.is_call() {
                continue;
            }
            let Some(dest_fn) = instr.dest.as_ref().and_then(|d| d.function.as_ref()) else {
                continue;
            };
            if self.debugee.classify_function(dest_fn).is_runtime_private() {
                continue;
            }
            if let Some(next_instr) = text.get(idx + 1) {
                if self.breakpoints.get(next_instr.addr).is_none() {
                    self.breakpoints.set(
                        &mut self.debugee,
                        next_instr.addr,
                        BreakletKind::StepInto,
                        cond.clone(),
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Set a breakpoint on the real body of a call's destination: wrappers skipped,
    /// prologue skipped, runtime internals filtered out.
    ///
    /// A destination that cannot (or must not) be entered is silently ignored, the
    /// per-line breakpoints of the active plan catch the execution instead.
    pub(super) fn set_step_into_breakpoint(
        &mut self,
        curfn: Option<&Function>,
        instr: &Instruction,
        cond: Option<BreakCondition>,
    ) -> Result<(), Error> {
        let Some(dest) = &instr.dest else {
            return Ok(());
        };

        // a step issued inside the runtime may descend into runtime internals
        let step_into_private = curfn
            .map(|f| self.debugee.classify_function(f).is_runtime_private())
            .unwrap_or(false);
        if let Some(dest_fn) = &dest.function {
            if !step_into_private && self.debugee.classify_function(dest_fn).is_runtime_private() {
                return Ok(());
            }
        }

        let (skipped_fn, mut pc) = self.skip_wrappers_in(dest.function.clone(), dest.pc);
        if let Some(func) = &skipped_fn {
            if self.debugee.relocate(func.entry) == pc {
                if let Ok(body) = self.debugee.skip_prologue(func) {
                    pc = self.debugee.relocate(body);
                }
            }
        }

        self.breakpoints
            .set(&mut self.debugee, pc, BreakletKind::StepNext, cond)?;
        Ok(())
    }

    /// Top frame and caller frame of the selected task (or the thread on focus when no
    /// task runtime is present).
    pub(super) fn top_frame_pair(&self) -> Result<(Stackframe, Stackframe), Error> {
        let frames = match &self.selected_task {
            Some(task) => self.debugee.unwind_task(task.id, 2)?,
            None => {
                let pid = self.ensure_thread_on_focus()?;
                self.debugee.unwind_thread(pid, 2)?
            }
        };
        let mut frames = frames.into_iter();
        let topframe = frames.next().ok_or(Error::FrameNotFound(0))?;
        let retframe = frames.next().ok_or(Error::FrameNotFound(1))?;
        Ok((topframe, retframe))
    }

    /// Address of the call instruction immediately preceding the instruction at `ret`.
    pub(super) fn find_call_instr_for_ret(
        &self,
        ret: RelocatedAddress,
        func: &Function,
    ) -> Result<RelocatedAddress, Error> {
        let from = self.debugee.relocate(func.entry);
        let to = self.debugee.relocate(func.end);
        let text = self.debugee.disasm_range(from, to)?;
        let mut prev = None;
        for instr in &text {
            if instr.addr == ret {
                return prev.ok_or_else(|| Error::CallInstrNotFound(ret, func.name.clone()));
            }
            prev = Some(instr.addr);
        }
        Err(Error::CallInstrNotFound(ret, func.name.clone()))
    }
}
