use crate::debugger::address::RelocatedAddress;
use crate::debugger::debugee::dwarf::{Function, FunctionClass};
use crate::debugger::debugee::unwind::Stackframe;
use crate::debugger::debugee::Debugee;
use crate::debugger::Debugger;
use itertools::Itertools;

/// Maximum number of trampoline hops the skip heuristics follow.
pub(super) const MAX_WRAPPER_HOPS: usize = 5;

impl<D: Debugee> Debugger<D> {
    /// Walk forward through compiler-generated trampolines to the real step-into target.
    ///
    /// A trampoline hop must have exactly one outgoing call or cross-function jump, with a
    /// resolvable destination whose base name matches the current function. The walk gives
    /// up to the unskipped `(start_fn, start_pc)` on any violation and is bounded by
    /// [`MAX_WRAPPER_HOPS`].
    pub(super) fn skip_wrappers_in(
        &self,
        start_fn: Option<Function>,
        start_pc: RelocatedAddress,
    ) -> (Option<Function>, RelocatedAddress) {
        let Some(start) = start_fn else {
            return (None, start_pc);
        };

        let mut func = start.clone();
        for _hop in 0..MAX_WRAPPER_HOPS {
            let from = self.debugee.relocate(func.entry);
            let to = self.debugee.relocate(func.end);
            let Ok(text) = self.debugee.disasm_range(from, to) else {
                break;
            };
            let Some(first) = text.first() else {
                break;
            };

            let generated = first
                .place
                .as_ref()
                .map(|place| self.debugee.is_compiler_generated(place))
                .unwrap_or(false);
            if !generated {
                let entry = self.debugee.relocate(func.entry);
                return (Some(func), entry);
            }

            // collect all functions called by the current destination function
            let mut targets: Vec<Function> = vec![];
            for instr in &text {
                if instr.is_call() {
                    let Some(dest_fn) = instr.dest.as_ref().and_then(|d| d.function.clone())
                    else {
                        return (Some(start), start_pc);
                    };
                    if !self.debugee.classify_function(&dest_fn).is_runtime_private() {
                        targets.push(dest_fn);
                    }
                } else if instr.is_jump() {
                    if let Some(dest_fn) = instr.dest.as_ref().and_then(|d| d.function.clone()) {
                        if dest_fn != func
                            && !self.debugee.classify_function(&dest_fn).is_runtime_private()
                        {
                            targets.push(dest_fn);
                        }
                    }
                }
            }

            let Ok(target) = targets.into_iter().exactly_one() else {
                // too many or not enough outgoing calls
                break;
            };
            if target.base_name() != func.base_name() {
                return (Some(start), start_pc);
            }
            func = target;
        }

        (Some(start), start_pc)
    }

    /// Resolve the logical return frame of a step-out, skipping compiler-generated and
    /// deferred-return trampoline frames between the stepped frame and its real caller.
    ///
    /// Returns the `(topframe, retframe)` pair straddling the first non-generated caller,
    /// or the inputs unchanged when nothing needs skipping (or the stack cannot tell).
    pub(super) fn skip_wrappers_out(
        &self,
        topframe: &Stackframe,
        retframe: &Stackframe,
    ) -> (Stackframe, Stackframe) {
        let unchanged = (topframe.clone(), retframe.clone());

        let Some(ret_addr) = topframe.ret_addr else {
            return unchanged;
        };
        if !self.frame_is_generated(retframe) {
            return unchanged;
        }
        if self
            .debugee
            .find_function_by_pc(self.debugee.globalize(ret_addr))
            .is_none()
        {
            return unchanged;
        }

        let frames = match &self.selected_task {
            Some(task) => self.debugee.unwind_task(task.id, MAX_WRAPPER_HOPS + 1),
            None => match self.thread_on_focus {
                Some(pid) => self.debugee.unwind_thread(pid, MAX_WRAPPER_HOPS + 1),
                None => return unchanged,
            },
        };
        let Ok(frames) = frames else {
            return unchanged;
        };

        for i in 1..frames.len() {
            let Some(func) = &frames[i].function else {
                return unchanged;
            };
            let entry_place = self.debugee.find_place_from_pc(func.entry);
            let generated = entry_place
                .map(|place| self.debugee.is_compiler_generated(&place))
                .unwrap_or(false)
                || self.debugee.classify_function(func) == FunctionClass::DeferReturn;
            if !generated {
                return (frames[i - 1].clone(), frames[i].clone());
            }
        }

        unchanged
    }

    fn frame_is_generated(&self, frame: &Stackframe) -> bool {
        frame
            .place
            .as_ref()
            .map(|place| self.debugee.is_compiler_generated(place))
            .unwrap_or(false)
            || frame
                .function
                .as_ref()
                .map(|func| self.debugee.classify_function(func) == FunctionClass::DeferReturn)
                .unwrap_or(false)
    }
}
