use crate::debugger::address::RelocatedAddress;
use crate::debugger::breakpoint::BreakletKind;
use crate::debugger::condition::BreakCondition;
use crate::debugger::debugee::disasm::Instruction;
use crate::debugger::debugee::dwarf::FunctionClass;
use crate::debugger::debugee::unwind::Stackframe;
use crate::debugger::debugee::Debugee;
use crate::debugger::error::Error;
use crate::debugger::Debugger;

/// Call sites of the deferred-return trampoline inside a disassembled function.
///
/// Deferred calls invoked through these sites must trigger a step's defer breakpoint,
/// reverse step-out uses them to recognize frames created by the trampoline.
pub(super) fn find_defer_return_calls<D: Debugee>(
    debugee: &D,
    text: &[Instruction],
) -> Vec<RelocatedAddress> {
    text.iter()
        .filter(|instr| {
            instr.is_call()
                && instr
                    .dest
                    .as_ref()
                    .and_then(|dest| dest.function.as_ref())
                    .map(|func| debugee.classify_function(func) == FunctionClass::DeferReturn)
                    .unwrap_or(false)
        })
        .map(|instr| instr.addr)
        .collect()
}

/// Index of the frame in which the panic call itself appears, if the stack is
/// currently unwinding through a panic.
pub(super) fn panic_frame_index<D: Debugee>(
    debugee: &D,
    frames: &[Stackframe],
) -> Option<usize> {
    frames.iter().position(|frame| {
        frame
            .function
            .as_ref()
            .map(|func| debugee.classify_function(func) == FunctionClass::Panic)
            .unwrap_or(false)
    })
}

/// Whether the call instruction that created the top frame is one of the recorded
/// deferred-return trampoline call sites.
pub(super) fn defer_return_call_site(
    call_pc: RelocatedAddress,
    defer_returns: &[RelocatedAddress],
) -> Option<RelocatedAddress> {
    defer_returns.iter().copied().find(|pc| *pc == call_pc)
}

impl<D: Debugee> Debugger<D> {
    /// Set a breakpoint on the resumption point of the most recently deferred call of
    /// `topframe`, if there is one and it differs from the current pc.
    ///
    /// When `step_into` is set the deferred-return call sites of the stepped function are
    /// attached, so the breakpoint also fires when the deferred call runs during a normal
    /// frame unwind (not only under a panic). Returns the resumption address.
    pub(super) fn set_defer_breakpoint(
        &mut self,
        text: Option<&[Instruction]>,
        topframe: &Stackframe,
        same_task: Option<BreakCondition>,
        step_into: bool,
    ) -> Result<Option<RelocatedAddress>, Error> {
        let mut defer_pc = None;
        if let Some(deferred) = &topframe.topmost_defer {
            if let Some(func) = &deferred.function {
                let resume_at = self.debugee.skip_prologue(func)?;
                defer_pc = Some(self.debugee.relocate(resume_at));
            }
        }

        match defer_pc {
            Some(pc) if pc != topframe.pc => {
                let defer_returns = if step_into {
                    text.map(|t| find_defer_return_calls(&self.debugee, t))
                        .unwrap_or_default()
                } else {
                    vec![]
                };
                let bp =
                    self.breakpoints
                        .set(&mut self.debugee, pc, BreakletKind::StepDefer, same_task)?;
                if step_into {
                    if let Some(breaklet) = bp
                        .breaklets
                        .iter_mut()
                        .find(|b| b.kind == BreakletKind::StepDefer)
                    {
                        breaklet.defer_returns = defer_returns;
                    }
                }
            }
            _ => {}
        }

        Ok(defer_pc)
    }
}
