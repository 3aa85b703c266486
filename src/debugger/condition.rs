use crate::debugger::debugee::unwind::Stackframe;
use crate::debugger::debugee::{Debugee, Task, TaskId};
use crate::debugger::error::Error;
use nix::unistd::Pid;

/// Boolean breakpoint condition over a thread's live state.
///
/// Stepping conditions come in a handful of shapes:
/// step-into breakpoints check `TaskIs(x)`, next and step-out breakpoints check
/// `TaskIs(x) && FrameOffsetIs(y)`, a breakpoint reachable both by stepping on a line and by
/// returning into it checks `TaskIs(x) && (FrameOffsetIs(y) || FrameOffsetIs(z))`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakCondition {
    /// True when the thread currently runs the given task.
    TaskIs(TaskId),
    /// True when the thread's topmost frame has the given frame offset.
    FrameOffsetIs(i64),
    And(Box<BreakCondition>, Box<BreakCondition>),
    Or(Box<BreakCondition>, Box<BreakCondition>),
}

impl BreakCondition {
    /// Condition that holds while execution stays on `task`.
    /// `None` means "unconditional" for debugees without a task runtime.
    pub fn same_task(task: Option<&Task>) -> Option<Self> {
        task.map(|t| BreakCondition::TaskIs(t.id))
    }

    /// Condition that holds while execution stays in the activation of `frame`.
    pub fn same_frame(frame: &Stackframe) -> Self {
        BreakCondition::FrameOffsetIs(frame.frame_offset)
    }

    pub fn and(self, other: BreakCondition) -> Self {
        BreakCondition::And(Box::new(self), Box::new(other))
    }

    pub fn or(self, other: BreakCondition) -> Self {
        BreakCondition::Or(Box::new(self), Box::new(other))
    }

    pub fn evaluate<D: Debugee + ?Sized>(&self, debugee: &D, pid: Pid) -> Result<bool, Error> {
        match self {
            BreakCondition::TaskIs(id) => Ok(debugee
                .task_of_thread(pid)
                .map(|task| task.id == *id)
                .unwrap_or(false)),
            BreakCondition::FrameOffsetIs(offset) => Ok(debugee.frame_offset(pid)? == *offset),
            BreakCondition::And(lhs, rhs) => {
                Ok(lhs.evaluate(debugee, pid)? && rhs.evaluate(debugee, pid)?)
            }
            BreakCondition::Or(lhs, rhs) => {
                Ok(lhs.evaluate(debugee, pid)? || rhs.evaluate(debugee, pid)?)
            }
        }
    }

    /// First task-identity clause of this condition.
    ///
    /// The dispatcher tests only this clause to decide whether a thread that hit an unrelated
    /// breakpoint is the one driving the step in progress.
    pub fn task_clause(&self) -> Option<&BreakCondition> {
        match self {
            BreakCondition::TaskIs(_) => Some(self),
            BreakCondition::FrameOffsetIs(_) => None,
            BreakCondition::And(lhs, rhs) | BreakCondition::Or(lhs, rhs) => {
                lhs.task_clause().or_else(|| rhs.task_clause())
            }
        }
    }
}
