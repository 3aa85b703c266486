use crate::debugger::address::RelocatedAddress;
use crate::debugger::condition::BreakCondition;
use crate::debugger::debugee::dwarf::FunctionClass;
use crate::debugger::debugee::{Debugee, ReturnCapture};
use crate::debugger::error::Error;
use indexmap::IndexMap;
use nix::unistd::Pid;
use smallvec::SmallVec;

/// Name of the internal user breakpoint a debugger frontend plants on the
/// runtime's fatal-unwind entry.
pub const UNRECOVERED_PANIC: &str = "unrecovered-panic";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum BreakletKind {
    /// Operator-requested breakpoint.
    User,
    /// Transient breakpoint of a step/next/step-out in progress: a line address,
    /// a return address or a resolved call target.
    StepNext,
    /// Transient breakpoint on a call instruction whose target resolves only once
    /// execution reaches it.
    StepInto,
    /// Transient breakpoint on a deferred call's resumption point.
    StepDefer,
}

impl BreakletKind {
    pub fn is_stepping(self) -> bool {
        matches!(
            self,
            BreakletKind::StepNext | BreakletKind::StepInto | BreakletKind::StepDefer
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitOp {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Mod,
}

/// Condition over the number of times a user breaklet was hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HitCondition {
    pub op: HitOp,
    pub value: u64,
}

impl HitCondition {
    fn satisfied(&self, hits: u64) -> bool {
        match self.op {
            HitOp::Eq => hits == self.value,
            HitOp::Lt => hits < self.value,
            HitOp::Le => hits <= self.value,
            HitOp::Gt => hits > self.value,
            HitOp::Ge => hits >= self.value,
            HitOp::Mod => self.value != 0 && hits % self.value == 0,
        }
    }

    /// Whether no future hit count can satisfy this condition anymore.
    fn no_more_satisfiable(&self, hits: u64) -> bool {
        match self.op {
            HitOp::Eq | HitOp::Le => hits >= self.value,
            HitOp::Lt => hits + 1 >= self.value,
            HitOp::Gt | HitOp::Ge | HitOp::Mod => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchType {
    Read,
    Write,
    ReadWrite,
}

/// One (kind, condition) pairing attached to a breakpoint address.
#[derive(Debug)]
pub struct Breaklet {
    pub kind: BreakletKind,
    pub cond: Option<BreakCondition>,
    /// `StepDefer` only: call sites of the deferred-return trampoline inside the stepped
    /// function. The breaklet activates when the stop was reached through one of them
    /// (or through a panic unwind); with an empty list only the panic path activates it.
    pub defer_returns: Vec<RelocatedAddress>,
    /// `User` only: report the stop but leave stepping breakpoints of an operation
    /// in progress alive.
    pub tracepoint: bool,
    pub hit_cond: Option<HitCondition>,
    pub hits: u64,
}

impl Breaklet {
    fn new(kind: BreakletKind, cond: Option<BreakCondition>) -> Self {
        Self {
            kind,
            cond,
            defer_returns: vec![],
            tracepoint: false,
            hit_cond: None,
            hits: 0,
        }
    }
}

/// Breakpoint-hit state of one thread, recalculated after every trap.
#[derive(Debug, Default)]
pub struct BreakpointHit {
    pub addr: RelocatedAddress,
    /// Some breaklet condition evaluated to true.
    pub active: bool,
    /// The active breaklet belongs to a stepping operation.
    pub stepping: bool,
    /// The active breaklet is a [`BreakletKind::StepInto`] one.
    pub stepping_into: bool,
    pub cond_error: Option<Error>,
}

/// Breakpoint representation: one patched address, many breaklets.
#[derive(Debug)]
pub struct Breakpoint {
    pub addr: RelocatedAddress,
    pub breaklets: SmallVec<[Breaklet; 2]>,
    /// Frontend-visible name of a user breakpoint.
    pub name: Option<String>,
    pub watch_type: Option<WatchType>,
    /// Set on a return breakpoint of a step operation, drives return-value capture.
    pub return_capture: Option<ReturnCapture>,
    pub total_hits: u64,
}

impl Breakpoint {
    fn new(addr: RelocatedAddress) -> Self {
        Self {
            addr,
            breaklets: SmallVec::new(),
            name: None,
            watch_type: None,
            return_capture: None,
            total_hits: 0,
        }
    }

    pub fn is_stepping(&self) -> bool {
        self.breaklets.iter().any(|b| b.kind.is_stepping())
    }

    pub fn is_tracepoint(&self) -> bool {
        self.breaklets
            .iter()
            .any(|b| b.kind == BreakletKind::User && b.tracepoint)
    }

    /// Whether some user breaklet's hit condition can never be satisfied again.
    pub fn hit_cond_exhausted(&self) -> bool {
        self.breaklets.iter().any(|b| {
            b.kind == BreakletKind::User
                && b.hit_cond
                    .map(|cond| cond.no_more_satisfiable(b.hits))
                    .unwrap_or(false)
        })
    }

    /// Recalculate the hit state of thread `pid` stopped at this breakpoint.
    ///
    /// Condition evaluation failures are recorded in the hit state, an errored breaklet
    /// counts as inactive.
    pub fn check_condition<D: Debugee>(&mut self, debugee: &D, pid: Pid) -> BreakpointHit {
        let mut hit = BreakpointHit {
            addr: self.addr,
            ..Default::default()
        };

        for breaklet in self.breaklets.iter_mut() {
            let mut active = match &breaklet.cond {
                None => true,
                Some(cond) => match cond.evaluate(debugee, pid) {
                    Ok(value) => value,
                    Err(e) => {
                        hit.cond_error = Some(e);
                        continue;
                    }
                },
            };

            match breaklet.kind {
                BreakletKind::StepDefer => {
                    if active {
                        active = defer_path_reached(debugee, pid, &breaklet.defer_returns);
                    }
                }
                BreakletKind::User => {
                    if active {
                        breaklet.hits += 1;
                        self.total_hits += 1;
                        if let Some(cond) = breaklet.hit_cond {
                            active = cond.satisfied(breaklet.hits);
                        }
                    }
                }
                BreakletKind::StepNext | BreakletKind::StepInto => {}
            }

            if active {
                hit.active = true;
                if breaklet.kind.is_stepping() {
                    hit.stepping = true;
                }
                if breaklet.kind == BreakletKind::StepInto {
                    hit.stepping_into = true;
                }
            }
        }

        hit
    }
}

/// A deferred-call breakpoint fires only during a frame unwind: either the stack shows a
/// panic in flight right above the caller, or the caller frame is the deferred-return
/// trampoline and this step recorded its call sites.
fn defer_path_reached<D: Debugee>(
    debugee: &D,
    pid: Pid,
    defer_returns: &[RelocatedAddress],
) -> bool {
    let Ok(frames) = debugee.unwind_thread(pid, 3) else {
        return true;
    };
    let via_panic = frames
        .get(2)
        .and_then(|frame| frame.function.as_ref())
        .map(|func| debugee.classify_function(func) == FunctionClass::Panic)
        .unwrap_or(false);
    let via_defer_return = !defer_returns.is_empty()
        && frames
            .get(1)
            .and_then(|frame| frame.function.as_ref())
            .map(|func| debugee.classify_function(func) == FunctionClass::DeferReturn)
            .unwrap_or(false);
    via_panic || via_defer_return
}

/// All breakpoints of a debug session, keyed by address.
///
/// The registry owns the logical state and forwards instruction patching to the debugee,
/// an address is armed while at least one breaklet refers to it.
#[derive(Default)]
pub struct BreakpointRegistry {
    map: IndexMap<RelocatedAddress, Breakpoint>,
}

impl BreakpointRegistry {
    pub fn get(&self, addr: RelocatedAddress) -> Option<&Breakpoint> {
        self.map.get(&addr)
    }

    pub fn get_mut(&mut self, addr: RelocatedAddress) -> Option<&mut Breakpoint> {
        self.map.get_mut(&addr)
    }

    pub fn addresses(&self) -> impl Iterator<Item = RelocatedAddress> + '_ {
        self.map.keys().copied()
    }

    /// Add a breaklet at `addr`, arming the address on first use.
    ///
    /// Re-adding a breaklet with the same kind and condition returns the existing
    /// breakpoint: stepping operations routinely re-touch addresses.
    pub fn set<D: Debugee>(
        &mut self,
        debugee: &mut D,
        addr: RelocatedAddress,
        kind: BreakletKind,
        cond: Option<BreakCondition>,
    ) -> Result<&mut Breakpoint, Error> {
        let bp = match self.map.entry(addr) {
            indexmap::map::Entry::Occupied(e) => e.into_mut(),
            indexmap::map::Entry::Vacant(v) => {
                debugee.arm_breakpoint(addr)?;
                v.insert(Breakpoint::new(addr))
            }
        };
        let exists = bp
            .breaklets
            .iter()
            .any(|b| b.kind == kind && b.cond == cond);
        if !exists {
            bp.breaklets.push(Breaklet::new(kind, cond));
        }
        Ok(bp)
    }

    /// Remove the whole breakpoint at `addr` and disarm the address.
    pub fn remove<D: Debugee>(
        &mut self,
        debugee: &mut D,
        addr: RelocatedAddress,
    ) -> Result<(), Error> {
        if self.map.shift_remove(&addr).is_some() {
            debugee.disarm_breakpoint(addr)?;
        }
        Ok(())
    }

    pub fn has_stepping(&self) -> bool {
        self.map.values().any(|bp| bp.is_stepping())
    }

    /// Remove every stepping breaklet; addresses left without breaklets are disarmed.
    pub fn clear_stepping<D: Debugee>(&mut self, debugee: &mut D) -> Result<(), Error> {
        let mut emptied = vec![];
        for bp in self.map.values_mut() {
            let had_stepping = bp.is_stepping();
            bp.breaklets.retain(|b| !b.kind.is_stepping());
            if had_stepping {
                bp.return_capture = None;
            }
            if bp.breaklets.is_empty() {
                emptied.push(bp.addr);
            }
        }
        for addr in emptied {
            self.map.shift_remove(&addr);
            debugee.disarm_breakpoint(addr)?;
        }
        Ok(())
    }

    /// Drop user breaklets whose hit condition is exhausted; other breaklets at the
    /// address stay alive, the address is disarmed only when none remain.
    pub fn remove_exhausted_user<D: Debugee>(
        &mut self,
        debugee: &mut D,
        addr: RelocatedAddress,
    ) -> Result<(), Error> {
        let Some(bp) = self.map.get_mut(&addr) else {
            return Ok(());
        };
        bp.breaklets.retain(|b| {
            !(b.kind == BreakletKind::User
                && b.hit_cond
                    .map(|cond| cond.no_more_satisfiable(b.hits))
                    .unwrap_or(false))
        });
        if bp.breaklets.is_empty() {
            self.map.shift_remove(&addr);
            debugee.disarm_breakpoint(addr)?;
        }
        Ok(())
    }

    /// Condition task clause of the first stepping breaklet, if a step is in progress.
    pub fn stepping_task_clause(&self) -> Option<&BreakCondition> {
        self.map.values().find_map(|bp| {
            bp.breaklets
                .iter()
                .filter(|b| b.kind.is_stepping())
                .find_map(|b| b.cond.as_ref().and_then(|cond| cond.task_clause()))
        })
    }
}
