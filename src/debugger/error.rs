use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use nix::unistd::Pid;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- generic errors --------------------------------------------
    #[error(transparent)]
    Backend(#[from] anyhow::Error),

    // --------------------------------- debugger entity not found----------------------------------
    #[error("no source for pc {0}")]
    NoSourceForPC(RelocatedAddress),
    #[error("function not found at address {0}")]
    FunctionNotFound(GlobalAddress),
    #[error("frame number {0} not found")]
    FrameNotFound(u32),
    #[error("thread {0} not found")]
    ThreadNotFound(Pid),

    // --------------------------------- stepping errors -------------------------------------------
    #[error("next while nexting")]
    StepInProgress,
    #[error("nothing to step out to")]
    NoStepOutTarget,
    #[error("call instruction for return address {0} not found in `{1}`")]
    CallInstrNotFound(RelocatedAddress, String),

    // --------------------------------- condition errors ------------------------------------------
    #[error("multiple errors evaluating conditions")]
    MultipleCondErrors,

    // --------------------------------- collaborator errors ---------------------------------------
    #[error("instructions disassembly error: {0}")]
    DisAsm(String),
    #[error("unwind: {0}")]
    Unwind(String),

    // --------------------------------- debugee process errors ------------------------------------
    #[error("debugee process exit with code {0}")]
    ProcessExit(i32),
    #[error("program is not being started")]
    ProcessNotStarted,
}

impl Error {
    /// Return a hint to an interface - continue debugging after error or stop whole process.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Backend(_) => false,
            Error::NoSourceForPC(_) => false,
            Error::FunctionNotFound(_) => false,
            Error::FrameNotFound(_) => false,
            Error::ThreadNotFound(_) => false,
            Error::StepInProgress => false,
            Error::NoStepOutTarget => false,
            Error::CallInstrNotFound(_, _) => false,
            Error::MultipleCondErrors => false,
            Error::DisAsm(_) => false,
            Error::Unwind(_) => false,
            Error::ProcessNotStarted => false,

            // currently fatal errors
            Error::ProcessExit(_) => true,
        }
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}

/// Transforms `Result` into `Option` and put error into debug logs if it occurs.
#[macro_export]
macro_rules! muted_error {
    ($res: expr) => {
        $crate::_error!(log::debug, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::debug, $res, $msg)
    };
}
