use crate::debugger::address::{GlobalAddress, RelocatedAddress};
use crate::debugger::debugee::dwarf::{Function, Place};

/// A call registered by a frame to run automatically during that frame's unwind.
#[derive(Debug, Clone)]
pub struct DeferredCall {
    /// Deferred function, if the runtime structures allow resolving it.
    pub function: Option<Function>,
}

/// One stack activation.
///
/// Unwinders report inlined calls as separate logical frames: for an inlined top frame
/// `function` is the physical function the call was inlined into, `inlined` is set, and the
/// next frame is the logical caller inside the same physical function.
#[derive(Debug, Clone)]
pub struct Stackframe {
    pub pc: RelocatedAddress,
    pub global_pc: GlobalAddress,
    pub place: Option<Place>,
    pub function: Option<Function>,
    /// Address execution resumes at in the caller, `None` at the stack bottom.
    pub ret_addr: Option<RelocatedAddress>,
    /// Stack-relative identifier of this activation, distinguishes recursive calls
    /// to one function.
    pub frame_offset: i64,
    pub inlined: bool,
    /// Most recently deferred call pending in this frame.
    pub topmost_defer: Option<DeferredCall>,
}

impl Stackframe {
    pub fn new(pc: RelocatedAddress, global_pc: GlobalAddress) -> Self {
        Self {
            pc,
            global_pc,
            place: None,
            function: None,
            ret_addr: None,
            frame_offset: 0,
            inlined: false,
            topmost_defer: None,
        }
    }
}
