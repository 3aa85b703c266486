use crate::debugger::address::GlobalAddress;
use rustc_demangle::try_demangle;
use std::path::PathBuf;

/// Source code point: file and line number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Place {
    pub file: PathBuf,
    pub line_number: u64,
}

impl Place {
    pub fn new(file: impl Into<PathBuf>, line_number: u64) -> Self {
        Self {
            file: file.into(),
            line_number,
        }
    }
}

/// Function description, resolved from the debug information.
///
/// [`Debugee::find_function_by_pc`](super::Debugee::find_function_by_pc) resolves the innermost
/// function at an address: for a pc inside an inlined call body this is the function where the
/// inlining happened, with the inline stack already applied to the name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    /// Full (possibly mangled) symbol name.
    pub name: String,
    pub entry: GlobalAddress,
    pub end: GlobalAddress,
}

impl Function {
    pub fn new(name: impl Into<String>, entry: GlobalAddress, end: GlobalAddress) -> Self {
        Self {
            name: name.into(),
            entry,
            end,
        }
    }

    pub fn contains(&self, pc: GlobalAddress) -> bool {
        pc >= self.entry && pc < self.end
    }

    /// Function name without path qualification and generic arguments.
    ///
    /// Compiler-generated trampolines share a base name with the function they forward to,
    /// this is what the wrapper skip heuristic compares.
    pub fn base_name(&self) -> String {
        let demangled;
        let name = match try_demangle(&self.name) {
            Ok(d) => {
                demangled = format!("{d:#}");
                demangled.as_str()
            }
            Err(_) => self.name.as_str(),
        };
        let last_segment = name.rsplit("::").next().unwrap_or(name);
        let last_segment = last_segment.split('<').next().unwrap_or(last_segment);
        last_segment
            .rsplit('.')
            .next()
            .unwrap_or(last_segment)
            .to_string()
    }
}

/// Runtime role of a function, as classified by the debug information layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionClass {
    /// Regular code.
    Ordinary,
    /// Internal runtime function that source level stepping must not enter.
    RuntimePrivate,
    /// The deferred-return trampoline: runs deferred calls during a frame unwind.
    DeferReturn,
    /// The panic entry: frames above it belong to an unwind in progress.
    Panic,
    /// Bottom of every task stack.
    TaskExit,
    /// The self-break helper a program calls to trap into the debugger.
    SelfBreak,
}

impl FunctionClass {
    /// Whether source-level stepping must skip over this function.
    pub fn is_runtime_private(self) -> bool {
        !matches!(self, FunctionClass::Ordinary | FunctionClass::SelfBreak)
    }
}
