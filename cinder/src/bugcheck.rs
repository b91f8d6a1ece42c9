//! Fail-fast integrity reporting.
//!
//! The heap runs without memory protection, so invariant violations are
//! never surfaced as recoverable errors: they halt execution through a
//! categorized stop code. Out-of-memory is the one recoverable condition
//! and is reported through `Option`/`Result` at the call sites instead.

use std::fmt;

/// Categorized reason for a fatal halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCode {
    HeapCorruption,
    DoubleFree,
    NotAMemoryReference,
    NoMarkStack,
    NoReleaseStack,
    SyncBlockCorruption,
    FinalizerCorruption,
    InvalidOperation,
    NoMemory,
}

impl fmt::Display for StopCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopCode::HeapCorruption => "HeapCorruption",
            StopCode::DoubleFree => "DoubleFree",
            StopCode::NotAMemoryReference => "NotAMemoryReference",
            StopCode::NoMarkStack => "NoMarkStack",
            StopCode::NoReleaseStack => "NoReleaseStack",
            StopCode::SyncBlockCorruption => "SyncBlockCorruption",
            StopCode::FinalizerCorruption => "FinalizerCorruption",
            StopCode::InvalidOperation => "InvalidOperation",
            StopCode::NoMemory => "NoMemory",
        };
        f.write_str(name)
    }
}

/// Halts execution with the given stop code.
#[cold]
#[inline(never)]
pub fn raise(code: StopCode) -> ! {
    log::error!("bugcheck: {code}");
    panic!("bugcheck: {code}");
}

/// Halts execution with the given stop code unless `condition` holds.
#[inline(always)]
pub fn ensure(condition: bool, code: StopCode) {
    if !condition {
        raise(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "bugcheck: HeapCorruption")]
    fn raise_carries_the_stop_code() {
        raise(StopCode::HeapCorruption);
    }

    #[test]
    fn ensure_passes_on_true() {
        ensure(true, StopCode::InvalidOperation);
    }

    #[test]
    #[should_panic(expected = "bugcheck: DoubleFree")]
    fn ensure_raises_on_false() {
        ensure(false, StopCode::DoubleFree);
    }
}
