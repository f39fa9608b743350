//! Exception delivery, consumed by the JIT helpers and interpreter fallbacks.

use crate::CoreId;

/// Every guest-visible exception the JIT or its helpers can raise.
///
/// ARM and PowerPC share one enum because both architectures route through
/// the same sink; each core only ever raises the subset that applies to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    Reset,
    UndefinedInstruction,
    SoftwareInterrupt,
    PrefetchAbort,
    DataAbort,
    InterruptRequest,
    FastInterrupt,
    SystemReset,
    Dsi,
    Isi,
    ExternalInterrupt,
    Decrementer,
    SystemCall,
    Ici,
}

/// Delivers guest exceptions raised by the JIT or its interpreter fallback.
///
/// Entry sets the architecture's save registers (SRR0/SRR1 for PowerPC,
/// banked LR + SPSR for ARM), switches privilege mode, disables the
/// interrupts the architecture disables on entry, and redirects PC to the
/// exception vector. None of that is this crate's concern: it owns only
/// the trigger point the JIT calls into.
pub trait ExceptionSink {
    fn trigger_exception(&mut self, core: CoreId, kind: ExceptionKind);
}
