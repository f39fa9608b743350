/// A general-purpose x86-64 register, numbered the way the ModRM/SIB
/// encoding needs it (so `reg as u8` is directly usable in a ModRM byte).
///
/// Only the low eight (REX-free) registers are named. The translators
/// never need R8-R15: the calling convention fixes P/A/C/D to RDI/RAX/RCX/
/// RDX and nothing else is addressed by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Register {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
}
