//! The `lwarx`/`stwcx.` reservation, shared by the three PPC cores (§5).
//!
//! One reservation record exists for the whole machine, guarded by a
//! mutex so `lwarx`/`stwcx.`/any store's cross-core invalidation can each
//! acquire it briefly rather than the emulator needing some other
//! synchronization discipline of its own.

use std::sync::Mutex;

use dbt_core::CoreId;

#[derive(Debug, Clone, Copy, Default)]
struct Record {
    owner: Option<CoreId>,
    addr: u32,
}

/// Shared across all PPC cores via `Arc<Reservation>` (or any equivalent
/// the host chooses); every method takes `&self` and locks internally, so
/// no caller needs its own synchronization.
#[derive(Debug, Default)]
pub struct Reservation(Mutex<Record>);

impl Reservation {
    #[must_use]
    pub fn new() -> Self {
        Reservation(Mutex::new(Record::default()))
    }

    pub fn reset(&self) {
        *self.0.lock().unwrap() = Record::default();
    }

    /// `lwarx`: records this core as watching `addr`.
    pub fn reserve(&self, owner: CoreId, addr: u32) {
        *self.0.lock().unwrap() = Record { owner: Some(owner), addr };
    }

    /// `stwcx.`'s precondition: `true` only if `owner` still holds the
    /// reservation on exactly `addr`. Does not itself clear the
    /// reservation — callers clear it only after the store the
    /// reservation gated has actually landed (see `dbt-core::DbtError`'s
    /// doc comment: loss surfaces as a plain `bool` into CR.EQ, not as an
    /// error).
    #[must_use]
    pub fn check(&self, owner: CoreId, addr: u32) -> bool {
        let record = self.0.lock().unwrap();
        record.owner == Some(owner) && record.addr == addr
    }

    /// Any store (from any core, including the reservation's own owner)
    /// to the watched address clears it.
    pub fn write(&self, addr: u32) {
        let mut record = self.0.lock().unwrap();
        if record.owner.is_some() && record.addr == addr {
            *record = Record::default();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stwcx_succeeds_only_for_the_reserving_core_and_address() {
        let r = Reservation::new();
        r.reserve(CoreId::Ppc(0), 0x1000);
        assert!(r.check(CoreId::Ppc(0), 0x1000));
        assert!(!r.check(CoreId::Ppc(1), 0x1000));
        assert!(!r.check(CoreId::Ppc(0), 0x1004));
    }

    #[test]
    fn a_store_from_any_core_to_the_watched_address_clears_the_reservation() {
        let r = Reservation::new();
        r.reserve(CoreId::Ppc(0), 0x2000);
        r.write(0x2000);
        assert!(!r.check(CoreId::Ppc(0), 0x2000));
    }

    #[test]
    fn a_store_to_a_different_address_leaves_the_reservation_intact() {
        let r = Reservation::new();
        r.reserve(CoreId::Ppc(0), 0x2000);
        r.write(0x3000);
        assert!(r.check(CoreId::Ppc(0), 0x2000));
    }
}
