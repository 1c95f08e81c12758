//! Simulation toolkit for radiomux.
//!
//! Provides a scriptable in-process modem with fault injection, and a
//! seeded chaos scenario that audits the exactly-once completion and
//! hold accounting guarantees under random interleavings.

pub mod modem;
pub mod scenario;
