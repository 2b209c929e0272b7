// ── Moniteur Atoms ─────────────────────────────────────────────────────────
// Pure layer: constants, the error taxonomy, and plain data types.
// Atoms layer rule: no I/O, no side effects, no imports from engine/.

pub mod constants;
pub mod error;
pub mod types;
