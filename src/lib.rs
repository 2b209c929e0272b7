// Moniteur; library root.
// The binary in main.rs is a thin shell over this crate; keeping everything
// in the library lets the integration test binary link the engine directly.

// ── Atoms (constants, error types, data model) ────────────────────────────
pub mod atoms;

// ── Engine (all subsystems) ───────────────────────────────────────────────
pub mod engine;
