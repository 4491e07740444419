// =============================================================================
// Exit Management — rule ladder evaluation and execution
// =============================================================================

pub mod engine;
pub mod rules;
