/*!
# Minnow DevKit - stubs and harness for testing the heartbeat agent

Lets the agent run end to end without a broker or a real filesystem:
- in-memory store with scriptable connect/provision/write faults
- scripted statvfs figures
- harness wiring connection, scheduler and health probe together
*/

pub mod stat_stub;
pub mod store_stub;
pub mod test_utils;

pub use stat_stub::ScriptedStats;
pub use store_stub::{MemoryStore, PutRecord, WriteFault};
pub use test_utils::TestHarness;
