//! The Windlass iteration orchestrator: the heart of the runtime.
//!
//! One user message becomes a bounded loop:
//!
//! 1. **Repair** the transcript (orphaned tool calls get synthetic error
//!    responses; the head turn is always a user turn)
//! 2. **Invoke** the model through the retry/fallback scheduler; on context
//!    overflow that survives fallback rotation, **compact** the transcript
//!    and retry within a fixed attempt budget
//! 3. **If tool calls**: execute them concurrently, append the results, loop
//! 4. **If text**: that is the answer
//!
//! A soft iteration threshold biases the model toward wrapping up; the hard
//! cap stops offering tools and allows exactly one final synthesis call.
//! The streaming variant walks the same loop while emitting
//! `text_delta`/`tool_start`/`tool_end` events and honoring cooperative
//! cancellation.

pub mod executor;
pub mod orchestrator;
pub mod stream_event;
pub mod test_helpers;
pub mod transcript;

pub use executor::{ToolExecutor, ToolResultGuard};
pub use orchestrator::{AgentResponse, ChatRequest, Orchestrator, RunOutcome};
pub use stream_event::RunEvent;
pub use transcript::{CompactionPolicy, Transcript};
