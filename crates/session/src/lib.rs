//! Session orchestration: model selection, conversation lifecycle and
//! streamed generation behind a single task.

mod events;
mod orchestrator;
mod state;


pub use events::{GenerationOutcome, SessionEvent};
pub use orchestrator::{spawn, SessionDeps, SessionHandle, SharedEngine};
pub use state::{SessionSnapshot, SessionState};
