//! Client-side conversation state machine

pub mod errors;
pub mod events;
pub mod machine;
pub mod reconcile;
pub mod state;

pub use errors::{ChatError, ValidationError};
pub use events::{AbortReason, ConversationEvent};
pub use machine::{ConversationMachine, MachineOptions, TurnOutcome, DEFAULT_IDLE_TIMEOUT};
pub use reconcile::{reconcile, RECONCILE_WINDOW_SECS};
pub use state::{Conversation, EditPlan, Phase, SlotStatus, StreamingSlot};
