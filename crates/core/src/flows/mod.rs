pub mod engine;
pub mod states;

pub use engine::{CallFlowEngine, CallTransitionError};
pub use states::{CallAction, CallEvent, TransitionOutcome};
