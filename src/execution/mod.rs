// Order lifecycle, positions and submission
pub mod order;
pub mod position_manager;
pub mod submitter;

pub use order::{Order, OrderEvent, OrderPurpose, OrderState, OrderType};
pub use position_manager::{
    ExitRules, OrderUpdate, Position, PositionManager, PositionState, TrailingState, MAX_SUBMIT_ATTEMPTS,
};
pub use submitter::{OrderSubmitter, SubmissionResult};
