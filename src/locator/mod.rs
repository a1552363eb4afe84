pub mod assemble;
pub mod engine;
pub mod loop_control;
pub mod state;

pub use engine::Locator;
pub use loop_control::CancelFlag;
pub use state::{ParseOutcome, ParseRequest};
