//! Durable state tracking and runaway guards for staged agent pipelines.
//!
//! A project moves forward through the fixed [`stage::Stage`] sequence. The
//! [`state::StateManager`] persists every step under a per-project lock,
//! the [`breaker::CircuitBreaker`] caps invocations, comments and repeated
//! failures, the [`feedback::FeedbackLoopController`] bounds the
//! specify/plan refinement loop, and the [`dispatch::Dispatcher`] ties them
//! to an external agent.

pub mod breaker;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod feedback;
pub mod notify;
pub mod stage;
pub mod state;
pub mod store;
pub mod usage;
