//! Live voice session orchestration for the T.T.A concierge: audio pipelines,
//! the session state machine, tool execution and the application store seam.

pub mod backend;
pub mod capture;
pub mod catalog;
pub mod error;
pub mod generic_types;
pub mod imagegen;
pub mod level;
pub mod mode;
pub mod playback;
pub mod realtime_api;
pub mod session_state;
pub mod smoother;
pub mod store;
pub mod tools;

#[cfg(test)]
pub(crate) mod test_support;
