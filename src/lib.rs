//! Autonomous milestone execution for coding agents.
//!
//! A session drives an external coding agent through a dependency-ordered
//! list of milestones. Every attempt is gated by a spend and prompt budget,
//! audited for out-of-band file changes, verified by the project's checks
//! and optionally by an agent-driven QA pass. State is persisted after every
//! transition so an interrupted session can resume, and the work happens on
//! an isolated git branch with pushes blocked until the session completes.

pub mod agent;
pub mod audit;
pub mod budget;
pub mod checks;
pub mod config;
pub mod executor;
pub mod git;
pub mod log;
pub mod observer;
pub mod paths;
pub mod pause;
pub mod plan;
pub mod prompt;
pub mod qa;
pub mod safety;
pub mod session;
pub mod state;

#[cfg(any(test, feature = "scenario-test"))]
pub mod testing;
