//! Integration test suite for foreman.
//!
//! These tests drive the orchestrator through its public API against real
//! git repositories, with a scripted process host in place of tmux and an
//! in-memory task store.
//!
//! # Test Categories
//!
//! - `dispatch`: Capacity, dependency progression and merging
//! - `lifecycle`: Execution, cancellation, restart and recovery
//! - `sessions`: Resuming agent conversations
//!
//! # CI Compatibility
//!
//! No agent CLI, tmux server or network access is needed.

mod fixtures;

mod dispatch;
mod lifecycle;
mod sessions;
