//! Core engine for ripple.
//!
//! Everything the CLI orchestrates lives here: workspace discovery, the
//! project dependency graph, wave planning, the source-generator pre-pass,
//! the bounded-concurrency executor, the debounced file watcher, the watch
//! orchestrator, and the long-lived task supervisor. Presentation is kept
//! out: engine components emit [`events::Event`] values over a channel and
//! never print directly.

pub mod events;
pub mod executor;
pub mod generator;
pub mod graph;
pub mod orchestrator;
pub mod plan;
pub mod pm;
pub mod project;
pub mod scanner;
pub mod supervisor;
pub mod watcher;
pub mod workspace;
