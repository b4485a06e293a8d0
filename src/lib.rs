//! # Flowboard: Declarative Dataflow Board Engine
//!
//! Flowboard executes *boards*: declarative graphs whose typed nodes are
//! wired by directed edges carrying named values. A board runs by traversal,
//! each node firing when its required inputs arrive, and the run is observed
//! as a stream of tagged events. Boards can run in-process, against a remote
//! run server, or with individual node types proxied to another process.
//!
//! ## Core concepts
//!
//! - **Board**: a [`graph::GraphDescriptor`] of nodes and edges, possibly
//!   with nested subgraphs.
//! - **Kit**: a named collection of [`kit::NodeHandler`]s resolving node
//!   types to async computations.
//! - **Run**: a single traversal surfaced as [`run::RunEvent`]s, with
//!   suspension points for inputs and secrets.
//! - **Remote**: the SSE wire protocol for replaying runs from a server and
//!   the proxy protocol for tunneling node invocations.
//!
//! ## Quick start
//!
//! ```no_run
//! use flowboard::graph::{Edge, GraphDescriptor, NodeDescriptor};
//! use flowboard::kit::Kit;
//! use flowboard::run::LocalRunner;
//!
//! # async fn demo() -> miette::Result<()> {
//! let board = GraphDescriptor {
//!     nodes: vec![
//!         NodeDescriptor::new("ask", "input"),
//!         NodeDescriptor::new("shout", "uppercase"),
//!         NodeDescriptor::new("answer", "output"),
//!     ],
//!     edges: vec![
//!         Edge::new("ask", "shout").ports("text", "text"),
//!         Edge::new("shout", "answer").ports("text", "text"),
//!     ],
//!     ..Default::default()
//! };
//!
//! let kit = Kit::new("example://shout").with_fn("uppercase", |inputs, _ctx| async move {
//!     let text = inputs
//!         .get("text")
//!         .and_then(|value| value.as_str())
//!         .unwrap_or_default()
//!         .to_uppercase();
//!     Ok([("text".to_string(), text.into())].into_iter().collect())
//! });
//!
//! let runner = LocalRunner::new(board).with_kit(kit);
//! let inputs = [("text".to_string(), "hello".into())].into_iter().collect();
//! let outputs = runner.run_once(inputs).await.map_err(miette::Report::from)?;
//! assert_eq!(outputs["text"].as_str(), Some("HELLO"));
//! # Ok(())
//! # }
//! ```
//!
//! Cyclic boards are handled by [`graph::condense`], which rewrites every
//! strongly connected component into a nested subgraph the scheduler can
//! traverse.
//!
//! ## Module guide
//!
//! - [`graph`] - board structure, values, validation, and cycle condensation
//! - [`kit`] - node handlers and kits
//! - [`traversal`] - the scheduler and dispatch loop
//! - [`run`] - run events, event streams, and the local runner
//! - [`remote`] - remote run client, proxy client/server, transports
//! - [`data`] - run-scoped grouped value storage
//! - [`telemetry`] - tracing/miette setup helpers for embedders

pub mod data;
pub mod graph;
pub mod kit;
pub mod remote;
pub mod run;
pub mod telemetry;
pub mod traversal;
