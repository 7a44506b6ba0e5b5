//! # task-sync
//!
//! A persistent, dependency-driven step runner for Docker-based grading
//! workflows.
//!
//! Work is organized as **tasks** holding typed **steps** — build an image,
//! launch a container pool, extract a volume, apply solution patches, parse
//! a rubric, run a scored shell command — persisted in PostgreSQL with a
//! JSON settings document per row. The engine resolves inter-step
//! dependencies into a DAG, decides per step whether anything changed
//! (content hashes, image identity, container liveness), routes each step
//! to its handler and writes results and settings mutations back
//! atomically. Rubric-hosting steps synthesize their own `rubric_shell`
//! children, one per parsed criterion.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use task_sync::{DockerCli, Engine, PgStore};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), task_sync::Error> {
//!     let store = Arc::new(PgStore::connect_from_env().await?);
//!     let docker = Arc::new(DockerCli::new()?);
//!     let engine = Engine::new(store, docker);
//!
//!     for report in engine.run_task(1).await? {
//!         println!("{}", report.summary());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`config`] - typed step configurations and the settings holder
//! - [`resolver`] - dependency extraction, DAG ordering, tree rendering
//! - [`detect`] - change predicates and image-identity resolution
//! - [`rubric`] - Markdown/JSON rubric parsing
//! - [`generator`] - dynamic `rubric_shell` child synthesis
//! - [`handlers`] - one handler per step type
//! - [`engine`] - eligibility, dispatch, persistence, run modes
//! - [`docker`] - the narrow container-engine adapter
//! - [`store`] - the data-access facade and its PostgreSQL implementation
//! - [`testing`] - scripted fakes for driving the engine in tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub use config::{DepRef, StepConfig, StepSettings, TYPE_KEYS};
pub use docker::{ContainerAdapter, DockerCli, ExecOutput};
pub use engine::{CancelToken, Engine, RunMode, StepReport, StepStatus};
pub use error::{Error, Result};
pub use handlers::{HandlerRegistry, StepHandler, StepOutcome};
pub use resolver::{render_tree, step_dependencies, StepDag};
pub use rubric::Criterion;
pub use settings::TaskSettings;
pub use store::{PgStore, StepRow, Store, TaskRow};

pub mod config;
pub mod detect;
pub mod docker;
pub mod engine;
pub mod error;
pub mod generator;
pub mod handlers;
pub mod hash;
pub mod resolver;
pub mod rubric;
pub mod settings;
pub mod store;
pub mod testing;

/// The version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
