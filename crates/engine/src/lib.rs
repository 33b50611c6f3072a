//! Opchain engine: playbook compilation and dependency-graph orchestration.
//!
//! The engine turns parameterized templates into executable playbooks —
//! DAGs of steps wrapping C2 and proxy jobs — and coordinates their
//! lifecycle: placement and renumbering, status propagation, modifier
//! pipelines between steps, cloning, and graph rendering. Persistence goes
//! through the [`store::Store`] trait (Postgres or in-memory), and every
//! mutation broadcasts on a per-playbook NATS channel.
//!
//! Typical embedding:
//!
//! ```no_run
//! use std::sync::Arc;
//! use opchain_engine::config::{DatabaseConfig, EngineConfig};
//! use opchain_engine::events::EventNotifier;
//! use opchain_engine::service::PlaybookService;
//! use opchain_engine::store::PgStore;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::from_env()?;
//! let pool = opchain_engine::db::create_pool(&DatabaseConfig::from_env()?).await?;
//! let store = PgStore::new(pool);
//! store.migrate().await?;
//!
//! let notifier = match config.nats_url.as_deref() {
//!     Some(url) => EventNotifier::connect(url).await?,
//!     None => EventNotifier::disabled(),
//! };
//! let service = PlaybookService::new(Arc::new(store), notifier)
//!     .with_clone_prefix(config.clone_prefix);
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod graph;
pub mod labels;
pub mod model;
pub mod modifier;
pub mod service;
pub mod store;
pub mod template;

pub use error::{EngineError, EngineResult};
pub use service::PlaybookService;
