//! pullpool: a bounded pool of lazily-created, reusable resource instances.
//!
//! Consumers submit work that needs exclusive access to one instance. The
//! pool reuses a free instance when it can, creates one while under the
//! configured limit, and otherwise queues the work until an instance frees up.
//!
//! ```no_run
//! use pullpool::{BoxError, Pool, PoolConfig};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = Pool::new(
//!     || async { Ok::<_, BoxError>(Vec::<u8>::new()) },
//!     PoolConfig::new().with_limit(4),
//! )?;
//!
//! let len = pool
//!     .run(|buf: &mut Vec<u8>| {
//!         Box::pin(async move {
//!             buf.push(1);
//!             Ok::<_, std::io::Error>(buf.len())
//!         })
//!     })
//!     .await?;
//! assert!(len >= 1);
//!
//! pool.set_destructor(|buf: Vec<u8>| async move { drop(buf) });
//! pool.destruct().await;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod handle;
mod pool;
mod queue;
mod registry;
mod teardown;

pub use config::{ConfigError, DEFAULT_LIMIT, PoolConfig};
pub use error::{BoxError, UseError};
pub use handle::UseHandle;
pub use pool::Pool;
