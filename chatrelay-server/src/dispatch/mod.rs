//! Dispatch loops
//!
//! Two interchangeable ways to drive accepted connections through their
//! [`Session`](crate::lifecycle::Session):
//!
//! - [`readiness`]: one thread blocked on a mio `Poll`, handling each ready
//!   event to completion before waiting again. Broadcast writes block that
//!   thread, so one slow peer delays every other client and new accepts.
//! - [`completion`]: a fixed-size tokio worker pool, one task per connection
//!   chaining read -> dispatch -> read, with queued fire-and-forget writes.
//!
//! Both honour the same broadcast contract; [`serve`] picks one from config.

pub mod completion;
pub mod readiness;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use chatrelay_utils::{RelayError, Result};

use crate::config::ServerConfig;

pub use completion::{ClientHandle, CompletionServer, CompletionShutdown};
pub use readiness::{PolledConnection, ReadinessServer, ReadinessShutdown};

/// Which dispatch loop runs the server
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStrategy {
    /// Single-threaded readiness multiplexing
    Readiness,
    /// Worker-pool completion dispatch
    #[default]
    Completion,
}

impl std::fmt::Display for DispatchStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Readiness => f.write_str("readiness"),
            Self::Completion => f.write_str("completion"),
        }
    }
}

/// Run the relay until shut down
///
/// The readiness loop runs on the calling thread. The completion loop gets its
/// own multi-threaded runtime with `config.workers` worker threads and stops on
/// Ctrl-C.
pub fn serve(config: &ServerConfig) -> Result<()> {
    let addr = config.listen_addr()?;
    info!("Starting {} dispatcher", config.strategy);

    match config.strategy {
        DispatchStrategy::Readiness => ReadinessServer::bind(addr, config)?.run(),
        DispatchStrategy::Completion => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(config.workers)
                .thread_name("chatrelay-worker")
                .enable_all()
                .build()
                .map_err(|e| RelayError::internal(format!("Failed to build runtime: {}", e)))?;

            runtime.block_on(async {
                let server = CompletionServer::bind(addr, config).await?;
                let shutdown = server.shutdown_handle();

                tokio::spawn(async move {
                    match tokio::signal::ctrl_c().await {
                        Ok(()) => {
                            info!("Interrupt received, shutting down");
                            shutdown.shutdown();
                        }
                        Err(e) => warn!("Failed to listen for Ctrl-C: {}", e),
                    }
                });

                server.run().await
            })
        }
    }
}
