//! chatrelay server - line-oriented TCP broadcast relay

use tracing::info;

use chatrelay_server::{dispatch, ConfigLoader};
use chatrelay_utils::{LogConfig, Result};

fn main() -> Result<()> {
    // Config picks the log destination, so it loads before logging exists
    let mut config = ConfigLoader::load()?;
    if let Some(port) = std::env::args().nth(1) {
        config = config.with_port_arg(&port)?;
    }
    ConfigLoader::validate(&config)?;

    chatrelay_utils::init_logging_with_config(LogConfig::server(config.log_output))?;

    info!(
        "chatrelay server starting on {}:{} ({} dispatch)",
        config.bind_address, config.port, config.strategy
    );

    dispatch::serve(&config)?;

    info!("chatrelay server stopped");
    Ok(())
}
