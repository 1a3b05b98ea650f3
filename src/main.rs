//! l2capd D-Bus service
//!
//! Exposes one L2CAP channel manager on the system's BlueZ stack over the
//! session bus, with connection state and received data emitted as signals.

use log::{error, info};
use tokio::signal;
use zbus::connection;

use l2capd::{
   BluezPlatform, Config, L2capManager, Result,
   dbus::{self, L2capService},
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting l2capd D-Bus service...");

   let config = Config::load()?;
   info!(
      "Loaded configuration: {} byte reads, {} byte responses",
      config.receive_buffer_size, config.response_buffer_size
   );

   let platform = BluezPlatform::new(&config).await?;
   let manager = L2capManager::new(platform, &config);

   let connection = connection::Builder::session()?
      .name(dbus::BUS_NAME)?
      .serve_at(dbus::OBJECT_PATH, L2capService::new(manager.clone()))?
      .build()
      .await?;

   info!("l2capd D-Bus service started at {}", dbus::BUS_NAME);

   let dispatcher = dbus::spawn_dispatcher(&connection, &manager).await?;

   signal::ctrl_c().await?;
   info!("Shutting down l2capd service...");

   dispatcher.abort();
   if let Err(e) = manager.disconnect().await {
      error!("Failed to release device link: {e}");
   }

   Ok(())
}
