//! Configuration management for the channel manager.
//!
//! This module handles loading and saving configuration from disk,
//! including buffer sizes, event buffering and I/O timeouts.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};

use crate::{
   bluetooth::l2cap::MAX_SDU_SIZE,
   error::{L2capError, Result},
};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Config {
   /// BlueZ adapter to use, e.g. `hci0`. The default adapter when unset.
   #[serde(default)]
   pub adapter: Option<String>,

   #[serde(default = "default_buffer_size")]
   pub receive_buffer_size: usize,

   #[serde(default = "default_buffer_size")]
   pub response_buffer_size: usize,

   /// Largest read size a caller may request for exchanges and receiving.
   #[serde(default = "default_max_buffer_size")]
   pub max_buffer_size: usize,

   /// Capacity of each broadcast topic before the oldest events are dropped.
   #[serde(default = "default_event_buffer")]
   pub event_buffer: usize,

   /// Upper bound for one request/response exchange. Unbounded when unset.
   #[serde(default)]
   pub exchange_timeout_ms: Option<u64>,

   #[serde(default = "default_channel_connect_timeout")]
   pub channel_connect_timeout_secs: u64,
}

const fn default_buffer_size() -> usize {
   1024
}

const fn default_max_buffer_size() -> usize {
   MAX_SDU_SIZE
}

const fn default_event_buffer() -> usize {
   64
}

const fn default_channel_connect_timeout() -> u64 {
   10
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         receive_buffer_size: default_buffer_size(),
         response_buffer_size: default_buffer_size(),
         max_buffer_size: default_max_buffer_size(),
         event_buffer: default_event_buffer(),
         exchange_timeout_ms: None,
         channel_connect_timeout_secs: default_channel_connect_timeout(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("L2CAPD_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         dirs::config_dir().ok_or(L2capError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("l2capd").join("config.toml"))
   }

   pub fn exchange_timeout(&self) -> Option<Duration> {
      self.exchange_timeout_ms.map(Duration::from_millis)
   }

   pub const fn channel_connect_timeout(&self) -> Duration {
      Duration::from_secs(self.channel_connect_timeout_secs)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_partial_file_falls_back_to_defaults() {
      let config: Config = toml::from_str("adapter = \"hci1\"\nexchange_timeout_ms = 250\n")
         .expect("valid toml");

      assert_eq!(config.adapter.as_deref(), Some("hci1"));
      assert_eq!(config.exchange_timeout(), Some(Duration::from_millis(250)));
      assert_eq!(config.receive_buffer_size, 1024);
      assert_eq!(config.response_buffer_size, 1024);
      assert_eq!(config.max_buffer_size, 65_535);
      assert_eq!(config.event_buffer, 64);
      assert_eq!(config.channel_connect_timeout(), Duration::from_secs(10));
   }

   #[test]
   fn test_missing_file_is_created_with_defaults() {
      let dir = tempfile::tempdir().expect("tempdir");
      let path = dir.path().join("l2capd").join("config.toml");

      let config = Config::load_from(&path).expect("load");
      assert_eq!(config, Config::default());
      assert!(path.exists());

      let mut changed = config;
      changed.receive_buffer_size = 512;
      changed.exchange_timeout_ms = Some(2000);
      changed.save_to(&path).expect("save");

      assert_eq!(Config::load_from(&path).expect("reload"), changed);
   }
}
