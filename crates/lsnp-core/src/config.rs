//! Engine configuration.
//!
//! Settings come from three places. The TOML file supplies whatever the
//! operator wrote down; anything the file omits falls back to the protocol
//! defaults below; and a handful of `LSNP_*` environment variables beat
//! both, which is how tests and one-off runs tweak a knob without editing
//! the file. The file itself lives at `$LSNP_CONFIG` when that is set, or
//! under the XDG config home (`~/.config/lsnp/config.toml`).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LsnpConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub presence: PresenceConfig,
    pub delivery: DeliveryConfig,
    pub file: FileConfig,
    pub dedupe: DedupeConfig,
    pub token: TokenConfig,
    /// Surface dropped/duplicate/unauthorized frames as verbose_log events.
    pub verbose: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Short name forming the left half of `name@ip`. Chosen at setup.
    pub name: String,
    pub display_name: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Well-known shared UDP port. 0 = OS-assigned (tests only).
    pub port: u16,
    /// Directed broadcast address override. Empty = limited broadcast
    /// 255.255.255.255.
    pub broadcast_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub profile_interval_secs: u64,
    pub ping_interval_secs: u64,
    /// A peer unseen for longer than this is flagged inactive.
    pub stale_threshold_secs: u64,
    /// A peer unseen for longer than this is removed from the registry.
    pub evict_threshold_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Seconds to wait before each retransmission of an unacked frame.
    pub retry_schedule_secs: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Body bytes per FILE_DATA chunk.
    pub chunk_size: usize,
    /// Maximum unacked chunks in flight per transfer.
    pub window: usize,
    /// Where completed incoming files are written.
    pub download_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeConfig {
    pub cap: usize,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    pub ttl_secs: u64,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: "anon".to_string(),
            display_name: "Anonymous".to_string(),
            status: "online".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: crate::wire::DEFAULT_PORT,
            broadcast_addr: String::new(),
        }
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            profile_interval_secs: 30,
            ping_interval_secs: 10,
            stale_threshold_secs: 60,
            evict_threshold_secs: 300,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            retry_schedule_secs: vec![2, 4, 8],
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::wire::DEFAULT_CHUNK_SIZE,
            window: 8,
            download_dir: data_dir().join("downloads"),
        }
    }
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            cap: 4096,
            ttl_secs: 60,
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self { ttl_secs: 3600 }
    }
}

// ── File location ─────────────────────────────────────────────────────────────

/// An `lsnp/` directory under an XDG base, honoring the `$XDG_*` variable
/// when set and walking the conventional home-relative fallback otherwise.
fn xdg_dir(env_key: &str, home_fallback: &[&str]) -> PathBuf {
    let base = match std::env::var_os(env_key) {
        Some(base) => PathBuf::from(base),
        None => {
            let mut dir = std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/tmp"));
            for part in home_fallback {
                dir.push(part);
            }
            dir
        }
    };
    base.join("lsnp")
}

fn data_dir() -> PathBuf {
    xdg_dir("XDG_DATA_HOME", &[".local", "share"])
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config file {path} does not parse: {source}")]
    Syntax {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("default config could not be rendered: {0}")]
    Render(#[from] toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl LsnpConfig {
    /// Where this host keeps its settings. `$LSNP_CONFIG` pins an explicit
    /// file; everything else goes through the XDG config home.
    pub fn file_path() -> PathBuf {
        match std::env::var_os("LSNP_CONFIG") {
            Some(explicit) => PathBuf::from(explicit),
            None => xdg_dir("XDG_CONFIG_HOME", &[".config"]).join("config.toml"),
        }
    }

    /// Read the settings for this run. A missing file simply means the
    /// defaults; any other I/O trouble, or a file that does not parse, is
    /// surfaced to the host. `LSNP_*` variables are folded in last.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = match std::fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text).map_err(|source| ConfigError::Syntax {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LsnpConfig::default(),
            Err(source) => return Err(ConfigError::Io { path, source }),
        };
        config.override_from_env();
        Ok(config)
    }

    /// First-run bootstrap: seed the config file with the defaults when
    /// there is none yet, then load as usual. Returns the path alongside
    /// the settings so the host can point the user at what to edit.
    pub fn bootstrap() -> Result<(Self, PathBuf), ConfigError> {
        let path = Self::file_path();
        if std::fs::metadata(&path).is_err() {
            let rendered = toml::to_string_pretty(&LsnpConfig::default())?;
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
                    path: path.clone(),
                    source,
                })?;
            }
            std::fs::write(&path, rendered).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
        }
        let config = Self::load()?;
        Ok((config, path))
    }

    /// One `LSNP_*` variable per overridable knob. Empty values are
    /// treated as unset so `LSNP_VERBOSE= lsnpd` does what it looks like.
    fn override_from_env(&mut self) {
        fn var(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.is_empty())
        }
        if let Some(v) = var("LSNP_IDENTITY__NAME") {
            self.identity.name = v;
        }
        if let Some(v) = var("LSNP_IDENTITY__DISPLAY_NAME") {
            self.identity.display_name = v;
        }
        if let Some(port) = var("LSNP_NETWORK__PORT").and_then(|v| v.parse().ok()) {
            self.network.port = port;
        }
        if let Some(v) = var("LSNP_NETWORK__BROADCAST_ADDR") {
            self.network.broadcast_addr = v;
        }
        if let Some(v) = var("LSNP_VERBOSE") {
            self.verbose = matches!(v.as_str(), "1" | "true" | "yes");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol() {
        let config = LsnpConfig::default();
        assert_eq!(config.network.port, 50999);
        assert_eq!(config.presence.profile_interval_secs, 30);
        assert_eq!(config.presence.ping_interval_secs, 10);
        assert_eq!(config.presence.stale_threshold_secs, 60);
        assert_eq!(config.presence.evict_threshold_secs, 300);
        assert_eq!(config.delivery.retry_schedule_secs, vec![2, 4, 8]);
        assert_eq!(config.file.chunk_size, 1024);
        assert_eq!(config.file.window, 8);
        assert_eq!(config.dedupe.cap, 4096);
        assert_eq!(config.dedupe.ttl_secs, 60);
        assert_eq!(config.token.ttl_secs, 3600);
        assert!(!config.verbose);
    }

    #[test]
    fn toml_round_trip() {
        let config = LsnpConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let back: LsnpConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.network.port, config.network.port);
        assert_eq!(
            back.delivery.retry_schedule_secs,
            config.delivery.retry_schedule_secs
        );
    }

    #[test]
    fn partial_file_fills_defaults() {
        let text = "[network]\nport = 40999\n";
        let config: LsnpConfig = toml::from_str(text).unwrap();
        assert_eq!(config.network.port, 40999);
        assert_eq!(config.presence.ping_interval_secs, 10);
    }
}
