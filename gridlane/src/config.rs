//! Runtime configuration.
//!
//! Search through config directories and find gridlane/runtime_config.json.
//! If not found or failed to parse, use defaults. Environment variables
//! are applied on top of whatever was read from disk.

use nanoserde::DeJson;

use crate::backend::{CUDAConfig, DummyConfig};

/// Number of event slots per stream when nothing else is configured
pub const DEFAULT_EVENT_WINDOW: usize = 1024;

const CONFIG_FILE: &str = "gridlane/runtime_config.json";

/// Runtime configuration. Every field is optional so partial files parse.
#[derive(Debug, Default, Clone, DeJson)]
pub struct RuntimeConfig {
    /// Capacity of each stream's event pool
    pub event_window: Option<usize>,
    /// Wrap the event cursor around when it reaches the end of the window
    pub circular_events: Option<bool>,
    /// Write kernel and transfer timers into the profiler
    pub profiler: Option<bool>,
    /// Print block and grid dimensions of every launch
    pub thread_info: Option<bool>,
    /// Default JIT flags used by `DeviceContext::install_code` callers that pass none
    pub jit_flags: Option<String>,
    /// Debug bitmask, see the `debug_*` accessors
    pub debug: Option<u32>,
    pub cuda: Option<CUDAConfig>,
    pub dummy: Option<DummyConfig>,
}

impl RuntimeConfig {
    /// Reads the config file and applies environment overrides.
    ///
    /// `GRIDLANE_DEBUG` is a bitmask, bit 0 prints device initialization,
    /// bit 1 performance, bit 2 launch geometry, bit 3 event pool activity
    /// and bit 4 dumps kernel binaries.
    pub fn load() -> RuntimeConfig {
        let debug_env = std::env::var("GRIDLANE_DEBUG").ok().and_then(|x| x.parse::<u32>().ok());
        let debug_dev = debug_env.is_some_and(|d| d % 2 == 1);

        let mut config = xdg::BaseDirectories::new()
            .map_err(|e| {
                if debug_dev {
                    log::info!("Failed to find config directories for runtime_config.json, {e}");
                }
            })
            .ok()
            .map(|bd| {
                let mut dirs = bd.get_config_dirs();
                dirs.push(bd.get_config_home());
                dirs
            })
            .and_then(|paths| {
                paths.into_iter().find_map(|mut path| {
                    path.push(CONFIG_FILE);
                    std::fs::read_to_string(&path).ok()
                })
            })
            .and_then(|file| {
                RuntimeConfig::deserialize_json(&file)
                    .map_err(|e| {
                        if debug_dev {
                            log::info!("Failed to parse runtime_config.json, {e}");
                        }
                    })
                    .ok()
            })
            .inspect(|_| {
                if debug_dev {
                    log::info!("Runtime config successfully read and parsed.");
                }
            })
            .unwrap_or_else(|| {
                if debug_dev {
                    log::info!("Runtime config not found, using defaults.");
                }
                RuntimeConfig::default()
            });

        if debug_env.is_some() {
            config.debug = debug_env;
        }
        if let Some(x) = std::env::var("GRIDLANE_EVENT_WINDOW").ok().and_then(|x| x.parse().ok()) {
            config.event_window = Some(x);
        }
        if let Some(x) = std::env::var("GRIDLANE_PROFILER").ok().and_then(|x| parse_bool(&x)) {
            config.profiler = Some(x);
        }
        if let Some(x) = std::env::var("GRIDLANE_CIRCULAR_EVENTS").ok().and_then(|x| parse_bool(&x)) {
            config.circular_events = Some(x);
        }
        config
    }

    pub fn event_window(&self) -> usize {
        self.event_window.unwrap_or(DEFAULT_EVENT_WINDOW).max(1)
    }

    pub fn circular_events(&self) -> bool {
        self.circular_events.unwrap_or(true)
    }

    pub fn profiler(&self) -> bool {
        self.profiler.unwrap_or(false)
    }

    pub fn thread_info(&self) -> bool {
        self.thread_info.unwrap_or(false)
    }

    pub fn jit_flags(&self) -> &str {
        self.jit_flags.as_deref().unwrap_or("")
    }

    pub const fn debug_dev(&self) -> bool {
        self.debug_bit(0)
    }

    pub const fn debug_perf(&self) -> bool {
        self.debug_bit(1)
    }

    pub const fn debug_sched(&self) -> bool {
        self.debug_bit(2)
    }

    pub const fn debug_events(&self) -> bool {
        self.debug_bit(3)
    }

    pub const fn debug_asm(&self) -> bool {
        self.debug_bit(4)
    }

    const fn debug_bit(&self, bit: u32) -> bool {
        match self.debug {
            Some(mask) => (mask >> bit) % 2 == 1,
            None => false,
        }
    }
}

fn parse_bool(x: &str) -> Option<bool> {
    match x.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_parses() {
        let config = RuntimeConfig::deserialize_json(r#"{"event_window": 16, "debug": 5}"#).unwrap();
        assert_eq!(config.event_window(), 16);
        assert!(config.circular_events());
        assert!(config.debug_dev());
        assert!(!config.debug_perf());
        assert!(config.debug_sched());
        assert!(config.cuda.is_none());
    }

    #[test]
    fn nested_backend_sections() {
        let config = RuntimeConfig::deserialize_json(
            r#"{"cuda": {"device_ids": [0]}, "dummy": {"enabled": true, "devices": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.cuda.and_then(|c| c.device_ids), Some(vec![0]));
        let dummy = config.dummy.unwrap();
        assert!(dummy.enabled);
        assert_eq!(dummy.devices, Some(2));
    }

    #[test]
    fn bool_env_values() {
        assert_eq!(parse_bool("ON"), Some(true));
        assert_eq!(parse_bool(" 0 "), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
