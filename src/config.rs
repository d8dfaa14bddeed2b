use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const MIN_VIEW_DISTANCE: u32 = 2;
pub const MAX_VIEW_DISTANCE: u32 = 32;

/// Server settings, read from JSON. Every field is optional in the file.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub view_distance: u32,
    /// 0 lets the pool pick one thread per core.
    pub worker_threads: usize,
    pub world_dir: PathBuf,
    pub spawn_chunk_radius: u32,
    pub seed: u64,
    pub unloads_per_tick: usize,
    /// Past this many holders waiting to unload, the per-tick budget is ignored.
    pub unload_backlog: usize,
    pub player_ticket_throttle: usize,
    /// Ticks between incremental saves.
    pub autosave_interval: u64,
    pub run_ticks: Option<u64>,
    pub bots: Vec<BotConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            view_distance: 10,
            worker_threads: 0,
            world_dir: PathBuf::from("world"),
            spawn_chunk_radius: 11,
            seed: 0,
            unloads_per_tick: 200,
            unload_backlog: 2000,
            player_ticket_throttle: 4,
            autosave_interval: 6000,
            run_ticks: None,
            bots: vec![],
        }
    }
}

/// A scripted walker standing in for a connected client.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BotConfig {
    pub name: String,
    /// Block coordinates, x then z.
    pub start: [f64; 2],
    /// Blocks moved per tick.
    pub velocity: [f64; 2],
    pub view_distance: Option<u32>,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            name: "bot".to_owned(),
            start: [0.0, 0.0],
            velocity: [0.0, 0.0],
            view_distance: None,
        }
    }
}

impl ServerConfig {
    /// Reads and validates `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        check_view_distance("view_distance", self.view_distance)?;
        for bot in &self.bots {
            if let Some(view_distance) = bot.view_distance {
                check_view_distance("bots.view_distance", view_distance)?;
            }
        }
        if self.spawn_chunk_radius > MAX_VIEW_DISTANCE {
            return Err(ConfigError::Invalid {
                field: "spawn_chunk_radius",
                reason: format!("{} is larger than {MAX_VIEW_DISTANCE}", self.spawn_chunk_radius),
            });
        }
        if self.player_ticket_throttle == 0 {
            return Err(ConfigError::Invalid {
                field: "player_ticket_throttle",
                reason: "at least one player ticket must be grantable".to_owned(),
            });
        }
        if self.autosave_interval == 0 {
            return Err(ConfigError::Invalid {
                field: "autosave_interval",
                reason: "must be at least one tick".to_owned(),
            });
        }
        Ok(())
    }

    pub fn region_dir(&self) -> PathBuf {
        self.world_dir.join("region")
    }
}

fn check_view_distance(field: &'static str, view_distance: u32) -> Result<(), ConfigError> {
    if (MIN_VIEW_DISTANCE..=MAX_VIEW_DISTANCE).contains(&view_distance) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            field,
            reason: format!("{view_distance} is outside {MIN_VIEW_DISTANCE}..={MAX_VIEW_DISTANCE}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let config: ServerConfig = serde_json::from_str(r#"{ "view_distance": 6, "bots": [{ "name": "walker" }] }"#).unwrap();
        assert_eq!(config.view_distance, 6);
        assert_eq!(config.unloads_per_tick, 200);
        assert_eq!(config.bots[0].name, "walker");
        assert_eq!(config.bots[0].velocity, [0.0, 0.0]);
        config.validate().unwrap();
    }

    #[test]
    fn out_of_range_values_are_rejected() {
        let config = ServerConfig {
            view_distance: 40,
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "view_distance", .. })));
        let config = ServerConfig {
            player_ticket_throttle: 0,
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn loads_from_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.json");
        std::fs::write(&path, r#"{ "seed": 99, "run_ticks": 20 }"#).unwrap();
        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.seed, 99);
        assert_eq!(config.run_ticks, Some(20));

        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(ServerConfig::load(&path), Err(ConfigError::Json(_))));
    }
}
