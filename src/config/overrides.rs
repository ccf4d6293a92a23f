use super::schema::Config;
use std::path::PathBuf;

/// Command-line values that take precedence over files and environment
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub port: Option<u16>,
    pub plugins_dir: Option<PathBuf>,
    pub debug: bool,
}

impl CliOverrides {
    pub fn apply(&self, mut config: Config) -> Config {
        if let Some(port) = self.port {
            config.server.port = port;
        }

        if let Some(dir) = &self.plugins_dir {
            config.plugins.root_dir = dir.clone();
        }

        if self.debug {
            config.logging.level = "debug".to_string();
        }

        config
    }
}
