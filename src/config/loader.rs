use super::schema::Config;
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use std::path::Path;

const ENV_PREFIX: &str = "CMS_KERNEL_";

pub async fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file("cms-kernel.toml"))
        .merge(Json::file("cms-kernel.json"))
        .merge(Yaml::file("cms-kernel.yaml"))
        .merge(Yaml::file("cms-kernel.yml"))
        // CMS_KERNEL_PLUGINS__ROOT_DIR=... style overrides
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    let config: Config = figment
        .merge(Env::prefixed(ENV_PREFIX).split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

fn finish(config: Config) -> Result<Config> {
    let config = apply_env_substitutions(config)?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if !config.server.api_prefix.starts_with('/') || config.server.api_prefix.len() < 2 {
        return Err(ConfigError::Validation(format!(
            "API prefix must be a non-root absolute path, got '{}'",
            config.server.api_prefix
        ))
        .into());
    }

    let plugins = &config.plugins;
    if plugins.schema != "http" && plugins.schema != "https" {
        return Err(ConfigError::Validation(format!(
            "Plugin schema must be http or https, got '{}'",
            plugins.schema
        ))
        .into());
    }

    if plugins.base_port == 0 {
        return Err(ConfigError::Validation("Plugin base port must be greater than 0".into()).into());
    }

    if plugins.base_port == config.server.port {
        return Err(ConfigError::Validation(
            "Plugin base port must differ from the server port".into(),
        )
        .into());
    }

    if plugins.proxy_timeout_ms == 0 {
        return Err(ConfigError::Validation("Proxy timeout must be greater than 0".into()).into());
    }

    if config.settings.refresh_interval_secs == 0
        || config.settings.permissions_refresh_interval_secs == 0
    {
        return Err(ConfigError::Validation(
            "Refresh intervals must be greater than 0".into(),
        )
        .into());
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    if let Some(root) = config.plugins.root_dir.to_str() {
        config.plugins.root_dir = substitute_env_vars(root)?.into();
    }

    if let Some(store) = config.store.path.to_str() {
        config.store.path = substitute_env_vars(store)?.into();
    }

    if let Some(dir) = config.logging.dir.as_ref().and_then(|d| d.to_str()) {
        config.logging.dir = Some(substitute_env_vars(dir)?.into());
    }

    Ok(config)
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        match std::env::var(var_name) {
            Ok(value) => {
                result = result.replace(&cap[0], &value);
            }
            Err(_) => {
                // ${VAR:-default}
                if let Some((name, default)) = var_name.split_once(":-") {
                    match std::env::var(name) {
                        Ok(value) => result = result.replace(&cap[0], &value),
                        Err(_) => result = result.replace(&cap[0], default),
                    }
                } else {
                    return Err(ConfigError::EnvVar(format!(
                        "Environment variable '{}' not found",
                        var_name
                    ))
                    .into());
                }
            }
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_env_substitution() {
        std::env::set_var("CMS_KERNEL_TEST_VAR", "plugins-here");

        let result = substitute_env_vars("/srv/${CMS_KERNEL_TEST_VAR}").unwrap();
        assert_eq!(result, "/srv/plugins-here");

        let result = substitute_env_vars("${CMS_KERNEL_MISSING:-./plugins}").unwrap();
        assert_eq!(result, "./plugins");

        assert!(substitute_env_vars("${CMS_KERNEL_DEFINITELY_MISSING}").is_err());

        std::env::remove_var("CMS_KERNEL_TEST_VAR");
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(validate(&config).is_ok());
        assert_eq!(config.plugins.base_port, 30002);
        assert_eq!(config.server.api_prefix, "/api");
    }

    #[test]
    fn test_validation_rejects_port_clash() {
        let mut config = Config::default();
        config.server.port = 30002;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_validation_rejects_unknown_schema() {
        let mut config = Config::default();
        config.plugins.schema = "ftp".to_string();
        assert!(validate(&config).is_err());
    }

    #[tokio::test]
    async fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "server:\n  port: 9000\nplugins:\n  rootDir: /opt/plugins\n  basePort: 40000\n"
        )
        .unwrap();

        let config = load_from_path(file.path()).await.unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.plugins.root_dir, std::path::PathBuf::from("/opt/plugins"));
        assert_eq!(config.plugins.base_port, 40000);
        assert_eq!(config.plugins.schema, "http");
    }

    #[tokio::test]
    async fn test_load_rejects_unknown_extension() {
        let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
        assert!(load_from_path(file.path()).await.is_err());
    }
}
