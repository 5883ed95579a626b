use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use gml_core::executor::DEFAULT_MAX_PARALLEL;

const CONFIG_PATH: &str = "~/.gml/config.toml";
const PLUGIN_DIR: &str = "~/.gml/frameworks";
const FIELD_MANAGER: &str = "gml";

/// Settings read from `~/.gml/config.toml`. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Settings {
    pub namespace: Option<String>,
    pub manifest_dir: Option<PathBuf>,
    pub plugin_dir: Option<PathBuf>,
    pub field_manager: Option<String>,
    pub max_parallel: Option<usize>,
}

impl Settings {
    /// Directory that overrides the embedded framework manifests, if any.
    pub fn manifest_dir(&self) -> Option<PathBuf> {
        self.manifest_dir.as_deref().map(expand_tilde)
    }

    pub fn plugin_dir(&self) -> PathBuf {
        match &self.plugin_dir {
            Some(dir) => expand_tilde(dir),
            None => expand_tilde(Path::new(PLUGIN_DIR)),
        }
    }

    pub fn field_manager(&self) -> &str {
        self.field_manager.as_deref().unwrap_or(FIELD_MANAGER)
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel.unwrap_or(DEFAULT_MAX_PARALLEL)
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

/// Load the settings file. A missing file means defaults.
pub fn parse_config() -> Result<Settings, Box<dyn std::error::Error>> {
    let config_path = expand_tilde(Path::new(CONFIG_PATH));
    if !config_path.exists() {
        return Ok(Settings::default());
    }
    parse_config_file(&config_path)
}

pub fn parse_config_file(path: &Path) -> Result<Settings, Box<dyn std::error::Error>> {
    let content = fs::read_to_string(path)?;
    let settings = toml::from_str(&content)
        .map_err(|e| format!("invalid settings in {}: {}", path.display(), e))?;
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn settings_file(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn reads_every_key() {
        let file = settings_file(
            "namespace = \"training\"\nmanifest-dir = \"/srv/manifests\"\nplugin-dir = \"/srv/plugins\"\nfield-manager = \"ci\"\nmax-parallel = 2\n",
        );
        let settings = parse_config_file(file.path()).unwrap();
        assert_eq!(settings.namespace.as_deref(), Some("training"));
        assert_eq!(settings.manifest_dir(), Some(PathBuf::from("/srv/manifests")));
        assert_eq!(settings.plugin_dir(), PathBuf::from("/srv/plugins"));
        assert_eq!(settings.field_manager(), "ci");
        assert_eq!(settings.max_parallel(), 2);
    }

    #[test]
    fn empty_file_gives_defaults() {
        let file = settings_file("");
        let settings = parse_config_file(file.path()).unwrap();
        assert_eq!(settings.field_manager(), "gml");
        assert_eq!(settings.max_parallel(), DEFAULT_MAX_PARALLEL);
        assert!(settings.plugin_dir().ends_with(".gml/frameworks"));
        assert!(settings.manifest_dir().is_none());
    }

    #[test]
    fn malformed_settings_are_an_error() {
        let file = settings_file("max-parallel = \"many\"\n");
        assert!(parse_config_file(file.path()).is_err());
        let file = settings_file("provider = \"lambda\"\n");
        assert!(parse_config_file(file.path()).is_err());
    }
}
