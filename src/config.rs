use anyhow::{Context, Result, anyhow, bail};
use dotenvy::dotenv;
use keyring::Entry;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf};
use url::Url;

use crate::batch::{AbandonPolicy, UploadOptions};
use crate::client::DEFAULT_CONTENT_BASE_URL;
use crate::credentials::{DEFAULT_API_BASE_URL, DEFAULT_OAUTH_BASE_URL, OAuthApp};
use crate::session::DEFAULT_DESTINATION_PREFIX;

pub const KEYRING_SERVICE: &str = "dbxup";
pub const KEYRING_REFRESH_TOKEN_USER: &str = "refresh-token";
pub const KEYRING_ACCESS_TOKEN_USER: &str = "access-token";

const ENV_PREFIX: &str = "DBXUP_";
const DEFAULT_CHUNK_SIZE_MIB: u64 = 8;
const MAX_CHUNK_SIZE_MIB: u64 = 150;

#[derive(Debug, Deserialize, Serialize, Default, PartialEq)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_secret: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size_mib: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_base_url: Option<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_base_url: Option<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_base_url: Option<Url>,
}

/// Read from `DBXUP_*` environment variables.
#[derive(Debug, Deserialize, Default)]
struct ConfigEnv {
    app_key: Option<String>,
    app_secret: Option<String>,
    refresh_token: Option<String>,
    access_token: Option<String>,
    destination_prefix: Option<String>,
    chunk_size_mib: Option<u64>,
    content_base_url: Option<Url>,
    api_base_url: Option<Url>,
    oauth_base_url: Option<Url>,
}

#[derive(Debug)]
pub struct Config {
    pub app_key: Option<String>,
    pub app_secret: Option<String>,
    pub refresh_token: Option<String>,
    pub access_token: Option<String>,
    pub destination_prefix: String,
    pub chunk_size_mib: u64,
    pub content_base_url: Url,
    pub api_base_url: Url,
    pub oauth_base_url: Url,
}

impl Config {
    pub fn upload_options(&self, abandon_policy: AbandonPolicy) -> Result<UploadOptions> {
        Ok(UploadOptions::default()
            .with_chunk_size(self.chunk_size_mib * 1024 * 1024)?
            .with_prefix(self.destination_prefix.clone())
            .with_abandon_policy(abandon_policy))
    }

    /// The OAuth app, when every part of the refresh exchange is configured.
    pub fn oauth_app(&self) -> Option<OAuthApp> {
        Some(OAuthApp {
            app_key: self.app_key.clone()?,
            app_secret: self.app_secret.clone()?,
            refresh_token: self.refresh_token.clone()?,
        })
    }
}

fn parse_default_url(url: &str) -> Result<Url> {
    Url::parse(url).with_context(|| format!("invalid built-in URL {url}"))
}

fn merge_config(
    base: ConfigFile,
    override_config: ConfigEnv,
    keyring_refresh_token: impl FnOnce() -> Option<String>,
) -> Result<Config> {
    let chunk_size_mib = override_config
        .chunk_size_mib
        .or(base.chunk_size_mib)
        .unwrap_or(DEFAULT_CHUNK_SIZE_MIB);
    if !(1..=MAX_CHUNK_SIZE_MIB).contains(&chunk_size_mib) {
        bail!(
            "chunk_size_mib must be between 1 and {}, got {}",
            MAX_CHUNK_SIZE_MIB,
            chunk_size_mib
        );
    }

    let refresh_token = override_config
        .refresh_token
        .or_else(keyring_refresh_token);

    let content_base_url = match override_config.content_base_url.or(base.content_base_url) {
        Some(url) => url,
        None => parse_default_url(DEFAULT_CONTENT_BASE_URL)?,
    };
    let api_base_url = match override_config.api_base_url.or(base.api_base_url) {
        Some(url) => url,
        None => parse_default_url(DEFAULT_API_BASE_URL)?,
    };
    let oauth_base_url = match override_config.oauth_base_url.or(base.oauth_base_url) {
        Some(url) => url,
        None => parse_default_url(DEFAULT_OAUTH_BASE_URL)?,
    };

    Ok(Config {
        app_key: override_config.app_key.or(base.app_key),
        app_secret: override_config.app_secret.or(base.app_secret),
        refresh_token,
        access_token: override_config.access_token,
        destination_prefix: override_config
            .destination_prefix
            .or(base.destination_prefix)
            .unwrap_or_else(|| DEFAULT_DESTINATION_PREFIX.to_string()),
        chunk_size_mib,
        content_base_url,
        api_base_url,
        oauth_base_url,
    })
}

fn keyring_refresh_token() -> Option<String> {
    let entry = Entry::new(KEYRING_SERVICE, KEYRING_REFRESH_TOKEN_USER).ok()?;
    let secret = entry.get_secret().ok()?;
    String::from_utf8(secret).ok()
}

pub fn config_file_path() -> Result<PathBuf> {
    let project_dirs = directories::ProjectDirs::from("com", "dbxup", "dbxup")
        .ok_or(anyhow!("Unable to determine home directory"))?;
    Ok(project_dirs.config_dir().join("config.toml"))
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    match fs::read_to_string(path) {
        Ok(config) => toml::from_str(&config)
            .with_context(|| format!("Failed to parse {}", path.display())),
        Err(_) => Ok(ConfigFile::default()),
    }
}

fn read_env_config(vars: impl IntoIterator<Item = (String, String)>) -> Result<ConfigEnv> {
    envy::prefixed(ENV_PREFIX)
        .from_iter(vars)
        .with_context(|| format!("Invalid {ENV_PREFIX}* environment"))
}

pub fn read_config() -> Result<Config> {
    let _ = dotenv();
    let env_config = read_env_config(std::env::vars())?;

    let file_config = read_config_file(&config_file_path()?)?;

    merge_config(file_config, env_config, keyring_refresh_token)
}

fn write_config_file(path: &Path, config: &ConfigFile) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(config)?;
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

pub fn write_config(config: ConfigFile) -> Result<()> {
    write_config_file(&config_file_path()?, &config)
}

impl ConfigFile {
    /// Takes every value set in `update`, keeping the rest.
    pub fn merge(self, update: ConfigFile) -> ConfigFile {
        ConfigFile {
            app_key: update.app_key.or(self.app_key),
            app_secret: update.app_secret.or(self.app_secret),
            destination_prefix: update.destination_prefix.or(self.destination_prefix),
            chunk_size_mib: update.chunk_size_mib.or(self.chunk_size_mib),
            content_base_url: update.content_base_url.or(self.content_base_url),
            api_base_url: update.api_base_url.or(self.api_base_url),
            oauth_base_url: update.oauth_base_url.or(self.oauth_base_url),
        }
    }
}

fn update_config_file(path: &Path, update: ConfigFile) -> Result<()> {
    let merged = read_config_file(path)?.merge(update);
    write_config_file(path, &merged)
}

/// Writes `update` over the existing config file, keeping values it leaves unset.
pub fn update_config(update: ConfigFile) -> Result<()> {
    update_config_file(&config_file_path()?, update)
}

pub fn set_refresh_token_keyring(refresh_token: String) -> Result<()> {
    let entry = Entry::new(KEYRING_SERVICE, KEYRING_REFRESH_TOKEN_USER)?;
    entry.set_secret(refresh_token.as_bytes())?;
    println!("Refresh token stored for use with dbxup");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = merge_config(ConfigFile::default(), ConfigEnv::default(), || None).unwrap();

        assert_eq!(config.destination_prefix, "galeria");
        assert_eq!(config.chunk_size_mib, 8);
        assert_eq!(config.content_base_url.as_str(), DEFAULT_CONTENT_BASE_URL);
        assert!(config.refresh_token.is_none());
        assert!(config.oauth_app().is_none());
    }

    #[test]
    fn environment_overrides_file() {
        let file = ConfigFile {
            app_key: Some("file-key".to_string()),
            destination_prefix: Some("fotos".to_string()),
            chunk_size_mib: Some(16),
            ..Default::default()
        };
        let env = ConfigEnv {
            app_key: Some("env-key".to_string()),
            chunk_size_mib: Some(4),
            ..Default::default()
        };

        let config = merge_config(file, env, || None).unwrap();
        assert_eq!(config.app_key.as_deref(), Some("env-key"));
        assert_eq!(config.destination_prefix, "fotos");
        assert_eq!(config.chunk_size_mib, 4);

        let options = config.upload_options(AbandonPolicy::Close).unwrap();
        assert_eq!(options.chunk_size(), 4 * 1024 * 1024);
        assert_eq!(options.prefix(), "fotos");
        assert_eq!(options.abandon_policy(), AbandonPolicy::Close);
    }

    #[test]
    fn keyring_is_only_consulted_without_env_token() {
        let env = ConfigEnv {
            refresh_token: Some("env-refresh".to_string()),
            ..Default::default()
        };
        let config = merge_config(ConfigFile::default(), env, || {
            panic!("keyring should not be read")
        })
        .unwrap();
        assert_eq!(config.refresh_token.as_deref(), Some("env-refresh"));

        let file = ConfigFile {
            app_key: Some("key".to_string()),
            app_secret: Some("secret".to_string()),
            ..Default::default()
        };
        let config = merge_config(file, ConfigEnv::default(), || {
            Some("stored-refresh".to_string())
        })
        .unwrap();
        let app = config.oauth_app().unwrap();
        assert_eq!(app.refresh_token, "stored-refresh");
    }

    #[test]
    fn chunk_size_out_of_range_is_rejected() {
        let file = ConfigFile {
            chunk_size_mib: Some(151),
            ..Default::default()
        };
        assert!(merge_config(file, ConfigEnv::default(), || None).is_err());

        let env = ConfigEnv {
            chunk_size_mib: Some(0),
            ..Default::default()
        };
        assert!(merge_config(ConfigFile::default(), env, || None).is_err());
    }

    #[test]
    fn config_file_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        assert_eq!(read_config_file(&path).unwrap(), ConfigFile::default());

        let config = ConfigFile {
            app_key: Some("key".to_string()),
            destination_prefix: Some("galeria".to_string()),
            chunk_size_mib: Some(32),
            ..Default::default()
        };
        write_config_file(&path, &config).unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert!(!written.contains("app_secret"));
        assert_eq!(read_config_file(&path).unwrap(), config);
    }

    #[test]
    fn malformed_environment_is_an_error() {
        let vars = vec![
            ("DBXUP_ACCESS_TOKEN".to_string(), "token".to_string()),
            ("DBXUP_CHUNK_SIZE_MIB".to_string(), "abc".to_string()),
        ];
        let err = read_env_config(vars).unwrap_err();
        assert!(err.to_string().contains("DBXUP_"));

        let vars = vec![
            ("DBXUP_ACCESS_TOKEN".to_string(), "token".to_string()),
            ("DBXUP_CHUNK_SIZE_MIB".to_string(), "16".to_string()),
            ("HOME".to_string(), "/root".to_string()),
        ];
        let env = read_env_config(vars).unwrap();
        assert_eq!(env.access_token.as_deref(), Some("token"));
        assert_eq!(env.chunk_size_mib, Some(16));
    }

    #[test]
    fn update_keeps_values_it_does_not_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let api_base_url = Url::parse("http://127.0.0.1:8080/2/").unwrap();

        write_config_file(
            &path,
            &ConfigFile {
                app_key: Some("old-key".to_string()),
                app_secret: Some("old-secret".to_string()),
                api_base_url: Some(api_base_url.clone()),
                ..Default::default()
            },
        )
        .unwrap();

        update_config_file(
            &path,
            ConfigFile {
                app_key: Some("new-key".to_string()),
                chunk_size_mib: Some(16),
                ..Default::default()
            },
        )
        .unwrap();

        let config = read_config_file(&path).unwrap();
        assert_eq!(config.app_key.as_deref(), Some("new-key"));
        assert_eq!(config.app_secret.as_deref(), Some("old-secret"));
        assert_eq!(config.chunk_size_mib, Some(16));
        assert_eq!(config.api_base_url, Some(api_base_url));
    }
}
