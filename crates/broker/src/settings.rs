//! Broker settings: CLI flags over the `[broker]` table of a TOML file over
//! built-in defaults.

use std::{
    env,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::{lifecycle, DEFAULT_EVENT_BUFFER};

pub const CONFIG_ENV: &str = "TOKENVAULT_CONFIG";
pub const HOME_ENV: &str = "TOKENVAULT_HOME";
pub const CONFIG_FILE_NAME: &str = "tokenvault.toml";
pub const DATABASE_FILE_NAME: &str = "tokenvault.db";

const DATA_DIR_NAME: &str = ".tokenvault";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub server_port: u16,
    pub auto_start_server: bool,
    /// Carried for a desktop host; the CLI only reports it.
    pub minimize_to_tray: bool,
    /// Carried for a desktop host; the CLI only reports it.
    pub start_with_windows: bool,
    pub database: PathBuf,
    pub stop_timeout: Duration,
    pub restart_delay: Duration,
    pub event_buffer: usize,
}

impl BrokerSettings {
    fn defaults_in(data_dir: &Path) -> Self {
        Self {
            server_port: lifecycle::DEFAULT_PORT,
            auto_start_server: true,
            minimize_to_tray: true,
            start_with_windows: false,
            database: data_dir.join(DATABASE_FILE_NAME),
            stop_timeout: lifecycle::DEFAULT_STOP_TIMEOUT,
            restart_delay: lifecycle::MIN_RESTART_DELAY,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self::defaults_in(&data_dir())
    }
}

/// Values given on the command line. `None` leaves the decision to the file
/// or the defaults.
#[derive(Debug, Default, Clone)]
pub struct CliSettingsOverrides {
    pub config: Option<PathBuf>,
    pub database: Option<PathBuf>,
    pub port: Option<u16>,
    pub auto_start_server: Option<bool>,
}

/// Contents of the `[broker]` table with relative paths already resolved.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FileBrokerSettings {
    pub server_port: Option<u16>,
    pub auto_start_server: Option<bool>,
    pub minimize_to_tray: Option<bool>,
    pub start_with_windows: Option<bool>,
    pub database: Option<PathBuf>,
    pub stop_timeout_ms: Option<u64>,
    pub restart_delay_ms: Option<u64>,
    pub event_buffer: Option<usize>,
}

#[derive(Deserialize)]
struct RootConfig {
    #[serde(default)]
    broker: Option<RawFileBrokerSettings>,
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawFileBrokerSettings {
    server_port: Option<u16>,
    auto_start_server: Option<bool>,
    minimize_to_tray: Option<bool>,
    start_with_windows: Option<bool>,
    database: Option<String>,
    stop_timeout_ms: Option<u64>,
    restart_delay_ms: Option<u64>,
    event_buffer: Option<usize>,
}

impl RawFileBrokerSettings {
    fn into_runtime_config(self, base_dir: &Path) -> FileBrokerSettings {
        FileBrokerSettings {
            server_port: self.server_port,
            auto_start_server: self.auto_start_server,
            minimize_to_tray: self.minimize_to_tray,
            start_with_windows: self.start_with_windows,
            database: self.database.map(|raw| resolve_relative(base_dir, &raw)),
            stop_timeout_ms: self.stop_timeout_ms,
            restart_delay_ms: self.restart_delay_ms,
            event_buffer: self.event_buffer,
        }
    }
}

/// `$TOKENVAULT_HOME`, else `$HOME/.tokenvault`, else `./.tokenvault`.
pub fn data_dir() -> PathBuf {
    data_dir_from(env::var_os(HOME_ENV), env::var_os("HOME"))
}

fn data_dir_from(vault_home: Option<OsString>, home: Option<OsString>) -> PathBuf {
    if let Some(dir) = vault_home.filter(|value| !value.is_empty()) {
        return PathBuf::from(dir);
    }
    match home.filter(|value| !value.is_empty()) {
        Some(home) => PathBuf::from(home).join(DATA_DIR_NAME),
        None => PathBuf::from(".").join(DATA_DIR_NAME),
    }
}

/// `--config`, else `$TOKENVAULT_CONFIG`, else `<data dir>/tokenvault.toml`.
pub fn config_path(cli: Option<&Path>) -> PathBuf {
    config_path_from(cli, env::var_os(CONFIG_ENV), &data_dir())
}

fn config_path_from(cli: Option<&Path>, env_value: Option<OsString>, data_dir: &Path) -> PathBuf {
    if let Some(path) = cli {
        return path.to_path_buf();
    }
    if let Some(path) = env_value.filter(|value| !value.is_empty()) {
        return PathBuf::from(path);
    }
    data_dir.join(CONFIG_FILE_NAME)
}

/// Reads the `[broker]` table. A missing file yields `None`.
pub fn load_file_config(path: &Path) -> Result<Option<FileBrokerSettings>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read broker config from {}", path.display()))?;
    let parsed: RootConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse TOML config {}", path.display()))?;

    let base_dir = path.parent().unwrap_or(Path::new("."));
    Ok(parsed
        .broker
        .map(|raw| raw.into_runtime_config(base_dir)))
}

/// Layers CLI values over the file over defaults rooted at `data_dir`.
pub fn determine_settings(
    cli: &CliSettingsOverrides,
    file_cfg: Option<&FileBrokerSettings>,
    data_dir: &Path,
) -> Result<BrokerSettings> {
    let defaults = BrokerSettings::defaults_in(data_dir);
    let file = file_cfg.cloned().unwrap_or_default();

    let stop_timeout_ms = file
        .stop_timeout_ms
        .unwrap_or(defaults.stop_timeout.as_millis() as u64);
    if stop_timeout_ms == 0 {
        bail!("broker.stop_timeout_ms must be greater than 0");
    }

    let restart_delay_ms = file
        .restart_delay_ms
        .unwrap_or(defaults.restart_delay.as_millis() as u64);
    let min_delay_ms = lifecycle::MIN_RESTART_DELAY.as_millis() as u64;
    if restart_delay_ms < min_delay_ms {
        bail!("broker.restart_delay_ms must be at least {min_delay_ms} (got {restart_delay_ms})");
    }

    let event_buffer = file.event_buffer.unwrap_or(defaults.event_buffer);
    if event_buffer == 0 {
        bail!("broker.event_buffer must be greater than 0");
    }

    Ok(BrokerSettings {
        server_port: cli
            .port
            .or(file.server_port)
            .unwrap_or(defaults.server_port),
        auto_start_server: cli
            .auto_start_server
            .or(file.auto_start_server)
            .unwrap_or(defaults.auto_start_server),
        minimize_to_tray: file.minimize_to_tray.unwrap_or(defaults.minimize_to_tray),
        start_with_windows: file
            .start_with_windows
            .unwrap_or(defaults.start_with_windows),
        database: cli
            .database
            .clone()
            .or(file.database)
            .unwrap_or(defaults.database),
        stop_timeout: Duration::from_millis(stop_timeout_ms),
        restart_delay: Duration::from_millis(restart_delay_ms),
        event_buffer,
    })
}

/// Resolves the config file location, reads it and layers the CLI on top.
pub fn load_settings(cli: &CliSettingsOverrides) -> Result<BrokerSettings> {
    let path = config_path(cli.config.as_deref());
    let file_cfg = load_file_config(&path)?;
    if file_cfg.is_some() {
        tracing::debug!("loaded broker config from {}", path.display());
    }
    determine_settings(cli, file_cfg.as_ref(), &data_dir())
}

fn resolve_relative(base_dir: &Path, raw: &str) -> PathBuf {
    let candidate = PathBuf::from(raw);
    if candidate.is_absolute() {
        candidate
    } else {
        base_dir.join(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_apply_without_file_or_flags() {
        let data_dir = Path::new("/var/lib/vault");
        let settings = determine_settings(&CliSettingsOverrides::default(), None, data_dir)
            .expect("defaults");

        assert_eq!(settings.server_port, 9999);
        assert!(settings.auto_start_server);
        assert!(settings.minimize_to_tray);
        assert!(!settings.start_with_windows);
        assert_eq!(settings.database, data_dir.join("tokenvault.db"));
        assert_eq!(settings.stop_timeout, Duration::from_secs(5));
        assert_eq!(settings.restart_delay, Duration::from_millis(500));
        assert_eq!(settings.event_buffer, 128);
    }

    #[test]
    fn file_values_override_defaults_and_flags_override_file() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tokenvault.toml");
        fs::write(
            &path,
            r#"
                [broker]
                server_port = 8088
                auto_start_server = false
                minimize_to_tray = false
                database = "data/vault.db"
                stop_timeout_ms = 250
                restart_delay_ms = 1000
                event_buffer = 16
            "#,
        )
        .expect("write config");

        let file_cfg = load_file_config(&path)
            .expect("load config")
            .expect("broker table");
        assert_eq!(file_cfg.database, Some(dir.path().join("data/vault.db")));

        let settings =
            determine_settings(&CliSettingsOverrides::default(), Some(&file_cfg), dir.path())
                .expect("file settings");
        assert_eq!(settings.server_port, 8088);
        assert!(!settings.auto_start_server);
        assert!(!settings.minimize_to_tray);
        assert_eq!(settings.stop_timeout, Duration::from_millis(250));
        assert_eq!(settings.restart_delay, Duration::from_secs(1));
        assert_eq!(settings.event_buffer, 16);

        let cli = CliSettingsOverrides {
            port: Some(7000),
            auto_start_server: Some(true),
            database: Some(PathBuf::from("/tmp/other.db")),
            ..CliSettingsOverrides::default()
        };
        let settings = determine_settings(&cli, Some(&file_cfg), dir.path()).expect("cli wins");
        assert_eq!(settings.server_port, 7000);
        assert!(settings.auto_start_server);
        assert_eq!(settings.database, PathBuf::from("/tmp/other.db"));
    }

    #[test]
    fn load_settings_reads_the_file_named_on_the_command_line() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("custom.toml");
        fs::write(
            &path,
            r#"
                [broker]
                server_port = 8123
                database = "vault.db"
            "#,
        )
        .expect("write config");

        assert_eq!(config_path(Some(&path)), path);

        let cli = CliSettingsOverrides {
            config: Some(path.clone()),
            ..CliSettingsOverrides::default()
        };
        let settings = load_settings(&cli).expect("settings");
        assert_eq!(settings.server_port, 8123);
        assert_eq!(settings.database, dir.path().join("vault.db"));
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let dir = tempdir().expect("tempdir");
        let loaded = load_file_config(&dir.path().join("absent.toml")).expect("missing is ok");
        assert!(loaded.is_none());
    }

    #[test]
    fn file_without_broker_table_uses_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tokenvault.toml");
        fs::write(&path, "").expect("write config");
        assert!(load_file_config(&path).expect("empty config").is_none());
    }

    #[test]
    fn type_errors_fail_the_parse() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("tokenvault.toml");
        fs::write(&path, "[broker]\nserver_port = \"nine\"\n").expect("write config");

        let err = load_file_config(&path).expect_err("bad type");
        assert!(format!("{err:#}").contains("Failed to parse TOML config"));

        fs::write(&path, "[broker]\nserver_port = 70000\n").expect("write config");
        assert!(load_file_config(&path).is_err());
    }

    #[test]
    fn range_violations_are_rejected() {
        let data_dir = Path::new(".");
        let cli = CliSettingsOverrides::default();

        let zero_timeout = FileBrokerSettings {
            stop_timeout_ms: Some(0),
            ..FileBrokerSettings::default()
        };
        let err = determine_settings(&cli, Some(&zero_timeout), data_dir).expect_err("timeout");
        assert!(err.to_string().contains("stop_timeout_ms"));

        let short_delay = FileBrokerSettings {
            restart_delay_ms: Some(100),
            ..FileBrokerSettings::default()
        };
        let err = determine_settings(&cli, Some(&short_delay), data_dir).expect_err("delay");
        assert!(err.to_string().contains("restart_delay_ms"));

        let no_buffer = FileBrokerSettings {
            event_buffer: Some(0),
            ..FileBrokerSettings::default()
        };
        let err = determine_settings(&cli, Some(&no_buffer), data_dir).expect_err("buffer");
        assert!(err.to_string().contains("event_buffer"));
    }

    #[test]
    fn data_dir_prefers_explicit_home() {
        assert_eq!(
            data_dir_from(Some("/srv/vault".into()), Some("/home/dev".into())),
            PathBuf::from("/srv/vault")
        );
        assert_eq!(
            data_dir_from(None, Some("/home/dev".into())),
            PathBuf::from("/home/dev/.tokenvault")
        );
        assert_eq!(
            data_dir_from(Some("".into()), None),
            PathBuf::from("./.tokenvault")
        );
    }

    #[test]
    fn config_path_precedence() {
        let data_dir = Path::new("/home/dev/.tokenvault");
        assert_eq!(
            config_path_from(
                Some(Path::new("/etc/vault.toml")),
                Some("/env/vault.toml".into()),
                data_dir
            ),
            PathBuf::from("/etc/vault.toml")
        );
        assert_eq!(
            config_path_from(None, Some("/env/vault.toml".into()), data_dir),
            PathBuf::from("/env/vault.toml")
        );
        assert_eq!(
            config_path_from(None, None, data_dir),
            data_dir.join("tokenvault.toml")
        );
    }
}
