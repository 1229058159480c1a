use crate::energy_accumulator::{AccumulatorSettings, DEFAULT_DURABLE_SAVE_INTERVAL, DEFAULT_WINDOW};
use crate::poll_scheduler::{ResourceKind, ResourceSettings};
use crate::snapshot_bus::{Channel, PublishMode};
use anyhow::{bail, Context};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_LOGIN_URL: &str = "https://enlighten.enphaseenergy.com/login/login.json";
pub const DEFAULT_TOKEN_URL: &str = "https://entrez.enphaseenergy.com/tokens";
const DEFAULT_TOKEN_FILE: &str = "/data/etc/envoy-telemetry/auth_token.json";
const DEFAULT_FAST_STATE_FILE: &str = "/var/volatile/tmp/envoy-telemetry/energy_totals.json";
const DEFAULT_DURABLE_STATE_FILE: &str = "/data/etc/envoy-telemetry/energy_totals.json";

const HISTORIC_MIN_INTERVAL: u64 = 900;

/// Which authentication the gateway firmware expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Firmware {
    /// Digest authentication as user `installer`.
    Legacy,
    /// Bearer token issued by the vendor cloud.
    Token,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenConfig {
    pub username: String,
    pub password: String,
    pub serial: String,
    pub login_url: String,
    pub token_url: String,
    pub token_file: PathBuf,
}

/// One optional polled resource.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceConfig {
    pub enabled: bool,
    pub interval: Duration,
    pub publish: PublishMode,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub address: String,
    pub scheme: String,
    pub firmware: Firmware,
    pub installer_password: String,
    pub token: TokenConfig,
    /// `None` keeps the fast tier in memory.
    pub fast_state_file: Option<PathBuf>,
    pub durable_state_file: PathBuf,
    pub historic_interval: Duration,
    pub devices: ResourceConfig,
    pub inverters: ResourceConfig,
    pub events: ResourceConfig,
    pub meters_publish: PublishMode,
    pub energy_window: Duration,
    pub durable_save_interval: Duration,
    pub publish_interval: Duration,
}

impl Config {
    /// Reads the configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup; empty values count
    /// as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let address = get("ENVOY_ADDRESS").context("ENVOY_ADDRESS is required")?;
        let firmware = match get("ENVOY_FIRMWARE")
            .as_deref()
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            None | Some("legacy") => Firmware::Legacy,
            Some("token") => Firmware::Token,
            Some(other) => bail!("ENVOY_FIRMWARE must be `legacy` or `token`, got `{other}`"),
        };
        let scheme = get("ENVOY_SCHEME").unwrap_or_else(|| match firmware {
            Firmware::Legacy => "http".to_string(),
            Firmware::Token => "https".to_string(),
        });

        let token = TokenConfig {
            username: get("ENLIGHTEN_USER").unwrap_or_default(),
            password: get("ENLIGHTEN_PASSWORD").unwrap_or_default(),
            serial: get("ENVOY_SERIAL").unwrap_or_default(),
            login_url: get("ENLIGHTEN_LOGIN_URL").unwrap_or_else(|| DEFAULT_LOGIN_URL.to_string()),
            token_url: get("ENLIGHTEN_TOKEN_URL").unwrap_or_else(|| DEFAULT_TOKEN_URL.to_string()),
            token_file: get("TOKEN_FILE")
                .unwrap_or_else(|| DEFAULT_TOKEN_FILE.to_string())
                .into(),
        };
        if firmware == Firmware::Token
            && (token.username.is_empty() || token.password.is_empty() || token.serial.is_empty())
        {
            bail!("Token firmware needs ENLIGHTEN_USER, ENLIGHTEN_PASSWORD and ENVOY_SERIAL");
        }

        // An explicitly empty FAST_STATE_FILE selects the in-memory tier.
        let fast_state_file = match lookup("FAST_STATE_FILE") {
            Some(path) if path.trim().is_empty() => None,
            Some(path) => Some(PathBuf::from(path)),
            None => Some(PathBuf::from(DEFAULT_FAST_STATE_FILE)),
        };

        let historic_interval = seconds(
            "HISTORIC_INTERVAL",
            get("HISTORIC_INTERVAL"),
            HISTORIC_MIN_INTERVAL,
            HISTORIC_MIN_INTERVAL,
        )?;

        Ok(Self {
            address,
            scheme,
            firmware,
            installer_password: get("ENVOY_INSTALLER_PASSWORD").unwrap_or_default(),
            token,
            fast_state_file,
            durable_state_file: get("DURABLE_STATE_FILE")
                .unwrap_or_else(|| DEFAULT_DURABLE_STATE_FILE.to_string())
                .into(),
            historic_interval,
            devices: resource(&get, "FETCH_DEVICES", 60, 3600)?,
            inverters: resource(&get, "FETCH_INVERTERS", 5, 300)?,
            events: resource(&get, "FETCH_EVENTS", 900, 3600)?,
            meters_publish: publish_mode(
                "METERS_PUBLISH",
                get("METERS_PUBLISH"),
                PublishMode::Always,
            )?,
            energy_window: seconds(
                "ENERGY_WINDOW_SECS",
                get("ENERGY_WINDOW_SECS"),
                1,
                DEFAULT_WINDOW.as_secs(),
            )?,
            durable_save_interval: seconds(
                "DURABLE_SAVE_INTERVAL",
                get("DURABLE_SAVE_INTERVAL"),
                0,
                DEFAULT_DURABLE_SAVE_INTERVAL.as_secs(),
            )?,
            publish_interval: seconds("PUBLISH_INTERVAL", get("PUBLISH_INTERVAL"), 1, 1)?,
        })
    }

    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme, self.address)
    }

    pub fn resource_settings(&self) -> Vec<(ResourceKind, ResourceSettings)> {
        let optional = |config: &ResourceConfig| ResourceSettings {
            enabled: config.enabled,
            interval: config.interval,
        };
        vec![
            (
                ResourceKind::HistoricCounters,
                ResourceSettings {
                    enabled: true,
                    interval: self.historic_interval,
                },
            ),
            (ResourceKind::DeviceInventory, optional(&self.devices)),
            (ResourceKind::InverterList, optional(&self.inverters)),
            (ResourceKind::EventLog, optional(&self.events)),
        ]
    }

    pub fn publish_modes(&self) -> Vec<(Channel, PublishMode)> {
        vec![
            (Channel::Meters, self.meters_publish),
            (Channel::Devices, self.devices.publish),
            (Channel::Inverters, self.inverters.publish),
            (Channel::Events, self.events.publish),
        ]
    }

    pub fn accumulator_settings(&self) -> AccumulatorSettings {
        AccumulatorSettings {
            window: self.energy_window,
            durable_save_interval: self.durable_save_interval,
        }
    }

    pub fn log_summary(&self) {
        info!("Envoy telemetry config:");
        info!("  Gateway: {} ({:?} firmware)", self.base_url(), self.firmware);
        info!("  Historic counters every {}s", self.historic_interval.as_secs());
        for (name, resource) in [
            ("Devices", &self.devices),
            ("Inverters", &self.inverters),
            ("Events", &self.events),
        ] {
            if resource.enabled {
                info!(
                    "  {name}: every {}s, publish {:?}",
                    resource.interval.as_secs(),
                    resource.publish
                );
            } else {
                info!("  {name}: disabled");
            }
        }
        info!(
            "  Fast tier: {}",
            self.fast_state_file
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "in memory".to_string())
        );
        info!("  Durable tier: {}", self.durable_state_file.display());
    }
}

/// Enabled resources poll at their minimum unless told otherwise and
/// publish every pass; disabled ones keep the reference defaults.
fn resource(
    get: &impl Fn(&str) -> Option<String>,
    prefix: &str,
    minimum: u64,
    disabled_interval: u64,
) -> anyhow::Result<ResourceConfig> {
    let enabled = parse_bool_safe(get(prefix));
    if !enabled {
        return Ok(ResourceConfig {
            enabled,
            interval: Duration::from_secs(disabled_interval),
            publish: PublishMode::OnChange,
        });
    }

    let interval_key = format!("{prefix}_INTERVAL");
    let publish_key = format!("{prefix}_PUBLISH");
    Ok(ResourceConfig {
        enabled,
        interval: seconds(&interval_key, get(&interval_key), minimum, minimum)?,
        publish: publish_mode(&publish_key, get(&publish_key), PublishMode::Always)?,
    })
}

/// Parses a number of seconds, clamping values below `minimum`.
fn seconds(
    key: &str,
    value: Option<String>,
    minimum: u64,
    default: u64,
) -> anyhow::Result<Duration> {
    let Some(value) = value else {
        return Ok(Duration::from_secs(default));
    };
    let parsed: u64 = value
        .trim()
        .parse()
        .with_context(|| format!("{key} must be a whole number of seconds, got `{value}`"))?;
    if parsed < minimum {
        warn!("{key}={parsed} is below the minimum, using {minimum}");
        return Ok(Duration::from_secs(minimum));
    }
    Ok(Duration::from_secs(parsed))
}

fn publish_mode(
    key: &str,
    value: Option<String>,
    default: PublishMode,
) -> anyhow::Result<PublishMode> {
    match value {
        None => Ok(default),
        Some(value) => PublishMode::parse(&value)
            .with_context(|| format!("{key} must be `always` or `on_change`, got `{value}`")),
    }
}

/// Safely parses a boolean from an optional string, defaulting to false
fn parse_bool_safe(val: Option<String>) -> bool {
    val.unwrap_or_default()
        .to_ascii_lowercase()
        .parse()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_parse_bool_safe() {
        assert!(!parse_bool_safe(None));
        assert!(!parse_bool_safe(Some("".to_string())));
        assert!(parse_bool_safe(Some("true".to_string())));
        assert!(parse_bool_safe(Some("TrUe".to_string())));
        assert!(!parse_bool_safe(Some("FALSE".to_string())));
        assert!(!parse_bool_safe(Some("yes".to_string())));
        assert!(!parse_bool_safe(Some("1".to_string())));
    }

    #[test]
    fn test_defaults() {
        let config = config(&[("ENVOY_ADDRESS", "192.168.1.20")]).unwrap();
        assert_eq!(config.firmware, Firmware::Legacy);
        assert_eq!(config.base_url(), "http://192.168.1.20");
        assert_eq!(config.historic_interval, Duration::from_secs(900));
        assert!(!config.devices.enabled);
        assert_eq!(config.inverters.interval, Duration::from_secs(300));
        assert_eq!(config.energy_window, Duration::from_secs(60));
        assert_eq!(config.durable_save_interval, Duration::from_secs(900));
        assert_eq!(config.meters_publish, PublishMode::Always);
        assert_eq!(
            config.fast_state_file,
            Some(PathBuf::from(DEFAULT_FAST_STATE_FILE))
        );

        let settings = config.resource_settings();
        assert_eq!(settings.len(), 4);
        assert!(settings[0].1.enabled);
        assert!(!settings[2].1.enabled);
    }

    #[test]
    fn test_address_required() {
        assert!(config(&[]).is_err());
        assert!(config(&[("ENVOY_ADDRESS", "  ")]).is_err());
    }

    #[test]
    fn test_minimums_are_enforced() {
        let config = config(&[
            ("ENVOY_ADDRESS", "envoy.local"),
            ("HISTORIC_INTERVAL", "60"),
            ("FETCH_INVERTERS", "true"),
            ("FETCH_INVERTERS_INTERVAL", "1"),
            ("FETCH_DEVICES", "true"),
            ("FETCH_DEVICES_INTERVAL", "120"),
            ("FETCH_EVENTS", "true"),
            ("PUBLISH_INTERVAL", "0"),
        ])
        .unwrap();

        assert_eq!(config.historic_interval, Duration::from_secs(900));
        assert_eq!(config.inverters.interval, Duration::from_secs(5));
        assert_eq!(config.devices.interval, Duration::from_secs(120));
        assert_eq!(config.events.interval, Duration::from_secs(900));
        assert_eq!(config.events.publish, PublishMode::Always);
        assert_eq!(config.publish_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_publish_modes() {
        let config = config(&[
            ("ENVOY_ADDRESS", "envoy.local"),
            ("FETCH_INVERTERS", "true"),
            ("FETCH_INVERTERS_PUBLISH", "0"),
        ])
        .unwrap();
        assert_eq!(config.inverters.publish, PublishMode::OnChange);
        assert!(config
            .publish_modes()
            .contains(&(Channel::Inverters, PublishMode::OnChange)));

        assert!(config_err(&[
            ("ENVOY_ADDRESS", "envoy.local"),
            ("FETCH_EVENTS", "true"),
            ("FETCH_EVENTS_PUBLISH", "sometimes"),
        ]));
    }

    fn config_err(vars: &[(&str, &str)]) -> bool {
        config(vars).is_err()
    }

    #[test]
    fn test_token_firmware() {
        assert!(config(&[("ENVOY_ADDRESS", "envoy.local"), ("ENVOY_FIRMWARE", "token")]).is_err());

        let config = config(&[
            ("ENVOY_ADDRESS", "envoy.local"),
            ("ENVOY_FIRMWARE", "Token"),
            ("ENLIGHTEN_USER", "owner@example.com"),
            ("ENLIGHTEN_PASSWORD", "secret"),
            ("ENVOY_SERIAL", "122100000001"),
            ("FAST_STATE_FILE", ""),
        ])
        .unwrap();
        assert_eq!(config.firmware, Firmware::Token);
        assert_eq!(config.base_url(), "https://envoy.local");
        assert_eq!(config.token.token_url, DEFAULT_TOKEN_URL);
        assert_eq!(config.fast_state_file, None);
    }

    #[test]
    fn test_bad_numbers_are_rejected() {
        assert!(config(&[
            ("ENVOY_ADDRESS", "envoy.local"),
            ("ENERGY_WINDOW_SECS", "a minute")
        ])
        .is_err());
        assert!(config(&[("ENVOY_ADDRESS", "envoy.local"), ("ENVOY_FIRMWARE", "v7")]).is_err());
    }
}
