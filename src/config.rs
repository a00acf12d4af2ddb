use anyhow::{Context, Result};
use std::{env, net::Ipv4Addr, path::PathBuf, sync::OnceLock, time::Duration};

/// Application configuration loaded and validated at startup
#[derive(Clone, Debug)]
pub struct AppConfig {
    /// UI server configuration
    pub ui: UiConfig,

    /// Monitored network interface and DHCP role configuration
    pub network: NetworkConfig,

    /// PTP daemon and management client configuration
    pub ptp: PtpConfig,

    /// E-paper panel helper configuration
    pub display: DisplayConfig,

    /// GPIO button configuration
    pub buttons: ButtonsConfig,

    /// Path configuration
    pub paths: PathConfig,
}

#[derive(Clone, Debug)]
pub struct UiConfig {
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct NetworkConfig {
    /// Interface whose DHCP role this device controls
    pub interface: String,
    /// Address the device carries while acting as DHCP server
    pub server_address: Ipv4Addr,
    /// Directory systemd-networkd reads profiles from
    pub profile_dir: PathBuf,
    /// Directory holding the interchangeable client/server profile templates
    pub template_dir: PathBuf,
    /// How long the foreign-server scan listens for offers
    pub scan_window: Duration,
    /// Bound for `networkctl reload` and other one-shot network tools
    pub tool_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct PtpConfig {
    pub daemon_path: PathBuf,
    pub management_client_path: PathBuf,
    /// Bound for a single pmc query
    pub query_timeout: Duration,
    /// Bound for the master-takeover confirmation poll
    pub confirm_timeout: Duration,
    pub confirm_poll_interval: Duration,
}

#[derive(Clone, Debug)]
pub struct DisplayConfig {
    /// External helper that drives the e-paper panel
    pub helper_path: PathBuf,
    pub helper_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct ButtonsConfig {
    pub chip: String,
    pub view_offset: u32,
    pub toggle_offset: u32,
    pub scan_offset: u32,
    pub sync_offset: u32,
}

#[derive(Clone, Debug)]
pub struct PathConfig {
    pub static_dir: PathBuf,
    pub index_html: PathBuf,
}

impl AppConfig {
    /// Get or load the application configuration
    ///
    /// On first call, loads and validates all configuration from environment
    /// variables; subsequent calls return the cached instance.
    ///
    /// # Panics
    /// Panics if configuration loading fails. This is intentional as the
    /// application cannot function without valid configuration.
    pub fn get() -> &'static Self {
        static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();
        APP_CONFIG.get_or_init(|| {
            Self::load_internal().expect("failed to load application configuration")
        })
    }

    fn load_internal() -> Result<Self> {
        Ok(AppConfig {
            ui: UiConfig::load()?,
            network: NetworkConfig::load()?,
            ptp: PtpConfig::load()?,
            display: DisplayConfig::load()?,
            buttons: ButtonsConfig::load()?,
            paths: PathConfig::load()?,
        })
    }
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

impl UiConfig {
    fn load() -> Result<Self> {
        let port = var_or("UI_PORT", "8080")
            .parse::<u16>()
            .context("UI_PORT format")?;
        Ok(UiConfig { port })
    }
}

impl NetworkConfig {
    fn load() -> Result<Self> {
        Ok(NetworkConfig {
            interface: var_or("NET_INTERFACE", "eth0"),
            server_address: var_or("SERVER_ADDRESS", "192.168.77.1")
                .parse()
                .context("SERVER_ADDRESS format")?,
            profile_dir: var_or("NETWORK_PROFILE_DIR", "/etc/systemd/network").into(),
            template_dir: var_or("NETWORK_TEMPLATE_DIR", "/usr/share/netclock/profiles").into(),
            scan_window: Duration::from_secs(5),
            tool_timeout: Duration::from_secs(10),
        })
    }
}

impl PtpConfig {
    fn load() -> Result<Self> {
        Ok(PtpConfig {
            daemon_path: var_or("PTP4L_PATH", "/usr/sbin/ptp4l").into(),
            management_client_path: var_or("PMC_PATH", "/usr/sbin/pmc").into(),
            query_timeout: Duration::from_secs(3),
            confirm_timeout: Duration::from_secs(10),
            confirm_poll_interval: Duration::from_millis(500),
        })
    }
}

impl DisplayConfig {
    fn load() -> Result<Self> {
        Ok(DisplayConfig {
            helper_path: var_or("DISPLAY_HELPER", "/usr/bin/epd-text").into(),
            helper_timeout: Duration::from_secs(10),
        })
    }
}

impl ButtonsConfig {
    fn load() -> Result<Self> {
        let offset = |name: &str, default: &str| -> Result<u32> {
            var_or(name, default)
                .parse::<u32>()
                .context(format!("{name} format"))
        };

        Ok(ButtonsConfig {
            chip: var_or("GPIO_CHIP", "gpiochip0"),
            view_offset: offset("BUTTON_VIEW_OFFSET", "5")?,
            toggle_offset: offset("BUTTON_TOGGLE_OFFSET", "6")?,
            scan_offset: offset("BUTTON_SCAN_OFFSET", "13")?,
            sync_offset: offset("BUTTON_SYNC_OFFSET", "19")?,
        })
    }
}

impl PathConfig {
    fn load() -> Result<Self> {
        let static_dir = PathBuf::from(var_or("STATIC_DIR", "static"));
        let index_html = static_dir.join("index.html");
        Ok(PathConfig {
            static_dir,
            index_html,
        })
    }
}
