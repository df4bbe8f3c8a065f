use std::path::Path;

use log::{debug, error, info};

use crate::errors::StartupError;
use crate::logging::{self, ErrorCode};
use crate::nmcli::{ControlTool, Nmcli};

/// Drivers where pinning a specific access point is known to wedge the
/// connection; the BSSID fallback is skipped entirely for these.
pub const FLAGGED_DRIVERS: &[&str] = &["brcmfmac", "rtl8188eu", "rtl8192cu"];

/// Process-wide state resolved once at startup and passed down explicitly
/// instead of being read from ambient globals.
#[derive(Debug, Clone)]
pub struct AppContext {
    pub interface: String,
    pub driver: String,
    pub driver_flagged: bool,
    pub ask_supported: bool,
    pub wait_secs: u64,
}

impl AppContext {
    pub fn build(
        tool: &Nmcli,
        interface: Option<String>,
        wait_secs: u64,
    ) -> Result<Self, StartupError> {
        if let Err(err) = tool.check_available() {
            error!(
                "{} control tool unavailable: {}",
                logging::error_code(ErrorCode::ToolMissing),
                err
            );
            return Err(err.into());
        }

        let wireless = wifi_interfaces(tool)?;
        let interface = match interface {
            Some(name) if wireless.iter().any(|w| *w == name) => name,
            Some(name) => return Err(StartupError::NotWireless(name)),
            None => wireless.into_iter().next().ok_or_else(|| {
                error!(
                    "{} no wireless interface present",
                    logging::error_code(ErrorCode::NoWirelessInterface)
                );
                StartupError::NoWirelessInterface
            })?,
        };

        let driver = probe_driver(tool, &interface);
        let driver_flagged = FLAGGED_DRIVERS.iter().any(|flagged| *flagged == driver);
        let ask_supported = tool.supports_ask();

        info!(
            "using interface {} (driver: {}, flagged: {}, daemon prompting: {})",
            interface,
            if driver.is_empty() { "unknown" } else { &driver },
            driver_flagged,
            ask_supported
        );

        Ok(Self {
            interface,
            driver,
            driver_flagged,
            ask_supported,
            wait_secs,
        })
    }
}

fn wifi_interfaces(tool: &dyn ControlTool) -> Result<Vec<String>, StartupError> {
    let raw = tool.run(&["-t", "-f", "DEVICE,TYPE", "device", "status"])?;
    Ok(raw
        .lines()
        .filter_map(|line| {
            let (device, kind) = line.split_once(':')?;
            (kind == "wifi").then(|| device.to_string())
        })
        .collect())
}

/// Driver identification, probed once: ask the tool first, fall back to the
/// sysfs driver symlink.
fn probe_driver(tool: &dyn ControlTool, interface: &str) -> String {
    match tool.run(&["-g", "GENERAL.DRIVER", "device", "show", interface]) {
        Ok(out) if !out.trim().is_empty() => out.trim().to_string(),
        _ => driver_from_sysfs(interface),
    }
}

fn driver_from_sysfs(interface: &str) -> String {
    let link = Path::new("/sys/class/net")
        .join(interface)
        .join("device/driver");
    match std::fs::read_link(&link) {
        Ok(target) => target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default(),
        Err(err) => {
            debug!("sysfs driver probe for {} failed: {}", interface, err);
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmcli::fake::FakeTool;

    #[test]
    fn wifi_interfaces_filters_by_type() {
        let tool = FakeTool::new();
        tool.on(
            "device status",
            vec![Ok("eth0:ethernet\nwlan0:wifi\nlo:loopback\nwlan1:wifi")],
        );
        let found = wifi_interfaces(&tool).unwrap();
        assert_eq!(found, vec!["wlan0".to_string(), "wlan1".to_string()]);
    }

    #[test]
    fn driver_probe_prefers_tool_answer() {
        let tool = FakeTool::new();
        tool.on("GENERAL.DRIVER", vec![Ok("iwlwifi\n")]);
        assert_eq!(probe_driver(&tool, "wlan0"), "iwlwifi");
    }
}
