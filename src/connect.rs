use log::{debug, info, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::errors::ConnectFailed;
use crate::logging::{self, ErrorCode};
use crate::nmcli::ControlTool;
use crate::prompt::CredentialSource;
use crate::scan::NetworkRecord;

/// Prefix for transient profiles so leftovers are recognizable in the
/// daemon's connection list.
const PROFILE_PREFIX: &str = "wifisel";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityProfile {
    Open,
    Wep,
    WpaPersonal,
    Wpa3Personal,
    EnhancedOpen,
}

impl SecurityProfile {
    /// Substring classification of the tool's free-text security tokens.
    /// The vocabulary is not fully specified (combined tokens like
    /// "WPA2 WPA3" are common), so matching stays fuzzy on purpose.
    /// Keywords are matched space-padded so "SAE" cannot match inside an
    /// unrelated token.
    pub fn classify(token: &str) -> Self {
        let padded = format!(" {} ", token);
        if padded.contains(" OWE ") {
            SecurityProfile::EnhancedOpen
        } else if padded.contains(" SAE ") || padded.contains(" WPA3 ") {
            SecurityProfile::Wpa3Personal
        } else if token.contains("WPA") {
            SecurityProfile::WpaPersonal
        } else if padded.contains(" WEP ") {
            SecurityProfile::Wep
        } else {
            SecurityProfile::Open
        }
    }

    fn needs_secret(&self) -> bool {
        !matches!(self, SecurityProfile::Open | SecurityProfile::EnhancedOpen)
    }
}

/// Best-effort security guess for a manually entered hidden SSID: reuse a
/// prior scan record with the same name if one exists, otherwise assume
/// WPA-Personal. A name collision can make this wrong; it is a default, not
/// a guarantee.
pub fn guess_security(records: &[NetworkRecord], ssid: &str) -> SecurityProfile {
    records
        .iter()
        .find(|record| record.ssid == ssid)
        .map(|record| SecurityProfile::classify(&record.security))
        .unwrap_or(SecurityProfile::WpaPersonal)
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub ssid: String,
    pub bssid: Option<String>,
    pub security: SecurityProfile,
    pub hidden: bool,
}

impl ConnectRequest {
    pub fn from_record(record: &NetworkRecord) -> Self {
        Self {
            ssid: record.ssid.clone(),
            bssid: record.bssid.clone(),
            security: SecurityProfile::classify(&record.security),
            hidden: false,
        }
    }

    pub fn hidden(ssid: String, security: SecurityProfile) -> Self {
        Self {
            ssid,
            bssid: None,
            security,
            hidden: true,
        }
    }
}

/// Ordered connection strategies, evaluated in sequence with early exit on
/// first success. SSID-first is deliberate: some drivers fail when the tool
/// forces a specific access point, so the daemon gets to pick first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    SsidFirst,
    BssidPinned,
}

pub struct Negotiator<'a> {
    tool: &'a dyn ControlTool,
    credentials: &'a mut dyn CredentialSource,
    ctx: &'a AppContext,
    // One prompt per negotiation; retries reuse the entered secret.
    cached_secret: Option<String>,
}

impl<'a> Negotiator<'a> {
    pub fn new(
        tool: &'a dyn ControlTool,
        credentials: &'a mut dyn CredentialSource,
        ctx: &'a AppContext,
    ) -> Self {
        Self {
            tool,
            credentials,
            ctx,
            cached_secret: None,
        }
    }

    /// Drive the request to a connected or failed outcome. No partial state
    /// survives a failure: every transient profile is removed.
    pub fn connect(&mut self, request: &ConnectRequest) -> Result<(), ConnectFailed> {
        self.cached_secret = None;

        let mut strategies = vec![Strategy::SsidFirst];
        if request.bssid.is_some() && !request.hidden {
            if self.ctx.driver_flagged {
                info!(
                    "driver {} is on the pinned-connect blocklist, skipping the BSSID fallback",
                    self.ctx.driver
                );
            } else {
                strategies.push(Strategy::BssidPinned);
            }
        }

        let mut last_reason = String::from("no applicable connection strategy");
        for strategy in strategies {
            match self.try_strategy(request, strategy) {
                Ok(()) => {
                    info!("connected to \"{}\" via {:?}", request.ssid, strategy);
                    return Ok(());
                }
                Err(reason) => {
                    warn!(
                        "{} {:?} attempt for \"{}\" failed: {}",
                        logging::error_code(ErrorCode::ConnectionFailed),
                        strategy,
                        request.ssid,
                        reason
                    );
                    last_reason = reason;
                }
            }
        }

        Err(ConnectFailed {
            ssid: request.ssid.clone(),
            reason: last_reason,
        })
    }

    fn try_strategy(&mut self, request: &ConnectRequest, strategy: Strategy) -> Result<(), String> {
        // Mixed-mode access points advertise SAE alongside WPA2; when the
        // SAE attempt is rejected, the same strategy is retried once
        // reclassified as WPA-Personal.
        let profiles = if request.security == SecurityProfile::Wpa3Personal {
            vec![SecurityProfile::Wpa3Personal, SecurityProfile::WpaPersonal]
        } else {
            vec![request.security]
        };

        let mut last_reason = String::new();
        for profile in profiles {
            match self.try_profile(request, strategy, profile) {
                Ok(()) => return Ok(()),
                Err(reason) => last_reason = reason,
            }
        }
        Err(last_reason)
    }

    fn try_profile(
        &mut self,
        request: &ConnectRequest,
        strategy: Strategy,
        profile: SecurityProfile,
    ) -> Result<(), String> {
        let name = format!("{}-{}", PROFILE_PREFIX, Uuid::new_v4());
        let mut guard = ProfileGuard::new(self.tool, &name);

        let secret = self.gather_secret(request, profile)?;
        self.add_profile(&name, request, strategy, profile, secret.as_deref())?;
        self.bring_up(&name, profile, secret.is_some())?;

        guard.keep();
        Ok(())
    }

    fn gather_secret(
        &mut self,
        request: &ConnectRequest,
        profile: SecurityProfile,
    ) -> Result<Option<String>, String> {
        match profile {
            SecurityProfile::Open | SecurityProfile::EnhancedOpen => Ok(None),
            SecurityProfile::WpaPersonal | SecurityProfile::Wpa3Personal
                if self.ctx.ask_supported =>
            {
                // The daemon prompts for the secret itself at activation.
                Ok(None)
            }
            SecurityProfile::Wep | SecurityProfile::WpaPersonal | SecurityProfile::Wpa3Personal => {
                if self.cached_secret.is_none() {
                    let label = match profile {
                        SecurityProfile::Wep => format!("Network key for \"{}\": ", request.ssid),
                        _ => format!("Password for \"{}\": ", request.ssid),
                    };
                    let entered = self
                        .credentials
                        .secret(&label)
                        .map_err(|err| format!("credential prompt failed: {}", err))?;
                    self.cached_secret = Some(entered);
                }
                Ok(self.cached_secret.clone())
            }
        }
    }

    fn add_profile(
        &self,
        name: &str,
        request: &ConnectRequest,
        strategy: Strategy,
        profile: SecurityProfile,
        secret: Option<&str>,
    ) -> Result<(), String> {
        let mut args: Vec<&str> = vec![
            "connection",
            "add",
            "type",
            "wifi",
            "save",
            "no",
            "ifname",
            self.ctx.interface.as_str(),
            "con-name",
            name,
            "ssid",
            request.ssid.as_str(),
        ];
        if request.hidden {
            args.extend(["802-11-wireless.hidden", "yes"]);
        }
        if strategy == Strategy::BssidPinned {
            if let Some(bssid) = request.bssid.as_deref() {
                args.extend(["802-11-wireless.bssid", bssid]);
            }
        }
        match profile {
            SecurityProfile::Open => {}
            SecurityProfile::EnhancedOpen => {
                args.extend(["802-11-wireless-security.key-mgmt", "owe"]);
            }
            SecurityProfile::Wep => {
                args.extend([
                    "802-11-wireless-security.key-mgmt",
                    "none",
                    "802-11-wireless-security.wep-key-type",
                    "key",
                ]);
                if let Some(key) = secret {
                    args.extend(["802-11-wireless-security.wep-key0", key]);
                }
            }
            SecurityProfile::WpaPersonal => {
                args.extend(["802-11-wireless-security.key-mgmt", "wpa-psk"]);
                if let Some(psk) = secret {
                    args.extend(["802-11-wireless-security.psk", psk]);
                }
            }
            SecurityProfile::Wpa3Personal => {
                args.extend(["802-11-wireless-security.key-mgmt", "sae"]);
                if let Some(psk) = secret {
                    args.extend(["802-11-wireless-security.psk", psk]);
                }
            }
        }

        self.tool
            .run(&args)
            .map(|_| ())
            .map_err(|err| err.to_string())
    }

    fn bring_up(
        &self,
        name: &str,
        profile: SecurityProfile,
        have_local_secret: bool,
    ) -> Result<(), String> {
        let wait = self.ctx.wait_secs.to_string();
        let delegate = profile.needs_secret() && !have_local_secret && self.ctx.ask_supported;
        if delegate {
            self.tool
                .run_interactive(&["-w", &wait, "--ask", "connection", "up", "id", name])
                .map_err(|err| err.to_string())
        } else {
            self.tool
                .run(&["-w", &wait, "connection", "up", "id", name])
                .map(|_| ())
                .map_err(|err| err.to_string())
        }
    }
}

/// Deletes the transient profile on drop unless the attempt that created it
/// succeeded; the successful profile is the live connection and must stay
/// active after the process exits. Profiles are added with `save no`, so
/// nothing accumulates across daemon restarts either way.
struct ProfileGuard<'a> {
    tool: &'a dyn ControlTool,
    name: String,
    keep: bool,
}

impl<'a> ProfileGuard<'a> {
    fn new(tool: &'a dyn ControlTool, name: &str) -> Self {
        Self {
            tool,
            name: name.to_string(),
            keep: false,
        }
    }

    fn keep(&mut self) {
        self.keep = true;
    }
}

impl Drop for ProfileGuard<'_> {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(err) = self
            .tool
            .run(&["connection", "delete", "id", self.name.as_str()])
        {
            // Also lands here when the add itself never went through.
            debug!(
                "{} cleanup of profile {} failed: {}",
                logging::error_code(ErrorCode::ProfileCleanupFailed),
                self.name,
                err
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmcli::fake::FakeTool;
    use crate::prompt::fake::FakePrompt;
    use crate::scan::Band;

    fn ctx(driver_flagged: bool, ask_supported: bool) -> AppContext {
        AppContext {
            interface: "wlan0".to_string(),
            driver: "iwlwifi".to_string(),
            driver_flagged,
            ask_supported,
            wait_secs: 5,
        }
    }

    fn record(ssid: &str, security: &str, bssid: Option<&str>) -> NetworkRecord {
        NetworkRecord {
            ssid: ssid.to_string(),
            bssid: bssid.map(String::from),
            frequency_mhz: Some(2412),
            band: Band::Band24,
            signal: 70,
            security: security.to_string(),
            in_use: false,
        }
    }

    #[test]
    fn classification_matches_tokens() {
        assert_eq!(SecurityProfile::classify(""), SecurityProfile::Open);
        assert_eq!(SecurityProfile::classify("--"), SecurityProfile::Open);
        assert_eq!(SecurityProfile::classify("WEP"), SecurityProfile::Wep);
        assert_eq!(SecurityProfile::classify("WPA2"), SecurityProfile::WpaPersonal);
        assert_eq!(SecurityProfile::classify("WPA1 WPA2"), SecurityProfile::WpaPersonal);
        assert_eq!(SecurityProfile::classify("SAE"), SecurityProfile::Wpa3Personal);
        assert_eq!(SecurityProfile::classify("WPA2 WPA3"), SecurityProfile::Wpa3Personal);
        assert_eq!(SecurityProfile::classify("OWE"), SecurityProfile::EnhancedOpen);
        // Space padding keeps keywords from matching inside other tokens.
        assert_eq!(SecurityProfile::classify("XSAEX"), SecurityProfile::Open);
    }

    #[test]
    fn open_connect_never_prompts() {
        let tool = FakeTool::new();
        let mut prompt = FakePrompt::default();
        let ctx = ctx(false, false);
        let request = ConnectRequest::from_record(&record("Cafe", "--", None));

        Negotiator::new(&tool, &mut prompt, &ctx)
            .connect(&request)
            .unwrap();

        assert_eq!(prompt.secrets, 0);
        assert!(tool.calls().iter().any(|c| c.contains("connection add")));
        assert!(!tool.calls().iter().any(|c| c.contains("psk")));
    }

    #[test]
    fn wpa_without_ask_prompts_once_and_supplies_psk() {
        let tool = FakeTool::new();
        let mut prompt = FakePrompt::with_secret("hunter22");
        let ctx = ctx(false, false);
        let request = ConnectRequest::from_record(&record("Home", "WPA2", None));

        Negotiator::new(&tool, &mut prompt, &ctx)
            .connect(&request)
            .unwrap();

        assert_eq!(prompt.secrets, 1);
        assert!(tool
            .calls()
            .iter()
            .any(|c| c.contains("802-11-wireless-security.psk hunter22")));
    }

    #[test]
    fn wpa_with_ask_delegates_prompting_to_the_daemon() {
        let tool = FakeTool::new();
        let mut prompt = FakePrompt::default();
        let ctx = ctx(false, true);
        let request = ConnectRequest::from_record(&record("Home", "WPA2", None));

        Negotiator::new(&tool, &mut prompt, &ctx)
            .connect(&request)
            .unwrap();

        assert_eq!(prompt.secrets, 0);
        assert!(tool.calls().iter().any(|c| c.contains("--ask connection up")));
    }

    #[test]
    fn sae_failure_retries_as_wpa_personal_after_cleanup() {
        let tool = FakeTool::new();
        let mut prompt = FakePrompt::with_secret("correct horse");
        let ctx = ctx(false, false);
        let request = ConnectRequest::from_record(&record("Modern", "WPA2 WPA3", None));

        tool.on("connection up", vec![Err("sae rejected"), Ok("")]);

        Negotiator::new(&tool, &mut prompt, &ctx)
            .connect(&request)
            .unwrap();

        let calls = tool.calls();
        let sae_add = calls.iter().position(|c| c.contains("key-mgmt sae")).unwrap();
        let wpa_add = calls
            .iter()
            .position(|c| c.contains("key-mgmt wpa-psk"))
            .unwrap();
        let delete = calls
            .iter()
            .position(|c| c.contains("connection delete"))
            .unwrap();
        assert!(sae_add < delete, "SAE profile removed after its failure");
        assert!(delete < wpa_add, "cleanup happens before the retry begins");
        // The secret entered for the SAE attempt is reused, not re-prompted.
        assert_eq!(prompt.secrets, 1);
    }

    #[test]
    fn bssid_fallback_runs_after_ssid_first_failure() {
        let tool = FakeTool::new();
        let mut prompt = FakePrompt::default();
        let ctx = ctx(false, false);
        let request =
            ConnectRequest::from_record(&record("Cafe", "--", Some("AA:BB:CC:DD:EE:FF")));

        tool.on("connection up", vec![Err("activation failed"), Ok("")]);

        Negotiator::new(&tool, &mut prompt, &ctx)
            .connect(&request)
            .unwrap();

        let pinned = tool
            .calls()
            .iter()
            .filter(|c| c.contains("802-11-wireless.bssid AA:BB:CC:DD:EE:FF"))
            .count();
        assert_eq!(pinned, 1);
    }

    #[test]
    fn flagged_driver_skips_the_bssid_fallback() {
        let tool = FakeTool::new();
        let mut prompt = FakePrompt::default();
        let ctx = ctx(true, false);
        let request =
            ConnectRequest::from_record(&record("Cafe", "--", Some("AA:BB:CC:DD:EE:FF")));

        tool.on("connection up", vec![Err("activation failed")]);

        let failure = Negotiator::new(&tool, &mut prompt, &ctx)
            .connect(&request)
            .unwrap_err();
        assert_eq!(failure.ssid, "Cafe");

        let calls = tool.calls();
        assert!(!calls.iter().any(|c| c.contains("802-11-wireless.bssid")));
        assert_eq!(
            calls.iter().filter(|c| c.contains("connection add")).count(),
            1
        );
        // The failed attempt's profile was still cleaned up.
        assert!(calls.iter().any(|c| c.contains("connection delete")));
    }

    #[test]
    fn hidden_request_never_pins_an_access_point() {
        let tool = FakeTool::new();
        let mut prompt = FakePrompt::with_secret("pw");
        let ctx = ctx(false, false);
        let request = ConnectRequest::hidden("Basement".to_string(), SecurityProfile::WpaPersonal);

        Negotiator::new(&tool, &mut prompt, &ctx)
            .connect(&request)
            .unwrap();

        let calls = tool.calls();
        assert!(calls.iter().any(|c| c.contains("802-11-wireless.hidden yes")));
        assert!(!calls.iter().any(|c| c.contains("802-11-wireless.bssid")));
    }

    #[test]
    fn hidden_security_guess_prefers_matching_scan_record() {
        let records = vec![record("Seen", "WPA2 WPA3", None)];
        assert_eq!(guess_security(&records, "Seen"), SecurityProfile::Wpa3Personal);
        assert_eq!(guess_security(&records, "Unseen"), SecurityProfile::WpaPersonal);
    }
}
