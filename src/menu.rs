use std::io::{self, Write};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::Ordering;

use anyhow::Result;
use chrono::{DateTime, Local};
use log::{info, warn};

use crate::connect::{guess_security, ConnectRequest, Negotiator};
use crate::context::AppContext;
use crate::errors::InputError;
use crate::logging::{self, ErrorCode};
use crate::nmcli::ControlTool;
use crate::prompt::{read_line_interruptible, CredentialSource, LineRead};
use crate::scan::{self, NetworkRecord};
use crate::INTERRUPTED;

const SSID_COLUMN: usize = 32;

#[derive(Debug, PartialEq, Eq)]
enum MenuCommand {
    /// Zero-based index into the currently displayed records.
    Select(usize),
    Hidden,
    Disconnect,
    Rescan,
    Quit,
}

fn parse_command(input: &str, shown: usize) -> Result<MenuCommand, InputError> {
    match input.trim() {
        "q" | "Q" => Ok(MenuCommand::Quit),
        "r" | "R" => Ok(MenuCommand::Rescan),
        "d" | "D" => Ok(MenuCommand::Disconnect),
        "h" | "H" => Ok(MenuCommand::Hidden),
        other => {
            let number: usize = other
                .parse()
                .map_err(|_| InputError::Unrecognized(other.to_string()))?;
            if number == 0 || number > shown {
                return Err(InputError::OutOfRange(number));
            }
            Ok(MenuCommand::Select(number - 1))
        }
    }
}

/// The interactive surface: a redrawn table of the current scan snapshot
/// plus a one-line command prompt. The snapshot is replaced wholesale on
/// every rescan; nothing persists across iterations beyond it.
pub struct Menu<'a> {
    tool: &'a dyn ControlTool,
    ctx: &'a AppContext,
    prompt: &'a mut dyn CredentialSource,
    records: Vec<NetworkRecord>,
    scanned_at: Option<DateTime<Local>>,
}

impl<'a> Menu<'a> {
    pub fn new(
        tool: &'a dyn ControlTool,
        ctx: &'a AppContext,
        prompt: &'a mut dyn CredentialSource,
    ) -> Self {
        Self {
            tool,
            ctx,
            prompt,
            records: Vec::new(),
            scanned_at: None,
        }
    }

    pub fn run(&mut self) -> Result<()> {
        self.refresh();

        // Raw reads: the std buffered readers retry interrupted reads, so a
        // SIGINT during input would sit unseen until the next newline.
        let stdin_fd = io::stdin().as_raw_fd();
        loop {
            if INTERRUPTED.load(Ordering::SeqCst) {
                println!();
                break;
            }
            self.render();

            let line = match read_line_interruptible(stdin_fd) {
                Ok(LineRead::Line(line)) => line,
                Ok(LineRead::Eof) => break, // EOF behaves like quit
                Ok(LineRead::Interrupted) => {
                    if INTERRUPTED.load(Ordering::SeqCst) {
                        println!();
                        break;
                    }
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            match parse_command(&line, self.records.len()) {
                Ok(MenuCommand::Quit) => break,
                Ok(MenuCommand::Rescan) => self.refresh(),
                Ok(MenuCommand::Disconnect) => self.disconnect(),
                Ok(MenuCommand::Hidden) => self.connect_hidden(),
                Ok(MenuCommand::Select(index)) => self.connect_entry(index),
                Err(err) => println!("{}", err),
            }
        }

        info!("leaving interactive loop");
        Ok(())
    }

    /// Replace the scan snapshot. A failed scan keeps the stale display and
    /// reports; the user can rescan.
    fn refresh(&mut self) {
        println!("Scanning on {}...", self.ctx.interface);
        match scan::scan(self.tool, &self.ctx.interface) {
            Ok(records) => {
                self.records = records;
                self.scanned_at = Some(Local::now());
            }
            Err(err) => {
                warn!(
                    "{} {}",
                    logging::error_code(ErrorCode::ScanFailed),
                    err
                );
                println!("Scan failed: {}", err);
            }
        }
    }

    fn render(&self) {
        println!();
        match &self.scanned_at {
            Some(at) => println!(
                "Wireless networks on {} (scanned {}):",
                self.ctx.interface,
                at.format("%H:%M:%S")
            ),
            None => println!("Wireless networks on {}:", self.ctx.interface),
        }

        if self.records.is_empty() {
            println!("  (no networks found)");
        } else {
            println!(
                "  {:>3}  {:<width$}  {:>7}  {:>6}  {}",
                "#",
                "SSID",
                "BAND",
                "SIGNAL",
                "SECURITY",
                width = SSID_COLUMN
            );
            for (number, record) in self.records.iter().enumerate() {
                println!(
                    "  {:>3}  {:<width$}  {:>7}  {:>6}  {}{}",
                    number + 1,
                    truncate(&record.ssid, SSID_COLUMN),
                    record.band.label(),
                    record.signal,
                    if record.security.is_empty() {
                        "--"
                    } else {
                        record.security.as_str()
                    },
                    if record.in_use { "  *" } else { "" },
                    width = SSID_COLUMN
                );
            }
        }

        println!();
        print!(
            "Select [1-{}], (h)idden, (d)isconnect, (r)escan, (q)uit: ",
            self.records.len().max(1)
        );
        let _ = io::stdout().flush();
    }

    fn connect_entry(&mut self, index: usize) {
        // Bounds were checked at parse time against the shown snapshot.
        let Some(record) = self.records.get(index).cloned() else {
            return;
        };
        self.negotiate(ConnectRequest::from_record(&record));
    }

    fn connect_hidden(&mut self) {
        let ssid = match self.prompt.line("Hidden network name: ") {
            Ok(ssid) => ssid,
            Err(err) => {
                warn!(
                    "{} hidden-name prompt failed: {}",
                    logging::error_code(ErrorCode::PromptFailed),
                    err
                );
                println!("Could not read a network name: {}", err);
                return;
            }
        };
        if ssid.is_empty() {
            println!("No name entered.");
            return;
        }
        let security = guess_security(&self.records, &ssid);
        self.negotiate(ConnectRequest::hidden(ssid, security));
    }

    fn negotiate(&mut self, request: ConnectRequest) {
        println!("Connecting to \"{}\"...", request.ssid);
        let outcome =
            Negotiator::new(self.tool, &mut *self.prompt, self.ctx).connect(&request);
        match outcome {
            Ok(()) => println!("Connected to \"{}\".", request.ssid),
            Err(failure) => println!("{}", failure),
        }
        // Pick up the new in-use marker either way.
        self.refresh();
    }

    fn disconnect(&mut self) {
        match self
            .tool
            .run(&["device", "disconnect", self.ctx.interface.as_str()])
        {
            Ok(_) => println!("Disconnected {}.", self.ctx.interface),
            Err(err) => println!("Disconnect failed: {}", err),
        }
        self.refresh();
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nmcli::fake::FakeTool;
    use crate::prompt::fake::FakePrompt;
    use crate::scan::parse_output;

    const SCAN_RAW: &str = "Cafe:00\\:11\\:22\\:33\\:44\\:55:2412 MHz:80:--:\n\
                            Home:00\\:11\\:22\\:33\\:44\\:66:5180 MHz:60:WPA2:\n";

    fn ctx() -> AppContext {
        AppContext {
            interface: "wlan0".to_string(),
            driver: "iwlwifi".to_string(),
            driver_flagged: false,
            ask_supported: false,
            wait_secs: 5,
        }
    }

    #[test]
    fn command_parsing() {
        assert_eq!(parse_command("q", 3), Ok(MenuCommand::Quit));
        assert_eq!(parse_command(" R\n", 3), Ok(MenuCommand::Rescan));
        assert_eq!(parse_command("d", 3), Ok(MenuCommand::Disconnect));
        assert_eq!(parse_command("h", 3), Ok(MenuCommand::Hidden));
        assert_eq!(parse_command("1", 3), Ok(MenuCommand::Select(0)));
        assert_eq!(parse_command("3\n", 3), Ok(MenuCommand::Select(2)));
        assert_eq!(parse_command("0", 3), Err(InputError::OutOfRange(0)));
        assert_eq!(parse_command("4", 3), Err(InputError::OutOfRange(4)));
        assert_eq!(
            parse_command("x", 3),
            Err(InputError::Unrecognized("x".to_string()))
        );
        assert_eq!(
            parse_command("", 3),
            Err(InputError::Unrecognized("".to_string()))
        );
    }

    #[test]
    fn selecting_the_open_record_connects_without_a_prompt() {
        let tool = FakeTool::new();
        tool.on("device wifi list", vec![Ok(SCAN_RAW), Ok(SCAN_RAW)]);
        let ctx = ctx();
        let mut prompt = FakePrompt::default();
        let mut menu = Menu::new(&tool, &ctx, &mut prompt);
        menu.records = parse_output(SCAN_RAW);

        menu.connect_entry(0);

        assert_eq!(prompt.secrets, 0);
        assert!(tool.calls().iter().any(|c| c.contains("ssid Cafe")));
        assert!(tool.calls().iter().any(|c| c.contains("connection up")));
    }

    #[test]
    fn selecting_the_wpa_record_prompts_for_a_password() {
        let tool = FakeTool::new();
        tool.on("device wifi list", vec![Ok(SCAN_RAW), Ok(SCAN_RAW)]);
        let ctx = ctx();
        let mut prompt = FakePrompt::with_secret("letmein88");
        let mut menu = Menu::new(&tool, &ctx, &mut prompt);
        menu.records = parse_output(SCAN_RAW);

        menu.connect_entry(1);

        assert_eq!(prompt.secrets, 1);
        assert!(tool.calls().iter().any(|c| c.contains("ssid Home")));
        assert!(tool
            .calls()
            .iter()
            .any(|c| c.contains("802-11-wireless-security.psk letmein88")));
    }

    #[test]
    fn hidden_entry_reuses_a_matching_scan_record_for_security() {
        let tool = FakeTool::new();
        tool.on("device wifi list", vec![Ok(SCAN_RAW), Ok(SCAN_RAW)]);
        let ctx = ctx();
        let mut prompt = FakePrompt::with_secret("pw");
        prompt.line_value = "Home".to_string();
        let mut menu = Menu::new(&tool, &ctx, &mut prompt);
        menu.records = parse_output(SCAN_RAW);

        menu.connect_hidden();

        assert_eq!(prompt.lines, 1);
        assert!(tool
            .calls()
            .iter()
            .any(|c| c.contains("802-11-wireless.hidden yes")));
        assert!(tool.calls().iter().any(|c| c.contains("key-mgmt wpa-psk")));
    }

    #[test]
    fn failed_scan_keeps_the_stale_snapshot() {
        let tool = FakeTool::new();
        tool.on("device wifi list", vec![Err("device is unavailable")]);
        let ctx = ctx();
        let mut prompt = FakePrompt::default();
        let mut menu = Menu::new(&tool, &ctx, &mut prompt);
        menu.records = parse_output(SCAN_RAW);
        let before = menu.records.clone();

        menu.refresh();

        assert_eq!(menu.records, before);
        assert!(menu.scanned_at.is_none());
    }

    #[test]
    fn truncate_is_char_boundary_safe() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("exactly-ten", 11), "exactly-ten");
        assert_eq!(truncate("a-very-long-network-name", 10), "a-very-lo…");
        assert_eq!(truncate("naïve-café-network", 10), "naïve-caf…");
    }
}
