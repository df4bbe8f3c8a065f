use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::errors::ToolError;

/// The network-management daemon's command-line control tool. Everything the
/// program does to real network state goes through this one binary.
pub const TOOL: &str = "nmcli";

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Invocation boundary to the control tool. A trait so scanning and
/// negotiation can be exercised against a scripted fake in tests.
pub trait ControlTool {
    /// Run with output captured and a bounded wall-clock wait; a non-zero
    /// exit status is an error carrying the tool's stderr.
    fn run(&self, args: &[&str]) -> Result<String, ToolError>;

    /// Run wired to the user's terminal, for daemon-side credential
    /// prompting. The bounded wait comes from the `-w` argument here, since
    /// the call legitimately blocks on the user typing.
    fn run_interactive(&self, args: &[&str]) -> Result<(), ToolError>;
}

pub struct Nmcli {
    limit: Duration,
}

impl Nmcli {
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }

    /// Resolves the binary by running its version query once.
    pub fn check_available(&self) -> Result<(), ToolError> {
        self.run(&["--version"]).map(|_| ())
    }

    /// Whether this tool can prompt for missing secrets itself (`--ask`).
    pub fn supports_ask(&self) -> bool {
        match self.run(&["--help"]) {
            Ok(help) => help.contains("--ask"),
            // Some versions print usage with a non-zero status.
            Err(ToolError::Failed { detail, .. }) => detail.contains("--ask"),
            Err(_) => false,
        }
    }
}

impl ControlTool for Nmcli {
    fn run(&self, args: &[&str]) -> Result<String, ToolError> {
        let command = display_command(args);
        debug!("running `{}`", command);

        let mut child = Command::new(TOOL)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| spawn_error(&command, source))?;

        // Drain the pipes off-thread so a chatty child cannot fill a pipe
        // buffer and deadlock against our deadline poll.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match wait_with_deadline(&mut child, self.limit) {
            Ok(Some(status)) => status,
            Ok(None) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ToolError::Timeout {
                    command,
                    limit: self.limit.as_secs(),
                });
            }
            Err(source) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ToolError::Wait { command, source });
            }
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        if status.success() {
            Ok(stdout)
        } else {
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            Err(ToolError::Failed {
                command,
                status: status.code().unwrap_or(-1),
                detail,
            })
        }
    }

    fn run_interactive(&self, args: &[&str]) -> Result<(), ToolError> {
        let command = display_command(args);
        debug!("running `{}` on the terminal", command);

        let status = Command::new(TOOL)
            .args(args)
            .status()
            .map_err(|source| spawn_error(&command, source))?;

        if status.success() {
            Ok(())
        } else {
            Err(ToolError::Failed {
                command,
                status: status.code().unwrap_or(-1),
                detail: "see terminal output".to_string(),
            })
        }
    }
}

fn display_command(args: &[&str]) -> String {
    let mut command = TOOL.to_string();
    for arg in args {
        command.push(' ');
        command.push_str(arg);
    }
    command
}

fn spawn_error(command: &str, source: std::io::Error) -> ToolError {
    if source.kind() == std::io::ErrorKind::NotFound {
        ToolError::Missing(TOOL.to_string())
    } else {
        ToolError::Spawn {
            command: command.to_string(),
            source,
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    })
}

fn wait_with_deadline(
    child: &mut Child,
    limit: Duration,
) -> std::io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
pub mod fake {
    use std::cell::RefCell;
    use std::collections::VecDeque;

    use super::ControlTool;
    use crate::errors::ToolError;

    /// Scripted stand-in for the control tool. Rules match on a substring of
    /// the joined argv and hand out queued responses in order; unscripted
    /// calls succeed with empty output.
    #[derive(Default)]
    pub struct FakeTool {
        rules: RefCell<Vec<(String, VecDeque<Result<String, String>>)>>,
        calls: RefCell<Vec<String>>,
    }

    impl FakeTool {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn on(&self, pattern: &str, responses: Vec<Result<&str, &str>>) {
            self.rules.borrow_mut().push((
                pattern.to_string(),
                responses
                    .into_iter()
                    .map(|r| r.map(String::from).map_err(String::from))
                    .collect(),
            ));
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }

        fn dispatch(&self, joined: String) -> Result<String, ToolError> {
            self.calls.borrow_mut().push(joined.clone());
            let mut rules = self.rules.borrow_mut();
            for (pattern, queue) in rules.iter_mut() {
                if joined.contains(pattern.as_str()) {
                    if let Some(response) = queue.pop_front() {
                        return response.map_err(|detail| ToolError::Failed {
                            command: joined,
                            status: 1,
                            detail,
                        });
                    }
                }
            }
            Ok(String::new())
        }
    }

    impl ControlTool for FakeTool {
        fn run(&self, args: &[&str]) -> Result<String, ToolError> {
            self.dispatch(args.join(" "))
        }

        fn run_interactive(&self, args: &[&str]) -> Result<(), ToolError> {
            self.dispatch(args.join(" ")).map(|_| ())
        }
    }
}
