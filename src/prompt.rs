use std::fs::File;
use std::io::Write;
use std::os::unix::io::{AsRawFd, RawFd};

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::sys::termios::{self, LocalFlags, SetArg, Termios};
use nix::unistd;

/// Source of interactive input. A seam so connection negotiation can run in
/// tests without a terminal.
pub trait CredentialSource {
    /// Read a line with echo on.
    fn line(&mut self, label: &str) -> Result<String>;

    /// Read a secret with echo suppressed for the duration of the read.
    fn secret(&mut self, label: &str) -> Result<String>;
}

/// Outcome of one line read against the raw file descriptor.
#[derive(Debug, PartialEq, Eq)]
pub enum LineRead {
    Line(String),
    Eof,
    Interrupted,
}

/// Line input built directly on the read syscall. The std buffered readers
/// retry interrupted reads, which would swallow SIGINT while blocked on the
/// terminal; here EINTR is surfaced so the caller can wind down.
pub fn read_line_interruptible(fd: RawFd) -> std::io::Result<LineRead> {
    let mut collected = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match unistd::read(fd, &mut byte) {
            Ok(0) => {
                if collected.is_empty() {
                    return Ok(LineRead::Eof);
                }
                return Ok(LineRead::Line(
                    String::from_utf8_lossy(&collected).into_owned(),
                ));
            }
            Ok(_) => {
                if byte[0] == b'\n' {
                    return Ok(LineRead::Line(
                        String::from_utf8_lossy(&collected).into_owned(),
                    ));
                }
                collected.push(byte[0]);
            }
            Err(Errno::EINTR) => return Ok(LineRead::Interrupted),
            Err(errno) => return Err(std::io::Error::from(errno)),
        }
    }
}

/// Prompts on the controlling terminal directly, so credentials cannot be
/// fed through piped standard input and masking works under redirection.
pub struct TtyPrompt {
    input: File,
    output: File,
}

impl TtyPrompt {
    pub fn open() -> Result<Self> {
        let input =
            File::open("/dev/tty").context("cannot open controlling terminal for reading")?;
        let output = File::options()
            .write(true)
            .open("/dev/tty")
            .context("cannot open controlling terminal for writing")?;
        Ok(Self { input, output })
    }

    fn read_trimmed(&mut self) -> Result<String> {
        match read_line_interruptible(self.input.as_raw_fd())
            .context("read from terminal failed")?
        {
            LineRead::Line(line) => Ok(line.trim_end_matches('\r').to_string()),
            LineRead::Eof => Ok(String::new()),
            LineRead::Interrupted => bail!("interrupted while reading from terminal"),
        }
    }
}

impl CredentialSource for TtyPrompt {
    fn line(&mut self, label: &str) -> Result<String> {
        write!(self.output, "{}", label)?;
        self.output.flush()?;
        self.read_trimmed()
    }

    fn secret(&mut self, label: &str) -> Result<String> {
        write!(self.output, "{}", label)?;
        self.output.flush()?;
        let guard = EchoGuard::disable(&self.input)?;
        let entered = self.read_trimmed();
        drop(guard);
        // Echo was off while the user hit return, so supply the newline.
        writeln!(self.output)?;
        entered
    }
}

/// Restores the saved terminal attributes unconditionally on drop, on every
/// exit path including unwinding out of an interrupted read.
struct EchoGuard {
    fd: i32,
    saved: Termios,
}

impl EchoGuard {
    fn disable(tty: &File) -> Result<Self> {
        let fd = tty.as_raw_fd();
        let saved = termios::tcgetattr(fd).context("tcgetattr on terminal failed")?;
        let mut muted = saved.clone();
        muted.local_flags.remove(LocalFlags::ECHO);
        termios::tcsetattr(fd, SetArg::TCSANOW, &muted)
            .context("disabling terminal echo failed")?;
        Ok(Self { fd, saved })
    }
}

impl Drop for EchoGuard {
    fn drop(&mut self) {
        let _ = termios::tcsetattr(self.fd, SetArg::TCSANOW, &self.saved);
    }
}
