//! Prompt-synchronised text command channel.
//!
//! Both the BootROM monitor and the QSPI flasher speak a line-oriented shell:
//! the host sends a command terminated by a carriage return, the target echoes
//! it, prints its output and finishes with a prompt (`#`).
//!
//! ```text
//! host   -> "erase 65536\r"
//! target <- "erase 65536\r\n" <output> "#"
//! ```
//!
//! Responses are read one byte at a time against an explicit deadline, so a
//! terminator is recognised the moment it arrives regardless of how the
//! platform implements serial read timeouts.

use {
    crate::{
        error::{Error, Result},
        port::Port,
    },
    log::{debug, trace},
    std::{
        io::Write,
        time::{Duration, Instant},
    },
};

/// Default prompt printed by both the monitor and the flasher.
pub const DEFAULT_PROMPT: &str = "#";

/// Default line terminator appended to every command.
pub const DEFAULT_NEWLINE: &str = "\r";

/// Default deadline for a command to be answered by a prompt.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for a bare wait on a terminator.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Consecutive end-of-file reads after which the port is considered gone.
const MAX_EOF_READS: usize = 64;

/// Pause between reads that returned end-of-file.
const EOF_BACKOFF: Duration = Duration::from_millis(1);

/// Command channel settings.
#[derive(Debug, Clone)]
pub struct ConsoleConfig {
    /// Prompt terminating every command response.
    pub prompt: String,
    /// Line terminator sent after each command.
    pub newline: String,
    /// Deadline used by [`Console::run`].
    pub command_timeout: Duration,
    /// Deadline used by [`Console::wait_for_prompt`].
    pub wait_timeout: Duration,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            newline: DEFAULT_NEWLINE.to_string(),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

/// Text captured while waiting for a terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Captured text with carriage returns removed (and the echo stripped when
    /// requested and the terminator was seen).
    pub text: String,
    /// Whether one of the expected terminators ended the capture.
    pub terminated: bool,
}

impl Response {
    /// Turn an unterminated response into [`Error::Timeout`].
    pub fn require(self, context: impl Into<String>) -> Result<String> {
        if self.terminated {
            Ok(self.text)
        } else {
            Err(Error::timeout(context, self.text))
        }
    }
}

/// Command channel over a [`Port`].
pub struct Console<P: Port> {
    port: P,
    config: ConsoleConfig,
    echo: Option<Box<dyn Write + Send>>,
}

impl<P: Port> Console<P> {
    /// Create a channel with the given settings.
    pub fn new(port: P, config: ConsoleConfig) -> Self {
        Self {
            port,
            config,
            echo: None,
        }
    }

    /// Copy every received byte to `sink` as it arrives.
    #[must_use]
    pub fn with_echo(mut self, sink: Box<dyn Write + Send>) -> Self {
        self.echo = Some(sink);
        self
    }

    /// Replace (or remove) the received-byte echo sink.
    pub fn set_echo(&mut self, sink: Option<Box<dyn Write + Send>>) {
        self.echo = sink;
    }

    /// Channel settings.
    pub fn config(&self) -> &ConsoleConfig {
        &self.config
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the channel and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Send `command` and wait for the prompt.
    ///
    /// Stale input is discarded first. With `strip_echo`, a terminated
    /// response has the echoed command line and the trailing prompt removed,
    /// leaving only the command's own output. A `timeout` of `None` waits
    /// forever.
    pub fn execute(
        &mut self,
        command: &str,
        timeout: Option<Duration>,
        strip_echo: bool,
    ) -> Result<Response> {
        self.port
            .clear_input()?;

        debug!("> {command:?}");
        let mut line = Vec::with_capacity(
            command.len()
                + self
                    .config
                    .newline
                    .len(),
        );
        line.extend_from_slice(command.as_bytes());
        line.extend_from_slice(
            self.config
                .newline
                .as_bytes(),
        );
        self.port
            .write_all_bytes(&line)?;

        let prompt = self
            .config
            .prompt
            .clone();
        let mut response = self.wait_for(&[prompt.as_str()], timeout)?;
        if response.terminated && strip_echo {
            response.text = strip_echo_text(&response.text, command, &prompt);
        }
        trace!("< {:?} (terminated: {})", response.text, response.terminated);
        Ok(response)
    }

    /// Run a command with the default timeout and return its stripped output.
    pub fn run(&mut self, command: &str) -> Result<String> {
        let timeout = self
            .config
            .command_timeout;
        self.run_with_timeout(command, timeout)
    }

    /// Run a command and return its stripped output, failing on timeout.
    pub fn run_with_timeout(&mut self, command: &str, timeout: Duration) -> Result<String> {
        self.execute(command, Some(timeout), true)?
            .require(format!("waiting for response to {command:?}"))
    }

    /// Wait until the captured input ends with one of `expected`.
    ///
    /// Returns whatever was captured; `terminated` tells whether the deadline
    /// expired first. A `timeout` of `None` waits until a terminator arrives
    /// or the port reports end-of-file repeatedly.
    pub fn wait_for(&mut self, expected: &[&str], timeout: Option<Duration>) -> Result<Response> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut captured: Vec<u8> = Vec::new();
        let mut byte = [0u8; 1];
        let mut eof_reads = 0;

        let matches = |buf: &[u8]| {
            expected
                .iter()
                .any(|e| buf.ends_with(e.as_bytes()))
        };

        while !matches(&captured) && deadline.is_none_or(|d| Instant::now() <= d) {
            match self
                .port
                .read(&mut byte)
            {
                Ok(0) => {
                    eof_reads += 1;
                    if eof_reads >= MAX_EOF_READS {
                        return Err(Error::Io(std::io::Error::new(
                            std::io::ErrorKind::UnexpectedEof,
                            format!(
                                "{} keeps returning end of file",
                                self.port
                                    .name()
                            ),
                        )));
                    }
                    std::thread::sleep(EOF_BACKOFF);
                },
                Ok(_) => {
                    eof_reads = 0;
                    captured.push(byte[0]);
                    if let Some(sink) = self
                        .echo
                        .as_mut()
                    {
                        let _ = sink.write_all(&byte);
                    }
                },
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
                    ) => {},
                Err(e) => return Err(Error::Io(e)),
            }
        }

        if let Some(sink) = self
            .echo
            .as_mut()
        {
            let _ = sink.flush();
        }

        Ok(Response {
            terminated: matches(&captured),
            text: String::from_utf8_lossy(&captured).replace('\r', ""),
        })
    }

    /// Wait for the prompt with the default wait timeout.
    pub fn wait_for_prompt(&mut self) -> Result<Response> {
        let prompt = self
            .config
            .prompt
            .clone();
        let timeout = self
            .config
            .wait_timeout;
        self.wait_for(&[prompt.as_str()], Some(timeout))
    }

    /// Write raw bytes with no terminator.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        self.port
            .write_all_bytes(data)
    }

    /// Read whatever raw bytes are available.
    ///
    /// A read timeout is reported as zero bytes rather than an error.
    pub fn read_raw(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self
            .port
            .read(buf)
        {
            Ok(n) => Ok(n),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            },
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Remove the echoed command line and the trailing prompt.
pub fn strip_echo_text(text: &str, command: &str, prompt: &str) -> String {
    let body = text
        .strip_prefix(command)
        .unwrap_or(text);
    let body = body
        .strip_prefix('\n')
        .unwrap_or(body);
    let body = body
        .strip_suffix(prompt)
        .unwrap_or(body);
    body.strip_suffix('\n')
        .unwrap_or(body)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::MockPort;
    use std::sync::{Arc, Mutex};

    fn console(port: MockPort) -> Console<MockPort> {
        Console::new(port, ConsoleConfig::default())
    }

    #[test]
    fn test_strip_echo_text() {
        assert_eq!(strip_echo_text("erase 0\nerased\n#", "erase 0", "#"), "erased");
        assert_eq!(strip_echo_text("\n#", "", "#"), "");
        assert_eq!(strip_echo_text("garbage#", "erase 0", "#"), "garbage");
    }

    #[test]
    fn test_execute_strips_echo_and_prompt() {
        let port = MockPort::new(|_| b"erase 0\r\nSector erased\r\n#".to_vec());
        let mut console = console(port);

        let response = console
            .execute("erase 0", Some(Duration::from_secs(1)), true)
            .unwrap();

        assert!(response.terminated);
        assert_eq!(response.text, "Sector erased");
        assert_eq!(console.port().writes(), &[b"erase 0\r".to_vec()]);
    }

    #[test]
    fn test_execute_without_strip_keeps_echo() {
        let port = MockPort::new(|_| b"erase 0\r\nok\r\n#".to_vec());
        let mut console = console(port);

        let response = console
            .execute("erase 0", Some(Duration::from_secs(1)), false)
            .unwrap();

        assert!(response.terminated);
        assert_eq!(response.text, "erase 0\nok\n#");
    }

    #[test]
    fn test_execute_discards_stale_input() {
        let mut port = MockPort::new(|_| b"help\r\nusage\r\n#".to_vec());
        port.push_input(b"stale#");
        let mut console = console(port);

        let output = console
            .run("help")
            .unwrap();
        assert_eq!(output, "usage");
    }

    #[test]
    fn test_timeout_returns_partial_text() {
        let port = MockPort::new(|_| b"read 0 4\r\npartial".to_vec());
        let mut console = console(port);

        let response = console
            .execute("read 0 4", Some(Duration::from_millis(30)), true)
            .unwrap();

        assert!(!response.terminated);
        assert_eq!(response.text, "read 0 4\npartial");
    }

    #[test]
    fn test_run_maps_timeout_to_error() {
        let mut console = console(MockPort::silent());

        let err = console
            .run_with_timeout("readcrc 0 16", Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[test]
    fn test_wait_for_any_terminator() {
        let mut port = MockPort::silent();
        port.push_input(b"xxC");
        let mut console = console(port);

        let response = console
            .wait_for(&["R", "C"], Some(Duration::from_millis(100)))
            .unwrap();
        assert!(response.terminated);
        assert_eq!(response.text, "xxC");
    }

    #[test]
    fn test_wait_stops_at_first_terminator() {
        let mut port = MockPort::silent();
        port.push_input(b"R#");
        let mut console = console(port);

        let response = console
            .wait_for(&["R"], Some(Duration::from_millis(100)))
            .unwrap();
        assert_eq!(response.text, "R");

        let rest = console
            .wait_for_prompt()
            .unwrap();
        assert_eq!(rest.text, "#");
    }

    #[test]
    fn test_execute_without_deadline_waits_for_prompt() {
        let mut console = console(MockPort::console(|_| "Sector erased".to_string()));

        let response = console
            .execute("erase 0", None, true)
            .unwrap();

        assert!(response.terminated);
        assert_eq!(response.text, "Sector erased");
    }

    #[test]
    fn test_wait_without_deadline_fails_on_unplugged_port() {
        let mut console = console(MockPort::unplugged());

        let err = console
            .wait_for(&["#"], None)
            .unwrap_err();
        match err {
            Error::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[derive(Clone, Default)]
    struct SharedSink(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0
                .lock()
                .unwrap()
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_echo_sink_receives_raw_bytes() {
        let sink = SharedSink::default();
        let port = MockPort::new(|_| b"run\r\nQSPI Flasher\r\n#".to_vec());
        let mut console = console(port).with_echo(Box::new(sink.clone()));

        console
            .run("run")
            .unwrap();

        let echoed = sink
            .0
            .lock()
            .unwrap()
            .clone();
        assert_eq!(echoed, b"run\r\nQSPI Flasher\r\n#");
    }

    #[test]
    fn test_custom_prompt_and_newline() {
        let port = MockPort::new(|written| {
            assert_eq!(written, b"ver\n");
            b"ver\n1.0\n> ".to_vec()
        });
        let config = ConsoleConfig {
            prompt: "> ".to_string(),
            newline: "\n".to_string(),
            ..ConsoleConfig::default()
        };
        let mut console = Console::new(port, config);

        assert_eq!(
            console
                .run("ver")
                .unwrap(),
            "1.0"
        );
    }
}
