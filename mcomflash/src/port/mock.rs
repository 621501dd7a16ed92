//! Scripted in-memory port for protocol tests.
//!
//! Every `write` is recorded and handed to a responder closure; whatever the
//! responder returns becomes readable input. Reads on an empty buffer behave
//! like a serial read timeout, or like end-of-file once the port is unplugged.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::Duration;

use crate::error::Result;
use crate::port::Port;

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

pub(crate) struct MockPort {
    rx: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    responder: Responder,
    timeout: Duration,
    closed: bool,
    unplugged: bool,
}

impl MockPort {
    pub(crate) fn new<F>(responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        Self {
            rx: VecDeque::new(),
            writes: Vec::new(),
            responder: Box::new(responder),
            timeout: Duration::from_millis(5),
            closed: false,
            unplugged: false,
        }
    }

    /// A port whose device never answers.
    pub(crate) fn silent() -> Self {
        Self::new(|_| Vec::new())
    }

    /// A port whose adapter was pulled: reads return end-of-file.
    pub(crate) fn unplugged() -> Self {
        Self {
            unplugged: true,
            ..Self::silent()
        }
    }

    /// A port that answers every line with an echo, `output` and the `#` prompt.
    pub(crate) fn console<F>(mut output: F) -> Self
    where
        F: FnMut(&str) -> String + Send + 'static,
    {
        Self::new(move |written| {
            let line = command_line(written);
            let out = output(&line);
            reply(&line, &out)
        })
    }

    /// Queue bytes as if the device had sent them unprompted.
    pub(crate) fn push_input(&mut self, data: &[u8]) {
        self.rx
            .extend(data);
    }

    /// All individual `write` calls, in order.
    pub(crate) fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    /// Every byte written, concatenated.
    pub(crate) fn written(&self) -> Vec<u8> {
        self.writes
            .concat()
    }

    /// Written chunks that look like text commands, with the terminator removed.
    pub(crate) fn commands(&self) -> Vec<String> {
        self.writes
            .iter()
            .filter(|w| w.ends_with(b"\r"))
            .map(|w| command_line(w))
            .collect()
    }
}

/// Route `log` output through the test harness; `RUST_LOG` selects the level.
pub(crate) fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .try_init();
}

/// Strip the line terminator from a written command.
pub(crate) fn command_line(written: &[u8]) -> String {
    String::from_utf8_lossy(written)
        .trim_end_matches('\r')
        .to_string()
}

/// Device-style response: echo, CRLF, output, prompt.
pub(crate) fn reply(line: &str, output: &str) -> Vec<u8> {
    format!("{line}\r\n{output}#").into_bytes()
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self
            .rx
            .is_empty()
        {
            if self.unplugged {
                return Ok(0);
            }
            std::thread::sleep(Duration::from_millis(1));
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "no data",
            ));
        }
        let n = buf
            .len()
            .min(
                self.rx
                    .len(),
            );
        for (slot, byte) in buf
            .iter_mut()
            .zip(
                self.rx
                    .drain(..n),
            )
        {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "port closed",
            ));
        }
        self.writes
            .push(buf.to_vec());
        let response = (self.responder)(buf);
        self.rx
            .extend(response);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn baud_rate(&self) -> u32 {
        crate::port::DEFAULT_BAUD
    }

    fn clear_input(&mut self) -> Result<()> {
        self.rx
            .clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}
