//! Raw flash readout.

use {
    crate::{
        error::{Error, Result},
        port::Port,
        protocol::console::Console,
    },
    log::{debug, warn},
    std::{
        io::Write,
        time::{Duration, Instant},
    },
};

/// Largest single transport read while streaming.
pub const READ_CHUNK: usize = 256;

/// Stream `len` bytes at `offset` into `sink`.
///
/// Empty transport reads are expected while the flasher is busy; the loop
/// only gives up when nothing at all arrives for the command timeout.
pub fn read<P: Port, W: Write>(
    console: &mut Console<P>,
    offset: u64,
    len: u64,
    sink: &mut W,
    progress: &mut dyn FnMut(usize, usize),
) -> Result<()> {
    let command = format!("read {offset} {len} bin");
    // The flasher echoes the command and prints a prompt before the payload.
    console.run(&command)?;

    let stall_limit: Duration = console
        .config()
        .command_timeout;
    let total = usize::try_from(len).unwrap_or(usize::MAX);
    let mut received: u64 = 0;
    let mut buf = [0u8; READ_CHUNK];
    let mut last_data = Instant::now();
    progress(0, total);

    while received < len {
        let want = usize::try_from(len - received)
            .unwrap_or(READ_CHUNK)
            .min(READ_CHUNK);
        let n = console.read_raw(&mut buf[..want])?;
        if n == 0 {
            if last_data.elapsed() > stall_limit {
                return Err(Error::timeout(
                    format!("reading {len} bytes at {offset:#x}"),
                    format!("{received} bytes received"),
                ));
            }
            continue;
        }
        sink.write_all(&buf[..n])?;
        received += n as u64;
        last_data = Instant::now();
        progress(usize::try_from(received).unwrap_or(usize::MAX), total);
    }
    sink.flush()?;

    if !console
        .wait_for_prompt()?
        .terminated
    {
        warn!("No prompt after reading {len} bytes at {offset:#x}");
    }
    debug!("Read {received} bytes at {offset:#x}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::{MockPort, command_line, reply};
    use crate::protocol::console::ConsoleConfig;

    /// Flasher stub holding `image`; answers `read` with the echo, a prompt,
    /// the payload and a final prompt.
    fn flasher_holding(image: Vec<u8>) -> MockPort {
        MockPort::new(move |written| {
            let line = command_line(written);
            let args: Vec<&str> = line
                .split_whitespace()
                .collect();
            match args.as_slice() {
                ["read", offset, len, "bin"] => {
                    let offset: usize = offset
                        .parse()
                        .unwrap();
                    let len: usize = len
                        .parse()
                        .unwrap();
                    let mut out = reply(&line, "");
                    out.extend_from_slice(&image[offset..offset + len]);
                    out.push(b'#');
                    out
                },
                _ => reply(&line, "?\r\n"),
            }
        })
    }

    #[test]
    fn test_read_streams_exact_length() {
        // Payload full of prompt characters must not confuse the stream.
        let image: Vec<u8> = (0..2048u32)
            .map(|i| if i % 3 == 0 { b'#' } else { i as u8 })
            .collect();
        let mut console = Console::new(flasher_holding(image.clone()), ConsoleConfig::default());
        let mut out = Vec::new();
        let mut steps = Vec::new();

        read(&mut console, 100, 1000, &mut out, &mut |n, t| steps.push((n, t))).unwrap();

        assert_eq!(out, image[100..1100]);
        assert_eq!(steps.first(), Some(&(0, 1000)));
        assert_eq!(steps.last(), Some(&(1000, 1000)));
        assert!(
            steps
                .windows(2)
                .all(|w| w[1].0 - w[0].0 <= READ_CHUNK)
        );
    }

    #[test]
    fn test_read_zero_length() {
        let mut console = Console::new(flasher_holding(vec![0; 16]), ConsoleConfig::default());
        let mut out = Vec::new();

        read(&mut console, 0, 0, &mut out, &mut |_, _| {}).unwrap();

        assert!(out.is_empty());
        assert_eq!(
            console
                .port()
                .commands(),
            vec!["read 0 0 bin".to_string()]
        );
    }

    #[test]
    fn test_read_stall_is_a_timeout() {
        let port = MockPort::new(|written| {
            let line = command_line(written);
            let mut out = reply(&line, "");
            out.extend_from_slice(&[1, 2, 3]);
            out
        });
        let mut console = Console::new(
            port,
            ConsoleConfig {
                command_timeout: Duration::from_millis(30),
                ..ConsoleConfig::default()
            },
        );
        let mut out = Vec::new();

        let err = read(&mut console, 0, 8, &mut out, &mut |_, _| {}).unwrap_err();

        assert!(matches!(err, Error::Timeout { .. }));
        assert_eq!(out, vec![1, 2, 3]);
    }
}
