//! Uploading the QSPI flasher through the BootROM monitor.
//!
//! The monitor has no upload command: an Intel HEX image written to the
//! console is loaded into on-chip RAM as it streams in, and `run` jumps to it.

use {
    crate::{
        error::{Error, Result},
        port::Port,
        protocol::console::Console,
    },
    log::{debug, info, warn},
    std::{thread, time::Duration},
};

/// Banner printed by the flasher in response to every empty command.
pub const FLASHER_ID: &str = "QSPI Flasher";

/// Grace period after `run` before the flasher accepts commands.
pub const STARTUP_DELAY: Duration = Duration::from_millis(100);

/// Per-write timeout used while streaming the image.
const UPLOAD_WRITE_TIMEOUT: Duration = Duration::from_secs(10);

/// Size of each raw write while streaming the image.
const UPLOAD_CHUNK: usize = 1024;

/// How the flasher came to be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// The flasher answered the first banner; nothing was uploaded.
    AlreadyRunning,
    /// The image was uploaded and started.
    Uploaded,
}

/// Make sure the flasher is running, uploading `image` if necessary.
pub fn bootstrap<P: Port>(
    console: &mut Console<P>,
    image: &[u8],
    progress: &mut dyn FnMut(usize, usize),
) -> Result<BootstrapOutcome> {
    let timeout = console
        .config()
        .command_timeout;
    let banner = console.execute("", Some(timeout), true)?;
    if !banner.terminated {
        debug!("Banner check captured {:?}", banner.text);
        return Err(Error::MonitorNotFound);
    }
    if banner
        .text
        .contains(FLASHER_ID)
    {
        debug!("Flasher is already executing");
        return Ok(BootstrapOutcome::AlreadyRunning);
    }

    info!("Sending flasher ({} bytes)...", image.len());
    upload(console, image, progress)?;

    // The monitor prints its prompt twice after an image upload.
    for _ in 0..2 {
        let echo = console.wait_for_prompt()?;
        if !echo.terminated {
            debug!("No prompt after upload, got {:?}", echo.text);
        }
    }

    let started = console.execute("run", Some(timeout), true)?;
    if !started.terminated
        || !started
            .text
            .contains(FLASHER_ID)
    {
        return Err(Error::FlasherNotStarted(started.text));
    }

    thread::sleep(STARTUP_DELAY);
    debug!("Flasher started");
    Ok(BootstrapOutcome::Uploaded)
}

fn upload<P: Port>(
    console: &mut Console<P>,
    image: &[u8],
    progress: &mut dyn FnMut(usize, usize),
) -> Result<()> {
    let previous = console
        .port()
        .timeout();
    console
        .port_mut()
        .set_timeout(UPLOAD_WRITE_TIMEOUT)?;

    let mut sent = 0;
    let mut result = Ok(());
    for chunk in image.chunks(UPLOAD_CHUNK) {
        if let Err(e) = console.write_raw(chunk) {
            result = Err(e);
            break;
        }
        sent += chunk.len();
        progress(sent, image.len());
    }

    if let Err(e) = console
        .port_mut()
        .set_timeout(previous)
    {
        warn!("Failed to restore read timeout: {e}");
    }
    result
}
