//! Host serial port backed by the `serialport` crate.

use {
    crate::{
        error::Result,
        port::{Port, SerialConfig},
    },
    log::debug,
    serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits},
    std::{
        io::{self, Read, Write},
        time::Duration,
    },
};

/// UART connected to the board's debug console.
pub struct NativePort {
    inner: Option<Box<dyn SerialPort>>,
    name: String,
    timeout: Duration,
    baud_rate: u32,
}

impl NativePort {
    /// Open `config.port_name` as 8N1 without flow control.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        debug!(
            "Opening {} at {} baud, {:?} per read",
            config.port_name, config.baud_rate, config.timeout
        );
        let inner = serialport::new(&config.port_name, config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(config.timeout)
            .open()?;

        Ok(Self {
            inner: Some(inner),
            name: config
                .port_name
                .clone(),
            timeout: config.timeout,
            baud_rate: config.baud_rate,
        })
    }

    fn inner(&mut self) -> io::Result<&mut Box<dyn SerialPort>> {
        self.inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "serial port was closed"))
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(inner) = self
            .inner
            .as_mut()
        {
            inner.set_timeout(timeout)?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_input(&mut self) -> Result<()> {
        self.inner()?
            .clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut inner) = self
            .inner
            .take()
        {
            // Whatever is still queued belongs to the last command; push it out.
            inner.flush()?;
            debug!("Closed {}", self.name);
        }
        Ok(())
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner()?
            .read(buf)
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner()?
            .write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner()?
            .flush()
    }
}
