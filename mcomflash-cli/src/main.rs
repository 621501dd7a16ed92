//! mcom03-flash - Command-line tool for programming the QSPI flash of MCom-03 boards.
//!
//! ## Features
//!
//! - Flash raw images to QSPI0 or QSPI1
//! - Read flash contents to a file
//! - Erase flash ranges
//! - Flash trusted-loader image sets
//! - Environment variable and config file support

use {
    anyhow::Result,
    clap::{Args, Parser, Subcommand, ValueEnum},
    console::style,
    env_logger::Env,
    log::debug,
    mcomflash::{GeometryOverride, QspiController},
    std::{
        env,
        fmt::Display,
        path::PathBuf,
        process::ExitCode,
        sync::atomic::{AtomicBool, Ordering},
    },
    thiserror::Error,
};

mod commands;
mod config;
mod progress;
mod size;

use {
    config::Config,
    size::{parse_size, parse_size_u32},
};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if progress bars and colors should be used.
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Default serial port of the board's debug UART.
const DEFAULT_PORT: &str = "/dev/ttyUSB0";

/// mcom03-flash - Program QSPI0/QSPI1 flash of MCom-03 (1892VA018) boards over UART.
///
/// A bare-metal QSPI flasher is uploaded to on-chip RAM through the BootROM
/// UART monitor and then driven to erase, write, verify and read the flash.
///
/// Sizes and offsets accept decimal or 0x-prefixed hex, and decimal numbers may
/// carry a suffix: K/KiB=1024, M/MiB=1024*1024, kB=1000, MB=1000*1000.
///
/// Environment variables:
///   MCOMFLASH_PORT         - Serial port (default: /dev/ttyUSB0)
///   MCOMFLASH_BAUD         - Baud rate (default: 115200)
///   MCOMFLASH_FLASHER      - Path to the Intel HEX flasher image
///   MCOMFLASH_FLASH_SIZE   - Flash size override
///   MCOMFLASH_FLASH_SECTOR - Erase sector size override
///   MCOMFLASH_FLASH_PAGE   - Page size override
#[derive(Parser)]
#[command(name = "mcom03-flash")]
#[command(author, version, about, long_about)]
#[command(propagate_version = true)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Serial port the board's UART0 is connected to [default: /dev/ttyUSB0].
    #[arg(short, long, global = true, env = "MCOMFLASH_PORT")]
    port: Option<String>,

    /// Baud rate of the BootROM monitor [default: 115200].
    #[arg(short, long, global = true, env = "MCOMFLASH_BAUD")]
    baud: Option<u32>,

    /// Path to the Intel HEX flasher executed on RISC0.
    #[arg(short, long, global = true, env = "MCOMFLASH_FLASHER", value_name = "PATH")]
    flasher: Option<PathBuf>,

    /// Override the flash total size.
    #[arg(long, global = true, env = "MCOMFLASH_FLASH_SIZE", value_parser = parse_size_u32)]
    flash_size: Option<u32>,

    /// Override the flash erase sector size.
    #[arg(long, global = true, env = "MCOMFLASH_FLASH_SECTOR", value_parser = parse_size_u32)]
    flash_sector: Option<u32>,

    /// Override the flash page size.
    #[arg(long, global = true, env = "MCOMFLASH_FLASH_PAGE", value_parser = parse_size_u32)]
    flash_page: Option<u32>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Echo everything received from the UART to stderr.
    #[arg(long, global = true)]
    show_traffic: bool,

    /// Do not show progress bars (always hidden when stderr is not a terminal).
    #[arg(long, global = true)]
    hide_progress_bar: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// QSPI controller argument.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum Qspi {
    /// QSPI0 (boot flash, 3.3 V only).
    Qspi0,
    /// QSPI1 (3.3 V or 1.8 V).
    Qspi1,
}

impl From<Qspi> for QspiController {
    fn from(qspi: Qspi) -> Self {
        match qspi {
            Qspi::Qspi0 => QspiController::Qspi0,
            Qspi::Qspi1 => QspiController::Qspi1,
        }
    }
}

/// Controller selection shared by every command.
#[derive(Args, Clone, Copy, Debug)]
pub(crate) struct Target {
    /// QSPI controller to use.
    #[arg(value_enum)]
    qspi: Qspi,

    /// Power QSPI1 at 1.8 V. Not allowed for QSPI0.
    #[arg(long)]
    voltage18: bool,
}

impl Target {
    pub(crate) fn controller(self) -> QspiController {
        self.qspi
            .into()
    }

    pub(crate) fn voltage_1v8(self) -> bool {
        self.voltage18
    }

    /// Reject combinations the hardware cannot do, before touching the port.
    pub(crate) fn validate(self) -> Result<(), CliError> {
        if self.voltage18
            && !self
                .controller()
                .supports_1v8()
        {
            return Err(CliError::Usage(format!(
                "Unsupported {} settings: --voltage18 is forbidden",
                self.controller()
            )));
        }
        Ok(())
    }
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Flash an image to QSPI (erase, write and verify).
    Flash {
        #[command(flatten)]
        target: Target,

        /// Binary image to flash.
        image: PathBuf,

        /// Flash offset (e.g. 0x100, 1024, 128K).
        #[arg(long, default_value = "0", value_parser = parse_size)]
        offset: u64,
    },

    /// Read data from QSPI into a file.
    Read {
        #[command(flatten)]
        target: Target,

        /// File to save.
        file: PathBuf,

        /// Number of bytes to read (default: the rest of flash after --offset).
        #[arg(value_parser = parse_size)]
        size: Option<u64>,

        /// Flash offset (e.g. 0x100, 1024, 128K).
        #[arg(long, default_value = "0", value_parser = parse_size)]
        offset: u64,
    },

    /// Erase data on QSPI.
    Erase {
        #[command(flatten)]
        target: Target,

        /// Number of bytes to erase (default: the rest of flash after --offset).
        #[arg(value_parser = parse_size)]
        size: Option<u64>,

        /// Sector-aligned flash offset (e.g. 0x10000, 64K).
        #[arg(long, default_value = "0", value_parser = parse_size)]
        offset: u64,
    },

    /// Flash trusted-loader images to QSPI0.
    FlashTl {
        #[command(flatten)]
        target: Target,

        /// BootROM SBIMG (flashed at 0x0).
        #[arg(value_name = "*-bootrom.sbimg")]
        bootrom: PathBuf,

        /// SBL-TL SBIMG (flashed at 0x200000).
        #[arg(value_name = "sbl-tl*.sbimg")]
        sbl_tl: PathBuf,

        /// SBL-TL OTP image (flashed at 0xA00000).
        #[arg(value_name = "sbl-tl-otp.bin")]
        sbl_tl_otp: PathBuf,
    },

    /// Flash trusted-loader images found in a directory to QSPI0.
    FlashTlDir {
        #[command(flatten)]
        target: Target,

        /// Directory to search for the images.
        dir: PathBuf,

        /// Image patterns relative to DIR; '_' skips an image.
        #[arg(
            num_args = 0..,
            default_values = ["*-bootrom.sbimg", "sbl-tl*.sbimg", "sbl-tl-otp.bin"]
        )]
        images: Vec<String>,
    },
}

/// CLI-level failure classes, mapped to process exit codes.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    /// Invalid arguments or combination of arguments.
    #[error("{0}")]
    Usage(String),
    /// Configuration could not be loaded or is invalid.
    #[error("{0}")]
    Config(String),
    /// The serial port could not be opened.
    #[error("{0}")]
    DeviceNotFound(String),
    /// The request cannot be carried out on this flash.
    #[error("{0}")]
    Precondition(String),
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Usage(_) | Self::Precondition(_) => 2,
            Self::Config(_) => 3,
            Self::DeviceNotFound(_) => 4,
        }
    }
}

/// Map an error to the process exit code.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return cli_err.exit_code();
    }
    match err.downcast_ref::<mcomflash::Error>() {
        Some(mcomflash::Error::Precondition(_)) => 2,
        Some(mcomflash::Error::Config(_)) => 3,
        _ => 1,
    }
}

/// Settings resolved from flags, environment and config files.
pub(crate) struct Settings {
    pub(crate) port: String,
    pub(crate) baud: u32,
    pub(crate) flasher: Option<PathBuf>,
    pub(crate) overrides: GeometryOverride,
    pub(crate) quiet: bool,
    pub(crate) show_traffic: bool,
    pub(crate) show_progress: bool,
}

impl Settings {
    fn resolve(cli: &Cli, config: Config) -> Result<Self, CliError> {
        let config_size = |setting: Option<config::SizeSetting>, key: &str| {
            setting
                .map(|s| {
                    s.bytes()
                        .and_then(|n| {
                            u32::try_from(n).map_err(|_| format!("size {n} is too large"))
                        })
                        .map_err(|e| CliError::Config(format!("flash.{key}: {e}")))
                })
                .transpose()
        };

        let overrides = GeometryOverride {
            total_size: cli
                .flash_size
                .map_or_else(|| config_size(config.flash.size, "size"), |v| Ok(Some(v)))?,
            sector_size: cli
                .flash_sector
                .map_or_else(|| config_size(config.flash.sector, "sector"), |v| Ok(Some(v)))?,
            page_size: cli
                .flash_page
                .map_or_else(|| config_size(config.flash.page, "page"), |v| Ok(Some(v)))?,
        };

        Ok(Self {
            port: cli
                .port
                .clone()
                .or(config.connection.port)
                .unwrap_or_else(|| DEFAULT_PORT.to_string()),
            baud: cli
                .baud
                .or(config.connection.baud)
                .unwrap_or(mcomflash::port::DEFAULT_BAUD),
            flasher: cli
                .flasher
                .clone()
                .or(config.flasher.image),
            overrides,
            quiet: cli.quiet,
            show_traffic: cli.show_traffic,
            show_progress: !cli.quiet && !cli.hide_progress_bar && use_fancy_output(),
        })
    }

    /// Print a status line to stderr unless in quiet mode.
    pub(crate) fn status(&self, message: impl Display) {
        if !self.quiet {
            eprintln!("{message}");
        }
    }

    /// Path of the flasher image to upload.
    pub(crate) fn flasher_image(&self) -> Result<PathBuf, CliError> {
        if let Some(path) = &self.flasher {
            return Ok(path.clone());
        }
        Config::default_flasher_candidates()
            .into_iter()
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                CliError::Config(format!(
                    "no flasher image configured; pass --flasher, set MCOMFLASH_FLASHER or \
                     place {} in the config directory",
                    config::DEFAULT_FLASHER_FILE
                ))
            })
    }
}

fn main() -> ExitCode {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "mcom03-flash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config_path {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };
    let settings = Settings::resolve(cli, config)?;

    match &cli.command {
        Commands::Flash {
            target,
            image,
            offset,
        } => commands::flash::cmd_flash(&settings, *target, image, *offset),
        Commands::Read {
            target,
            file,
            size,
            offset,
        } => commands::read::cmd_read(&settings, *target, file, *offset, *size),
        Commands::Erase {
            target,
            size,
            offset,
        } => commands::erase::cmd_erase(&settings, *target, *offset, *size),
        Commands::FlashTl {
            target,
            bootrom,
            sbl_tl,
            sbl_tl_otp,
        } => commands::trusted::cmd_flash_tl(&settings, *target, [bootrom, sbl_tl, sbl_tl_otp]),
        Commands::FlashTlDir {
            target,
            dir,
            images,
        } => commands::trusted::cmd_flash_tl_dir(&settings, *target, dir, images),
    }
}
