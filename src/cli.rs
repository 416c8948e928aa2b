use std::path::PathBuf;

use anyhow::bail;
use structopt::StructOpt;

use lpcisp::config::DEFAULT_COMMAND_RETRIES;
use lpcisp::{LinkConfig, Options};

/// A workflow selected on the command line
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Workflow {
    Erase,
    Program,
    Examine,
    Info,
}

impl Workflow {
    pub fn name(self) -> &'static str {
        match self {
            Workflow::Erase => "erase",
            Workflow::Program => "program",
            Workflow::Examine => "examine",
            Workflow::Info => "info",
        }
    }

    /// Returns true if the workflow needs a firmware image
    pub fn needs_image(self) -> bool {
        matches!(self, Workflow::Program | Workflow::Examine)
    }
}

#[derive(StructOpt, Debug)]
#[structopt(about = "Flash LPC15xx microcontrollers through the serial ISP bootloader")]
pub struct Opts {
    /// The serial device to connect to
    #[structopt(
        env = "SERIAL_PORT",
        short = "d",
        long = "device",
        default_value = "/dev/ttyUSB0"
    )]
    pub device: String,

    /// The firmware image to program or examine (.bin, .hex, .ihex, .elf or .axf)
    #[structopt(short = "f", long = "filename", parse(from_os_str))]
    pub filename: Option<PathBuf>,

    /// Erase every sector that is not blank
    #[structopt(short = "e", long = "erase")]
    pub erase: bool,

    /// Program the image into flash
    #[structopt(short = "p", long = "program")]
    pub program: bool,

    /// Read back flash and compare it with the image
    #[structopt(short = "x", long = "examine")]
    pub examine: bool,

    /// Print the part id, serial number and boot code version
    #[structopt(short = "i", long = "info")]
    pub info: bool,

    /// Treat the reset line as active high
    #[structopt(short = "r", long = "reset")]
    pub reset: bool,

    /// Don't use GPIO for reset and ISP selection, prompt instead
    #[structopt(short = "g", long = "nogpio")]
    pub nogpio: bool,

    /// Log everything, including a hex dump of the serial traffic
    #[structopt(short = "v", long = "verbose")]
    pub verbose: bool,

    /// The serial baud rate to use for the bootloader
    #[structopt(
        env = "BAUD_RATE",
        short = "b",
        long = "baud-rate",
        default_value = "115200"
    )]
    pub baud_rate: u32,

    /// The number of stop bits
    #[structopt(long = "stop-bits", default_value = "1", possible_values = &["1", "2"])]
    pub stop_bits: u8,

    /// How many times to reset and synchronize before giving up
    #[structopt(long = "sync-retries", default_value = "2")]
    pub sync_retries: u32,
}

impl Opts {
    /// Returns the selected workflows in the order they run
    pub fn workflows(&self) -> Vec<Workflow> {
        [
            (self.erase, Workflow::Erase),
            (self.program, Workflow::Program),
            (self.examine, Workflow::Examine),
            (self.info, Workflow::Info),
        ]
        .iter()
        .filter(|(selected, _)| *selected)
        .map(|&(_, workflow)| workflow)
        .collect()
    }

    /// Checks the combination of flags
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let workflows = self.workflows();

        if workflows.is_empty() {
            bail!("Nothing to do, pass at least one of --erase, --program, --examine or --info");
        }

        if self.filename.is_none() {
            if let Some(workflow) = workflows.iter().find(|w| w.needs_image()) {
                bail!("--{} requires an image, pass it with --filename", workflow.name());
            }
        }

        if self.sync_retries == 0 {
            bail!("--sync-retries must be at least 1");
        }

        Ok(())
    }

    /// Returns the run options selected on the command line
    pub fn options(&self) -> Options {
        Options {
            link: LinkConfig {
                baud_rate: self.baud_rate,
                stop_bits: self.stop_bits,
            },
            sync_retries: self.sync_retries,
            command_retries: DEFAULT_COMMAND_RETRIES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Opts {
        Opts::from_iter_safe(std::iter::once("lpc-isp").chain(args.iter().cloned())).unwrap()
    }

    #[test]
    fn it_should_run_workflows_in_a_fixed_order() {
        let opts = parse(&["-x", "-e", "-p", "-f", "blinky.hex"]);

        assert_eq!(
            opts.workflows(),
            vec![Workflow::Erase, Workflow::Program, Workflow::Examine]
        );
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn it_should_require_an_image_to_program() {
        let opts = parse(&["--program"]);

        assert!(opts.validate().is_err());
        assert!(parse(&["--erase"]).validate().is_ok());
        assert!(parse(&["--info"]).validate().is_ok());
    }

    #[test]
    fn it_should_require_a_workflow() {
        assert!(parse(&["-f", "blinky.elf"]).validate().is_err());
    }

    #[test]
    fn it_should_map_link_options() {
        let opts = parse(&["-e", "-b", "57600", "--stop-bits", "2", "--sync-retries", "5"]);
        let options = opts.options();

        assert_eq!(options.link.baud_rate, 57600);
        assert_eq!(options.link.stop_bits, 2);
        assert_eq!(options.sync_retries, 5);
        assert_eq!(options.command_retries, DEFAULT_COMMAND_RETRIES);
    }

    #[test]
    fn it_should_parse_the_mode_flags() {
        let opts = parse(&["-e", "-r", "-g", "-v"]);

        assert!(opts.reset);
        assert!(opts.nogpio);
        assert!(opts.verbose);
        assert!(!parse(&["-e"]).verbose);
    }

    #[test]
    fn it_should_reject_unknown_stop_bits() {
        assert!(Opts::from_iter_safe(&["lpc-isp", "-e", "--stop-bits", "3"]).is_err());
    }
}
