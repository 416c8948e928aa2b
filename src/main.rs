use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use log::{info, warn, LevelFilter};
use structopt::StructOpt;

mod cli;

use cli::Workflow;
use lpcisp::{
    image, CancelToken, Flasher, Geometry, GpioReset, ImageError, ManualReset, MemoryImage,
    ModeControl, Options, StatusLed, TargetInfo, Transport,
};

/// How often the main thread reports on a running workflow
const TICK: Duration = Duration::from_secs(4);

/// Logs at info level, or everything with `verbose`. `RUST_LOG` takes precedence over both.
fn init_logger(verbose: bool) {
    let mut builder = pretty_env_logger::formatted_timed_builder();

    builder.filter_level(if verbose {
        LevelFilter::Trace
    } else {
        LevelFilter::Info
    });

    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    builder.init();
}

fn print_info(info: &TargetInfo) {
    println!("Chip id:           {}", info.chip_id);
    println!("Part id:           {:#010x}", info.part_id);
    println!(
        "Serial number:     {:08x} {:08x} {:08x} {:08x}",
        info.uid[0], info.uid[1], info.uid[2], info.uid[3]
    );
    println!(
        "Boot code version: {}.{}",
        info.boot_code_version.major, info.boot_code_version.minor
    );
}

/// Everything a worker needs to run one workflow on its own link
struct Job {
    workflow: Workflow,
    device: String,
    options: Options,
    mode: Box<dyn ModeControl + Send>,
    image: Option<Arc<MemoryImage>>,
    cancel: CancelToken,
}

impl Job {
    fn run(self) -> Result<(), lpcisp::Error> {
        let transport = Transport::open(&self.device, &self.options.link)?;
        let flasher = Flasher::new(
            transport,
            self.mode,
            Geometry::LPC15XX,
            self.options,
            self.cancel,
        );

        match (self.workflow, self.image) {
            (Workflow::Erase, _) => flasher.erase(),
            (Workflow::Program, Some(image)) => flasher.program(&image),
            (Workflow::Examine, Some(image)) => flasher.examine(&image),
            (Workflow::Info, _) => flasher.info().map(|info| print_info(&info)),
            (_, None) => Err(ImageError::Empty.into()),
        }
    }
}

/// Runs `job` on a worker thread and waits for it, reporting progress every tick.
///
/// `led` is lit for as long as the job runs.
fn run_on_worker(job: Job, led: Option<&StatusLed>) -> Result<(), anyhow::Error> {
    let name = job.workflow.name();
    let cancel = job.cancel.clone();
    let _busy = match led.map(StatusLed::busy) {
        Some(Ok(busy)) => Some(busy),
        Some(Err(err)) => {
            warn!("Status LED unavailable: {}", err);
            None
        }
        None => None,
    };
    let (tx, rx) = mpsc::channel();

    let worker = thread::Builder::new()
        .name(name.to_owned())
        .spawn(move || {
            // The receiver only goes away once main has given up on the result
            let _ = tx.send(job.run());
        })
        .with_context(|| format!("Failed to start the {} worker", name))?;

    let result = loop {
        match rx.recv_timeout(TICK) {
            Ok(result) => break result,
            Err(RecvTimeoutError::Timeout) if cancel.is_cancelled() => {
                info!("Waiting for {} to stop", name)
            }
            Err(RecvTimeoutError::Timeout) => info!("Still running {}", name),
            Err(RecvTimeoutError::Disconnected) => break Err(lpcisp::Error::Cancelled),
        }
    };

    worker
        .join()
        .map_err(|_| anyhow!("The {} worker panicked", name))?;

    result.with_context(|| format!("Failed to {}", name))
}

fn mode_control(opts: &cli::Opts) -> Box<dyn ModeControl + Send> {
    if opts.nogpio {
        Box::new(ManualReset::stdio())
    } else {
        Box::new(GpioReset::new(!opts.reset))
    }
}

fn main() -> Result<(), anyhow::Error> {
    // Parse the command-line arguments
    let opts = cli::Opts::from_args();

    init_logger(opts.verbose);
    opts.validate()?;

    let cancel = CancelToken::new();
    let handler_cancel = cancel.clone();

    ctrlc::set_handler(move || {
        eprintln!("Interrupted, stopping at the next step");
        handler_cancel.cancel();
    })
    .context("Failed to install the signal handler")?;

    let workflows = opts.workflows();
    let image = match &opts.filename {
        Some(path) if workflows.iter().any(|w| w.needs_image()) => {
            let image = image::load(path, Geometry::LPC15XX.flash_size())
                .with_context(|| format!("Failed to load {}", path.display()))?;

            Some(Arc::new(image))
        }
        _ => None,
    };

    info!("Using serial device {:?}", opts.device);

    let led = if opts.nogpio {
        None
    } else {
        Some(StatusLed::new())
    };

    for workflow in workflows {
        if cancel.is_cancelled() {
            bail!("Cancelled before {}", workflow.name());
        }

        run_on_worker(
            Job {
                workflow,
                device: opts.device.clone(),
                options: opts.options(),
                mode: mode_control(&opts),
                image: image.clone(),
                cancel: cancel.clone(),
            },
            led.as_ref(),
        )?;
    }

    Ok(())
}
