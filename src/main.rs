use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use confique::Config;
use daq_stream::*;
use log::{info, LevelFilter};
use simplelog::{
    ColorChoice, CombinedLogger, SharedLogger, TermLogger, TerminalMode, WriteLogger,
};
use std::{fs::File, path::PathBuf, thread};
use time::OffsetDateTime;

#[derive(Parser)]
#[command(
    name = "daq_stream",
    version,
    about = "Calibrate and stream a multi-channel data acquisition device"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: PathBuf,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// List devices visible to the driver
    Devices,
    /// Search for the fastest loss-free stream rate
    Calibrate(CalibrateArgs),
    /// Stream into memory for a fixed duration
    Collect(CollectArgs),
}

#[derive(Args)]
struct CalibrateArgs {
    /// Observation window per candidate, in seconds
    #[arg(long)]
    seconds: Option<f64>,
}

#[derive(Args)]
struct CollectArgs {
    /// Show a live status view; press q to stop early
    #[arg(long)]
    tui: bool,

    /// Seconds of data to collect
    #[arg(long)]
    duration: Option<f64>,

    /// Scans per second
    #[arg(long)]
    frequency: Option<f64>,

    /// Scans per read, 0 for automatic
    #[arg(long)]
    packet_size: Option<usize>,

    /// Calibrate first and stream at the rate found
    #[arg(long)]
    calibrated: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Conf::builder()
        .file(&cli.config)
        .load()
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let tui = matches!(&cli.command, Command::Collect(args) if args.tui);
    init_logging(&config, cli.verbose, tui)?;

    let backend = sim_backend(&config);
    let mut device = simulated_device(&config, &backend);

    match cli.command {
        Command::Devices => devices(&mut device),
        Command::Calibrate(args) => {
            if let Some(seconds) = args.seconds {
                config.calibration.num_seconds = seconds;
            }
            calibrate(&config, &mut device).map(|_| ())
        }
        Command::Collect(args) => collect(&mut config, &mut device, args),
    }
}

fn init_logging(config: &Conf, verbose: u8, tui: bool) -> Result<()> {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let stamp = OffsetDateTime::now_utc().unix_timestamp();
    let log_path = PathBuf::from(&config.run.log_dir).join(format!("daq_stream_{stamp}.log"));
    let log_file =
        File::create(&log_path).with_context(|| format!("creating {}", log_path.display()))?;

    let mut loggers: Vec<Box<dyn SharedLogger>> = vec![WriteLogger::new(
        LevelFilter::Debug.max(level),
        simplelog::Config::default(),
        log_file,
    )];
    // the terminal belongs to the status view while it runs
    if !tui {
        loggers.push(TermLogger::new(
            level,
            simplelog::Config::default(),
            TerminalMode::Mixed,
            ColorChoice::Auto,
        ));
    }
    CombinedLogger::init(loggers)?;
    Ok(())
}

fn devices(device: &mut Device<SimulatedDriver>) -> Result<()> {
    let found = device.list_devices()?;
    if found.is_empty() {
        println!("No devices found");
    }
    for d in found {
        println!(
            "{}\t{}\t{}\tserial {}",
            d.device_type.name(),
            d.connection.name(),
            d.identifier,
            d.serial_number
        );
    }
    Ok(())
}

fn calibrate(config: &Conf, device: &mut Device<SimulatedDriver>) -> Result<Calibration> {
    let plan = sampling_plan(config);
    let report = RateCalibrator::new(device, &plan, calibration_settings(config)).calibrate()?;
    let (frequency, packet_size) = report.outcome.as_pair();
    println!("Frequency:\t{frequency}");
    println!("Packet size:\t{packet_size}");
    println!(
        "Probes:\t\t{} ({} attempts, {:.1} s)",
        report.probes,
        report.attempts,
        report.elapsed.as_secs_f64()
    );
    Ok(report.outcome)
}

fn collect(
    config: &mut Conf,
    device: &mut Device<SimulatedDriver>,
    args: CollectArgs,
) -> Result<()> {
    if let Some(duration) = args.duration {
        config.run.duration = duration;
    }
    if let Some(frequency) = args.frequency {
        config.plan.frequency = frequency;
    }
    if let Some(packet_size) = args.packet_size {
        config.plan.packet_size = packet_size;
    }

    let mut plan = sampling_plan(config);
    if args.calibrated {
        match calibrate(config, device)? {
            Calibration::Found {
                frequency,
                packet_size,
            } => plan = plan.with_rate(frequency, packet_size),
            Calibration::Failed => bail!("calibration found no loss-free rate"),
        }
    }

    let labels = plan.column_labels();
    let mut engine = IngestionEngine::new(device, engine_settings(config));
    let run = engine.prepare(&plan, config.run.duration)?;
    let buffer = run.buffer();

    let report = if args.tui {
        let stop = run.stop_handle();
        thread::scope(|s| -> Result<CollectReport> {
            let worker = s.spawn(move || run.execute(None));
            let mut terminal = ratatui::init();
            let mut status = Status::new(buffer.clone(), labels, stop.clone());
            let shown = status.run(&mut terminal, || worker.is_finished());
            ratatui::restore();
            if shown.is_err() {
                stop.stop();
            }
            let report = worker
                .join()
                .map_err(|_| anyhow!("acquisition thread panicked"))??;
            shown?;
            Ok(report)
        })?
    } else {
        run.execute(None)?
    };

    info!("{} rows held in memory", buffer.row_count());
    println!("Elapsed:\t{:.3} s", report.elapsed.as_secs_f64());
    println!("Rows:\t\t{}", report.rows);
    println!("Skip rate:\t{}", report.skip_rate);
    println!(
        "Rate:\t\t{} Hz, {} scans per packet",
        report.frequency, report.packet_size
    );
    for warning in &report.warnings {
        println!("Warning:\t{warning}");
    }
    if report.cancelled {
        println!("Stopped early");
    }
    Ok(())
}
