//! gpio-rtt entry point.
//!
//! Runs one side of the round-trip bench: the edge responder on the device
//! under test, or the stimulus/capture node that measures it. `--simulated`
//! runs both sides in-process against a wired simulated chip.

mod signals;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rtt_common::{EdgeDetection, HarnessConfig, ResponderConfig};
use rtt_gpio::{BlockingEdges, CdevChip, EdgeSource, LineController, LineHandle, PollingEdges, SimulatedChip};
use rtt_runtime::{
    check_rt_capabilities, init_realtime, responder_request, run_stimulus, validate_rt_capabilities, LinuxSched,
    Responder, ResponderCounters, StimulusSummary, ThreadTable, WindowReport,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::signals::SignalHandler;

/// Wire delay between the two sides of the simulated bench.
const SIM_PROPAGATION: Duration = Duration::from_micros(2);

/// Time the simulated responder takes to drive its output.
const SIM_RESPONSE_LATENCY: Duration = Duration::from_micros(10);

/// gpio-rtt command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "gpio-rtt",
    about = "GPIO round-trip latency and jitter harness",
    version,
    long_about = None
)]
struct Args {
    /// Path to a harness configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info", global = true)]
    log_level: String,

    /// GPIO character device (overrides config file).
    #[arg(long, value_name = "PATH", global = true)]
    chip: Option<PathBuf>,

    /// Run against an in-process simulated chip with both sides wired up.
    #[arg(long, short = 's', global = true)]
    simulated: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
enum Command {
    /// Mirror the input line onto the output line.
    Respond {
        /// Sample the input level instead of waiting for kernel edge events.
        #[arg(long)]
        polling: bool,

        /// Stop after this many rising edges.
        #[arg(long, value_name = "N")]
        max_edges: Option<u64>,
    },
    /// Emit stimulus pulses and report round-trip statistics per window.
    Stimulate {
        /// Stop after this many windows.
        #[arg(long, value_name = "N")]
        max_windows: Option<u64>,

        /// Print one JSON object per window instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Validate the configuration and probe real-time prerequisites.
    Check {
        /// IRQ numbers whose service threads should be looked up.
        #[arg(long = "irq", value_name = "N")]
        irqs: Vec<u32>,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting gpio-rtt");

    let mut config = load_config(&args)?;
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;

    if let Command::Check { irqs } = &args.command {
        return check(&config, irqs, args.simulated);
    }

    let signals = SignalHandler::install().context("Failed to set up signal handlers")?;

    let report = init_realtime(&config.realtime, &LinuxSched, &ThreadTable::default())
        .context("Real-time initialization failed")?;
    debug!(?report, "Real-time posture");

    let result = if args.simulated {
        run_simulated(&config, &args.command, signals.stop_flag())
    } else {
        let chip = CdevChip::open(&config.chip.path)
            .with_context(|| format!("Failed to open {:?}", config.chip.path))?;
        run_command(&config, &args.command, &chip, signals.stop_flag())
    };

    if let Err(e) = &result {
        error!(error = %e, "gpio-rtt stopped on a fatal error");
    }
    let state = signals.state();
    match state.last_signal() {
        Some(signal) if state.shutdown_requested() => {
            info!(%signal, count = state.signal_count(), "gpio-rtt stopped by signal");
        }
        _ => info!("gpio-rtt exiting"),
    }
    result
}

/// Initialize logging with the specified log level.
///
/// Diagnostics go to stderr so stdout carries only reports.
fn init_logging(level: &str) {
    let filter = format!(
        "gpio_rtt={},rtt_runtime={},rtt_gpio={},rtt_common={}",
        level, level, level, level
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `GPIO_RTT_CONFIG` environment variable
/// 3. `/etc/gpio-rtt/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<HarnessConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return HarnessConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path));
    }

    if let Ok(env_path) = std::env::var("GPIO_RTT_CONFIG") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from GPIO_RTT_CONFIG");
            return HarnessConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from GPIO_RTT_CONFIG={:?}", env_path)
            });
        }
        warn!(
            path = %env_path,
            "GPIO_RTT_CONFIG set but file does not exist, checking other locations"
        );
    }

    for path in ["/etc/gpio-rtt/config.toml", "config/default.toml"] {
        let config_path = PathBuf::from(path);
        if config_path.exists() {
            info!(?config_path, "Loading config file");
            return HarnessConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {:?}", config_path));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(HarnessConfig::default())
}

/// Command-line flags win over file values.
fn apply_overrides(config: &mut HarnessConfig, args: &Args) {
    if let Some(chip) = &args.chip {
        config.chip.path = chip.clone();
    }
    if let Command::Respond { polling: true, .. } = args.command {
        config.responder.detection = EdgeDetection::Polling;
    }
}

/// Run the selected role against `controller`.
fn run_command(
    config: &HarnessConfig,
    command: &Command,
    controller: &dyn LineController,
    stop: &AtomicBool,
) -> Result<()> {
    match command {
        Command::Respond { max_edges, .. } => {
            let counters = respond(config, controller, stop, *max_edges)?;
            info!(
                rising = counters.rising,
                falling = counters.falling,
                timeouts = counters.timeouts,
                spurious = counters.spurious,
                "Responder finished"
            );
            Ok(())
        }
        Command::Stimulate { max_windows, json } => {
            let summary = stimulate(config, controller, stop, *max_windows, *json)?;
            info!(
                windows = summary.windows,
                cycles = summary.cycles,
                overruns = summary.overruns,
                missed = summary.totals.missed,
                rejected = summary.totals.rejected(),
                "Stimulus finished"
            );
            Ok(())
        }
        Command::Check { irqs } => check(config, irqs, false),
    }
}

fn respond(
    config: &HarnessConfig,
    controller: &dyn LineController,
    stop: &AtomicBool,
    max_edges: Option<u64>,
) -> Result<ResponderCounters> {
    let request = responder_request(&config.responder, &config.chip.consumer);
    let lines = controller
        .request(&request)
        .with_context(|| format!("Failed to request responder lines on {}", controller.name()))?;

    let responder = &config.responder;
    match responder.detection {
        EdgeDetection::Blocking => run_responder(lines, BlockingEdges::new(), responder, stop, max_edges),
        EdgeDetection::Polling => {
            run_responder(lines, PollingEdges::new(responder.poll_interval), responder, stop, max_edges)
        }
    }
}

fn run_responder<E: EdgeSource>(
    lines: Box<dyn LineHandle>,
    source: E,
    config: &ResponderConfig,
    stop: &AtomicBool,
    max_edges: Option<u64>,
) -> Result<ResponderCounters> {
    let mut responder = Responder::new(
        lines,
        source,
        config.input.get(),
        config.output.get(),
        config.wait_timeout,
    )?;
    Ok(responder.run(stop, max_edges)?)
}

fn stimulate(
    config: &HarnessConfig,
    controller: &dyn LineController,
    stop: &AtomicBool,
    max_windows: Option<u64>,
    json: bool,
) -> Result<StimulusSummary> {
    let mut print = |report: &WindowReport| {
        if json {
            match serde_json::to_string(report) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, window = report.window, "Failed to encode report"),
            }
        } else {
            println!("{report}");
        }
    };
    run_stimulus(
        controller,
        &config.chip.consumer,
        &config.stimulus,
        stop,
        max_windows,
        &mut print,
    )
    .context("Stimulus run failed")
}

/// Simulated chip large enough for every configured offset, with the
/// stimulus output wired to the responder input and the responder output
/// wired back to the capture input.
fn simulated_chip(config: &HarnessConfig) -> Result<SimulatedChip> {
    let (responder, stimulus) = (&config.responder, &config.stimulus);
    let num_lines = [responder.input, responder.output, stimulus.input, stimulus.output]
        .iter()
        .map(|o| o.get())
        .max()
        .unwrap_or(0)
        + 1;

    let chip = SimulatedChip::realtime("sim-gpiochip", num_lines);
    chip.connect(stimulus.output.get(), responder.input.get(), SIM_PROPAGATION)?;
    chip.connect(responder.output.get(), stimulus.input.get(), SIM_PROPAGATION)?;
    chip.set_write_latency(responder.output.get(), SIM_RESPONSE_LATENCY)?;
    info!(lines = num_lines, "Simulated chip wired");
    Ok(chip)
}

/// Run the selected role on the main thread and its counterpart on a peer
/// thread, both against one simulated chip.
fn run_simulated(config: &HarnessConfig, command: &Command, stop: &AtomicBool) -> Result<()> {
    let chip = simulated_chip(config)?;
    let peer_stop = AtomicBool::new(false);

    crossbeam_utils::thread::scope(|s| -> Result<()> {
        let peer = s.spawn(|_| -> Result<()> {
            match command {
                Command::Respond { .. } => {
                    let mut quiet = |report: &WindowReport| debug!(%report, "peer window");
                    run_stimulus(
                        &chip,
                        &config.chip.consumer,
                        &config.stimulus,
                        &peer_stop,
                        None,
                        &mut quiet,
                    )?;
                }
                Command::Stimulate { .. } => {
                    let mut peer_config = config.responder.clone();
                    peer_config.detection = EdgeDetection::Blocking;
                    let lines = chip.request(&responder_request(&peer_config, &config.chip.consumer))?;
                    run_responder(lines, BlockingEdges::new(), &peer_config, &peer_stop, None)?;
                }
                Command::Check { .. } => {}
            }
            Ok(())
        });

        let result = run_command(config, command, &chip, stop);
        peer_stop.store(true, Ordering::Release);
        chip.interrupt();

        match peer.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Simulated peer failed"),
            Err(_) => warn!("Simulated peer panicked"),
        }
        result
    })
    .map_err(|_| anyhow!("simulated bench panicked"))?
}

/// Print configuration, privilege, and IRQ-thread findings to stdout.
fn check(config: &HarnessConfig, irqs: &[u32], simulated: bool) -> Result<()> {
    println!("config: ok");

    if simulated {
        println!("chip: simulated");
    } else {
        match CdevChip::open(&config.chip.path) {
            Ok(chip) => println!("chip: {} ok", chip.path().display()),
            Err(e) => println!("chip: {e}"),
        }
    }

    let caps = check_rt_capabilities();
    println!(
        "realtime scheduling: {} (root: {}, RLIMIT_RTPRIO: {:?})",
        yes_no(caps.can_use_rt_scheduling()),
        caps.is_root,
        caps.rtprio_limit
    );
    println!(
        "memory locking: {} (RLIMIT_MEMLOCK: {:?})",
        yes_no(caps.can_lock_memory()),
        caps.memlock_limit
    );
    println!("PREEMPT_RT kernel: {}", yes_no(caps.preempt_rt));

    let table = ThreadTable::default();
    let mut wanted: Vec<u32> = config.realtime.irq_threads.clone();
    wanted.extend_from_slice(irqs);
    wanted.sort_unstable();
    wanted.dedup();
    for irq in wanted {
        let threads = table
            .irq_threads(irq)
            .with_context(|| format!("Failed to scan threads for IRQ {irq}"))?;
        if threads.is_empty() {
            println!("irq {irq}: no service thread");
        }
        for task in threads {
            println!("irq {irq}: {} (pid {}, tid {})", task.comm, task.pid, task.tid);
        }
    }

    if config.realtime.enabled && config.realtime.fail_fast {
        validate_rt_capabilities(&config.realtime, &caps).context("Real-time prerequisites not met")?;
    }
    Ok(())
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}
