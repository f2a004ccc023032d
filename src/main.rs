use clap::{value_parser, Arg, ArgAction, Command};
use ringlog::*;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

mod agent;
mod config;
mod exposition;
mod simulate;

use agent::publish::Registry;
use agent::table::{CounterTable, MemoryTable, TableError};
use agent::Harvester;
use config::Config;

/// Number of CPUs the simulated datapath shards across.
const SIMULATED_CPUS: usize = 4;

/// How often the simulated datapath records a round of traffic.
const SIMULATED_PERIOD: Duration = Duration::from_millis(100);

fn main() {
    // custom panic hook to terminate whole process after unwinding
    std::panic::set_hook(Box::new(|s| {
        eprintln!("{s}");
        std::process::exit(101);
    }));

    let args = command().get_matches();

    let config = match args.get_one::<PathBuf>("CONFIG") {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{e}");
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    let verbose = args.get_count("VERBOSE");
    let level = raise(config.log().level(), verbose);

    let debug_output: Box<dyn Output> = Box::new(Stderr::new());

    let debug_log = if level <= Level::Info {
        LogBuilder::new().format(ringlog::default_format)
    } else {
        LogBuilder::new()
    }
    .output(debug_output)
    .build()
    .expect("failed to initialize debug log");

    let mut log = MultiLogBuilder::new()
        .level_filter(level.to_level_filter())
        .default(debug_log)
        .build()
        .start();

    std::thread::spawn(move || loop {
        let _ = log.flush();
        std::thread::sleep(Duration::from_millis(50));
    });

    let once = args.get_flag("ONCE");
    let simulate = args.get_flag("SIMULATE");

    if let Err(e) = run(config, once, simulate) {
        error!("{e:#}");
        // give the log drain a chance to flush
        std::thread::sleep(Duration::from_millis(200));
        std::process::exit(1);
    }
}

fn command() -> Command {
    Command::new(env!("CARGO_BIN_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::new("CONFIG")
                .help("Path to the configuration file")
                .action(ArgAction::Set)
                .value_parser(value_parser!(PathBuf))
                .index(1),
        )
        .arg(
            Arg::new("ONCE")
                .long("once")
                .help("Run a single sync cycle and exit")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("SIMULATE")
                .long("simulate")
                .help("Harvest a synthetic in-memory table instead of the pinned map")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("VERBOSE")
                .long("verbose")
                .short('v')
                .help("Increase verbosity")
                .action(ArgAction::Count),
        )
}

/// Raises a log level by `steps` towards `Trace`.
fn raise(level: Level, steps: u8) -> Level {
    let mut level = level;
    for _ in 0..steps {
        level = match level {
            Level::Error => Level::Warn,
            Level::Warn => Level::Info,
            Level::Info => Level::Debug,
            Level::Debug | Level::Trace => Level::Trace,
        };
    }
    level
}

/// Where the metrics table comes from.
enum Source {
    Pinned(PathBuf),
    Simulated(Arc<MemoryTable>),
}

impl Source {
    /// A simulated datapath. One round of traffic is recorded up front so a
    /// single cycle has something to harvest. Later rounds are recorded in
    /// the background unless only one cycle will run.
    fn simulated(once: bool, running: Arc<AtomicBool>) -> anyhow::Result<Self> {
        let table = Arc::new(MemoryTable::new(SIMULATED_CPUS));
        simulate::round(&table, 0)?;

        if !once {
            simulate::spawn(table.clone(), SIMULATED_PERIOD, running)?;
        }

        Ok(Self::Simulated(table))
    }

    fn open(self) -> Result<Box<dyn CounterTable>, TableError> {
        match self {
            #[cfg(target_os = "linux")]
            Self::Pinned(path) => Ok(Box::new(agent::table::PinnedTable::open(path)?)),
            #[cfg(not(target_os = "linux"))]
            Self::Pinned(path) => Err(TableError::Open {
                path: path.display().to_string(),
                reason: "pinned BPF maps are only supported on Linux".to_string(),
            }),
            Self::Simulated(table) => Ok(Box::new(table)),
        }
    }
}

fn run(config: Config, once: bool, simulate: bool) -> anyhow::Result<()> {
    let interval = config.general().interval()?;
    let timeout = config.general().timeout()?;

    let running = Arc::new(AtomicBool::new(true));

    let source = if simulate {
        info!("harvesting a simulated datapath with {SIMULATED_CPUS} CPUs");
        Source::simulated(once, running.clone())?
    } else {
        if let Ok(cpus) = agent::table::possible_cpus() {
            debug!("{cpus} possible CPUs");
        }
        Source::Pinned(config.table().path().to_path_buf())
    };

    let registry = Arc::new(Registry::new(config.exposition().cardinality()));

    if once {
        let harvester = Harvester::new(source.open()?, registry.clone());
        let report = harvester.sync(Some(Instant::now() + timeout))?;
        info!(
            "synced {} entries: {} counters increased",
            report.entries, report.increased
        );
        print!("{}", exposition::render(&registry)?);
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .worker_threads(1)
        .thread_name("dpmetrics-http")
        .build()?;

    if config.exposition().enabled() {
        let listen = config.exposition().listen()?;
        let registry = registry.clone();
        runtime.spawn(async move {
            if let Err(e) = exposition::serve(listen, registry).await {
                error!("metrics endpoint stopped: {e}");
            }
        });
    }

    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            running.store(false, Ordering::Relaxed);
        })?;
    }

    // the table is opened on the sync thread and lives there for the
    // lifetime of the agent
    let (opened, ready) = std::sync::mpsc::channel();

    let worker = std::thread::Builder::new()
        .name("sync".to_string())
        .spawn(move || {
            let harvester = match source.open() {
                Ok(table) => {
                    let _ = opened.send(Ok(()));
                    Harvester::new(table, registry)
                }
                Err(e) => {
                    let _ = opened.send(Err(e));
                    return;
                }
            };

            sync_loop(&harvester, interval, timeout, &running);
        })?;

    match ready.recv() {
        Ok(Ok(())) => info!("harvesting every {}", humantime::format_duration(interval)),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => anyhow::bail!("sync thread exited before opening the table"),
    }

    let _ = worker.join();

    info!("shutting down");
    runtime.shutdown_timeout(Duration::from_secs(1));

    Ok(())
}

/// Runs sync cycles on a fixed cadence until `running` is cleared. Cycles
/// never overlap: a slow cycle delays the next one rather than running
/// concurrently with it.
fn sync_loop<T: CounterTable>(
    harvester: &Harvester<T, Arc<Registry>>,
    interval: Duration,
    timeout: Duration,
    running: &AtomicBool,
) {
    let mut next = Instant::now();

    while running.load(Ordering::Relaxed) {
        let now = Instant::now();

        if now < next {
            std::thread::sleep((next - now).min(Duration::from_millis(100)));
            continue;
        }

        next += interval;
        if next < now {
            warn!("sync cycle overran the interval");
            next = now + interval;
        }

        if let Err(e) = harvester.sync(Some(now + timeout)) {
            error!("sync cycle failed: {e}");
        }
    }
}
