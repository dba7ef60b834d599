// SPDX-License-Identifier: GPL-2.0
//
// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

mod stats;

use std::fs;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use clap::{Parser, Subcommand};
use crossbeam::channel::RecvTimeoutError;
use log::{debug, info, warn};
use scx_stats::prelude::*;

use scx_minimal_core::{
    HostError, HostPort, InstanceHandle, LifecycleController, MinimalScheduler, PolicySpec,
    Scenario, Simulator, SliceConfig, StatusFile, TaskBehavior, Weight, DEFAULT_POLICY_NAME,
    DEFAULT_STATUS_PATH, NSEC_PER_USEC,
};

use stats::Metrics;

const SCHEDULER_NAME: &str = "scx_minimal";

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Virtual time simulated per run-loop iteration, paced 1:1 against the
/// wall clock.
const SIM_WINDOW_NS: u64 = 100_000_000;

/// How long `start` and `stop` wait for the status surface to settle.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(3);

/// scx_minimal: a minimal vruntime-fair scheduling policy
///
/// The policy tracks every runnable task in a registry and always dispatches the task with the
/// lowest weight-normalized virtual runtime (vruntime):
///
/// - each task receives a time slice of execution (slice_ns), scaled down when more tasks are
///   waiting
///
/// - the actual execution time, adjusted based on the task's weight, determines the vruntime
///
/// - tasks are then dispatched from the lowest to the highest vruntime
///
/// At most one policy instance can be attached at a time; the name of the active policy is
/// published to a status file that other processes can read back. Without a subcommand the
/// scheduler runs in the foreground, driving a synthetic workload through the policy and serving
/// statistics over a UNIX socket until it receives Ctrl-C.
///
/// The `start`, `stop` and `status` subcommands manage a background instance through the status
/// file and a pidfile.
#[derive(Debug, Parser)]
struct Opts {
    #[clap(subcommand)]
    command: Option<Action>,

    /// Scheduling slice duration in microseconds.
    #[clap(short = 's', long, default_value = "5000")]
    slice_us: u64,

    /// Scheduling minimum slice duration in microseconds.
    #[clap(short = 'S', long, default_value = "500")]
    slice_us_min: u64,

    /// Policy name published to the status file while attached.
    #[clap(long, default_value = DEFAULT_POLICY_NAME)]
    policy_name: String,

    /// Path of the status file.
    #[clap(long, default_value = DEFAULT_STATUS_PATH)]
    status_path: PathBuf,

    /// Path of the pidfile used by the start/stop subcommands.
    #[clap(long, default_value = "/var/run/scx_minimal/pid")]
    pid_path: PathBuf,

    /// Amount of CPUs driving the policy.
    #[clap(short = 'c', long, default_value = "4")]
    nr_cpus: u32,

    /// Enable stats monitoring with the specified interval.
    #[clap(long)]
    stats: Option<f64>,

    /// Run in stats monitoring mode with the specified interval. Scheduler
    /// is not launched.
    #[clap(long)]
    monitor: Option<f64>,

    /// Show descriptions for statistics.
    #[clap(long)]
    help_stats: bool,

    /// Enable verbose output.
    #[clap(short = 'v', long, action = clap::ArgAction::SetTrue)]
    verbose: bool,

    /// Print scheduler version and exit.
    #[clap(short = 'V', long, action = clap::ArgAction::SetTrue)]
    version: bool,
}

#[derive(Debug, Subcommand)]
enum Action {
    /// Start the scheduler as a background process.
    Start,
    /// Stop the running scheduler.
    Stop,
    /// Print the name of the active policy.
    Status,
}

/// Host port for standalone operation: there is no outer scheduling
/// class to install into, so registration only has to be observable.
struct LocalHostPort;

impl HostPort for LocalHostPort {
    fn register(&self, spec: &PolicySpec) -> Result<(), HostError> {
        info!("Register {} policy", spec.name);
        Ok(())
    }

    fn deregister(&self) -> Result<(), HostError> {
        info!("Deregister policy");
        Ok(())
    }
}

struct Scheduler {
    sched: Arc<MinimalScheduler>,
    ctl: LifecycleController,
    handle: InstanceHandle,
    scenario: Scenario,
    stats_server: StatsServer<(), Metrics>,
    nr_cpus: u32,
    pid_path: PathBuf,
}

impl Scheduler {
    fn init(opts: &Opts) -> Result<Self> {
        let slice = SliceConfig {
            slice_ns: opts.slice_us * NSEC_PER_USEC,
            slice_ns_min: opts.slice_us_min * NSEC_PER_USEC,
        };
        let sched = Arc::new(
            MinimalScheduler::new(slice).context("Invalid time slice configuration")?,
        );

        let status = StatusFile::new(&opts.status_path);
        if let Some(name) = status
            .read()
            .with_context(|| format!("Failed to read {:?}", opts.status_path))?
        {
            bail!("policy {} is already active", name);
        }

        let ctl = LifecycleController::new(
            Arc::new(LocalHostPort),
            sched.clone(),
            Some(status),
        );
        let handle = ctl
            .attach(&opts.policy_name)
            .with_context(|| format!("Failed to attach policy {}", opts.policy_name))?;

        if let Some(parent) = opts.pid_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&opts.pid_path, std::process::id().to_string())
            .with_context(|| format!("Failed to write {:?}", opts.pid_path))?;

        let stats_server = StatsServer::new(stats::server_data()).launch()?;

        info!("{} {} attached as {}", SCHEDULER_NAME, VERSION, opts.policy_name);

        Ok(Self {
            sched,
            ctl,
            handle,
            scenario: Self::workload(opts.nr_cpus),
            stats_server,
            nr_cpus: opts.nr_cpus,
            pid_path: opts.pid_path.clone(),
        })
    }

    /// Synthetic workload exercising the policy: one CPU hog per CPU to
    /// keep the run queue contended, plus an interactive task and a
    /// double-weight hog.
    fn workload(nr_cpus: u32) -> Scenario {
        let mut builder = Scenario::builder().cpus(nr_cpus).duration_ns(SIM_WINDOW_NS);
        for i in 0..nr_cpus {
            builder = builder.add_task(
                &format!("worker{i}"),
                Weight::DEFAULT,
                TaskBehavior::cpu_bound(),
            );
        }
        builder
            .add_task(
                "chatty",
                Weight::DEFAULT,
                TaskBehavior::interactive(500_000, 2_000_000),
            )
            .add_task("heavy", Weight(200), TaskBehavior::cpu_bound())
            .build()
    }

    fn get_metrics(&self) -> Metrics {
        let m = self.sched.metrics();
        Metrics {
            nr_cpus: self.nr_cpus as u64,
            nr_tasks: m.nr_tasks,
            nr_queued: m.nr_queued,
            nr_dispatches: m.nr_dispatches,
            nr_enqueues: m.nr_enqueues,
            nr_sched_congested: m.nr_sched_congested,
        }
    }

    fn run(&mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let (res_ch, req_ch) = self.stats_server.channels();
        let sim = Simulator::new(self.sched.clone());

        while !shutdown.load(Ordering::Relaxed) {
            let started = Instant::now();
            sim.run(&self.scenario);
            debug!("simulated {}ns window", SIM_WINDOW_NS);

            match req_ch.recv_timeout(Duration::from_millis(100)) {
                Ok(()) => res_ch.send(self.get_metrics())?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(e) => Err(e)?,
            }

            // Pace virtual time 1:1 against the wall clock.
            let window = Duration::from_nanos(SIM_WINDOW_NS);
            if let Some(rem) = window.checked_sub(started.elapsed()) {
                std::thread::sleep(rem);
            }
        }

        self.ctl
            .detach(self.handle)
            .context("Failed to detach policy")?;
        if let Err(err) = fs::remove_file(&self.pid_path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove pidfile: {}", err);
            }
        }
        Ok(())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        info!("Unregister {SCHEDULER_NAME} scheduler");
    }
}

fn forwarded_args(opts: &Opts) -> Vec<String> {
    vec![
        "--slice-us".into(),
        opts.slice_us.to_string(),
        "--slice-us-min".into(),
        opts.slice_us_min.to_string(),
        "--policy-name".into(),
        opts.policy_name.clone(),
        "--status-path".into(),
        opts.status_path.display().to_string(),
        "--pid-path".into(),
        opts.pid_path.display().to_string(),
        "--nr-cpus".into(),
        opts.nr_cpus.to_string(),
    ]
}

fn cmd_start(opts: &Opts) -> Result<()> {
    let status = StatusFile::new(&opts.status_path);
    if let Some(name) = status.read()? {
        bail!("policy {} is already active", name);
    }

    let exe = std::env::current_exe().context("Failed to resolve scheduler binary")?;
    std::process::Command::new(exe)
        .args(forwarded_args(opts))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        // Own process group: a Ctrl-C in the launching terminal must not
        // reach the background scheduler.
        .process_group(0)
        .spawn()
        .context("Failed to spawn scheduler")?;

    let deadline = Instant::now() + SETTLE_TIMEOUT;
    while Instant::now() < deadline {
        if let Some(name) = status.read()? {
            info!("{} started", name);
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    bail!("scheduler did not become active");
}

fn cmd_stop(opts: &Opts) -> Result<()> {
    let status = StatusFile::new(&opts.status_path);
    let Some(name) = status.read()? else {
        bail!("no active policy");
    };

    let pid: i32 = fs::read_to_string(&opts.pid_path)
        .with_context(|| format!("Failed to read {:?}", opts.pid_path))?
        .trim()
        .parse()
        .context("Invalid pidfile content")?;
    nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), nix::sys::signal::SIGINT)
        .with_context(|| format!("Failed to signal pid {}", pid))?;

    let deadline = Instant::now() + SETTLE_TIMEOUT;
    while Instant::now() < deadline {
        if status.read()?.is_none() {
            info!("{} stopped", name);
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    bail!("policy {} did not detach", name);
}

fn cmd_status(opts: &Opts) -> Result<()> {
    let status = StatusFile::new(&opts.status_path);
    match status.read()? {
        Some(name) => println!("{}", name),
        None => println!("none"),
    }
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();

    if opts.version {
        println!("{} {}", SCHEDULER_NAME, VERSION);
        return Ok(());
    }

    if opts.help_stats {
        stats::server_data().describe_meta(&mut std::io::stdout(), None)?;
        return Ok(());
    }

    let loglevel = if opts.verbose {
        simplelog::LevelFilter::Debug
    } else {
        simplelog::LevelFilter::Info
    };
    let mut lcfg = simplelog::ConfigBuilder::new();
    lcfg.set_time_level(simplelog::LevelFilter::Error)
        .set_location_level(simplelog::LevelFilter::Off)
        .set_target_level(simplelog::LevelFilter::Off)
        .set_thread_level(simplelog::LevelFilter::Off);
    simplelog::TermLogger::init(
        loglevel,
        lcfg.build(),
        simplelog::TerminalMode::Stderr,
        simplelog::ColorChoice::Auto,
    )?;

    match &opts.command {
        Some(Action::Start) => return cmd_start(&opts),
        Some(Action::Stop) => return cmd_stop(&opts),
        Some(Action::Status) => return cmd_status(&opts),
        None => {}
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    ctrlc::set_handler(move || {
        shutdown_clone.store(true, Ordering::Relaxed);
    })
    .context("Error setting Ctrl-C handler")?;

    if let Some(intv) = opts.monitor.or(opts.stats) {
        let shutdown_copy = shutdown.clone();
        let jh = std::thread::spawn(move || {
            match stats::monitor(Duration::from_secs_f64(intv), shutdown_copy) {
                Ok(_) => debug!("stats monitor thread finished successfully"),
                Err(err) => warn!("stats monitor thread finished because of an error {}", err),
            }
        });
        if opts.monitor.is_some() {
            let _ = jh.join();
            return Ok(());
        }
    }

    let mut sched = Scheduler::init(&opts)?;
    sched.run(shutdown)
}
