use std::io::Write;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;

use anyhow::Result;
use log::info;
use scx_stats::prelude::*;
use scx_stats_derive::stat_doc;
use scx_stats_derive::Stats;
use serde::Deserialize;
use serde::Serialize;

#[stat_doc]
#[derive(Clone, Debug, Default, Serialize, Deserialize, Stats)]
#[stat(top)]
pub struct Metrics {
    #[stat(desc = "Number of CPUs driving the policy")]
    pub nr_cpus: u64,
    #[stat(desc = "Amount of tasks currently tracked by the registry")]
    pub nr_tasks: u64,
    #[stat(desc = "Amount of tasks waiting in the run queue")]
    pub nr_queued: u64,
    #[stat(desc = "Number of dispatch decisions handed out")]
    pub nr_dispatches: u64,
    #[stat(desc = "Number of enqueue events processed")]
    pub nr_enqueues: u64,
    #[stat(desc = "Number of scheduler congestion events")]
    pub nr_sched_congested: u64,
}

impl Metrics {
    fn format<W: Write>(&self, w: &mut W) -> Result<()> {
        writeln!(
            w,
            "[{}] tasks -> t: {:>2} q: {:<2} | dispatch -> d: {:<5} e: {:<5} | cg: {:<5}",
            crate::SCHEDULER_NAME,
            self.nr_tasks,
            self.nr_queued,
            self.nr_dispatches,
            self.nr_enqueues,
            self.nr_sched_congested,
        )?;
        Ok(())
    }

    fn delta(&self, rhs: &Self) -> Self {
        Self {
            nr_dispatches: self.nr_dispatches - rhs.nr_dispatches,
            nr_enqueues: self.nr_enqueues - rhs.nr_enqueues,
            nr_sched_congested: self.nr_sched_congested - rhs.nr_sched_congested,
            ..self.clone()
        }
    }
}

pub fn server_data() -> StatsServerData<(), Metrics> {
    let open: Box<dyn StatsOpener<(), Metrics>> = Box::new(move |(req_ch, res_ch)| {
        req_ch.send(())?;
        let mut prev = res_ch.recv()?;

        let read: Box<dyn StatsReader<(), Metrics>> = Box::new(move |_args, (req_ch, res_ch)| {
            req_ch.send(())?;
            let cur = res_ch.recv()?;
            let delta = cur.delta(&prev);
            prev = cur;
            delta.to_json()
        });

        Ok(read)
    });

    StatsServerData::new()
        .add_meta(Metrics::meta())
        .add_ops("top", StatsOps { open, close: None })
}

pub fn monitor(intv: Duration, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut retry_cnt: u32 = 0;

    const RETRYABLE_ERRORS: [std::io::ErrorKind; 2] = [
        std::io::ErrorKind::NotFound,
        std::io::ErrorKind::ConnectionRefused,
    ];

    while !shutdown.load(Ordering::Relaxed) {
        let mut client = match StatsClient::new().connect() {
            Ok(v) => v,
            Err(e) => match e.downcast_ref::<std::io::Error>() {
                Some(ioe) if RETRYABLE_ERRORS.contains(&ioe.kind()) => {
                    if retry_cnt == 1 {
                        info!("Stats server not available, retrying...");
                    }
                    retry_cnt += 1;
                    sleep(Duration::from_secs(1));
                    continue;
                }
                _ => Err(e)?,
            },
        };
        retry_cnt = 0;

        while !shutdown.load(Ordering::Relaxed) {
            let metrics = match client.request::<Metrics>("stats", vec![]) {
                Ok(v) => v,
                Err(e) => {
                    info!("Connection to stats server failed ({e})");
                    sleep(Duration::from_secs(1));
                    break;
                }
            };
            metrics.format(&mut std::io::stdout())?;
            sleep(intv);
        }
    }

    Ok(())
}
