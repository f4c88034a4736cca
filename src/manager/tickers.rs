use super::Shared;
use crate::config::IntervalMs;
use crate::storage::{PopulationStore, TableError};
use crate::supervisor::AgentHandle;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use rand::Rng;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Background loops of the controller. Dropping the stop sender wakes every
/// loop out of its sleep.
pub(crate) struct Tickers {
    stop: Option<Sender<()>>,
    threads: Vec<JoinHandle<()>>,
}

impl Tickers {
    pub(crate) fn spawn<S, H>(shared: Arc<Shared<S, H>>) -> io::Result<Self>
    where
        S: PopulationStore + 'static,
        H: AgentHandle + 'static,
    {
        let (stop, stopped) = channel::bounded::<()>(0);
        let mut threads = Vec::with_capacity(3);

        let growth = Arc::clone(&shared);
        let growth_interval = shared.config.growth_interval;
        threads.push(every(
            "growth",
            stopped.clone(),
            move || random_delay(growth_interval),
            move || {
                if let Err(err) = grow_once(&growth) {
                    warn!(error = %err, "grass growth failed");
                }
            },
        )?);

        let drought = Arc::clone(&shared);
        let drought_period = shared.config.drought_period();
        threads.push(every(
            "drought",
            stopped.clone(),
            move || drought_period,
            move || {
                let ticks = drought.config.drought_ticks;
                *drought.drought.lock() = ticks;
                info!(ticks, "drought started");
            },
        )?);

        let reaper_interval = shared.config.reaper_interval();
        threads.push(every(
            "reaper",
            stopped,
            move || reaper_interval,
            move || {
                if let Err(err) = shared.sweep() {
                    warn!(error = %err, "reaper pass failed");
                }
            },
        )?);

        Ok(Self {
            stop: Some(stop),
            threads,
        })
    }

    pub(crate) fn stop(&mut self) {
        drop(self.stop.take());
        for thread in self.threads.drain(..) {
            if thread.join().is_err() {
                warn!("ticker thread panicked");
            }
        }
    }
}

impl Drop for Tickers {
    fn drop(&mut self) {
        self.stop();
    }
}

fn every(
    name: &str,
    stopped: Receiver<()>,
    mut delay: impl FnMut() -> Duration + Send + 'static,
    mut work: impl FnMut() + Send + 'static,
) -> io::Result<JoinHandle<()>> {
    let label = name.to_string();
    thread::Builder::new().name(label.clone()).spawn(move || {
        loop {
            match stopped.recv_timeout(delay()) {
                Err(RecvTimeoutError::Timeout) => work(),
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(ticker = %label, "ticker stopped");
    })
}

fn random_delay(interval: IntervalMs) -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(interval.range()))
}

/// One growth tick: skipped (and counted down) while a drought is active,
/// otherwise one grass unit up to the resource limit. Returns whether grass
/// grew.
pub fn grow_once<S, H>(shared: &Shared<S, H>) -> Result<bool, TableError>
where
    S: PopulationStore,
{
    {
        let mut remaining = shared.drought.lock();
        if *remaining > 0 {
            *remaining -= 1;
            debug!(remaining = *remaining, "growth suspended by drought");
            return Ok(false);
        }
    }

    let limit = shared.config.resource_limit;
    shared.store.with_table(|view| -> Result<bool, TableError> {
        let current = view.resource_count()?;
        if current >= limit {
            return Ok(false);
        }
        view.set_resource_count(current + 1)?;
        debug!(grass = current + 1, "grass grew");
        Ok(true)
    })
}
