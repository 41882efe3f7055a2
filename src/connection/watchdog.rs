use std::{sync::Arc, time::Duration};

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at, timeout},
};

use crate::{connection::GenerationGuard, transport::Socket};

/// Keep-alive probe for the socket of one generation.
///
/// Every `probe_interval` the watchdog pings the socket and waits `pong_timeout` for the pong. A
/// missing pong terminates the socket, which surfaces as a regular close to the controller.
#[derive(Debug)]
pub(crate) struct KeepAliveWatchdog {
    probe_interval: Duration,
    pong_timeout: Duration,
    pongs: Option<mpsc::UnboundedSender<()>>,
    task: Option<JoinHandle<()>>,
}

impl KeepAliveWatchdog {
    pub(crate) fn new(probe_interval: Duration, pong_timeout: Duration) -> Self {
        Self { probe_interval, pong_timeout, pongs: None, task: None }
    }

    /// Starts probing `socket`, replacing any previous probe.
    pub(crate) fn start<S: Socket>(&mut self, socket: Arc<S>, guard: GenerationGuard) {
        self.stop();
        let (pongs_tx, pongs_rx) = mpsc::unbounded_channel();
        self.pongs = Some(pongs_tx);
        self.task = Some(tokio::spawn(probe(
            socket,
            pongs_rx,
            guard,
            self.probe_interval,
            self.pong_timeout,
        )));
    }

    /// Records a pong from the probed socket.
    pub(crate) fn pong(&self) {
        if let Some(pongs) = &self.pongs {
            let _ = pongs.send(());
        }
    }

    /// Cancels the probe and any pending pong deadline. Safe to call repeatedly.
    pub(crate) fn stop(&mut self) {
        self.pongs = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for KeepAliveWatchdog {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn probe<S: Socket>(
    socket: Arc<S>,
    mut pongs: mpsc::UnboundedReceiver<()>,
    guard: GenerationGuard,
    probe_interval: Duration,
    pong_timeout: Duration,
) {
    let mut ticker = interval_at(Instant::now() + probe_interval, probe_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        // pongs answering an earlier probe don't count for this one
        while pongs.try_recv().is_ok() {}

        if !guard.is_current() {
            return;
        }

        if let Err(e) = socket.ping() {
            debug!(generation = guard.id(), error = %e, "Keep-alive probe not sent");
            return;
        }
        trace!(generation = guard.id(), "Keep-alive probe sent");

        match timeout(pong_timeout, pongs.recv()).await {
            Ok(Some(())) => trace!(generation = guard.id(), "Pong received"),
            Ok(None) => return,
            Err(_) => {
                if guard.is_current() {
                    warn!(
                        generation = guard.id(),
                        pong_timeout_ms = pong_timeout.as_millis(),
                        "No pong received, terminating socket"
                    );
                    socket.terminate();
                }
                return;
            }
        }
    }
}
