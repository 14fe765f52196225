//! The shard server event loop.
//!
//! A single-threaded cooperative loop drives the cluster transport, the
//! replication timers and storage job completions. Everything the quorum
//! context does runs on this task; worker threads only touch disk inside
//! storage jobs.

use std::time::{Duration, Instant};

use anyhow::{bail, Error};

use silo_replication::{ClusterTransport, IncomingMessage};

use crate::shard::ShardQuorum;

/// Monotonic millisecond clock for the replication state machines.
pub struct Clock {
    started: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

/// Fallback wakeup so lease acquisition and housekeeping never stall.
const IDLE_TICK_MS: u64 = 250;

pub struct Server {
    transport: ClusterTransport,
    quorum: ShardQuorum,
    clock: Clock,
}

impl Server {
    pub fn new(transport: ClusterTransport, quorum: ShardQuorum) -> Self {
        Self {
            transport,
            quorum,
            clock: Clock::new(),
        }
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn quorum_mut(&mut self) -> &mut ShardQuorum {
        &mut self.quorum
    }

    fn flush_sends(&mut self, now: u64) -> Result<(), Error> {
        for (to, payload) in self.quorum.pump(now)? {
            self.transport
                .send_quorum(to, self.quorum.quorum_id(), &payload);
        }
        Ok(())
    }

    pub async fn run(mut self) -> Result<(), Error> {
        let job_notify = self.quorum.storage().job_notifier();

        let now = self.clock.now_ms();
        self.quorum.tick(now)?;
        self.flush_sends(now)?;

        loop {
            if let Some(failure) = self.quorum.failure() {
                bail!("shard server failed: {}", failure);
            }

            let now = self.clock.now_ms();
            let sleep_ms = match self.quorum.next_timeout() {
                Some(at) if at > now => (at - now).min(IDLE_TICK_MS),
                Some(_) => 0,
                None => IDLE_TICK_MS,
            };

            tokio::select! {
                incoming = self.transport.recv() => {
                    let now = self.clock.now_ms();
                    match incoming {
                        Some(IncomingMessage::Quorum { quorum_id, payload, .. }) => {
                            if quorum_id != self.quorum.quorum_id() {
                                log::debug!("dropping frame for unknown quorum {}", quorum_id);
                            } else if let Err(err) = self.quorum.on_wire_message(&payload, now) {
                                log::warn!("{}", err);
                            }
                        }
                        Some(IncomingMessage::Cluster { from, .. }) => {
                            log::debug!("cluster control message from node {}", from);
                        }
                        None => bail!("cluster transport closed"),
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {
                    let now = self.clock.now_ms();
                    self.quorum.tick(now)?;
                }
                _ = job_notify.notified() => {
                    self.quorum.storage().poll_completions()?;
                }
                _ = tokio::signal::ctrl_c() => {
                    log::info!("shutting down");
                    return Ok(());
                }
            }

            let now = self.clock.now_ms();
            self.flush_sends(now)?;
        }
    }
}
