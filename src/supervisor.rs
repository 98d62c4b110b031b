//! The supervisor: keeps N worker processes alive, respawning any that
//! exit, with a strictly increasing peer id handed to every spawn.
//!
//! Children are real processes (the same executable in worker mode), not
//! threads, so a crashed worker never takes its siblings down.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::process::{Child, Command};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Pause between supervision passes.
pub const TICK: Duration = Duration::from_millis(250);

/// How to launch one worker. `args` carries the worker's full settings as
/// command-line flags; the supervisor appends the per-spawn peer id.
#[derive(Clone, Debug)]
pub struct ChildSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ChildSpec {
    fn command(&self, id: u64) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).arg("--worker-id").arg(id.to_string());
        cmd
    }
}

struct Slot {
    spec: ChildSpec,
    child: Option<Child>,
    id: u64,
}

pub struct Supervisor {
    slots: Vec<Slot>,
    next_id: u64,
}

impl Supervisor {
    /// `base_id` seeds the id sequence; every spawn takes the next id, so
    /// ids strictly increase across restarts of the same supervisor.
    pub fn new(specs: Vec<ChildSpec>, base_id: u64) -> Self {
        Supervisor {
            slots: specs
                .into_iter()
                .map(|spec| Slot {
                    spec,
                    child: None,
                    id: 0,
                })
                .collect(),
            next_id: base_id,
        }
    }

    /// One supervision pass: spawn every empty slot, reap every occupied
    /// one. A spawn failure is fatal; a stopped (not exited) child is left
    /// alone.
    fn tick(&mut self) -> Result<()> {
        for slot in &mut self.slots {
            match &mut slot.child {
                None => {
                    self.next_id += 1;
                    let id = self.next_id;

                    let child = slot
                        .spec
                        .command(id)
                        .spawn()
                        .with_context(|| format!("spawning worker {:?}", slot.spec.program))?;
                    info!(id, pid = child.id(), "worker spawned");

                    slot.id = id;
                    slot.child = Some(child);
                },
                Some(child) => match child.try_wait() {
                    Ok(Some(status)) => {
                        warn!(id = slot.id, %status, "worker exited; will respawn");
                        slot.child = None;
                    },
                    Ok(None) => {},
                    Err(error) => {
                        error!(id = slot.id, %error, "failed to poll worker");
                    },
                },
            }
        }

        Ok(())
    }

    /// Supervises until cancelled, then kills any remaining children.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        loop {
            self.tick()?;

            tokio::select! {
                _ = time::sleep(TICK) => {},
                _ = cancel.cancelled() => break,
            }
        }

        for slot in &mut self.slots {
            if let Some(child) = &mut slot.child {
                if let Err(error) = child.kill().await {
                    warn!(id = slot.id, %error, "failed to kill worker");
                }
            }
        }

        Ok(())
    }
}
