//! The slave loop: a single-task state machine that drains the job queue,
//! drives the engine, and mails results back to the submitting master.
//!
//! States are IDLE, BUSY, and ZOMBIE. The loop is the sole mutator of the
//! engine handle and of the host status; every status change is followed by
//! an announce kick after the host lock is released.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::outbound::{self, Target};
use crate::presence::AnnounceHandle;
use crate::registry::Registry;
use crate::types::host::{HostDescriptor, Status};
use crate::types::job::{CurrentJob, JobDef, JobEntry};
use crate::wire::cells::{Cell, CellList};

/// How long a failed engine start keeps the slave refusing work.
pub const ZOMBIE_TIMEOUT: Duration = Duration::from_secs(900);
/// An engine idle for longer than this is closed (config `timeout`).
pub const ENGINE_IDLE_TIMEOUT: Duration = Duration::from_secs(180);
/// Queue poll interval while there is nothing to do.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// The fixed expression evaluated for every job. `peerexec` implements the
/// in-engine watchdog, driven by the injected `timallow` option.
pub const EVAL_EXPR: &str = "[argout, options] = peerexec(argin, options)";

const ENGINE_START_MSG: &str = "could not start the matlab engine";

#[derive(Copy, Clone, Debug)]
pub struct SlaveTimeouts {
    pub engine_idle: Duration,
    pub zombie: Duration,
}

impl Default for SlaveTimeouts {
    fn default() -> Self {
        SlaveTimeouts {
            engine_idle: ENGINE_IDLE_TIMEOUT,
            zombie: ZOMBIE_TIMEOUT,
        }
    }
}

/// Which step of the engine exchange failed.
///
/// Evaluation and retrieval failures leave the engine in an unknown state,
/// so they abort the whole process; the supervisor restarts it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum JobFailure {
    PutArg = 1,
    PutOpt = 2,
    Eval = 3,
    GetArg = 4,
    GetOpt = 5,
}

impl JobFailure {
    fn step(self) -> u8 {
        self as u8
    }

    fn aborts(self) -> bool {
        matches!(self, JobFailure::Eval | JobFailure::GetArg | JobFailure::GetOpt)
    }

    fn message(self) -> &'static str {
        match self {
            JobFailure::PutArg => "failed to put argin into the engine",
            JobFailure::PutOpt => "failed to put options into the engine",
            JobFailure::Eval => "failed to evaluate peerexec in the engine",
            JobFailure::GetArg => "failed to get argout from the engine",
            JobFailure::GetOpt => "failed to get options from the engine",
        }
    }
}

pub struct Slave<E> {
    registry: Arc<Registry>,
    announce: AnnounceHandle,
    engine: E,
    engine_cmd: String,
    timeouts: SlaveTimeouts,
    engine_running: bool,
    engine_failed_at: Option<Instant>,
    engine_aborted: bool,
    last_job_finished_at: Instant,
}

impl<E: Engine> Slave<E> {
    pub fn new(
        registry: Arc<Registry>,
        announce: AnnounceHandle,
        engine: E,
        engine_cmd: String,
        timeouts: SlaveTimeouts,
    ) -> Self {
        Slave {
            registry,
            announce,
            engine,
            engine_cmd,
            timeouts,
            engine_running: false,
            engine_failed_at: None,
            engine_aborted: false,
            last_job_finished_at: Instant::now(),
        }
    }

    /// Runs until cancelled or the engine aborts; returns whether the engine
    /// aborted (in which case the process should exit non-zero and let the
    /// supervisor respawn it).
    pub async fn run(&mut self, cancel: &CancellationToken) -> bool {
        info!("slave loop running");

        while !self.engine_aborted && !cancel.is_cancelled() {
            self.tick().await;
        }

        if self.engine_running {
            if let Err(error) = self.engine.close().await {
                warn!(%error, "closing engine on shutdown");
            }
            self.engine_running = false;
        }

        self.engine_aborted
    }

    async fn tick(&mut self) {
        let now = Instant::now();

        // engine idle shutdown; peer-visible status is unaffected
        if self.engine_running
            && now.duration_since(self.last_job_finished_at) > self.timeouts.engine_idle
        {
            info!("closing idle engine");
            if let Err(error) = self.engine.close().await {
                warn!(%error, "closing idle engine");
            }
            self.engine_running = false;
        }

        // zombie: refuse work until the recovery timeout elapses
        if let Some(failed_at) = self.engine_failed_at {
            if now.duration_since(failed_at) > self.timeouts.zombie {
                info!("leaving zombie state");
                self.engine_failed_at = None;
                self.registry.update_host(|h| {
                    h.status = Status::Idle;
                    h.current = CurrentJob::default();
                });
                self.announce.kick();
            } else {
                time::sleep(IDLE_POLL).await;
                return;
            }
        }

        if self.registry.queue_len() == 0 {
            time::sleep(IDLE_POLL).await;
            return;
        }

        // the engine must be up before the job is taken
        if !self.engine_running {
            if let Err(error) = self.engine.open(&self.engine_cmd).await {
                error!(%error, "engine start failed");
                self.engine_failed_at = Some(Instant::now());
                self.registry.update_host(|h| h.status = Status::Zombie);
                self.announce.kick();

                // the waiting submitter still learns what happened
                if let Some(job) = self.registry.pop_job() {
                    let (argout, options) = lasterr_result(ENGINE_START_MSG);
                    self.deliver(&job, &argout, &options).await;
                }
                self.registry.clear_jobs();
                return;
            }
            self.engine_running = true;
        }

        let Some(job) = self.registry.pop_job() else {
            return;
        };
        self.run_job(job).await;
    }

    async fn run_job(&mut self, job: JobEntry) {
        let mut timallow = 0;
        self.registry.update_host(|h| {
            h.status = Status::Busy;
            h.current = CurrentJob {
                hostid: job.host.id,
                jobid: job.def.id,
                memreq: job.def.memreq,
                cpureq: job.def.cpureq,
                timreq: job.def.timreq,
                name: job.host.name.clone(),
                user: job.host.user.clone(),
                group: job.host.group.clone(),
            };
            timallow = job.def.timreq.saturating_mul(3).min(h.timavail);
        });
        self.announce.kick();

        debug!(job.id = job.def.id, masterid = job.host.id, timallow, "job started");

        // append the implicit options consumed by the in-engine watchdog
        let mut opts = CellList::decode_lossy(&job.opt);
        opts.push_str("masterid");
        opts.push_u64(job.host.id);
        opts.push_str("timallow");
        opts.push_u64(timallow);
        let opt_blob = opts.encode();

        let (argout, options) = match self.evaluate(&job.arg, &opt_blob).await {
            Ok(r) => r,
            Err(failure) => {
                warn!(step = failure.step(), job.id = job.def.id, "job failed");
                if failure.aborts() {
                    self.engine_aborted = true;
                }
                lasterr_result(failure.message())
            },
        };

        self.deliver(&job, &argout, &options).await;

        self.registry.clear_jobs();
        if !self.engine_aborted {
            self.registry.update_host(|h| {
                h.status = Status::Idle;
                h.current = CurrentJob::default();
            });
            self.announce.kick();
        }
        self.last_job_finished_at = Instant::now();
    }

    /// The five-step engine exchange; the first failing step wins.
    async fn evaluate(&mut self, arg: &[u8], opt: &[u8]) -> Result<(Bytes, Bytes), JobFailure> {
        fn note(failure: JobFailure) -> impl FnOnce(anyhow::Error) -> JobFailure {
            move |error| {
                warn!(%error, step = failure.step(), "engine step failed");
                failure
            }
        }

        self.engine
            .put("argin", arg)
            .await
            .map_err(note(JobFailure::PutArg))?;
        self.engine
            .put("options", opt)
            .await
            .map_err(note(JobFailure::PutOpt))?;
        self.engine
            .eval(EVAL_EXPR)
            .await
            .map_err(note(JobFailure::Eval))?;
        let argout = self
            .engine
            .get("argout")
            .await
            .map_err(note(JobFailure::GetArg))?;
        let options = self
            .engine
            .get("options")
            .await
            .map_err(note(JobFailure::GetOpt))?;

        Ok((argout, options))
    }

    /// Mails a result to the job's master, if it is still known; a vanished
    /// peer means the results are dropped and its watchdog cleans up.
    async fn deliver(&self, job: &JobEntry, argout: &[u8], options: &[u8]) {
        let Some(peer) = self.registry.find_peer(job.host.id) else {
            error!(masterid = job.host.id, "master no longer known; discarding results");
            return;
        };

        let me = self.registry.snapshot_host();
        let target = pick_target(&me, &peer.host, peer.ipaddr);
        let def = JobDef::result_for(job.def.id, argout.len() as u32, options.len() as u32);

        if let Err(error) = outbound::send_result(&target, &me, &def, argout, options).await {
            error!(%error, masterid = job.host.id, "failed to return results");
        }
    }
}

/// Prefers the local socket when the master lives on this host and offers
/// one, otherwise connects back over TCP.
fn pick_target(me: &HostDescriptor, master: &HostDescriptor, ipaddr: std::net::IpAddr) -> Target {
    #[cfg(unix)]
    if master.name == me.name && !master.socket.is_empty() {
        return Target::Uds(master.socket.clone().into());
    }

    Target::Tcp(SocketAddr::new(ipaddr, master.port))
}

/// Synthesizes the result pair reported for a failed job: a one-cell argout
/// and a two-cell `["lasterr", <message>]` options list.
fn lasterr_result(message: &str) -> (Bytes, Bytes) {
    let argout = CellList(vec![Cell::Bytes(Bytes::new())]).encode();

    let mut options = CellList::default();
    options.push_str("lasterr");
    options.push_str(message);

    (argout, options.encode())
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
    use tokio::net::TcpListener;

    use super::*;
    use crate::engine::mock::MockEngine;
    use crate::presence::announce_channel;
    use crate::types::host::HostDescriptor;
    use crate::types::policy::{AccessLists, SmartPolicies};
    use crate::wire::{self, frames, WIRE_VERSION};

    fn slave_host() -> HostDescriptor {
        HostDescriptor {
            id: 5,
            name: "slavehost".into(),
            user: "svc".into(),
            memavail: 1 << 20,
            cpuavail: 8,
            timavail: 100,
            ..Default::default()
        }
    }

    fn registry() -> Arc<Registry> {
        Arc::new(Registry::new(
            slave_host(),
            AccessLists::default(),
            SmartPolicies::default(),
        ))
    }

    fn master_desc(port: u16) -> HostDescriptor {
        HostDescriptor {
            id: 42,
            name: "masterhost".into(),
            user: "alice".into(),
            port,
            ..Default::default()
        }
    }

    fn job(master: &HostDescriptor, arg: &'static [u8], opt: Bytes) -> JobEntry {
        JobEntry {
            host: master.clone(),
            def: JobDef {
                version: WIRE_VERSION,
                id: 7,
                memreq: 1024,
                cpureq: 1,
                timreq: 10,
                argsize: arg.len() as u32,
                optsize: opt.len() as u32,
            },
            arg: Bytes::from_static(arg),
            opt,
        }
    }

    fn slave(reg: &Arc<Registry>, engine: MockEngine, timeouts: SlaveTimeouts) -> Slave<MockEngine> {
        let (handle, _kicks) = announce_channel();
        Slave::new(reg.clone(), handle, engine, "mock-engine".into(), timeouts)
    }

    async fn read_result(
        mut stream: impl AsyncRead + AsyncWrite + Unpin,
    ) -> (HostDescriptor, JobDef, Vec<u8>, Vec<u8>) {
        wire::send_handshake(&mut stream, true).await.unwrap();

        let mut buf = vec![0u8; frames::HOST_WIRE_LEN];
        stream.read_exact(&mut buf).await.unwrap();
        let host = frames::decode_host(&buf).unwrap();
        wire::send_handshake(&mut stream, true).await.unwrap();

        let mut buf = vec![0u8; frames::JOBDEF_WIRE_LEN];
        stream.read_exact(&mut buf).await.unwrap();
        let def = frames::decode_jobdef(&buf).unwrap();
        wire::send_handshake(&mut stream, true).await.unwrap();

        let mut arg = vec![0u8; def.argsize as usize];
        stream.read_exact(&mut arg).await.unwrap();
        wire::send_handshake(&mut stream, true).await.unwrap();

        let mut opt = vec![0u8; def.optsize as usize];
        stream.read_exact(&mut opt).await.unwrap();
        wire::send_handshake(&mut stream, true).await.unwrap();

        (host, def, arg, opt)
    }

    // Binds a one-shot master, registers it as a peer, and returns the
    // receiving task plus its descriptor.
    async fn spawn_master(
        reg: &Arc<Registry>,
    ) -> (
        tokio::task::JoinHandle<(HostDescriptor, JobDef, Vec<u8>, Vec<u8>)>,
        HostDescriptor,
    ) {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let desc = master_desc(port);

        reg.upsert_peer(
            desc.clone(),
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            Instant::now(),
        );

        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            read_result(stream).await
        });

        (task, desc)
    }

    #[tokio::test]
    async fn test_happy_path_roundtrip() {
        let reg = registry();
        let (master, desc) = spawn_master(&reg).await;

        let mut opt = CellList::default();
        opt.push_str("priority");
        opt.push_u64(1);
        reg.enqueue_job(job(&desc, b"\x01\x02\x03\x04\x05\x06\x07\x08", opt.encode()));

        let mut s = slave(&reg, MockEngine::default(), SlaveTimeouts::default());
        s.tick().await;

        let (host, def, argout, options) = master.await.unwrap();
        assert_eq!(host.id, 5);
        assert_eq!(def.id, 7);
        assert_eq!(argout, b"\x08\x07\x06\x05\x04\x03\x02\x01");

        // injected options sit at the end, in order, with timallow = 3*10
        let cells = CellList::decode(&options).unwrap();
        let n = cells.len();
        assert_eq!(cells.0[n - 4], Cell::Str("masterid".into()));
        assert_eq!(cells.0[n - 3], Cell::U64(42));
        assert_eq!(cells.0[n - 2], Cell::Str("timallow".into()));
        assert_eq!(cells.0[n - 1], Cell::U64(30));
        assert_eq!(cells.0[0], Cell::Str("priority".into()));

        assert_eq!(reg.status(), Status::Idle);
        assert!(reg.snapshot_host().current.is_none());
        assert_eq!(reg.queue_len(), 0);
        assert!(s.engine_running);
        assert!(!s.engine_aborted);
    }

    #[tokio::test]
    async fn test_timallow_clamped_by_timavail() {
        let reg = registry();
        let (master, desc) = spawn_master(&reg).await;

        let mut entry = job(&desc, b"x", Bytes::new());
        entry.def.timreq = 90; // 3*90 = 270, clamped to timavail = 100
        reg.enqueue_job(entry);

        let mut s = slave(&reg, MockEngine::default(), SlaveTimeouts::default());
        s.tick().await;

        let (_, _, _, options) = master.await.unwrap();
        let cells = CellList::decode(&options).unwrap();
        assert_eq!(cells.0[cells.len() - 1], Cell::U64(100));
    }

    #[tokio::test]
    async fn test_engine_start_failure_goes_zombie() {
        let reg = registry();
        let (master, desc) = spawn_master(&reg).await;
        reg.enqueue_job(job(&desc, b"x", Bytes::new()));

        let engine = MockEngine {
            fail_open: true,
            ..Default::default()
        };
        let mut s = slave(
            &reg,
            engine,
            SlaveTimeouts {
                zombie: Duration::from_millis(50),
                ..Default::default()
            },
        );
        s.tick().await;

        assert_eq!(reg.status(), Status::Zombie);
        assert!(s.engine_failed_at.is_some());
        assert!(!s.engine_aborted);
        assert_eq!(reg.queue_len(), 0);

        // the submitter is told why
        let (_, _, argout, options) = master.await.unwrap();
        assert_eq!(CellList::decode(&argout).unwrap().len(), 1);
        let cells = CellList::decode(&options).unwrap();
        assert_eq!(cells.0[0], Cell::Str("lasterr".into()));
        assert_eq!(
            cells.0[1],
            Cell::Str("could not start the matlab engine".into())
        );

        // zombie refuses work until the timeout, then recovers to idle
        reg.enqueue_job(job(&desc, b"y", Bytes::new()));
        s.tick().await;
        assert_eq!(reg.status(), Status::Zombie);
        reg.clear_jobs();

        time::sleep(Duration::from_millis(60)).await;
        s.tick().await;
        assert_eq!(reg.status(), Status::Idle);
    }

    #[tokio::test]
    async fn test_eval_failure_aborts_with_lasterr() {
        let reg = registry();
        let (master, desc) = spawn_master(&reg).await;
        reg.enqueue_job(job(&desc, b"x", Bytes::new()));

        let engine = MockEngine {
            fail_eval: true,
            ..Default::default()
        };
        let mut s = slave(&reg, engine, SlaveTimeouts::default());
        s.tick().await;

        assert!(s.engine_aborted);

        let (_, def, _, options) = master.await.unwrap();
        assert_eq!(def.id, 7);
        let cells = CellList::decode(&options).unwrap();
        assert_eq!(cells.0[0], Cell::Str("lasterr".into()));
        assert_eq!(
            cells.0[1],
            Cell::Str("failed to evaluate peerexec in the engine".into())
        );
    }

    #[tokio::test]
    async fn test_put_failure_does_not_abort() {
        let reg = registry();
        let (master, desc) = spawn_master(&reg).await;
        reg.enqueue_job(job(&desc, b"x", Bytes::new()));

        let engine = MockEngine {
            fail_put: true,
            ..Default::default()
        };
        let mut s = slave(&reg, engine, SlaveTimeouts::default());
        s.tick().await;

        assert!(!s.engine_aborted);
        assert_eq!(reg.status(), Status::Idle);

        let (_, _, _, options) = master.await.unwrap();
        let cells = CellList::decode(&options).unwrap();
        assert_eq!(
            cells.0[1],
            Cell::Str("failed to put argin into the engine".into())
        );
    }

    #[tokio::test]
    async fn test_missing_peer_discards_results() {
        let reg = registry();
        // master never announced: no peer entry
        reg.enqueue_job(job(&master_desc(1), b"x", Bytes::new()));

        let mut s = slave(&reg, MockEngine::default(), SlaveTimeouts::default());
        s.tick().await;

        assert_eq!(reg.status(), Status::Idle);
        assert_eq!(reg.queue_len(), 0);
        assert!(!s.engine_aborted);
    }

    #[tokio::test]
    async fn test_idle_engine_closes_after_timeout() {
        let reg = registry();
        let mut s = slave(
            &reg,
            MockEngine::default(),
            SlaveTimeouts {
                engine_idle: Duration::from_millis(20),
                ..Default::default()
            },
        );

        s.engine.open("mock-engine").await.unwrap();
        s.engine_running = true;

        time::sleep(Duration::from_millis(40)).await;
        s.tick().await;

        assert!(!s.engine_running);
        assert!(!s.engine.opened);
        // closing the engine is invisible to peers
        assert_eq!(reg.status(), Status::Idle);
    }

    #[test]
    fn test_uds_preferred_for_local_master() {
        let me = slave_host();

        let mut local = master_desc(7000);
        local.name = me.name.clone();
        local.socket = "/tmp/master.sock".into();
        let target = pick_target(&me, &local, IpAddr::V4(Ipv4Addr::LOCALHOST));
        #[cfg(unix)]
        assert!(matches!(target, Target::Uds(p) if p.to_str() == Some("/tmp/master.sock")));
        #[cfg(not(unix))]
        assert!(matches!(target, Target::Tcp(_)));

        let remote = master_desc(7000);
        assert!(matches!(
            pick_target(&me, &remote, IpAddr::V4(Ipv4Addr::LOCALHOST)),
            Target::Tcp(addr) if addr.port() == 7000
        ));
    }
}
