//! The process-wide shared state: self descriptor, peer table, job queue,
//! access lists, and policy switches.
//!
//! Each aggregate has its own mutex, and every method takes exactly one of
//! them for a short critical section. Nothing here blocks: callers snapshot
//! what they need under the lock and do their I/O after release. The locks
//! are std (not tokio) mutexes since they are never held across an `.await`.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::types::host::{HostDescriptor, Status};
use crate::types::job::JobEntry;
use crate::types::peer::PeerEntry;
use crate::types::policy::{AccessLists, SmartPolicies};

pub struct Registry {
    host: Mutex<HostDescriptor>,
    peers: Mutex<Vec<PeerEntry>>,
    jobs: Mutex<VecDeque<JobEntry>>,
    access: Mutex<AccessLists>,
    smart: Mutex<SmartState>,
}

struct SmartState {
    policies: SmartPolicies,
    /// Master id and acceptance time of the most recently accepted job, for
    /// the smartshare back-off window.
    last_accept: Option<(u64, Instant)>,
}

impl Registry {
    pub fn new(host: HostDescriptor, access: AccessLists, policies: SmartPolicies) -> Self {
        Registry {
            host: Mutex::new(host),
            peers: Mutex::new(Vec::new()),
            jobs: Mutex::new(VecDeque::new()),
            access: Mutex::new(access),
            smart: Mutex::new(SmartState {
                policies,
                last_accept: None,
            }),
        }
    }

    // host descriptor

    pub fn update_host(&self, f: impl FnOnce(&mut HostDescriptor)) {
        f(&mut self.host.lock().unwrap());
    }

    pub fn snapshot_host(&self) -> HostDescriptor {
        self.host.lock().unwrap().clone()
    }

    pub fn status(&self) -> Status {
        self.host.lock().unwrap().status
    }

    /// The descriptor as it should be announced: the smartmem and smartcpu
    /// policies shade the advertised resources while a job is running.
    pub fn advertised_host(&self) -> HostDescriptor {
        let mut host = self.snapshot_host();
        let smart = self.smart.lock().unwrap();

        if host.status == Status::Busy {
            if smart.policies.smartmem.enabled {
                host.memavail = host.memavail.saturating_sub(host.current.memreq);
            }
            if smart.policies.smartcpu.enabled {
                host.cpuavail = 0;
            }
        }

        host
    }

    // job queue

    pub fn enqueue_job(&self, job: JobEntry) {
        self.jobs.lock().unwrap().push_back(job);
    }

    pub fn pop_job(&self) -> Option<JobEntry> {
        self.jobs.lock().unwrap().pop_front()
    }

    pub fn queue_len(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn clear_jobs(&self) {
        self.jobs.lock().unwrap().clear();
    }

    // peer table

    /// Looks a peer up by host id, returning a snapshot.
    pub fn find_peer(&self, hostid: u64) -> Option<PeerEntry> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.host.id == hostid)
            .cloned()
    }

    /// Inserts or refreshes a peer entry, keyed by `(id, name)`.
    pub fn upsert_peer(&self, host: HostDescriptor, ipaddr: IpAddr, now: Instant) {
        let mut peers = self.peers.lock().unwrap();

        match peers.iter_mut().find(|p| p.host.same_identity(&host)) {
            Some(entry) => {
                entry.host = host;
                entry.ipaddr = ipaddr;
                entry.lastseen = now;
            },
            None => peers.push(PeerEntry {
                host,
                ipaddr,
                lastseen: now,
            }),
        }
    }

    /// Drops entries not seen for longer than `expiry`. Idempotent; returns
    /// the number of evicted peers.
    pub fn sweep_peers(&self, now: Instant, expiry: Duration) -> usize {
        let mut peers = self.peers.lock().unwrap();
        let before = peers.len();
        peers.retain(|p| now.duration_since(p.lastseen) <= expiry);
        before - peers.len()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    // access policy

    pub fn access_allows(&self, submitter: &HostDescriptor) -> bool {
        self.access.lock().unwrap().permits(submitter)
    }

    /// The smartshare gate: refuses a submitter whose master id was accepted
    /// within the back-off window. Always permits when the policy is off.
    pub fn smartshare_permits(&self, masterid: u64, now: Instant) -> bool {
        let smart = self.smart.lock().unwrap();
        let policy = smart.policies.smartshare;

        if !policy.enabled {
            return true;
        }

        match smart.last_accept {
            Some((id, at)) if id == masterid => {
                now.duration_since(at) > Duration::from_millis(policy.param)
            },
            _ => true,
        }
    }

    /// Records an accepted job for the smartshare window.
    pub fn note_accepted(&self, masterid: u64, now: Instant) {
        self.smart.lock().unwrap().last_accept = Some((masterid, now));
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::types::job::JobDef;
    use crate::types::policy::SmartPolicy;

    fn registry() -> Registry {
        Registry::new(
            HostDescriptor::default(),
            AccessLists::default(),
            SmartPolicies::default(),
        )
    }

    fn job(id: u64) -> JobEntry {
        JobEntry {
            host: HostDescriptor::default(),
            def: JobDef {
                id,
                ..Default::default()
            },
            arg: Bytes::new(),
            opt: Bytes::new(),
        }
    }

    fn peer(id: u64, name: &str) -> HostDescriptor {
        HostDescriptor {
            id,
            name: name.into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_job_queue_fifo() {
        let r = registry();
        r.enqueue_job(job(1));
        r.enqueue_job(job(2));
        r.enqueue_job(job(3));

        assert_eq!(r.queue_len(), 3);
        assert_eq!(r.pop_job().unwrap().def.id, 1);
        assert_eq!(r.pop_job().unwrap().def.id, 2);
        r.clear_jobs();
        assert!(r.pop_job().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_upsert_and_sweep() {
        let r = registry();
        let ip: IpAddr = "192.0.2.1".parse().unwrap();

        r.upsert_peer(peer(1, "a"), ip, Instant::now());
        r.upsert_peer(peer(2, "b"), ip, Instant::now());

        tokio::time::advance(Duration::from_secs(30)).await;

        // same (id, name) refreshes in place
        r.upsert_peer(peer(1, "a"), ip, Instant::now());
        // same id, different name is a distinct peer
        r.upsert_peer(peer(1, "c"), ip, Instant::now());
        assert_eq!(r.peer_count(), 3);

        tokio::time::advance(Duration::from_secs(45)).await;

        // Only peer 2 is stale: 1/"a" and 1/"c" were seen at t=30.
        let expiry = Duration::from_secs(60);
        assert_eq!(r.sweep_peers(Instant::now(), expiry), 1);
        assert_eq!(r.peer_count(), 2);
        assert!(r.find_peer(2).is_none());

        // sweeping again evicts nothing
        assert_eq!(r.sweep_peers(Instant::now(), expiry), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_smartshare_window() {
        let r = Registry::new(
            HostDescriptor::default(),
            AccessLists::default(),
            SmartPolicies {
                smartshare: SmartPolicy {
                    enabled: true,
                    param: 500,
                },
                ..Default::default()
            },
        );

        assert!(r.smartshare_permits(42, Instant::now()));
        r.note_accepted(42, Instant::now());

        // inside the window: same master refused, others fine
        assert!(!r.smartshare_permits(42, Instant::now()));
        assert!(r.smartshare_permits(43, Instant::now()));

        tokio::time::advance(Duration::from_millis(600)).await;
        assert!(r.smartshare_permits(42, Instant::now()));
    }

    #[test]
    fn test_advertised_host_shading() {
        let r = Registry::new(
            HostDescriptor {
                memavail: 1000,
                cpuavail: 4,
                ..Default::default()
            },
            AccessLists::default(),
            SmartPolicies::from_flags(true, true, false),
        );

        // idle: advertised as configured
        assert_eq!(r.advertised_host().memavail, 1000);
        assert_eq!(r.advertised_host().cpuavail, 4);

        r.update_host(|h| {
            h.status = Status::Busy;
            h.current.memreq = 300;
        });

        let adv = r.advertised_host();
        assert_eq!(adv.memavail, 700);
        assert_eq!(adv.cpuavail, 0);
        // the real descriptor is untouched
        assert_eq!(r.snapshot_host().memavail, 1000);
    }
}
