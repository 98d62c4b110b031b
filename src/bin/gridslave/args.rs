use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

use peergrid::config::{Overrides, Settings};

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// Path to a YAML config file describing one or more workers.
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Memory advertised to peers, bytes (default: unlimited).
    #[arg(long)]
    pub memavail: Option<u64>,
    /// CPU capacity advertised to peers (default: unlimited).
    #[arg(long)]
    pub cpuavail: Option<u64>,
    /// Wall time advertised to peers, seconds (default: unlimited).
    #[arg(long)]
    pub timavail: Option<u64>,
    /// Seconds the engine may sit idle before being closed.
    #[arg(long)]
    pub timeout: Option<u64>,
    /// Log filter: 0 lets everything through, 7 only fatal problems.
    #[arg(short, long)]
    pub verbose: Option<u8>,
    /// Number of workers to supervise.
    #[arg(short, long)]
    pub number: Option<usize>,
    /// Name announced to peers (default: the system hostname).
    #[arg(long)]
    pub hostname: Option<String>,
    /// User identity announced to peers.
    #[arg(long)]
    pub user: Option<String>,
    /// Group identity announced to peers.
    #[arg(long)]
    pub group: Option<String>,
    /// Engine launch command.
    #[arg(long)]
    pub matlab: Option<String>,
    /// Hosts allowed to submit jobs, comma-separated (default: all).
    #[arg(long, value_delimiter = ',')]
    pub allowhost: Option<Vec<String>>,
    /// Users allowed to submit jobs, comma-separated (default: all).
    #[arg(long, value_delimiter = ',')]
    pub allowuser: Option<Vec<String>>,
    /// Groups allowed to submit jobs, comma-separated (default: all).
    #[arg(long, value_delimiter = ',')]
    pub allowgroup: Option<Vec<String>>,
    /// Enables the adaptive memory advertisement policy (0/1).
    #[arg(long)]
    pub smartmem: Option<u8>,
    /// Enables the adaptive CPU advertisement policy (0/1).
    #[arg(long)]
    pub smartcpu: Option<u8>,
    /// Enables the master back-off policy (0/1).
    #[arg(long)]
    pub smartshare: Option<u8>,
    /// (TCP) port to accept jobs on (0 = auto-assign).
    #[arg(short, long)]
    pub port: Option<u16>,
    /// UDS path to accept local jobs on.
    #[arg(long)]
    pub socket: Option<String>,
    /// Announce/discovery address, broadcast or multicast.
    #[arg(long)]
    pub announce_addr: Option<IpAddr>,
    /// Announce/discovery port.
    #[arg(long)]
    pub announce_port: Option<u16>,
    /// Sets the maximum allowed size of a job's arg or opt blob.
    #[arg(short = 'z', long)]
    pub max_job_size: Option<u32>,
    /// Enables human-friendly logging.
    #[arg(short, long, default_value_t)]
    pub debug: bool,
    /// Internal: run as a single worker with this peer id.
    #[arg(long, hide = true)]
    pub worker_id: Option<u64>,
}

impl Args {
    fn overrides(&self) -> Overrides {
        Overrides {
            memavail: self.memavail,
            cpuavail: self.cpuavail,
            timavail: self.timavail,
            timeout: self.timeout,
            verbose: self.verbose,
            number: self.number,
            hostname: self.hostname.clone(),
            user: self.user.clone(),
            group: self.group.clone(),
            matlab: self.matlab.clone(),
            allowhost: self.allowhost.clone(),
            allowuser: self.allowuser.clone(),
            allowgroup: self.allowgroup.clone(),
            smartmem: self.smartmem.map(|v| v != 0),
            smartcpu: self.smartcpu.map(|v| v != 0),
            smartshare: self.smartshare.map(|v| v != 0),
            port: self.port,
            socket: self.socket.clone(),
            announce_addr: self.announce_addr,
            announce_port: self.announce_port,
            max_job_size: self.max_job_size,
        }
    }

    /// Built-in defaults with this invocation's flags applied.
    pub fn settings(&self) -> Settings {
        let mut settings = Settings::default();
        self.overrides().apply(&mut settings);
        settings
    }
}
