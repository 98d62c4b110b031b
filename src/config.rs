//! The configuration surface: one [`Settings`] value per worker, assembled
//! from built-in defaults, an optional YAML config file, and CLI flags.
//!
//! The supervisor re-serializes each worker's settings as command-line flags
//! when spawning, so workers never read the config file themselves.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::Level;

use crate::types::host::INFINITE;

/// Default announce/discovery port.
pub const DEFAULT_ANNOUNCE_PORT: u16 = 6660;

#[derive(Clone, Debug)]
pub struct Settings {
    pub memavail: u64,
    pub cpuavail: u64,
    pub timavail: u64,
    /// Engine idle timeout, seconds.
    pub timeout: u64,
    /// Log filter, 0 (everything) to 7 (fatal only).
    pub verbose: u8,
    /// Worker count in supervisor mode.
    pub number: usize,
    pub hostname: String,
    pub user: String,
    pub group: String,
    /// Engine launch command.
    pub matlab: String,
    pub allowhost: Vec<String>,
    pub allowuser: Vec<String>,
    pub allowgroup: Vec<String>,
    pub smartmem: bool,
    pub smartcpu: bool,
    pub smartshare: bool,
    /// TCP intake port; 0 = auto-assign.
    pub port: u16,
    /// UDS intake path; empty = per-worker default under the temp dir.
    pub socket: String,
    pub announce_addr: IpAddr,
    pub announce_port: u16,
    /// Upper bound on each of a job's argsize and optsize.
    pub max_job_size: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            memavail: INFINITE,
            cpuavail: INFINITE,
            timavail: INFINITE,
            timeout: 180,
            verbose: 4,
            number: 1,
            hostname: default_hostname(),
            user: default_user(),
            group: "unknown".into(),
            matlab: "matlab -nosplash -nodisplay".into(),
            allowhost: Vec::new(),
            allowuser: Vec::new(),
            allowgroup: Vec::new(),
            smartmem: false,
            smartcpu: false,
            smartshare: false,
            port: 0,
            socket: String::new(),
            announce_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            announce_port: DEFAULT_ANNOUNCE_PORT,
            max_job_size: 1 << 26,
        }
    }
}

fn default_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".into())
}

fn default_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "unknown".into())
}

impl Settings {
    /// The UDS path for a worker, defaulting under the temp dir when not
    /// configured.
    pub fn socket_path(&self, id: u64) -> PathBuf {
        if self.socket.is_empty() {
            std::env::temp_dir().join(format!("gridslave-{id}.sock"))
        } else {
            PathBuf::from(&self.socket)
        }
    }

    /// Re-serializes these settings as worker command-line flags, the shape
    /// the supervisor spawns children with.
    pub fn to_worker_args(&self) -> Vec<String> {
        fn flag(args: &mut Vec<String>, name: &str, value: impl ToString) {
            args.push(format!("--{name}"));
            args.push(value.to_string());
        }

        let mut args = Vec::new();
        flag(&mut args, "memavail", self.memavail);
        flag(&mut args, "cpuavail", self.cpuavail);
        flag(&mut args, "timavail", self.timavail);
        flag(&mut args, "timeout", self.timeout);
        flag(&mut args, "verbose", self.verbose);
        flag(&mut args, "hostname", &self.hostname);
        flag(&mut args, "user", &self.user);
        flag(&mut args, "group", &self.group);
        flag(&mut args, "matlab", &self.matlab);
        if !self.allowhost.is_empty() {
            flag(&mut args, "allowhost", self.allowhost.join(","));
        }
        if !self.allowuser.is_empty() {
            flag(&mut args, "allowuser", self.allowuser.join(","));
        }
        if !self.allowgroup.is_empty() {
            flag(&mut args, "allowgroup", self.allowgroup.join(","));
        }
        flag(&mut args, "smartmem", u8::from(self.smartmem));
        flag(&mut args, "smartcpu", u8::from(self.smartcpu));
        flag(&mut args, "smartshare", u8::from(self.smartshare));
        flag(&mut args, "port", self.port);
        if !self.socket.is_empty() {
            flag(&mut args, "socket", &self.socket);
        }
        flag(&mut args, "announce-addr", self.announce_addr);
        flag(&mut args, "announce-port", self.announce_port);
        flag(&mut args, "max-job-size", self.max_job_size);
        args
    }
}

/// One override section: any subset of the settings.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Overrides {
    pub memavail: Option<u64>,
    pub cpuavail: Option<u64>,
    pub timavail: Option<u64>,
    pub timeout: Option<u64>,
    pub verbose: Option<u8>,
    pub number: Option<usize>,
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub matlab: Option<String>,
    pub allowhost: Option<Vec<String>>,
    pub allowuser: Option<Vec<String>>,
    pub allowgroup: Option<Vec<String>>,
    pub smartmem: Option<bool>,
    pub smartcpu: Option<bool>,
    pub smartshare: Option<bool>,
    pub port: Option<u16>,
    pub socket: Option<String>,
    pub announce_addr: Option<IpAddr>,
    pub announce_port: Option<u16>,
    pub max_job_size: Option<u32>,
}

macro_rules! apply_field {
    ($self:ident, $settings:ident, $($field:ident),+ $(,)?) => {
        $(if let Some(v) = &$self.$field {
            $settings.$field = v.clone();
        })+
    };
}

impl Overrides {
    pub fn apply(&self, settings: &mut Settings) {
        apply_field!(
            self, settings, memavail, cpuavail, timavail, timeout, verbose, number, hostname,
            user, group, matlab, allowhost, allowuser, allowgroup, smartmem, smartcpu,
            smartshare, port, socket, announce_addr, announce_port, max_job_size,
        );
    }
}

/// The on-disk config file: shared defaults plus one section per worker.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub defaults: Overrides,
    #[serde(default)]
    pub peers: Vec<Overrides>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<ConfigFile> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {path:?}"))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing config file {path:?}"))
    }

    /// Expands into the per-worker settings list: one entry per `peers`
    /// section, or `number` copies of the defaults when no sections are
    /// given.
    pub fn workers(&self, base: &Settings) -> Vec<Settings> {
        let mut defaults = base.clone();
        self.defaults.apply(&mut defaults);

        if self.peers.is_empty() {
            return vec![defaults.clone(); defaults.number.max(1)];
        }

        self.peers
            .iter()
            .map(|o| {
                let mut s = defaults.clone();
                o.apply(&mut s);
                s
            })
            .collect()
    }
}

/// Maps the 0..7 verbosity knob onto a tracing level: 0 lets everything
/// through, 7 only what is effectively fatal.
pub fn verbose_level(verbose: u8) -> Level {
    match verbose {
        0 | 1 => Level::TRACE,
        2 | 3 => Level::DEBUG,
        4 => Level::INFO,
        5 => Level::WARN,
        _ => Level::ERROR,
    }
}
