use std::collections::HashSet;

use super::host::HostDescriptor;

/// Intake-time access control.
///
/// Each list is consulted independently; an empty list allows everyone for
/// that dimension, so a default-constructed value admits all submitters.
#[derive(Clone, Debug, Default)]
pub struct AccessLists {
    pub allowuser: HashSet<String>,
    pub allowhost: HashSet<String>,
    pub allowgroup: HashSet<String>,
}

impl AccessLists {
    pub fn from_lists(
        allowuser: &[String],
        allowhost: &[String],
        allowgroup: &[String],
    ) -> Self {
        AccessLists {
            allowuser: allowuser.iter().cloned().collect(),
            allowhost: allowhost.iter().cloned().collect(),
            allowgroup: allowgroup.iter().cloned().collect(),
        }
    }

    /// Whether a submitter presenting this descriptor may enqueue jobs here.
    pub fn permits(&self, host: &HostDescriptor) -> bool {
        fn ok(list: &HashSet<String>, value: &str) -> bool {
            list.is_empty() || list.contains(value)
        }

        ok(&self.allowuser, &host.user)
            && ok(&self.allowhost, &host.name)
            && ok(&self.allowgroup, &host.group)
    }
}

/// One adaptive policy toggle. Lifetime = process; flipped only at startup.
#[derive(Copy, Clone, Debug)]
pub struct SmartPolicy {
    pub enabled: bool,
    pub param: u64,
}

impl Default for SmartPolicy {
    fn default() -> Self {
        SmartPolicy {
            enabled: false,
            param: 0,
        }
    }
}

/// The process-wide policy switches.
///
/// * `smartmem`: while busy, shrink the advertised `memavail` by the running
///   job's `memreq`.
/// * `smartcpu`: while busy, advertise `cpuavail` of zero.
/// * `smartshare`: refuse a second job from the same master within `param`
///   milliseconds, nudging masters towards idle slaves.
#[derive(Clone, Debug, Default)]
pub struct SmartPolicies {
    pub smartmem: SmartPolicy,
    pub smartcpu: SmartPolicy,
    pub smartshare: SmartPolicy,
}

impl SmartPolicies {
    /// Default back-off window for `smartshare`, in milliseconds.
    pub const SHARE_WINDOW_MS: u64 = 500;

    pub fn from_flags(smartmem: bool, smartcpu: bool, smartshare: bool) -> Self {
        SmartPolicies {
            smartmem: SmartPolicy {
                enabled: smartmem,
                param: 0,
            },
            smartcpu: SmartPolicy {
                enabled: smartcpu,
                param: 0,
            },
            smartshare: SmartPolicy {
                enabled: smartshare,
                param: Self::SHARE_WINDOW_MS,
            },
        }
    }
}
