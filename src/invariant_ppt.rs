//! PPT invariant system: invariant enforcement with contract tracking.
//!
//! Scheduler-side code asserts invariants here; tests later check that the
//! invariants they depend on were actually exercised. Never call into this
//! module from the data path (queues, flags, software workers): it locks.
//! Without the `ppt` feature only the checks remain.

#[cfg(feature = "ppt")]
use lazy_static::lazy_static;
#[cfg(feature = "ppt")]
use std::collections::BTreeSet;
#[cfg(feature = "ppt")]
use std::sync::{Mutex, MutexGuard};

/// A granted context was free before and the device stays within its contexts.
pub const CONTEXT_BOUND: u32 = 1;
/// A grant's device (or component list) matches the requested primitive.
pub const PRIMITIVE_MATCH: u32 = 2;
/// A failed decomposition leaves the inventory bit-for-bit unchanged.
pub const COMPOSITE_ATOMIC: u32 = 3;
pub const RELEASE_FREES_CONTEXT: u32 = 4;
/// Accepted edges keep the graph acyclic and level-local.
pub const GRAPH_LEGALITY: u32 = 5;
pub const GRAPH_REJECTS_INVALID: u32 = 6;
/// Every non-binding edge gets exactly one channel.
pub const QUEUE_SINGLE_ALLOC: u32 = 7;
pub const BINDING_RESOLVES: u32 = 8;
/// The request slot changes hands only through DONE -> IDLE.
pub const HANDSHAKE_TURNAROUND: u32 = 9;
pub const PRIORITY_LIVE_UPDATE: u32 = 10;
pub const QUARANTINE_ENFORCED: u32 = 11;
/// A joined CPU worker has given its input channel back.
pub const FALLBACK_JOINED: u32 = 12;

#[cfg(feature = "ppt")]
lazy_static! {
    static ref ENFORCED: Mutex<BTreeSet<u32>> = Mutex::new(BTreeSet::new());
}

#[cfg(feature = "ppt")]
fn enforced() -> MutexGuard<'static, BTreeSet<u32>> {
    ENFORCED.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn failure(id: u32, message: &str, site: Option<&str>) -> String {
    match site {
        Some(site) => format!("invariant {} violated in {}: {}", id, site, message),
        None => format!("invariant {} violated: {}", id, message),
    }
}

/// Panic when `holds` is false; otherwise record `id` as enforced.
#[cfg(feature = "ppt")]
pub(crate) fn assert_invariant(id: u32, holds: bool, message: &str, site: Option<&str>) {
    if !holds {
        let text = failure(id, message, site);
        tracing::error!("{}", text);
        panic!("{}", text);
    }
    enforced().insert(id);
}

#[cfg(not(feature = "ppt"))]
pub(crate) fn assert_invariant(id: u32, holds: bool, message: &str, site: Option<&str>) {
    if !holds {
        panic!("{}", failure(id, message, site));
    }
}

/// Panic unless every id in `required` has been enforced at least once in
/// this process.
#[cfg(feature = "ppt")]
pub fn contract_test(test_name: &str, required: &[u32]) {
    let missing: Vec<u32> = {
        let log = enforced();
        required.iter().copied().filter(|id| !log.contains(id)).collect()
    };
    if !missing.is_empty() {
        panic!("contract '{}' never enforced invariants {:?}", test_name, missing);
    }
}

#[cfg(not(feature = "ppt"))]
pub fn contract_test(_test_name: &str, _required: &[u32]) {}

/// Forget every enforced invariant.
#[cfg(feature = "ppt")]
pub fn clear_invariant_log() {
    enforced().clear();
}

#[cfg(not(feature = "ppt"))]
pub fn clear_invariant_log() {}
