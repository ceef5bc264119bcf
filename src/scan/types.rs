//! Scan request/record types.

use std::collections::HashMap;

/// A single record returned by a scan: its key digest, generation, and bin
/// values.
#[derive(Debug, Clone)]
pub struct ScanRecord {
    pub namespace: String,
    pub set_name: String,
    pub generation: u32,
    pub bins: HashMap<String, Vec<u8>>,
}

/// What a scan operation iterates over and how.
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub namespace: String,
    pub set_name: Option<String>,
    pub bin_names: Vec<String>,
    pub concurrent_nodes: bool,
    /// `true` requests only key digests, no bin data.
    pub no_bins: bool,
    /// Scan-percentage knob (1-100), the second scan-options byte.
    pub scan_pct: u8,
    /// Priority, packed into the high nibble of the first scan-options byte.
    pub priority: u8,
    /// Abort the scan if the cluster's partition map changes mid-flight.
    pub fail_on_cluster_change: bool,
    pub udf: Option<UdfCall>,
}

impl Default for ScanRequest {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            set_name: None,
            bin_names: Vec::new(),
            concurrent_nodes: true,
            no_bins: false,
            scan_pct: 100,
            priority: 0,
            fail_on_cluster_change: false,
            udf: None,
        }
    }
}

/// A background-scan UDF invocation: package, function, and pre-encoded
/// argument blob.
#[derive(Debug, Clone)]
pub struct UdfCall {
    pub package_name: String,
    pub function_name: String,
    pub args: Vec<u8>,
}

/// A 63-bit scan task id. The high bit is always clear so it round-trips
/// cleanly through the wire protocol's unsigned 8-byte task-id field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub u64);

impl TaskId {
    pub fn random() -> Self {
        use rand::RngCore;
        let raw = rand::thread_rng().next_u64();
        Self(raw & 0x7FFF_FFFF_FFFF_FFFF)
    }
}
