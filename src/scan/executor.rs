//! Parallel scan fan-out: one blocking worker-thread job per node, a shared
//! error latch, and an exactly-once completion signal.
//!
//! The worker pool is deliberately a plain `std::thread` pool rather than
//! tokio tasks: scan callbacks are user code that may block for
//! arbitrary amounts of time, and the original client never let that
//! blocking pressure the event loop that runs cluster tending.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cluster::Cluster;
use crate::error::{ClientError, Result};
use crate::node::Node;
use crate::scan::types::{ScanRecord, ScanRequest, TaskId};
use crate::scan::wire::{self, StreamEvent};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A bounded pool of blocking OS threads shared by every scan issued from
/// this process, shared across clusters.
struct ScanWorkerPool {
    sender: mpsc::Sender<Job>,
}

impl ScanWorkerPool {
    fn new(n_threads: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        for i in 0..n_threads.max(1) {
            let receiver = receiver.clone();
            thread::Builder::new()
                .name(format!("scan-worker-{i}"))
                .spawn(move || loop {
                    let job = {
                        let rx = receiver.lock().unwrap();
                        rx.recv()
                    };
                    match job {
                        Ok(job) => job(),
                        Err(_) => return,
                    }
                })
                .expect("failed to spawn scan worker thread");
        }
        Self { sender }
    }

    fn submit(&self, job: Job) {
        let _ = self.sender.send(job);
    }
}

static POOL: OnceLock<ScanWorkerPool> = OnceLock::new();

fn worker_pool(n_threads: usize) -> &'static ScanWorkerPool {
    POOL.get_or_init(|| ScanWorkerPool::new(n_threads))
}

/// A single-writer abort latch shared across every node job in one scan
/// invocation: the first fatal error or callback-requested abort wins, and
/// every other job's next read checks it cooperatively.
#[derive(Clone, Default)]
struct ErrorLatch {
    flag: Arc<AtomicBool>,
    error: Arc<Mutex<Option<ClientError>>>,
}

impl ErrorLatch {
    fn trip(&self, err: ClientError) {
        if !self.flag.swap(true, Ordering::AcqRel) {
            *self.error.lock().unwrap() = Some(err);
        }
    }

    fn is_tripped(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    fn take_error(&self) -> Option<ClientError> {
        self.error.lock().unwrap().take()
    }
}

/// Return value from a user scan callback: keep scanning, or stop this node
/// (and every other in-flight node in the same scan) immediately.
pub enum CallbackAction {
    Continue,
    Abort,
}

/// Executes `callback` once per record across every node holding a replica
/// of `req.namespace` (or a single node, via `scan_node`). Blocks the calling
/// thread until every node's stream ends or the scan is aborted.
///
/// `callback` receives `Some(record)` for every record streamed and exactly
/// one final `None` when the whole scan finishes without error or abort:
/// N records plus one sentinel iff the aggregate status is ok. An aborted or
/// failed scan never delivers the sentinel.
pub struct Executor;

impl Executor {
    /// Fans a scan out across every node in the cluster, honoring
    /// `req.concurrent_nodes`.
    pub fn scan_foreach(
        cluster: &Arc<Cluster>,
        req: &ScanRequest,
        callback: impl FnMut(Option<ScanRecord>) -> CallbackAction + Send + 'static,
    ) -> Result<()> {
        let nodes = cluster.nodes_snapshot();
        if nodes.is_empty() {
            return Err(ClientError::ClusterEmpty);
        }

        let latch = ErrorLatch::default();
        let task_id = TaskId::random();
        let callback = Arc::new(Mutex::new(callback));

        if req.concurrent_nodes {
            let pool = worker_pool(cluster.policy.scan_worker_threads);
            let (tx, rx) = mpsc::channel::<()>();
            for node in &nodes {
                let node = node.clone();
                let req = req.clone();
                let latch = latch.clone();
                let tx = tx.clone();
                let callback = callback.clone();
                pool.submit(Box::new(move || {
                    let result = run_node_scan(&node, &req, task_id, &latch, |rec| {
                        let mut cb = callback.lock().unwrap();
                        (*cb)(Some(rec))
                    });
                    if let Err(e) = result {
                        latch.trip(e);
                    }
                    let _ = tx.send(());
                }));
            }
            drop(tx);
            for _ in &nodes {
                let _ = rx.recv();
            }
        } else {
            for node in &nodes {
                if latch.is_tripped() {
                    break;
                }
                let callback = callback.clone();
                let result = run_node_scan(node, req, task_id, &latch, |rec| {
                    let mut cb = callback.lock().unwrap();
                    (*cb)(Some(rec))
                });
                if let Err(e) = result {
                    latch.trip(e);
                }
            }
        }

        finish(&latch, &callback)
    }

    /// Scans exactly one node, bypassing fan-out.
    pub fn scan_node(
        node: &Arc<Node>,
        req: &ScanRequest,
        callback: impl FnMut(Option<ScanRecord>) -> CallbackAction,
    ) -> Result<()> {
        let latch = ErrorLatch::default();
        let callback = Mutex::new(callback);
        let result = run_node_scan(node, req, TaskId::random(), &latch, |rec| {
            (*callback.lock().unwrap())(Some(rec))
        });
        if let Err(e) = result {
            latch.trip(e);
        }

        match latch.take_error() {
            None => {
                (*callback.lock().unwrap())(None);
                Ok(())
            }
            Some(ClientError::ClientAbort) | Some(ClientError::ScanAborted) => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Issues a background (UDF) scan: fire-and-forget, the server runs the
    /// UDF server-side and no record stream is read back beyond the
    /// single completion record.
    pub fn scan_background(cluster: &Arc<Cluster>, req: &ScanRequest) -> Result<TaskId> {
        if req.udf.is_none() {
            return Err(ClientError::InvalidParameter(
                "scan_background requires a udf call".into(),
            ));
        }
        let nodes = cluster.nodes_snapshot();
        if nodes.is_empty() {
            return Err(ClientError::ClusterEmpty);
        }
        let task_id = TaskId::random();
        let latch = ErrorLatch::default();
        for node in &nodes {
            run_node_scan(node, req, task_id, &latch, |_| CallbackAction::Continue)?;
        }
        Ok(task_id)
    }
}

/// Resolves the aggregate outcome of a (possibly fanned-out) scan and
/// delivers the sentinel-none callback exactly once, only on clean success.
fn finish(
    latch: &ErrorLatch,
    callback: &Arc<Mutex<impl FnMut(Option<ScanRecord>) -> CallbackAction + ?Sized>>,
) -> Result<()> {
    match latch.take_error() {
        None => {
            (*callback.lock().unwrap())(None);
            Ok(())
        }
        Some(ClientError::ClientAbort) | Some(ClientError::ScanAborted) => Ok(()),
        Some(e) => Err(e),
    }
}

/// Connects (blocking), sends the scan command, and reads frames until the
/// node signals end-of-stream, a protocol error, the shared latch trips, or
/// the callback requests abort.
fn run_node_scan(
    node: &Arc<Node>,
    req: &ScanRequest,
    task_id: TaskId,
    latch: &ErrorLatch,
    mut callback: impl FnMut(ScanRecord) -> CallbackAction,
) -> Result<()> {
    let endpoints = node.endpoints();
    let mut stream = blocking_connect(&endpoints)?;

    let max_namespace_len = node
        .cluster()
        .map(|c| c.policy.max_namespace_len)
        .unwrap_or_else(|| crate::policy::ClientPolicy::default().max_namespace_len);
    let command = wire::encode_scan_command(req, task_id, max_namespace_len)?;
    stream.write_all(&command)?;

    let header_len = wire::header_len();
    loop {
        if latch.is_tripped() {
            debug!(node = %node.name, "scan aborted by sibling node or latch");
            return Err(ClientError::ScanAborted);
        }

        let mut header = vec![0u8; header_len];
        if let Err(e) = stream.read_exact(&mut header) {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Ok(());
            }
            return Err(e.into());
        }
        let header: [u8; 8] = header.try_into().unwrap();
        let len = wire::decode_frame_header(&header);
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body)?;

        let events = wire::parse_frame_body(&req.namespace, &body)?;
        for event in events {
            match event {
                StreamEvent::Record(rec) => match callback(rec) {
                    CallbackAction::Continue => {}
                    CallbackAction::Abort => {
                        latch.trip(ClientError::ClientAbort);
                        return Err(ClientError::ClientAbort);
                    }
                },
                StreamEvent::End => return Ok(()),
            }
        }
    }
}

fn blocking_connect(endpoints: &[std::net::SocketAddr]) -> Result<TcpStream> {
    if endpoints.is_empty() {
        return Err(ClientError::InvalidParameter("node has no usable endpoints".into()));
    }
    for addr in endpoints {
        if let Ok(stream) = TcpStream::connect_timeout(addr, Duration::from_secs(1)) {
            let _ = stream.set_nodelay(true);
            let _ = stream.set_read_timeout(Some(Duration::from_secs(30)));
            return Ok(stream);
        }
    }
    warn!("scan could not connect to any endpoint");
    Err(ClientError::Transient)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::wire::INFO3_LAST;
    use std::net::TcpListener;
    use std::sync::atomic::AtomicUsize;

    fn spawn_record_server(records: usize) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let mut cmd_header = [0u8; 8];
            sock.read_exact(&mut cmd_header).unwrap();
            let len = wire::decode_frame_header(&cmd_header);
            let mut cmd_body = vec![0u8; len];
            sock.read_exact(&mut cmd_body).unwrap();

            let message = |result_code: u8, info_flags: u8, generation: u32| {
                let mut m = Vec::new();
                m.push(result_code);
                m.push(info_flags);
                m.push(0);
                m.push(0);
                m.extend_from_slice(&generation.to_be_bytes());
                m.extend_from_slice(&0u32.to_be_bytes());
                m.extend_from_slice(&0u32.to_be_bytes());
                m.extend_from_slice(&0u16.to_be_bytes());
                m.extend_from_slice(&0u16.to_be_bytes());
                m
            };

            let mut body = Vec::new();
            for i in 0..records {
                body.extend(message(0, 0, i as u32 + 1));
            }
            body.extend(message(0, INFO3_LAST, 0));

            let sz = body.len() as u64;
            let header = sz | (2u64 << 56) | (3u64 << 48);
            sock.write_all(&header.to_be_bytes()).unwrap();
            sock.write_all(&body).unwrap();
        });
        addr
    }

    fn test_node(addr: std::net::SocketAddr) -> Arc<Node> {
        Node::new(
            "n1".into(),
            vec![addr],
            std::sync::Weak::new(),
            &crate::policy::ClientPolicy::default(),
        )
    }

    #[test]
    fn scan_node_delivers_records_then_one_sentinel() {
        let addr = spawn_record_server(3);
        let node = test_node(addr);
        let req = ScanRequest {
            namespace: "test".into(),
            ..Default::default()
        };
        let records = Arc::new(AtomicUsize::new(0));
        let sentinels = Arc::new(AtomicUsize::new(0));
        let (r2, s2) = (records.clone(), sentinels.clone());
        Executor::scan_node(&node, &req, move |rec| {
            match rec {
                Some(_) => r2.fetch_add(1, Ordering::Relaxed),
                None => s2.fetch_add(1, Ordering::Relaxed),
            };
            CallbackAction::Continue
        })
        .unwrap();
        assert_eq!(records.load(Ordering::Relaxed), 3);
        assert_eq!(sentinels.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn scan_node_abort_suppresses_sentinel() {
        let addr = spawn_record_server(5);
        let node = test_node(addr);
        let req = ScanRequest {
            namespace: "test".into(),
            ..Default::default()
        };
        let records = Arc::new(AtomicUsize::new(0));
        let sentinels = Arc::new(AtomicUsize::new(0));
        let (r2, s2) = (records.clone(), sentinels.clone());
        Executor::scan_node(&node, &req, move |rec| match rec {
            Some(_) => {
                let n = r2.fetch_add(1, Ordering::Relaxed) + 1;
                if n == 2 {
                    CallbackAction::Abort
                } else {
                    CallbackAction::Continue
                }
            }
            None => {
                s2.fetch_add(1, Ordering::Relaxed);
                CallbackAction::Continue
            }
        })
        .unwrap();
        assert_eq!(records.load(Ordering::Relaxed), 2);
        assert_eq!(sentinels.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn error_latch_tripped_error_is_reported_once() {
        let latch = ErrorLatch::default();
        latch.trip(ClientError::Transient);
        latch.trip(ClientError::Timeout);
        assert!(matches!(latch.take_error(), Some(ClientError::Transient)));
        assert!(latch.take_error().is_none());
    }
}
