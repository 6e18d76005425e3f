//! The worker pool and ready-queue scheduler.
//!
//! Frame evaluation is demand driven: a root request enters the ready queue,
//! a worker picks it up and runs the node's filter, and any upstream frames
//! the filter declares become child requests that re-enter the same queue.
//! The queue is ordered by `(request order, insertion order)` so independent
//! external requests drain in a weak FIFO while a single request may still
//! fan out into many parallel upstream fetches.
//!
//! Per-node admission enforces the filter's declared concurrency policy, and
//! a scheduler-wide in-flight map coalesces concurrent requests for the same
//! `(node, output, n)` onto one computation.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

use crate::context::{DeliveredKey, FrameContext};
use crate::core::MessageLevel;
use crate::frames::{Frame, MediaType};
use crate::node::{ActivationReason, FilterMode, Node};
use crate::Error;

/// Completion callback of a root request.
pub(crate) type DoneCallback = Box<dyn FnOnce(std::result::Result<Arc<Frame>, Error>) + Send>;

/// Internal result type threaded through completion: the error side carries
/// the first latched error message.
type FrameResult = std::result::Result<Arc<Frame>, String>;

enum Notify {
    /// A downstream request waiting on this one.
    Parent(Arc<FrameRequest>),
    /// An external completion callback (root requests).
    Done { callback: DoneCallback, lock_output: bool },
}

struct RequestState {
    reason: ActivationReason,
    delivered: HashMap<DeliveredKey, Arc<Frame>>,
    frame_data: Option<Box<dyn Any + Send>>,
    /// First latched upstream error message.
    error: Option<String>,
    dependents: Vec<Notify>,
}

/// One in-flight frame computation: the scheduler-side activation record for
/// `(node, output, n)`.
pub(crate) struct FrameRequest {
    node: Arc<Node>,
    output: usize,
    n: i32,
    /// Root request order, inherited by every child.
    order: u64,
    /// Whether this request was created by an external `start` call.
    is_root: bool,
    /// Unresolved upstream requests.
    pending: AtomicUsize,
    state: Mutex<RequestState>,
}

type QueueKey = (u64, u64);
type InflightKey = (u64, usize, i32);

struct PoolState {
    queue: BTreeMap<QueueKey, Arc<FrameRequest>>,
    inflight: HashMap<InflightKey, Arc<FrameRequest>>,
    /// Frames already produced on behalf of each live root request, so late
    /// sibling subtrees reuse them instead of re-entering the filter. This is
    /// what makes production at-most-once per root request; the map is
    /// dropped when its root completes.
    root_results: HashMap<u64, HashMap<InflightKey, FrameResult>>,
    threads: usize,
    max_threads: usize,
    /// Extra worker slots opened by `reserve_thread`.
    reserved: usize,
    /// Workers currently running a filter pass.
    active: usize,
    /// Workers parked on the work condvar.
    idle: usize,
    stop: bool,
    next_order: u64,
    next_seq: u64,
    handles: Vec<JoinHandle<()>>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    work: Condvar,
    done: Condvar,
    /// Serializes root callbacks requested with `lock_output`.
    output_lock: Mutex<()>,
}

/// The core's worker pool.
pub(crate) struct ThreadPool {
    shared: Arc<PoolShared>,
}

impl ThreadPool {
    pub(crate) fn new() -> Self {
        let max_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        ThreadPool {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    queue: BTreeMap::new(),
                    inflight: HashMap::new(),
                    root_results: HashMap::new(),
                    threads: 0,
                    max_threads,
                    reserved: 0,
                    active: 0,
                    idle: 0,
                    stop: false,
                    next_order: 0,
                    next_seq: 0,
                    handles: Vec::new(),
                }),
                work: Condvar::new(),
                done: Condvar::new(),
                output_lock: Mutex::new(()),
            }),
        }
    }

    pub(crate) fn thread_count(&self) -> usize {
        self.shared.state.lock().max_threads
    }

    pub(crate) fn set_thread_count(&self, count: usize) -> usize {
        let mut ps = self.shared.state.lock();
        ps.max_threads = count.max(1);
        ps.max_threads
    }

    /// Enters a root request into the scheduler. The callback fires exactly
    /// once, with the produced frame or the first error latched anywhere in
    /// the request's dependency tree.
    pub(crate) fn start(
        &self,
        node: Arc<Node>,
        output: usize,
        n: i32,
        callback: DoneCallback,
        lock_output: bool,
    ) {
        let mut ps = self.shared.state.lock();
        let order = ps.next_order;
        ps.next_order += 1;
        let key = (node.id, output, n);
        if let Some(existing) = ps.inflight.get(&key) {
            existing
                .state
                .lock()
                .dependents
                .push(Notify::Done { callback, lock_output });
            return;
        }
        let req = Arc::new(FrameRequest {
            node,
            output,
            n,
            order,
            is_root: true,
            pending: AtomicUsize::new(0),
            state: Mutex::new(RequestState {
                reason: ActivationReason::Initial,
                delivered: HashMap::new(),
                frame_data: None,
                error: None,
                dependents: vec![Notify::Done { callback, lock_output }],
            }),
        });
        ps.inflight.insert(key, req.clone());
        enqueue_locked(&self.shared, &mut ps, req);
    }

    /// Hands the calling worker's slot back to the pool while the filter
    /// blocks on external work. Must be paired with
    /// [`release_thread`](Self::release_thread).
    pub(crate) fn reserve_thread(&self) {
        let mut ps = self.shared.state.lock();
        ps.reserved += 1;
        if !ps.queue.is_empty() {
            spawn_worker_if_needed(&self.shared, &mut ps);
            self.shared.work.notify_one();
        }
    }

    /// Restores a slot taken with [`reserve_thread`](Self::reserve_thread).
    pub(crate) fn release_thread(&self) {
        let mut ps = self.shared.state.lock();
        ps.reserved = ps.reserved.saturating_sub(1);
    }

    /// Blocks until no request is queued, running, or suspended.
    pub(crate) fn wait_for_done(&self) {
        let mut ps = self.shared.state.lock();
        while !(ps.queue.is_empty() && ps.active == 0 && ps.inflight.is_empty()) {
            self.shared.done.wait(&mut ps);
        }
    }

    pub(crate) fn shutdown(&self) {
        let handles = {
            let mut ps = self.shared.state.lock();
            ps.stop = true;
            self.shared.work.notify_all();
            mem::take(&mut ps.handles)
        };
        // The shutdown can be triggered from a worker (a callback dropping
        // the last core handle); that thread must not join itself and will
        // exit on its own through the stop flag.
        let current = std::thread::current().id();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

fn enqueue_locked(shared: &Arc<PoolShared>, ps: &mut PoolState, req: Arc<FrameRequest>) {
    let seq = ps.next_seq;
    ps.next_seq += 1;
    ps.queue.insert((req.order, seq), req);
    spawn_worker_if_needed(shared, ps);
    shared.work.notify_one();
}

fn spawn_worker_if_needed(shared: &Arc<PoolShared>, ps: &mut PoolState) {
    if ps.idle == 0 && ps.threads < ps.max_threads + ps.reserved {
        ps.threads += 1;
        let shared = shared.clone();
        ps.handles.push(std::thread::spawn(move || worker_main(shared)));
    }
}

/// Whether a queued request may enter its node right now under the node's
/// filter mode. ParallelRequests needs no check here: in-flight coalescing
/// guarantees a single request per `(node, n)`, and a request runs on at
/// most one worker.
fn admissible(req: &FrameRequest) -> bool {
    match req.node.mode {
        FilterMode::Parallel | FilterMode::ParallelRequests => true,
        FilterMode::Unordered => !req.node.running.load(Ordering::SeqCst),
        FilterMode::FrameState => {
            if req.node.running.load(Ordering::SeqCst) {
                return false;
            }
            let serial = req.node.serial_frame.load(Ordering::SeqCst);
            serial == -1 || serial == req.n
        }
    }
}

fn admit(req: &FrameRequest) {
    match req.node.mode {
        FilterMode::Unordered => req.node.running.store(true, Ordering::SeqCst),
        FilterMode::FrameState => {
            req.node.running.store(true, Ordering::SeqCst);
            req.node.serial_frame.store(req.n, Ordering::SeqCst);
        }
        _ => {}
    }
}

fn worker_main(shared: Arc<PoolShared>) {
    let mut ps = shared.state.lock();
    loop {
        if ps.stop {
            break;
        }
        let key = ps
            .queue
            .iter()
            .find(|(_, req)| admissible(req))
            .map(|(key, _)| *key);
        let Some(key) = key else {
            if ps.queue.is_empty() && ps.active == 0 && ps.inflight.is_empty() {
                shared.done.notify_all();
            }
            ps.idle += 1;
            shared.work.wait(&mut ps);
            ps.idle -= 1;
            continue;
        };
        let req = ps.queue.remove(&key).expect("queued request present");
        admit(&req);
        ps.active += 1;
        drop(ps);

        run_request(&shared, &req);

        ps = shared.state.lock();
        ps.active -= 1;
        if ps.queue.is_empty() && ps.active == 0 && ps.inflight.is_empty() {
            shared.done.notify_all();
        }
    }
    ps.threads -= 1;
}

/// Runs one activation pass of a request's filter and dispatches on the
/// outcome: produced frame, suspension, or error.
fn run_request(shared: &Arc<PoolShared>, req: &Arc<FrameRequest>) {
    let core = req.node.core.clone();
    let (reason, delivered, frame_data) = {
        let mut st = req.state.lock();
        (st.reason, mem::take(&mut st.delivered), st.frame_data.take())
    };

    let mut ctx = FrameContext::new(req.output, req.n, &delivered, frame_data);
    let result = req
        .node
        .filter()
        .get_frame(req.n, reason, &mut ctx, &core);

    // The filter has left; serialized nodes become admissible again.
    match req.node.mode {
        FilterMode::Unordered | FilterMode::FrameState => {
            req.node.running.store(false, Ordering::SeqCst);
            shared.work.notify_one();
        }
        _ => {}
    }

    let staged = mem::take(&mut ctx.staged);
    let frame_data = ctx.frame_data.take();
    drop(ctx);
    {
        let mut st = req.state.lock();
        st.delivered = delivered;
        st.frame_data = frame_data;
    }

    match result {
        Ok(Some(frame)) => {
            validate_output(req, &frame);
            complete_request(shared, req, Ok(frame));
        }
        Err(e) => complete_request(shared, req, Err(e.to_string())),
        Ok(None) => match reason {
            ActivationReason::Initial if !staged.is_empty() => {
                register_upstream(shared, req, staged);
            }
            ActivationReason::Error => {
                let msg = req
                    .state
                    .lock()
                    .error
                    .clone()
                    .unwrap_or_else(|| "upstream filter failed".to_owned());
                complete_request(shared, req, Err(msg));
            }
            _ => core.fatal(&format!(
                "filter {} returned no frame and no error for frame {}",
                req.node.name, req.n
            )),
        },
    }

    if core.memory().over_limit() {
        core.notify_caches(true);
    }
}

/// Registers the upstream frames a filter declared in its Initial pass.
/// Frames already produced for this root request are delivered on the spot;
/// the rest coalesce onto in-flight computations or become new child
/// requests.
fn register_upstream(
    shared: &Arc<PoolShared>,
    req: &Arc<FrameRequest>,
    staged: Vec<(Arc<Node>, usize, i32)>,
) {
    let mut unique: Vec<(Arc<Node>, usize, i32)> = Vec::with_capacity(staged.len());
    for (node, output, n) in staged {
        if !unique
            .iter()
            .any(|(un, uo, um)| un.id == node.id && *uo == output && *um == n)
        {
            unique.push((node, output, n));
        }
    }

    let mut ps = shared.state.lock();

    let mut resolved: Vec<(InflightKey, FrameResult)> = Vec::new();
    let mut outstanding: Vec<(Arc<Node>, usize, i32)> = Vec::new();
    match ps.root_results.get(&req.order) {
        Some(produced) => {
            for (node, output, n) in unique {
                let key = (node.id, output, n);
                match produced.get(&key) {
                    Some(result) => resolved.push((key, result.clone())),
                    None => outstanding.push((node, output, n)),
                }
            }
        }
        None => outstanding = unique,
    }

    if !resolved.is_empty() {
        let mut st = req.state.lock();
        for (key, result) in resolved {
            match result {
                Ok(frame) => {
                    st.delivered.insert(key, frame);
                }
                Err(msg) => {
                    if st.error.is_none() {
                        st.error = Some(msg);
                    }
                }
            }
        }
        if outstanding.is_empty() {
            st.reason = if st.error.is_some() {
                ActivationReason::Error
            } else {
                ActivationReason::AllReady
            };
        }
    }
    if outstanding.is_empty() {
        let req = req.clone();
        enqueue_locked(shared, &mut ps, req);
        return;
    }

    // Set before any child can possibly complete; completion needs this lock.
    req.pending.store(outstanding.len(), Ordering::SeqCst);
    for (node, output, n) in outstanding {
        let key = (node.id, output, n);
        if let Some(child) = ps.inflight.get(&key) {
            child.state.lock().dependents.push(Notify::Parent(req.clone()));
            continue;
        }
        let child = Arc::new(FrameRequest {
            node,
            output,
            n,
            order: req.order,
            is_root: false,
            pending: AtomicUsize::new(0),
            state: Mutex::new(RequestState {
                reason: ActivationReason::Initial,
                delivered: HashMap::new(),
                frame_data: None,
                error: None,
                dependents: vec![Notify::Parent(req.clone())],
            }),
        });
        ps.inflight.insert(key, child.clone());
        enqueue_locked(shared, &mut ps, child);
    }
}

/// Finishes a request: delivers the result to every dependent, re-enqueues
/// parents whose pending count reached zero, and fires root callbacks.
fn complete_request(shared: &Arc<PoolShared>, req: &Arc<FrameRequest>, result: FrameResult) {
    let mut callbacks: Vec<(DoneCallback, bool)> = Vec::new();
    let result = {
        let mut ps = shared.state.lock();
        ps.inflight.remove(&(req.node.id, req.output, req.n));
        if req.node.mode == FilterMode::FrameState {
            req.node.serial_frame.store(-1, Ordering::SeqCst);
            shared.work.notify_all();
        }

        // Latch the failure, keeping the first error message seen by this
        // request as the canonical one delivered downstream.
        let (result, dependents) = {
            let mut st = req.state.lock();
            if let Err(msg) = &result {
                if st.error.is_none() {
                    st.error = Some(msg.clone());
                }
            }
            let result = match result {
                Ok(frame) => Ok(frame),
                Err(_) => Err(st.error.clone().expect("error latched above")),
            };
            (result, mem::take(&mut st.dependents))
        };

        // Record the production for every root request whose tree this
        // computation served, so later siblings in those trees reuse it.
        let key = (req.node.id, req.output, req.n);
        let mut orders = vec![req.order];
        for dep in &dependents {
            if let Notify::Parent(parent) = dep {
                if !orders.contains(&parent.order) {
                    orders.push(parent.order);
                }
            }
        }
        for order in orders {
            ps.root_results
                .entry(order)
                .or_default()
                .insert(key, result.clone());
        }
        if req.is_root {
            ps.root_results.remove(&req.order);
        }

        for dep in dependents {
            match dep {
                Notify::Parent(parent) => {
                    {
                        let mut pst = parent.state.lock();
                        match &result {
                            Ok(frame) => {
                                pst.delivered
                                    .insert((req.node.id, req.output, req.n), frame.clone());
                            }
                            Err(msg) => {
                                if pst.error.is_none() {
                                    pst.error = Some(msg.clone());
                                }
                            }
                        }
                    }
                    if parent.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                        {
                            let mut pst = parent.state.lock();
                            pst.reason = if pst.error.is_some() {
                                ActivationReason::Error
                            } else {
                                ActivationReason::AllReady
                            };
                        }
                        enqueue_locked(shared, &mut ps, parent);
                    }
                }
                Notify::Done {
                    callback,
                    lock_output,
                } => callbacks.push((callback, lock_output)),
            }
        }
        result
    };

    for (callback, lock_output) in callbacks {
        let delivered = result.clone().map_err(Error::Filter);
        if lock_output {
            let _serialized = shared.output_lock.lock();
            callback(delivered);
        } else {
            callback(delivered);
        }
    }
}

/// Checks a produced frame against the node's declared output descriptor.
/// Any mismatch, or guard corruption, is a filter-protocol violation and
/// therefore fatal.
fn validate_output(req: &FrameRequest, frame: &Frame) {
    let core = &req.node.core;
    let name = &req.node.name;
    match req.node.media_type() {
        MediaType::Video => {
            let Some(vf) = frame.video_format() else {
                core.fatal(&format!(
                    "filter {name} returned an audio frame from a video output"
                ));
            };
            let vi = req
                .node
                .video_info(req.output)
                .expect("video node has video info");
            if vi.format.color_family != crate::ColorFamily::Undefined && *vf != vi.format {
                core.fatal(&format!(
                    "filter {name} returned a frame that's not of the declared format"
                ));
            }
            if (vi.width != 0 || vi.height != 0)
                && (frame.width() != vi.width || frame.height() != vi.height)
            {
                core.fatal(&format!(
                    "filter {name} declared the size {}x{} but returned a frame of size {}x{}",
                    vi.width,
                    vi.height,
                    frame.width(),
                    frame.height()
                ));
            }
        }
        MediaType::Audio => {
            let Some(af) = frame.audio_format() else {
                core.fatal(&format!(
                    "filter {name} returned a video frame from an audio output"
                ));
            };
            let ai = req
                .node
                .audio_info(req.output)
                .expect("audio node has audio info");
            if *af != ai.format {
                core.fatal(&format!(
                    "filter {name} returned a frame that's not of the declared format"
                ));
            }
            let expected = ai.frame_samples(req.n);
            if frame.num_samples() != expected {
                core.fatal(&format!(
                    "filter {name} returned an audio frame with {} samples but {expected} were expected from the declared length",
                    frame.num_samples()
                ));
            }
        }
    }
    if !frame.verify_guard_pattern() {
        core.log_message(
            MessageLevel::Fatal,
            &format!("guard memory corrupted in frame {} returned from {name}", req.n),
        );
    }
}
