//! The engine façade: owns the memory pool, format registry, worker pool,
//! plugin table, and message-handler chain.
//!
//! A [`Core`] is a cheap clonable handle; the underlying state lives until
//! the last handle (including the ones held internally by every node) drops.
//! Frames may outlive the core — they only borrow the memory pool, which
//! frees itself once the last payload is gone.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use num_enum::{IntoPrimitive, TryFromPrimitive};
use parking_lot::Mutex;

use crate::completion::Completion;
use crate::format::FormatRegistry;
use crate::frames::Frame;
use crate::memory::MemoryPool;
use crate::node::{node_flags, AudioInfo, Filter, FilterMode, Node, NodeRef, OutputInfo, VideoInfo};
use crate::plugin::{FunctionFrame, Plugin, PluginLoader};
use crate::props::PropertyMap;
use crate::scheduler::{DoneCallback, ThreadPool};
use crate::{
    AudioFormat, ColorFamily, Error, Result, SampleType, VideoFormat, API_MAJOR,
};

/// Severity of a core diagnostic message.
///
/// `Fatal` messages invoke every registered handler and then terminate the
/// process.
#[derive(Debug, TryFromPrimitive, IntoPrimitive, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum MessageLevel {
    Debug = 0,
    Information = 1,
    Warning = 2,
    Critical = 3,
    Fatal = 4,
}

/// A registered message handler callback.
pub type MessageHandler = Box<dyn Fn(MessageLevel, &str) + Send + Sync>;

/// Handle returned by [`Core::add_message_handler`], used to remove it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHandlerId(u64);

/// Creation flags for [`Core::new`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreFlags {
    /// Hosts that drive plugin auto-loading should skip it when set.
    pub disable_auto_loading: bool,
    /// Record creation-function chains on every node for graph inspection.
    pub enable_graph_inspection: bool,
}

/// A snapshot of core configuration and resource use.
#[derive(Debug, Clone)]
pub struct CoreInfo {
    pub version: &'static str,
    pub api_major: i32,
    pub api_minor: i32,
    pub num_threads: usize,
    pub max_framebuffer_size: usize,
    pub used_framebuffer_size: usize,
}

pub(crate) struct CoreInner {
    flags: CoreFlags,
    memory: Arc<MemoryPool>,
    formats: FormatRegistry,
    pool: ThreadPool,
    plugins: Mutex<Vec<Arc<Plugin>>>,
    handlers: Mutex<Vec<(u64, MessageHandler)>>,
    next_handler_id: AtomicU64,
    caches: Mutex<Vec<Weak<Node>>>,
    function_frame: Mutex<Option<Arc<FunctionFrame>>>,
    filter_instances: AtomicUsize,
}

/// Shared handle to an engine instance.
///
/// # Examples
///
/// ```
/// use frameflow::{Core, CoreFlags};
///
/// let core = Core::new(CoreFlags::default());
/// let std_plugin = core.plugin_by_namespace("std").expect("built-in plugin");
/// assert_eq!(std_plugin.id(), "com.frameflow.std");
/// ```
#[derive(Clone)]
pub struct Core {
    pub(crate) inner: Arc<CoreInner>,
}

/// Terminates the process over an unrecoverable invariant violation in a
/// context with no core at hand (allocation failure, corrupted buffer
/// header).
pub(crate) fn fatal_error(msg: &str) -> ! {
    tracing::error!(target: "frameflow", "{msg}");
    eprintln!("frameflow encountered a fatal error: {msg}");
    std::process::abort();
}

impl Core {
    /// Builds a core: memory pool, format registry, worker pool, and the
    /// built-in `std` plugin.
    pub fn new(flags: CoreFlags) -> Core {
        let core = Core {
            inner: Arc::new(CoreInner {
                flags,
                memory: Arc::new(MemoryPool::new()),
                formats: FormatRegistry::new(),
                pool: ThreadPool::new(),
                plugins: Mutex::new(Vec::new()),
                handlers: Mutex::new(Vec::new()),
                next_handler_id: AtomicU64::new(1),
                caches: Mutex::new(Vec::new()),
                function_frame: Mutex::new(None),
                filter_instances: AtomicUsize::new(0),
            }),
        };
        crate::stdlib::register_std_plugin(&core)
            .expect("built-in plugin registers cleanly");
        core
    }

    pub fn info(&self) -> CoreInfo {
        CoreInfo {
            version: env!("CARGO_PKG_VERSION"),
            api_major: API_MAJOR,
            api_minor: 0,
            num_threads: self.inner.pool.thread_count(),
            max_framebuffer_size: self.inner.memory.limit(),
            used_framebuffer_size: self.inner.memory.used(),
        }
    }

    // ----- memory -----

    pub(crate) fn memory(&self) -> &MemoryPool {
        &self.inner.memory
    }

    /// Current frame-buffer bytes in use.
    pub fn memory_used(&self) -> usize {
        self.inner.memory.used()
    }

    /// Peak frame-buffer use over the core's lifetime.
    pub fn memory_peak(&self) -> usize {
        self.inner.memory.peak()
    }

    /// The soft memory cap.
    pub fn memory_limit(&self) -> usize {
        self.inner.memory.limit()
    }

    /// Adjusts the soft memory cap; returns the value in effect.
    pub fn set_memory_limit(&self, bytes: usize) -> usize {
        self.inner.memory.set_limit(bytes)
    }

    /// Enables or disables the large-page allocation strategy.
    pub fn set_large_pages(&self, enabled: bool) {
        self.inner.memory.set_large_pages(enabled)
    }

    // ----- threads -----

    /// The worker-pool size.
    pub fn thread_count(&self) -> usize {
        self.inner.pool.thread_count()
    }

    /// Resizes the worker pool; returns the size in effect.
    pub fn set_thread_count(&self, count: usize) -> usize {
        self.inner.pool.set_thread_count(count)
    }

    /// Temporarily hands the calling worker's slot back to the pool so a
    /// filter can block on external work without starving the scheduler.
    /// Pair with [`release_thread`](Core::release_thread).
    pub fn reserve_thread(&self) {
        self.inner.pool.reserve_thread()
    }

    /// Restores a slot taken with [`reserve_thread`](Core::reserve_thread).
    pub fn release_thread(&self) {
        self.inner.pool.release_thread()
    }

    // ----- formats -----

    /// Validates and canonicalizes a video format into the registry.
    pub fn query_video_format(
        &self,
        color_family: ColorFamily,
        sample_type: SampleType,
        bits_per_sample: u32,
        sub_sampling_w: u32,
        sub_sampling_h: u32,
    ) -> Result<VideoFormat> {
        let format = VideoFormat::new(
            color_family,
            sample_type,
            bits_per_sample,
            sub_sampling_w,
            sub_sampling_h,
        )?;
        self.inner.formats.register(format);
        Ok(format)
    }

    /// Rebuilds a video format from its packed id and registers it.
    pub fn video_format_by_id(&self, id: u32) -> Result<VideoFormat> {
        let format = VideoFormat::from_id(id)?;
        self.inner.formats.register(format);
        Ok(format)
    }

    /// Validates and canonicalizes an audio format.
    pub fn query_audio_format(
        &self,
        sample_type: SampleType,
        bits_per_sample: u32,
        channel_layout: u64,
    ) -> Result<AudioFormat> {
        AudioFormat::new(sample_type, bits_per_sample, channel_layout)
    }

    /// Display name of a video format.
    pub fn video_format_name(&self, format: &VideoFormat) -> String {
        format.name()
    }

    /// Display name of an audio format.
    pub fn audio_format_name(&self, format: &AudioFormat) -> String {
        format.name()
    }

    /// Every registered video format, in registration order.
    pub fn enumerate_video_formats(&self) -> Vec<Arc<VideoFormat>> {
        self.inner.formats.enumerate()
    }

    // ----- frames -----

    /// Allocates a new video frame, optionally copying properties from a
    /// template frame.
    pub fn new_video_frame(
        &self,
        format: VideoFormat,
        width: i32,
        height: i32,
        prop_src: Option<&Frame>,
    ) -> Frame {
        Frame::new_video(format, width, height, prop_src, &self.inner.memory)
    }

    /// Allocates a new video frame reusing plane payloads from existing
    /// frames; `plane_src[i]` gives the source frame and source plane for
    /// output plane `i`, `None` allocates fresh.
    pub fn new_video_frame_from_planes(
        &self,
        format: VideoFormat,
        width: i32,
        height: i32,
        plane_src: [Option<(&Frame, usize)>; 3],
        prop_src: Option<&Frame>,
    ) -> Frame {
        Frame::new_video_from_planes(format, width, height, plane_src, prop_src, &self.inner.memory)
    }

    /// Allocates a new audio frame of up to [`FRAME_SAMPLES`](crate::FRAME_SAMPLES)
    /// samples.
    pub fn new_audio_frame(
        &self,
        format: AudioFormat,
        num_samples: i32,
        prop_src: Option<&Frame>,
    ) -> Frame {
        Frame::new_audio(format, num_samples, prop_src, &self.inner.memory)
    }

    /// Cheap frame copy; plane payloads are shared.
    pub fn copy_frame(&self, frame: &Frame) -> Frame {
        frame.copy()
    }

    // ----- filters -----

    /// Instantiates a video filter node and returns one reference per
    /// declared output.
    pub fn create_video_filter(
        &self,
        name: &str,
        video_info: Vec<VideoInfo>,
        filter: Box<dyn Filter>,
        mode: FilterMode,
        flags: u32,
    ) -> Result<Vec<NodeRef>> {
        let node = Node::new(
            name,
            OutputInfo::Video(video_info),
            filter,
            mode,
            flags,
            API_MAJOR,
            self,
        )?;
        Ok(Self::refs_for(node))
    }

    /// Instantiates an audio filter node and returns one reference per
    /// declared output.
    pub fn create_audio_filter(
        &self,
        name: &str,
        audio_info: Vec<AudioInfo>,
        filter: Box<dyn Filter>,
        mode: FilterMode,
        flags: u32,
    ) -> Result<Vec<NodeRef>> {
        let node = Node::new(
            name,
            OutputInfo::Audio(audio_info),
            filter,
            mode,
            flags,
            API_MAJOR,
            self,
        )?;
        Ok(Self::refs_for(node))
    }

    fn refs_for(node: Arc<Node>) -> Vec<NodeRef> {
        (0..node.outputs.len())
            .map(|index| NodeRef {
                node: node.clone(),
                index,
            })
            .collect()
    }

    /// Number of live filter instances.
    pub fn num_filter_instances(&self) -> usize {
        self.inner.filter_instances.load(Ordering::Relaxed)
    }

    pub(crate) fn register_node(&self, node: &Arc<Node>) {
        self.inner.filter_instances.fetch_add(1, Ordering::Relaxed);
        if node.flags & node_flags::IS_CACHE != 0 {
            self.inner.caches.lock().push(Arc::downgrade(node));
        }
    }

    pub(crate) fn node_destroyed(&self) {
        self.inner.filter_instances.fetch_sub(1, Ordering::Relaxed);
    }

    /// Asks every cache filter to trim (or grow) its retained frames.
    pub(crate) fn notify_caches(&self, needs_memory: bool) {
        let caches: Vec<Arc<Node>> = {
            let mut caches = self.inner.caches.lock();
            caches.retain(|weak| weak.strong_count() > 0);
            caches.iter().filter_map(Weak::upgrade).collect()
        };
        for node in caches {
            node.filter().notify_cache(needs_memory);
        }
    }

    // ----- frame requests -----

    /// Synchronously evaluates frame `n` of a node, blocking until the
    /// scheduler delivers it.
    ///
    /// Must not be called from inside a filter: a filter that needs upstream
    /// frames declares them through
    /// [`FrameContext::request_frame`](crate::FrameContext::request_frame),
    /// and a filter blocked on external work should bracket the wait with
    /// [`reserve_thread`](Core::reserve_thread) /
    /// [`release_thread`](Core::release_thread).
    pub fn get_frame(&self, node: &NodeRef, n: i32) -> Result<Arc<Frame>> {
        let completion = Arc::new(Completion::new());
        let signal = completion.clone();
        self.request_frame_internal(node, n, false, Box::new(move |result| signal.signal(result)));
        completion.wait()
    }

    /// Asynchronously evaluates frame `n` of a node. The callback fires
    /// exactly once, on a worker thread.
    pub fn get_frame_async(
        &self,
        node: &NodeRef,
        n: i32,
        callback: impl FnOnce(Result<Arc<Frame>>) + Send + 'static,
    ) {
        self.request_frame_internal(node, n, false, Box::new(callback));
    }

    /// Like [`get_frame_async`](Core::get_frame_async), but callbacks are
    /// serialized under a single output lock so external consumers observe a
    /// total order of completions.
    pub fn get_frame_async_ordered(
        &self,
        node: &NodeRef,
        n: i32,
        callback: impl FnOnce(Result<Arc<Frame>>) + Send + 'static,
    ) {
        self.request_frame_internal(node, n, true, Box::new(callback));
    }

    fn request_frame_internal(
        &self,
        node: &NodeRef,
        n: i32,
        lock_output: bool,
        callback: DoneCallback,
    ) {
        let num_frames = node.num_frames();
        if n < 0 || n >= num_frames {
            callback(Err(Error::FrameNumber { n, num_frames }));
            return;
        }
        self.inner
            .pool
            .start(node.node.clone(), node.index, n, callback, lock_output);
    }

    // ----- plugins -----

    /// Whether plugin auto-loading was left enabled at creation. The core
    /// itself performs no path discovery; hosts consult this before driving
    /// [`load_all_in_path`](Core::load_all_in_path).
    pub fn auto_loading_enabled(&self) -> bool {
        !self.inner.flags.disable_auto_loading
    }

    /// Loads one plugin module through the loader and registers it.
    pub fn load_plugin(
        &self,
        loader: &dyn PluginLoader,
        path: &str,
        forced_namespace: Option<&str>,
        forced_id: Option<&str>,
        alt_search_path: bool,
    ) -> Result<Arc<Plugin>> {
        let init = loader.load(path, alt_search_path)?;
        let plugin = Arc::new(Plugin::new(self, forced_namespace, forced_id));
        plugin.set_filename(path);
        init.init(&plugin, self)?;
        if !plugin.is_configured() {
            return Err(Error::Plugin(format!(
                "module {path} did not configure its plugin"
            )));
        }
        if plugin.lock_after_init() {
            plugin.lock();
        }
        self.register_plugin(plugin)
    }

    /// Loads every module in a directory with the given suffix, ignoring
    /// individual failures. Returns false if the directory itself cannot be
    /// listed.
    pub fn load_all_in_path(&self, loader: &dyn PluginLoader, dir: &str, suffix: &str) -> bool {
        let Ok(paths) = loader.list(dir, suffix) else {
            return false;
        };
        for path in paths {
            if let Err(e) = self.load_plugin(loader, &path, None, None, false) {
                self.log_message(
                    MessageLevel::Warning,
                    &format!("skipped plugin {path}: {e}"),
                );
            }
        }
        true
    }

    pub(crate) fn register_plugin(&self, plugin: Arc<Plugin>) -> Result<Arc<Plugin>> {
        let mut plugins = self.inner.plugins.lock();
        let id = plugin.id();
        let namespace = plugin.namespace();
        if let Some(existing) = plugins.iter().find(|p| p.id() == id) {
            let mut msg = format!("plugin {id} already loaded");
            if let Some(from) = existing.filename() {
                msg += &format!(" from {from}");
            }
            return Err(Error::Plugin(msg));
        }
        if plugins.iter().any(|p| p.namespace() == namespace) {
            return Err(Error::Plugin(format!(
                "plugin load failed, namespace {namespace} already populated"
            )));
        }
        plugins.push(plugin.clone());
        Ok(plugin)
    }

    /// Looks a plugin up by identifier.
    pub fn plugin_by_id(&self, id: &str) -> Option<Arc<Plugin>> {
        self.inner.plugins.lock().iter().find(|p| p.id() == id).cloned()
    }

    /// Looks a plugin up by namespace.
    pub fn plugin_by_namespace(&self, namespace: &str) -> Option<Arc<Plugin>> {
        self.inner
            .plugins
            .lock()
            .iter()
            .find(|p| p.namespace() == namespace)
            .cloned()
    }

    /// Every registered plugin.
    pub fn plugins(&self) -> Vec<Arc<Plugin>> {
        self.inner.plugins.lock().clone()
    }

    /// Invokes a plugin function with argument validation; failures come
    /// back as an error-stamped map.
    pub fn invoke(&self, plugin: &Plugin, func_name: &str, args: &PropertyMap) -> PropertyMap {
        plugin.invoke(self, func_name, args)
    }

    // ----- graph inspection -----

    pub(crate) fn graph_inspection_enabled(&self) -> bool {
        self.inner.flags.enable_graph_inspection
    }

    pub(crate) fn current_function_frame(&self) -> Option<Arc<FunctionFrame>> {
        if !self.graph_inspection_enabled() {
            return None;
        }
        self.inner.function_frame.lock().clone()
    }

    pub(crate) fn push_function_frame(&self, name: &str, args: PropertyMap) {
        let mut head = self.inner.function_frame.lock();
        *head = Some(Arc::new(FunctionFrame {
            name: name.to_owned(),
            args,
            next: head.take(),
        }));
    }

    pub(crate) fn pop_function_frame(&self) {
        let mut head = self.inner.function_frame.lock();
        *head = head.take().and_then(|frame| frame.next.clone());
    }

    // ----- logging -----

    /// Registers a message handler; returns a handle for removal.
    pub fn add_message_handler(
        &self,
        handler: impl Fn(MessageLevel, &str) + Send + Sync + 'static,
    ) -> MessageHandlerId {
        let id = self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed);
        self.inner.handlers.lock().push((id, Box::new(handler)));
        MessageHandlerId(id)
    }

    /// Removes a handler. Returns whether it was registered.
    pub fn remove_message_handler(&self, id: MessageHandlerId) -> bool {
        let mut handlers = self.inner.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(hid, _)| *hid != id.0);
        handlers.len() != before
    }

    /// Dispatches a message to every handler and to the `tracing` sink.
    /// `Fatal` terminates the process after all handlers ran.
    pub fn log_message(&self, level: MessageLevel, msg: &str) {
        {
            let handlers = self.inner.handlers.lock();
            for (_, handler) in handlers.iter() {
                handler(level, msg);
            }
            match level {
                MessageLevel::Debug => tracing::debug!(target: "frameflow", "{msg}"),
                MessageLevel::Information => tracing::info!(target: "frameflow", "{msg}"),
                MessageLevel::Warning => tracing::warn!(target: "frameflow", "{msg}"),
                MessageLevel::Critical | MessageLevel::Fatal => {
                    tracing::error!(target: "frameflow", "{msg}")
                }
            }
        }
        if level == MessageLevel::Fatal {
            eprintln!("frameflow encountered a fatal error: {msg}");
            std::process::abort();
        }
    }

    /// Logs at `Fatal` and terminates.
    pub(crate) fn fatal(&self, msg: &str) -> ! {
        self.log_message(MessageLevel::Fatal, msg);
        std::process::abort()
    }
}

impl Drop for CoreInner {
    fn drop(&mut self) {
        self.pool.wait_for_done();
        self.pool.shutdown();
        let used = self.memory.used();
        if used > 0 {
            let msg = format!("core freed but {used} bytes still allocated in frame buffers");
            for (_, handler) in self.handlers.lock().iter() {
                handler(MessageLevel::Warning, &msg);
            }
            tracing::warn!(target: "frameflow", "{msg}");
        }
    }
}
