//! Filter instances, their declared outputs, and owning references.
//!
//! A [`Node`] wires one [`Filter`] implementation into the graph together
//! with its declared output descriptors and concurrency policy. Clients and
//! filters hold [`NodeRef`]s: cheap owning handles to one output index of a
//! node. When the last reference drops, the filter instance is released
//! through a thread-local deferred-destruction list so that release chains
//! of arbitrary depth cannot overflow the stack.

use std::cell::RefCell;
use std::mem::ManuallyDrop;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::context::FrameContext;
use crate::frames::{Frame, MediaType};
use crate::plugin::FunctionFrame;
use crate::{AudioFormat, Core, Error, Result, VideoFormat, FRAME_SAMPLES};

/// Why a filter's `get_frame` is being entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationReason {
    /// First entry for this request. Issue upstream requests and return
    /// `Ok(None)` to suspend, or return a finished frame outright.
    Initial,
    /// Every requested upstream frame has been delivered to the context.
    AllReady,
    /// An upstream request failed; propagate by returning `Err`.
    Error,
}

/// Concurrency policy a filter declares for its `get_frame` entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterMode {
    /// Any number of workers may run the filter concurrently.
    Parallel,
    /// Distinct frame numbers run in parallel; each `(node, n)` admits a
    /// single worker at a time.
    ParallelRequests,
    /// One worker in the filter at a time, frame numbers in any order.
    Unordered,
    /// One worker at a time, and frames complete strictly in ascending
    /// order; the node tracks the frame currently in flight.
    FrameState,
}

/// Node behavior flags.
pub mod node_flags {
    /// Upstream caches should not retain this node's output.
    pub const NO_CACHE: u32 = 1;
    /// The filter is a cache and participates in memory-pressure trimming.
    /// Must be combined with [`NO_CACHE`].
    pub const IS_CACHE: u32 = 2;
    /// The node prefers strictly linear frame access.
    pub const MAKE_LINEAR: u32 = 4;
    /// The node wants to be told when frames it depends on become ready.
    pub const NOTIFY_FRAME_READY: u32 = 8;

    pub(crate) const ALL: u32 = NO_CACHE | IS_CACHE | MAKE_LINEAR | NOTIFY_FRAME_READY;
}

/// A filter: the callback side of a node.
///
/// Instance configuration lives in the implementing type. Per-request
/// scratch state belongs in the frame context's `frame_data` slot, which
/// survives across the Initial/AllReady suspension of a single request.
pub trait Filter: Send + Sync {
    /// The activation callback. See [`ActivationReason`] for the contract of
    /// each pass.
    fn get_frame(
        &self,
        n: i32,
        reason: ActivationReason,
        ctx: &mut FrameContext<'_>,
        core: &Core,
    ) -> Result<Option<Arc<Frame>>>;

    /// Called on cache filters (flag [`node_flags::IS_CACHE`]) when global
    /// memory use crosses the soft cap. Implementations should trim.
    fn notify_cache(&self, _needs_memory: bool) {}
}

/// Declared properties of one video output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoInfo {
    pub format: VideoFormat,
    pub fps_num: i64,
    pub fps_den: i64,
    /// Zero width and height together declare variable-dimension output.
    pub width: i32,
    pub height: i32,
    pub num_frames: i32,
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Reduces a frame-rate fraction to lowest terms, normalizing 0/x to 0/1.
pub(crate) fn reduce_rational(num: i64, den: i64) -> (i64, i64) {
    if num == 0 {
        return (0, 1);
    }
    let d = gcd(num, den);
    if d == 0 {
        (num, den)
    } else {
        (num / d, den / d)
    }
}

impl VideoInfo {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.num_frames < 1 {
            return Err(Error::Node(format!(
                "declared frame count must be positive, got {}",
                self.num_frames
            )));
        }
        if self.width < 0 || self.height < 0 {
            return Err(Error::Node("dimensions may not be negative".into()));
        }
        if (self.width == 0) != (self.height == 0) {
            return Err(Error::Node(
                "variable-dimension clips must have both width and height set to 0".into(),
            ));
        }
        if self.fps_num < 0 || self.fps_den < 1 {
            return Err(Error::Node(format!(
                "invalid frame rate {}/{}",
                self.fps_num, self.fps_den
            )));
        }
        let d = gcd(self.fps_num, self.fps_den);
        if (self.fps_num == 0 && self.fps_den != 1) || (self.fps_num != 0 && d != 1) {
            return Err(Error::Node(format!(
                "frame rate must be a reduced fraction, got {}/{}",
                self.fps_num, self.fps_den
            )));
        }
        Ok(())
    }
}

/// Declared properties of one audio output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioInfo {
    pub format: AudioFormat,
    pub sample_rate: i32,
    pub num_samples: i64,
}

impl AudioInfo {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.sample_rate < 1 {
            return Err(Error::Node(format!(
                "sample rate must be positive, got {}",
                self.sample_rate
            )));
        }
        let max_samples = i32::MAX as i64 * FRAME_SAMPLES as i64;
        if self.num_samples < 1 || self.num_samples > max_samples {
            return Err(Error::Node(format!(
                "declared sample count {} outside the supported range 1..={max_samples}",
                self.num_samples
            )));
        }
        Ok(())
    }

    /// Number of frames covering the declared samples at the engine's frame
    /// granularity.
    pub fn num_frames(&self) -> i32 {
        ((self.num_samples + FRAME_SAMPLES as i64 - 1) / FRAME_SAMPLES as i64) as i32
    }

    /// Expected sample count of frame `n`: the full granularity for all but
    /// the last frame, which holds the remainder.
    pub fn frame_samples(&self, n: i32) -> i32 {
        if n < self.num_frames() - 1 {
            FRAME_SAMPLES
        } else {
            let rem = (self.num_samples % FRAME_SAMPLES as i64) as i32;
            if rem == 0 {
                FRAME_SAMPLES
            } else {
                rem
            }
        }
    }
}

pub(crate) enum OutputInfo {
    Video(Vec<VideoInfo>),
    Audio(Vec<AudioInfo>),
}

impl OutputInfo {
    pub(crate) fn len(&self) -> usize {
        match self {
            OutputInfo::Video(v) => v.len(),
            OutputInfo::Audio(a) => a.len(),
        }
    }
}

static NODE_IDS: AtomicU64 = AtomicU64::new(1);

/// One filter instance in the graph.
pub(crate) struct Node {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) mode: FilterMode,
    pub(crate) flags: u32,
    pub(crate) api_major: i32,
    filter: ManuallyDrop<Box<dyn Filter>>,
    pub(crate) outputs: OutputInfo,
    pub(crate) core: Core,
    pub(crate) function_frame: Option<Arc<FunctionFrame>>,
    /// Serialized-mode admission: a worker is inside the filter.
    pub(crate) running: AtomicBool,
    /// FrameState mode: frame number currently in flight, -1 when idle.
    pub(crate) serial_frame: AtomicI32,
}

impl Node {
    pub(crate) fn new(
        name: &str,
        outputs: OutputInfo,
        filter: Box<dyn Filter>,
        mode: FilterMode,
        flags: u32,
        api_major: i32,
        core: &Core,
    ) -> Result<Arc<Node>> {
        if flags & !node_flags::ALL != 0 {
            return Err(Error::Node(format!(
                "filter {name} specified unknown flags"
            )));
        }
        if flags & node_flags::IS_CACHE != 0 && flags & node_flags::NO_CACHE == 0 {
            return Err(Error::Node(format!(
                "filter {name} specified an illegal combination of flags (IS_CACHE requires NO_CACHE)"
            )));
        }
        if outputs.len() == 0 {
            return Err(Error::Node(format!(
                "filter {name} needs to have at least one output"
            )));
        }
        match &outputs {
            OutputInfo::Video(infos) => {
                for vi in infos {
                    vi.validate()
                        .map_err(|e| Error::Node(format!("filter {name}: {e}")))?;
                }
            }
            OutputInfo::Audio(infos) => {
                for ai in infos {
                    ai.validate()
                        .map_err(|e| Error::Node(format!("filter {name}: {e}")))?;
                }
            }
        }

        let node = Arc::new(Node {
            id: NODE_IDS.fetch_add(1, Ordering::Relaxed),
            name: name.to_owned(),
            mode,
            flags,
            api_major,
            filter: ManuallyDrop::new(filter),
            outputs,
            core: core.clone(),
            function_frame: core.current_function_frame(),
            running: AtomicBool::new(false),
            serial_frame: AtomicI32::new(-1),
        });
        core.register_node(&node);
        Ok(node)
    }

    pub(crate) fn filter(&self) -> &dyn Filter {
        &**self.filter
    }

    pub(crate) fn media_type(&self) -> MediaType {
        match self.outputs {
            OutputInfo::Video(_) => MediaType::Video,
            OutputInfo::Audio(_) => MediaType::Audio,
        }
    }

    pub(crate) fn video_info(&self, index: usize) -> Option<&VideoInfo> {
        match &self.outputs {
            OutputInfo::Video(infos) => infos.get(index),
            OutputInfo::Audio(_) => None,
        }
    }

    pub(crate) fn audio_info(&self, index: usize) -> Option<&AudioInfo> {
        match &self.outputs {
            OutputInfo::Audio(infos) => infos.get(index),
            OutputInfo::Video(_) => None,
        }
    }

    /// Declared frame count of one output.
    pub(crate) fn num_frames(&self, index: usize) -> i32 {
        match &self.outputs {
            OutputInfo::Video(infos) => infos[index].num_frames,
            OutputInfo::Audio(infos) => infos[index].num_frames(),
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let filter = unsafe { ManuallyDrop::take(&mut self.filter) };
        self.core.node_destroyed();
        defer_filter_release(filter);
    }
}

thread_local! {
    static RELEASE_LIST: RefCell<ReleaseList> = RefCell::new(ReleaseList {
        draining: false,
        pending: Vec::new(),
    });
}

struct ReleaseList {
    draining: bool,
    pending: Vec<Box<dyn Filter>>,
}

/// Queues a filter instance for release. Dropping a filter may release the
/// node references it owns and trigger further filter releases; routing them
/// through this list turns the recursion into a loop drained at the
/// outermost call.
fn defer_filter_release(filter: Box<dyn Filter>) {
    let outermost = RELEASE_LIST.with(|list| {
        let mut list = list.borrow_mut();
        list.pending.push(filter);
        !std::mem::replace(&mut list.draining, true)
    });
    if !outermost {
        return;
    }
    loop {
        let next = RELEASE_LIST.with(|list| list.borrow_mut().pending.pop());
        match next {
            Some(filter) => drop(filter),
            None => break,
        }
    }
    RELEASE_LIST.with(|list| list.borrow_mut().draining = false);
}

/// Owning handle to one output index of a node.
///
/// Cloning is cheap; the underlying filter instance is released when the
/// last reference to any of its outputs drops.
#[derive(Clone)]
pub struct NodeRef {
    pub(crate) node: Arc<Node>,
    pub(crate) index: usize,
}

impl NodeRef {
    /// Diagnostic name of the underlying filter instance.
    pub fn name(&self) -> &str {
        &self.node.name
    }

    /// The output index this reference designates.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn num_outputs(&self) -> usize {
        self.node.outputs.len()
    }

    pub fn media_type(&self) -> MediaType {
        self.node.media_type()
    }

    pub fn filter_mode(&self) -> FilterMode {
        self.node.mode
    }

    pub fn flags(&self) -> u32 {
        self.node.flags
    }

    /// ABI major of the plugin that created this node.
    pub fn api_major(&self) -> i32 {
        self.node.api_major
    }

    /// Declared video output descriptor, if this is a video node.
    pub fn video_info(&self) -> Option<&VideoInfo> {
        self.node.video_info(self.index)
    }

    /// Declared audio output descriptor, if this is an audio node.
    pub fn audio_info(&self) -> Option<&AudioInfo> {
        self.node.audio_info(self.index)
    }

    /// Declared frame count of this output.
    pub fn num_frames(&self) -> i32 {
        self.node.num_frames(self.index)
    }

    /// Name of the invocation that created this node, `level` steps up the
    /// creation chain. Requires graph inspection to be enabled on the core.
    pub fn creation_function_name(&self, level: usize) -> Option<&str> {
        self.creation_frame(level).map(|f| f.name.as_str())
    }

    /// Argument snapshot of the invocation that created this node, `level`
    /// steps up the creation chain.
    pub fn creation_function_args(&self, level: usize) -> Option<&crate::PropertyMap> {
        self.creation_frame(level).map(|f| &f.args)
    }

    fn creation_frame(&self, level: usize) -> Option<&FunctionFrame> {
        let mut frame = self.node.function_frame.as_deref()?;
        for _ in 0..level {
            frame = frame.next.as_deref()?;
        }
        Some(frame)
    }
}

impl std::fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRef")
            .field("name", &self.node.name)
            .field("index", &self.index)
            .finish()
    }
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.node, &other.node) && self.index == other.index
    }
}

impl Eq for NodeRef {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ColorFamily, SampleType, STEREO};

    fn format() -> VideoFormat {
        VideoFormat::new(ColorFamily::YUV, SampleType::Integer, 8, 1, 1).unwrap()
    }

    #[test]
    fn test_video_info_validation() {
        let good = VideoInfo {
            format: format(),
            fps_num: 30000,
            fps_den: 1001,
            width: 1920,
            height: 1080,
            num_frames: 10,
        };
        assert!(good.validate().is_ok());

        assert!(VideoInfo { num_frames: 0, ..good }.validate().is_err());
        assert!(VideoInfo { width: 0, ..good }.validate().is_err());
        assert!(VideoInfo { fps_num: 30, fps_den: 2, ..good }.validate().is_err());
        assert!(VideoInfo { fps_num: 0, fps_den: 5, ..good }.validate().is_err());
        assert!(VideoInfo { width: 0, height: 0, ..good }.validate().is_ok());
        assert!(VideoInfo { fps_num: 0, fps_den: 1, ..good }.validate().is_ok());
    }

    #[test]
    fn test_audio_info_frame_counts() {
        let format = AudioFormat::new(SampleType::Integer, 16, STEREO).unwrap();
        let ai = AudioInfo {
            format,
            sample_rate: 48000,
            num_samples: FRAME_SAMPLES as i64 * 2 + 1,
        };
        assert!(ai.validate().is_ok());
        assert_eq!(ai.num_frames(), 3);
        assert_eq!(ai.frame_samples(0), FRAME_SAMPLES);
        assert_eq!(ai.frame_samples(1), FRAME_SAMPLES);
        assert_eq!(ai.frame_samples(2), 1);

        let exact = AudioInfo {
            format,
            sample_rate: 48000,
            num_samples: FRAME_SAMPLES as i64 * 4,
        };
        assert_eq!(exact.num_frames(), 4);
        assert_eq!(exact.frame_samples(3), FRAME_SAMPLES);

        let single = AudioInfo {
            format,
            sample_rate: 48000,
            num_samples: 1,
        };
        assert_eq!(single.num_frames(), 1);
        assert_eq!(single.frame_samples(0), 1);
    }

    #[test]
    fn test_audio_info_rejects_out_of_range() {
        let format = AudioFormat::new(SampleType::Integer, 16, STEREO).unwrap();
        let too_many = AudioInfo {
            format,
            sample_rate: 48000,
            num_samples: i32::MAX as i64 * FRAME_SAMPLES as i64 + 1,
        };
        assert!(too_many.validate().is_err());
        let none = AudioInfo {
            format,
            sample_rate: 48000,
            num_samples: 0,
        };
        assert!(none.validate().is_err());
    }
}
