//! frameflow — a pull-based frame-graph media processing engine.
//!
//! Clients compose filter instances into a directed acyclic graph and then
//! request individual frames from an output node; the engine evaluates every
//! upstream dependency of that frame recursively and concurrently on a
//! bounded worker pool.
//!
//! The engine is built around a small number of cooperating pieces:
//!
//! - **Frames** ([`Frame`]): reference-counted, externally immutable media
//!   data with copy-on-write plane access, allocated from a recycling
//!   [arena](`MemoryPool`) bounded by a soft memory cap.
//! - **Nodes** ([`NodeRef`], [`Filter`]): filter instances with declared
//!   output descriptors and a per-node concurrency policy
//!   ([`FilterMode`]).
//! - **The activation protocol** ([`ActivationReason`], [`FrameContext`]):
//!   a filter is entered once to declare its upstream frame needs, suspends,
//!   and is re-entered when everything it asked for is ready.
//! - **Plugins** ([`Plugin`]): units of publication exposing named functions
//!   with typed argument schemas, validated at invocation.
//!
//! # Example
//!
//! ```
//! use frameflow::{Core, CoreFlags, PropertyMap};
//!
//! let core = Core::new(CoreFlags::default());
//! let std_plugin = core.plugin_by_namespace("std").expect("built-in plugin");
//!
//! // Build a 3-frame gray source through the function registry.
//! let mut args = PropertyMap::new();
//! args.set_int("width", 320);
//! args.set_int("height", 240);
//! args.set_int("length", 3);
//! let result = core.invoke(&std_plugin, "BlankClip", &args);
//! assert!(result.error().is_none());
//! let clip = result.get_video_node("clip", 0).unwrap();
//!
//! // Pull a frame from it.
//! let frame = core.get_frame(&clip, 2).unwrap();
//! assert_eq!(frame.width(), 320);
//! ```

mod completion;
mod context;
pub(crate) mod core;
mod error;
mod format;
mod frames;
mod memory;
mod node;
mod plugin;
mod props;
mod scheduler;
mod stdlib;

use std::sync::OnceLock;

pub use crate::completion::Completion;
pub use crate::context::FrameContext;
pub use crate::core::{Core, CoreFlags, CoreInfo, MessageHandler, MessageHandlerId, MessageLevel};
pub use crate::error::{Error, Result};
pub use crate::format::{
    AudioChannel, AudioFormat, ColorFamily, FormatRegistry, SampleType, VideoFormat, STEREO,
};
pub use crate::frames::{Frame, FrameFormat, MediaType};
pub use crate::memory::MemoryPool;
pub use crate::node::{
    node_flags, ActivationReason, AudioInfo, Filter, FilterMode, NodeRef, VideoInfo,
};
pub use crate::plugin::{FunctionBody, Plugin, PluginFunction, PluginInit, PluginLoader};
pub use crate::props::{DataTypeHint, Function, PropType, PropertyMap, PropsError};

/// Current function-registry ABI major.
pub const API_MAJOR: i32 = 4;
/// The coexisting legacy ABI major (`clip`/`frame` type spellings, no audio).
pub const LEGACY_API_MAJOR: i32 = 3;

/// Fixed audio frame granularity: every audio frame but the last of a clip
/// holds exactly this many samples.
pub const FRAME_SAMPLES: i32 = 3072;

/// Process-wide frame-buffer and stride alignment in bytes, fixed at first
/// use from CPU capability: 32, or 64 when wide SIMD is available.
pub fn frame_alignment() -> usize {
    static ALIGNMENT: OnceLock<usize> = OnceLock::new();
    *ALIGNMENT.get_or_init(|| {
        #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
        {
            if std::is_x86_feature_detected!("avx512f") {
                return 64;
            }
        }
        32
    })
}
