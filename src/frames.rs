//! Frame and plane-payload types for video and audio.
//!
//! A [`Frame`] is a self-contained, externally immutable unit of media data:
//! a format descriptor, one or three independently reference-counted plane
//! payloads, and a property map. Copying a frame is cheap (the payloads are
//! shared); obtaining a writable plane pointer performs copy-on-write so the
//! single-writer invariant always holds.
//!
//! Plane payloads are allocated from the core's [`MemoryPool`] and bracketed
//! by guard regions filled with a fixed sentinel pattern; the scheduler may
//! verify the guards after every filter return and treats corruption as
//! fatal.

use std::ptr::NonNull;
use std::sync::Arc;

use crate::memory::MemoryPool;
use crate::props::PropertyMap;
use crate::{frame_alignment, AudioFormat, VideoFormat, FRAME_SAMPLES};

/// Sentinel written into plane guard regions.
pub(crate) const GUARD_PATTERN: u32 = 0xDEAD_BEEF;

fn guard_space() -> usize {
    frame_alignment()
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Whether a frame carries video or audio data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaType {
    Video,
    Audio,
}

/// Format descriptor of a frame, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Video(VideoFormat),
    Audio(AudioFormat),
}

/// One reference-counted aligned payload backing a video plane or an audio
/// sample block.
pub(crate) struct PlaneData {
    data: NonNull<u8>,
    /// Total allocation size including both guard regions.
    size: usize,
    pool: Arc<MemoryPool>,
}

// The payload is plain bytes and the pool is internally synchronized.
unsafe impl Send for PlaneData {}
unsafe impl Sync for PlaneData {}

impl PlaneData {
    /// Allocates a zeroed payload of `payload_size` bytes plus guards and
    /// charges it against the pool.
    fn new(payload_size: usize, pool: Arc<MemoryPool>) -> Arc<Self> {
        let size = payload_size + 2 * guard_space();
        let data = pool.alloc_buffer(size);
        pool.add(size);
        let plane = PlaneData { data, size, pool };
        unsafe {
            std::ptr::write_bytes(plane.payload_ptr(), 0, payload_size);
        }
        plane.write_guards();
        Arc::new(plane)
    }

    /// Allocates a new payload with identical contents, via the recycler.
    fn duplicate(&self) -> Arc<Self> {
        let data = self.pool.alloc_buffer(self.size);
        self.pool.add(self.size);
        let copy = PlaneData {
            data,
            size: self.size,
            pool: self.pool.clone(),
        };
        unsafe {
            std::ptr::copy_nonoverlapping(self.data.as_ptr(), copy.data.as_ptr(), self.size);
        }
        Arc::new(copy)
    }

    fn payload_ptr(&self) -> *mut u8 {
        unsafe { self.data.as_ptr().add(guard_space()) }
    }

    fn payload_len(&self) -> usize {
        self.size - 2 * guard_space()
    }

    fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.payload_ptr(), self.payload_len()) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.payload_ptr(), self.payload_len()) }
    }

    fn write_guards(&self) {
        let words = guard_space() / 4;
        let head = self.data.as_ptr().cast::<u32>();
        let tail = unsafe {
            self.data
                .as_ptr()
                .add(self.size - guard_space())
                .cast::<u32>()
        };
        for i in 0..words {
            unsafe {
                head.add(i).write_unaligned(GUARD_PATTERN);
                tail.add(i).write_unaligned(GUARD_PATTERN);
            }
        }
    }

    fn verify_guards(&self) -> bool {
        let words = guard_space() / 4;
        let head = self.data.as_ptr().cast::<u32>();
        let tail = unsafe {
            self.data
                .as_ptr()
                .add(self.size - guard_space())
                .cast::<u32>()
        };
        (0..words).all(|i| unsafe {
            head.add(i).read_unaligned() == GUARD_PATTERN
                && tail.add(i).read_unaligned() == GUARD_PATTERN
        })
    }
}

impl Drop for PlaneData {
    fn drop(&mut self) {
        self.pool.free_buffer(self.data);
        self.pool.subtract(self.size);
    }
}

/// A video image or audio block with format, payloads, and properties.
///
/// Frames are externally immutable from the moment a filter returns them;
/// they circulate as `Arc<Frame>`. A filter that is still building a frame
/// holds it by value and may mutate planes through
/// [`plane_mut`](Frame::plane_mut), which enforces copy-on-write.
///
/// # Examples
///
/// ```
/// use frameflow::{ColorFamily, Core, CoreFlags, SampleType, VideoFormat};
///
/// let core = Core::new(CoreFlags::default());
/// let format = VideoFormat::new(ColorFamily::YUV, SampleType::Integer, 8, 1, 1)?;
/// let mut frame = core.new_video_frame(format, 640, 480, None);
/// frame.plane_mut(0).fill(128);
/// assert_eq!(frame.plane(0)[0], 128);
/// assert_eq!(frame.stride(1), frame.stride(2));
/// # Ok::<(), frameflow::Error>(())
/// ```
pub struct Frame {
    format: FrameFormat,
    /// Video width, or the sample count for audio frames.
    width: i32,
    height: i32,
    num_planes: usize,
    planes: [Option<Arc<PlaneData>>; 3],
    stride: [usize; 3],
    props: PropertyMap,
}

impl Frame {
    pub(crate) fn new_video(
        format: VideoFormat,
        width: i32,
        height: i32,
        prop_src: Option<&Frame>,
        pool: &Arc<MemoryPool>,
    ) -> Frame {
        if width <= 0 || height <= 0 {
            crate::core::fatal_error(&format!(
                "frame creation with non-positive dimensions ({width}x{height})"
            ));
        }
        let align = frame_alignment();
        let mut stride = [0usize; 3];
        stride[0] = align_up(width as usize * format.bytes_per_sample as usize, align);
        if format.num_planes == 3 {
            let chroma = align_up(
                (width as usize >> format.sub_sampling_w) * format.bytes_per_sample as usize,
                align,
            );
            stride[1] = chroma;
            stride[2] = chroma;
        }

        let mut planes: [Option<Arc<PlaneData>>; 3] = [None, None, None];
        planes[0] = Some(PlaneData::new(stride[0] * height as usize, pool.clone()));
        if format.num_planes == 3 {
            let chroma_size = stride[1] * (height as usize >> format.sub_sampling_h);
            planes[1] = Some(PlaneData::new(chroma_size, pool.clone()));
            planes[2] = Some(PlaneData::new(chroma_size, pool.clone()));
        }

        Frame {
            format: FrameFormat::Video(format),
            width,
            height,
            num_planes: format.num_planes,
            planes,
            stride,
            props: prop_src.map(|f| f.props.clone()).unwrap_or_default(),
        }
    }

    /// Builds a video frame reusing plane payloads from existing frames.
    /// `plane_src[i]` names a source frame and the plane index to borrow for
    /// output plane `i`; `None` allocates a fresh plane.
    pub(crate) fn new_video_from_planes(
        format: VideoFormat,
        width: i32,
        height: i32,
        plane_src: [Option<(&Frame, usize)>; 3],
        prop_src: Option<&Frame>,
        pool: &Arc<MemoryPool>,
    ) -> Frame {
        if width <= 0 || height <= 0 {
            crate::core::fatal_error(&format!(
                "frame creation with non-positive dimensions ({width}x{height})"
            ));
        }
        let align = frame_alignment();
        let mut stride = [0usize; 3];
        stride[0] = align_up(width as usize * format.bytes_per_sample as usize, align);
        if format.num_planes == 3 {
            let chroma = align_up(
                (width as usize >> format.sub_sampling_w) * format.bytes_per_sample as usize,
                align,
            );
            stride[1] = chroma;
            stride[2] = chroma;
        }

        let mut frame = Frame {
            format: FrameFormat::Video(format),
            width,
            height,
            num_planes: format.num_planes,
            planes: [None, None, None],
            stride,
            props: prop_src.map(|f| f.props.clone()).unwrap_or_default(),
        };
        for i in 0..format.num_planes {
            match plane_src[i] {
                Some((src_frame, src_plane)) => {
                    if src_plane >= src_frame.num_planes {
                        crate::core::fatal_error(&format!(
                            "frame creation references plane {src_plane} which does not exist in the source frame"
                        ));
                    }
                    if src_frame.plane_width(src_plane) != frame.plane_width(i)
                        || src_frame.plane_height(src_plane) != frame.plane_height(i)
                    {
                        crate::core::fatal_error(&format!(
                            "frame creation with mismatched plane dimensions: source {}x{}, destination {}x{}",
                            src_frame.plane_width(src_plane),
                            src_frame.plane_height(src_plane),
                            frame.plane_width(i),
                            frame.plane_height(i)
                        ));
                    }
                    frame.planes[i] = src_frame.planes[src_plane].clone();
                }
                None => {
                    let size = stride[i] * frame.plane_height(i) as usize;
                    frame.planes[i] = Some(PlaneData::new(size, pool.clone()));
                }
            }
        }
        frame
    }

    pub(crate) fn new_audio(
        format: AudioFormat,
        num_samples: i32,
        prop_src: Option<&Frame>,
        pool: &Arc<MemoryPool>,
    ) -> Frame {
        if num_samples <= 0 || num_samples > FRAME_SAMPLES {
            crate::core::fatal_error(&format!(
                "audio frame creation with bad sample count ({num_samples})"
            ));
        }
        // One fixed-capacity row per channel inside a single payload.
        let stride = format.bytes_per_sample as usize * FRAME_SAMPLES as usize;
        let payload = PlaneData::new(stride * format.num_channels, pool.clone());
        Frame {
            format: FrameFormat::Audio(format),
            width: num_samples,
            height: 0,
            num_planes: format.num_channels,
            planes: [Some(payload), None, None],
            stride: [stride, 0, 0],
            props: prop_src.map(|f| f.props.clone()).unwrap_or_default(),
        }
    }

    /// Cheap copy: a new frame header holding additional references to the
    /// same plane payloads, with a cloned property map.
    pub fn copy(&self) -> Frame {
        Frame {
            format: self.format,
            width: self.width,
            height: self.height,
            num_planes: self.num_planes,
            planes: self.planes.clone(),
            stride: self.stride,
            props: self.props.clone(),
        }
    }

    pub fn media_type(&self) -> MediaType {
        match self.format {
            FrameFormat::Video(_) => MediaType::Video,
            FrameFormat::Audio(_) => MediaType::Audio,
        }
    }

    /// The video format, if this is a video frame.
    pub fn video_format(&self) -> Option<&VideoFormat> {
        match &self.format {
            FrameFormat::Video(f) => Some(f),
            FrameFormat::Audio(_) => None,
        }
    }

    /// The audio format, if this is an audio frame.
    pub fn audio_format(&self) -> Option<&AudioFormat> {
        match &self.format {
            FrameFormat::Audio(f) => Some(f),
            FrameFormat::Video(_) => None,
        }
    }

    /// Width of plane 0 (video only).
    pub fn width(&self) -> i32 {
        self.plane_width(0)
    }

    /// Height of plane 0 (video only).
    pub fn height(&self) -> i32 {
        self.plane_height(0)
    }

    /// Width of a specific plane, honoring chroma subsampling.
    pub fn plane_width(&self, plane: usize) -> i32 {
        match &self.format {
            FrameFormat::Video(f) if plane > 0 => self.width >> f.sub_sampling_w,
            _ => self.width,
        }
    }

    /// Height of a specific plane, honoring chroma subsampling.
    pub fn plane_height(&self, plane: usize) -> i32 {
        match &self.format {
            FrameFormat::Video(f) if plane > 0 => self.height >> f.sub_sampling_h,
            _ => self.height,
        }
    }

    /// Sample count of an audio frame.
    pub fn num_samples(&self) -> i32 {
        debug_assert!(matches!(self.format, FrameFormat::Audio(_)));
        self.width
    }

    /// Number of planes (video) or channels (audio).
    pub fn num_planes(&self) -> usize {
        self.num_planes
    }

    /// Row stride of a plane in bytes; always a multiple of the platform
    /// alignment for video planes.
    pub fn stride(&self, plane: usize) -> usize {
        self.check_plane(plane);
        match self.format {
            FrameFormat::Video(_) => self.stride[plane],
            FrameFormat::Audio(_) => self.stride[0],
        }
    }

    fn check_plane(&self, plane: usize) {
        if plane >= self.num_planes {
            crate::core::fatal_error(&format!(
                "access to nonexistent plane {plane} (frame has {})",
                self.num_planes
            ));
        }
    }

    fn plane_span(&self, plane: usize) -> (usize, usize, usize) {
        match self.format {
            // (payload index, byte offset, length)
            FrameFormat::Video(_) => {
                let len = self.stride[plane] * self.plane_height(plane) as usize;
                (plane, 0, len)
            }
            FrameFormat::Audio(_) => (0, plane * self.stride[0], self.stride[0]),
        }
    }

    /// Read access to a video plane's bytes (or an audio channel's row).
    pub fn plane(&self, plane: usize) -> &[u8] {
        self.check_plane(plane);
        let (payload, offset, len) = self.plane_span(plane);
        let data = self.planes[payload]
            .as_ref()
            .expect("checked plane payload present");
        &data.bytes()[offset..offset + len]
    }

    /// Read access to one audio channel's samples.
    pub fn channel(&self, channel: usize) -> &[u8] {
        self.plane(channel)
    }

    /// Write access to a plane, performing copy-on-write.
    ///
    /// This may only be called while the frame is uniquely owned (`&mut self`
    /// on a frame not yet wrapped in an `Arc`), which is what makes the
    /// refcount==1 fast path sound: reads and writes of a payload can never
    /// race. If the payload is shared with other frames it is duplicated via
    /// the recycler first; afterwards this plane's payload refcount is
    /// exactly 1 and the other planes are untouched.
    pub fn plane_mut(&mut self, plane: usize) -> &mut [u8] {
        self.check_plane(plane);
        let (payload, offset, len) = self.plane_span(plane);
        let slot = self.planes[payload]
            .as_mut()
            .expect("checked plane payload present");
        if Arc::get_mut(slot).is_none() {
            *slot = slot.duplicate();
        }
        let data = Arc::get_mut(slot).expect("payload uniquely held after copy-on-write");
        &mut data.bytes_mut()[offset..offset + len]
    }

    /// Write access to one audio channel's samples (copy-on-write).
    pub fn channel_mut(&mut self, channel: usize) -> &mut [u8] {
        self.plane_mut(channel)
    }

    /// The frame's property map.
    pub fn props(&self) -> &PropertyMap {
        &self.props
    }

    /// Mutable access to the property map (only while uniquely owned).
    pub fn props_mut(&mut self) -> &mut PropertyMap {
        &mut self.props
    }

    /// Replaces this frame's properties with a copy of another frame's.
    pub fn copy_props_from(&mut self, src: &Frame) {
        self.props = src.props.clone();
    }

    /// Verifies the guard regions of every payload.
    pub(crate) fn verify_guard_pattern(&self) -> bool {
        self.planes
            .iter()
            .flatten()
            .all(|p| p.verify_guards())
    }

    /// Refcount of a plane's payload (shared across frames created by
    /// [`copy`](Frame::copy)).
    #[cfg(test)]
    pub(crate) fn plane_refcount(&self, plane: usize) -> usize {
        let (payload, _, _) = self.plane_span(plane);
        Arc::strong_count(self.planes[payload].as_ref().expect("plane present"))
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.format {
            FrameFormat::Video(vf) => f
                .debug_struct("Frame")
                .field("format", &vf.name())
                .field("width", &self.width)
                .field("height", &self.height)
                .finish_non_exhaustive(),
            FrameFormat::Audio(af) => f
                .debug_struct("Frame")
                .field("format", &af.name())
                .field("samples", &self.width)
                .finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ColorFamily, SampleType, STEREO};

    fn pool() -> Arc<MemoryPool> {
        Arc::new(MemoryPool::new())
    }

    fn yuv420p8() -> VideoFormat {
        VideoFormat::new(ColorFamily::YUV, SampleType::Integer, 8, 1, 1).unwrap()
    }

    #[test]
    fn test_video_stride_alignment() {
        let pool = pool();
        let frame = Frame::new_video(yuv420p8(), 123, 45, None, &pool);
        let align = frame_alignment();
        assert_eq!(frame.stride(0) % align, 0);
        assert!(frame.stride(0) >= 123);
        // Planes 1 and 2 share a stride derived from chroma subsampling.
        assert_eq!(frame.stride(1), frame.stride(2));
        assert_eq!(frame.stride(1), align_up(123 >> 1, align));
        assert_eq!(frame.plane(1).len(), frame.stride(1) * (45 >> 1));
    }

    #[test]
    fn test_copy_shares_payloads() {
        let pool = pool();
        let frame = Frame::new_video(yuv420p8(), 64, 64, None, &pool);
        assert_eq!(frame.plane_refcount(0), 1);
        let copy = frame.copy();
        assert_eq!(frame.plane_refcount(0), 2);
        assert_eq!(copy.plane_refcount(1), 2);
        drop(copy);
        assert_eq!(frame.plane_refcount(0), 1);
    }

    #[test]
    fn test_copy_on_write_isolates_written_plane() {
        let pool = pool();
        let mut frame = Frame::new_video(yuv420p8(), 64, 64, None, &pool);
        frame.plane_mut(0).fill(10);
        let copy = frame.copy();
        assert_eq!(frame.plane_refcount(0), 2);

        frame.plane_mut(0).fill(99);
        // Written plane was duplicated; both sides now hold it uniquely.
        assert_eq!(frame.plane_refcount(0), 1);
        assert_eq!(copy.plane_refcount(0), 1);
        // Untouched planes are still shared.
        assert_eq!(frame.plane_refcount(1), 2);
        assert_eq!(copy.plane(0)[0], 10);
        assert_eq!(frame.plane(0)[0], 99);
    }

    #[test]
    fn test_write_without_sharing_skips_copy() {
        let pool = pool();
        let mut frame = Frame::new_video(yuv420p8(), 64, 64, None, &pool);
        let before = frame.plane(0).as_ptr();
        frame.plane_mut(0).fill(1);
        assert_eq!(frame.plane(0).as_ptr(), before);
    }

    #[test]
    fn test_plane_stealing_constructor() {
        let pool = pool();
        let mut src = Frame::new_video(yuv420p8(), 64, 64, None, &pool);
        src.plane_mut(1).fill(77);
        let frame = Frame::new_video_from_planes(
            yuv420p8(),
            64,
            64,
            [None, Some((&src, 1)), Some((&src, 2))],
            Some(&src),
            &pool,
        );
        assert_eq!(src.plane_refcount(1), 2);
        assert_eq!(frame.plane(1)[0], 77);
        // Plane 0 was freshly allocated and zeroed.
        assert_eq!(frame.plane(0)[0], 0);
    }

    #[test]
    fn test_audio_frame_layout() {
        let pool = pool();
        let format = AudioFormat::new(SampleType::Integer, 16, STEREO).unwrap();
        let frame = Frame::new_audio(format, 1024, None, &pool);
        assert_eq!(frame.num_samples(), 1024);
        assert_eq!(frame.num_planes(), 2);
        assert_eq!(frame.stride(0), 2 * FRAME_SAMPLES as usize);
        assert_eq!(frame.channel(0).len(), frame.channel(1).len());
    }

    #[test]
    fn test_audio_channel_cow() {
        let pool = pool();
        let format = AudioFormat::new(SampleType::Float, 32, STEREO).unwrap();
        let mut frame = Frame::new_audio(format, 256, None, &pool);
        frame.channel_mut(0).fill(3);
        let copy = frame.copy();
        frame.channel_mut(1).fill(4);
        // Audio shares one payload, so writing either channel unshares it.
        assert_eq!(frame.plane_refcount(0), 1);
        assert_eq!(copy.channel(1)[0], 0);
        assert_eq!(frame.channel(1)[0], 4);
        assert_eq!(frame.channel(0)[0], 3);
    }

    #[test]
    fn test_guard_pattern_survives_normal_writes() {
        let pool = pool();
        let mut frame = Frame::new_video(yuv420p8(), 96, 64, None, &pool);
        frame.plane_mut(0).fill(0xFF);
        frame.plane_mut(1).fill(0xAA);
        assert!(frame.verify_guard_pattern());
    }

    #[test]
    fn test_memory_returns_to_zero_when_frames_drop() {
        let pool = pool();
        assert_eq!(pool.used(), 0);
        let a = Frame::new_video(yuv420p8(), 64, 64, None, &pool);
        let b = a.copy();
        assert!(pool.used() > 0);
        drop(a);
        assert!(pool.used() > 0);
        drop(b);
        assert_eq!(pool.used(), 0);
    }

    #[test]
    fn test_props_template_copied_at_creation() {
        let pool = pool();
        let mut src = Frame::new_video(yuv420p8(), 64, 64, None, &pool);
        src.props_mut().set_int("n", 42);
        let frame = Frame::new_video(yuv420p8(), 64, 64, Some(&src), &pool);
        assert_eq!(frame.props().get_int("n", 0).unwrap(), 42);
    }
}
