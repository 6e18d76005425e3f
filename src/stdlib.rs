//! The built-in `std` plugin: a small set of core filters registered at
//! core construction and locked read-only afterwards.
//!
//! `BlankClip` is a leaf frame source, `Passthrough` the identity filter,
//! `Cache` an explicit caching node participating in memory-pressure
//! trimming, and `AverageNeighbors` a temporal fan-out filter averaging a
//! window of upstream frames.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::FrameContext;
use crate::node::{node_flags, reduce_rational, ActivationReason, Filter, FilterMode, VideoInfo};
use crate::plugin::Plugin;
use crate::props::{PropertyMap, PropsError};
use crate::{
    ColorFamily, Core, Error, Frame, NodeRef, Result, SampleType, VideoFormat, API_MAJOR,
};

pub(crate) fn register_std_plugin(core: &Core) -> Result<Arc<Plugin>> {
    let plugin = Arc::new(Plugin::new(core, None, None));
    plugin.configure(
        "com.frameflow.std",
        "std",
        "FrameFlow core functions",
        1,
        API_MAJOR << 16,
        false,
    )?;
    plugin.register_function(
        "BlankClip",
        "width:int:opt;height:int:opt;format:int:opt;length:int:opt;fpsnum:int:opt;fpsden:int:opt;color:float[]:opt;",
        "clip:vnode;",
        blank_clip,
    )?;
    plugin.register_function("Passthrough", "clip:vnode;", "clip:vnode;", passthrough)?;
    plugin.register_function("Cache", "clip:vnode;size:int:opt;", "clip:vnode;", cache)?;
    plugin.register_function(
        "AverageNeighbors",
        "clip:vnode;radius:int:opt;",
        "clip:vnode;",
        average_neighbors,
    )?;
    plugin.lock();
    core.register_plugin(plugin)
}

/// Reads an optional argument that schema validation already type-checked.
fn int_or(args: &PropertyMap, key: &str, default: i64) -> i64 {
    match args.get_int(key, 0) {
        Ok(v) => v,
        Err(_) => default,
    }
}

fn nodes_to_map(nodes: Vec<NodeRef>) -> PropertyMap {
    let mut out = PropertyMap::new();
    for node in nodes {
        out.append_video_node("clip", node);
    }
    out
}

// ----- BlankClip -----

struct BlankClipFilter {
    vi: VideoInfo,
    color: Vec<f64>,
}

impl Filter for BlankClipFilter {
    fn get_frame(
        &self,
        _n: i32,
        reason: ActivationReason,
        _ctx: &mut FrameContext<'_>,
        core: &Core,
    ) -> Result<Option<Arc<Frame>>> {
        if reason != ActivationReason::Initial {
            return Ok(None);
        }
        let mut frame = core.new_video_frame(self.vi.format, self.vi.width, self.vi.height, None);
        for plane in 0..self.vi.format.num_planes {
            let value = self.color.get(plane).copied().unwrap_or(0.0);
            fill_plane(&mut frame, plane, &self.vi.format, value);
        }
        Ok(Some(Arc::new(frame)))
    }
}

fn blank_clip(args: &PropertyMap, core: &Core) -> Result<PropertyMap> {
    let width = int_or(args, "width", 640) as i32;
    let height = int_or(args, "height", 480) as i32;
    let format = match args.get_int("format", 0) {
        Ok(id) => VideoFormat::from_id(id as u32)?,
        Err(PropsError::Unset) => {
            VideoFormat::new(ColorFamily::RGB, SampleType::Integer, 8, 0, 0)?
        }
        Err(e) => return Err(Error::Argument(e.to_string())),
    };
    if format.color_family == ColorFamily::Undefined {
        return Err(Error::Argument("variable format is not allowed".into()));
    }
    if width < 1 || height < 1 {
        return Err(Error::Argument("dimensions must be positive".into()));
    }
    if width % (1 << format.sub_sampling_w) != 0 || height % (1 << format.sub_sampling_h) != 0 {
        return Err(Error::Argument(
            "dimensions must be divisible by the subsampling factors".into(),
        ));
    }
    let length = int_or(args, "length", 240);
    if length < 1 || length > i32::MAX as i64 {
        return Err(Error::Argument(format!("invalid length {length}")));
    }
    let (fps_num, fps_den) =
        reduce_rational(int_or(args, "fpsnum", 24), int_or(args, "fpsden", 1).max(1));
    let color = match args.get_floats("color") {
        Ok(values) => {
            if values.len() != format.num_planes {
                return Err(Error::Argument(format!(
                    "color needs one component per plane ({} supplied, {} needed)",
                    values.len(),
                    format.num_planes
                )));
            }
            values.to_vec()
        }
        Err(_) => vec![0.0; format.num_planes],
    };

    let vi = VideoInfo {
        format,
        fps_num,
        fps_den,
        width,
        height,
        num_frames: length as i32,
    };
    let nodes = core.create_video_filter(
        "BlankClip",
        vec![vi],
        Box::new(BlankClipFilter { vi, color }),
        FilterMode::Parallel,
        0,
    )?;
    Ok(nodes_to_map(nodes))
}

fn fill_plane(frame: &mut Frame, plane: usize, format: &VideoFormat, value: f64) {
    let data = frame.plane_mut(plane);
    match (format.sample_type, format.bytes_per_sample) {
        (SampleType::Integer, 1) => {
            let max = (1u32 << format.bits_per_sample) - 1;
            data.fill(value.round().clamp(0.0, max as f64) as u8);
        }
        (SampleType::Integer, 2) => {
            let max = (1u32 << format.bits_per_sample) - 1;
            let v = (value.round().clamp(0.0, max as f64) as u16).to_ne_bytes();
            for chunk in data.chunks_exact_mut(2) {
                chunk.copy_from_slice(&v);
            }
        }
        (SampleType::Integer, 4) => {
            let max = ((1u64 << format.bits_per_sample) - 1) as f64;
            let v = (value.round().clamp(0.0, max) as u32).to_ne_bytes();
            for chunk in data.chunks_exact_mut(4) {
                chunk.copy_from_slice(&v);
            }
        }
        (SampleType::Float, 2) => {
            let v = f16_bits(value as f32).to_ne_bytes();
            for chunk in data.chunks_exact_mut(2) {
                chunk.copy_from_slice(&v);
            }
        }
        (SampleType::Float, _) => {
            let v = (value as f32).to_ne_bytes();
            for chunk in data.chunks_exact_mut(4) {
                chunk.copy_from_slice(&v);
            }
        }
        _ => {}
    }
}

/// Truncating f32 to binary16 conversion, enough for constant fills.
fn f16_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exp = ((bits >> 23) & 0xFF) as i32;
    let frac = bits & 0x007F_FFFF;
    if exp == 0xFF {
        return sign | 0x7C00 | if frac != 0 { 0x0200 } else { 0 };
    }
    let exp = exp - 127 + 15;
    if exp >= 0x1F {
        return sign | 0x7C00;
    }
    if exp <= 0 {
        if exp < -10 {
            return sign;
        }
        let frac = frac | 0x0080_0000;
        return sign | (frac >> (14 - exp)) as u16;
    }
    sign | (((exp as u32) << 10) | (frac >> 13)) as u16
}

// ----- Passthrough -----

struct PassthroughFilter {
    clip: NodeRef,
}

impl Filter for PassthroughFilter {
    fn get_frame(
        &self,
        n: i32,
        reason: ActivationReason,
        ctx: &mut FrameContext<'_>,
        _core: &Core,
    ) -> Result<Option<Arc<Frame>>> {
        match reason {
            ActivationReason::Initial => {
                ctx.request_frame(n, &self.clip);
                Ok(None)
            }
            ActivationReason::AllReady => ctx
                .frame(&self.clip, n)
                .map(Some)
                .ok_or_else(|| Error::Filter("upstream frame missing".into())),
            ActivationReason::Error => Ok(None),
        }
    }
}

fn passthrough(args: &PropertyMap, core: &Core) -> Result<PropertyMap> {
    let clip = args
        .get_video_node("clip", 0)
        .map_err(|e| Error::Argument(e.to_string()))?;
    let vi = *clip
        .video_info()
        .ok_or_else(|| Error::Argument("clip is not a video node".into()))?;
    let nodes = core.create_video_filter(
        "Passthrough",
        vec![vi],
        Box::new(PassthroughFilter { clip }),
        FilterMode::Parallel,
        0,
    )?;
    Ok(nodes_to_map(nodes))
}

// ----- Cache -----

struct CacheStore {
    frames: HashMap<i32, Arc<Frame>>,
    order: VecDeque<i32>,
    max: usize,
}

impl CacheStore {
    fn touch(&mut self, n: i32) {
        self.order.retain(|m| *m != n);
        self.order.push_back(n);
    }

    fn trim(&mut self) {
        while self.frames.len() > self.max {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.frames.remove(&oldest);
        }
    }
}

struct CacheFilter {
    clip: NodeRef,
    store: Mutex<CacheStore>,
}

impl Filter for CacheFilter {
    fn get_frame(
        &self,
        n: i32,
        reason: ActivationReason,
        ctx: &mut FrameContext<'_>,
        _core: &Core,
    ) -> Result<Option<Arc<Frame>>> {
        match reason {
            ActivationReason::Initial => {
                let mut store = self.store.lock();
                if let Some(hit) = store.frames.get(&n).cloned() {
                    store.touch(n);
                    return Ok(Some(hit));
                }
                drop(store);
                ctx.request_frame(n, &self.clip);
                Ok(None)
            }
            ActivationReason::AllReady => {
                let frame = ctx
                    .frame(&self.clip, n)
                    .ok_or_else(|| Error::Filter("upstream frame missing".into()))?;
                let mut store = self.store.lock();
                store.frames.insert(n, frame.clone());
                store.touch(n);
                store.trim();
                Ok(Some(frame))
            }
            ActivationReason::Error => Ok(None),
        }
    }

    fn notify_cache(&self, needs_memory: bool) {
        if !needs_memory {
            return;
        }
        let mut store = self.store.lock();
        store.max = (store.max / 2).max(1);
        store.trim();
    }
}

fn cache(args: &PropertyMap, core: &Core) -> Result<PropertyMap> {
    let clip = args
        .get_video_node("clip", 0)
        .map_err(|e| Error::Argument(e.to_string()))?;
    let vi = *clip
        .video_info()
        .ok_or_else(|| Error::Argument("clip is not a video node".into()))?;
    let size = int_or(args, "size", 20);
    if size < 1 {
        return Err(Error::Argument(format!("invalid cache size {size}")));
    }
    let filter = CacheFilter {
        clip,
        store: Mutex::new(CacheStore {
            frames: HashMap::new(),
            order: VecDeque::new(),
            max: size as usize,
        }),
    };
    let nodes = core.create_video_filter(
        "Cache",
        vec![vi],
        Box::new(filter),
        FilterMode::Unordered,
        node_flags::IS_CACHE | node_flags::NO_CACHE,
    )?;
    Ok(nodes_to_map(nodes))
}

// ----- AverageNeighbors -----

struct AverageNeighborsFilter {
    clip: NodeRef,
    vi: VideoInfo,
    radius: i32,
}

impl Filter for AverageNeighborsFilter {
    fn get_frame(
        &self,
        n: i32,
        reason: ActivationReason,
        ctx: &mut FrameContext<'_>,
        core: &Core,
    ) -> Result<Option<Arc<Frame>>> {
        let last = self.clip.num_frames() - 1;
        match reason {
            ActivationReason::Initial => {
                for m in n - self.radius..=n + self.radius {
                    ctx.request_frame(m.clamp(0, last), &self.clip);
                }
                Ok(None)
            }
            ActivationReason::AllReady => {
                let window: Vec<i32> = (n - self.radius..=n + self.radius)
                    .map(|m| m.clamp(0, last))
                    .collect();
                let frames = window
                    .iter()
                    .map(|m| {
                        ctx.frame(&self.clip, *m)
                            .ok_or_else(|| Error::Filter("upstream frame missing".into()))
                    })
                    .collect::<Result<Vec<_>>>()?;
                let center = window
                    .iter()
                    .position(|m| *m == n.clamp(0, last))
                    .unwrap_or(0);
                let mut out = core.new_video_frame(
                    self.vi.format,
                    self.vi.width,
                    self.vi.height,
                    Some(frames[center].as_ref()),
                );
                let count = frames.len() as u32;
                for plane in 0..self.vi.format.num_planes {
                    let dst = out.plane_mut(plane);
                    if self.vi.format.sample_type == SampleType::Integer {
                        for (i, sample) in dst.iter_mut().enumerate() {
                            let sum: u32 =
                                frames.iter().map(|f| f.plane(plane)[i] as u32).sum();
                            *sample = ((sum + count / 2) / count) as u8;
                        }
                    } else {
                        for i in (0..dst.len()).step_by(4) {
                            let sum: f32 = frames
                                .iter()
                                .map(|f| {
                                    f32::from_ne_bytes(
                                        f.plane(plane)[i..i + 4]
                                            .try_into()
                                            .expect("4-byte sample chunk"),
                                    )
                                })
                                .sum();
                            dst[i..i + 4].copy_from_slice(&(sum / count as f32).to_ne_bytes());
                        }
                    }
                }
                Ok(Some(Arc::new(out)))
            }
            ActivationReason::Error => Ok(None),
        }
    }
}

fn average_neighbors(args: &PropertyMap, core: &Core) -> Result<PropertyMap> {
    let clip = args
        .get_video_node("clip", 0)
        .map_err(|e| Error::Argument(e.to_string()))?;
    let vi = *clip
        .video_info()
        .ok_or_else(|| Error::Argument("clip is not a video node".into()))?;
    if vi.width == 0 || vi.format.color_family == ColorFamily::Undefined {
        return Err(Error::Argument(
            "clips with variable format or dimensions are not supported".into(),
        ));
    }
    let eight_bit_int =
        vi.format.sample_type == SampleType::Integer && vi.format.bytes_per_sample == 1;
    let single_float =
        vi.format.sample_type == SampleType::Float && vi.format.bits_per_sample == 32;
    if !eight_bit_int && !single_float {
        return Err(Error::Argument(
            "only 8-bit integer and 32-bit float formats are supported".into(),
        ));
    }
    let radius = int_or(args, "radius", 1);
    if !(1..=30).contains(&radius) {
        return Err(Error::Argument(format!("invalid radius {radius}")));
    }
    let filter = AverageNeighborsFilter {
        clip,
        vi,
        radius: radius as i32,
    };
    let nodes = core.create_video_filter(
        "AverageNeighbors",
        vec![vi],
        Box::new(filter),
        FilterMode::Parallel,
        0,
    )?;
    Ok(nodes_to_map(nodes))
}
