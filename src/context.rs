//! The per-request activation record handed to filters.
//!
//! Each entry into a filter's `get_frame` receives a [`FrameContext`]: the
//! in-filter view of the frame request being evaluated. In the Initial pass
//! the filter declares its upstream needs through
//! [`request_frame`](FrameContext::request_frame); when re-entered with
//! `AllReady` it retrieves the delivered frames with
//! [`frame`](FrameContext::frame). The `frame_data` slot carries filter
//! state across the suspension of a single request.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use crate::frames::Frame;
use crate::node::{Node, NodeRef};

/// Key of a delivered upstream frame: (node id, output index, frame number).
pub(crate) type DeliveredKey = (u64, usize, i32);

/// In-filter view of one frame request.
pub struct FrameContext<'a> {
    output_index: usize,
    n: i32,
    delivered: &'a HashMap<DeliveredKey, Arc<Frame>>,
    /// Upstream requests issued during this pass: (node, output, n).
    pub(crate) staged: Vec<(Arc<Node>, usize, i32)>,
    pub(crate) frame_data: Option<Box<dyn Any + Send>>,
}

impl<'a> FrameContext<'a> {
    pub(crate) fn new(
        output_index: usize,
        n: i32,
        delivered: &'a HashMap<DeliveredKey, Arc<Frame>>,
        frame_data: Option<Box<dyn Any + Send>>,
    ) -> Self {
        FrameContext {
            output_index,
            n,
            delivered,
            staged: Vec::new(),
            frame_data,
        }
    }

    /// The output index this request is evaluating.
    pub fn output_index(&self) -> usize {
        self.output_index
    }

    /// The frame number this request is evaluating.
    pub fn n(&self) -> i32 {
        self.n
    }

    /// Declares that this request needs frame `n` of `upstream` before it can
    /// produce output. Legal only in the Initial pass; the filter must then
    /// return `Ok(None)` to suspend until all declared frames are ready.
    pub fn request_frame(&mut self, n: i32, upstream: &NodeRef) {
        self.staged
            .push((upstream.node.clone(), upstream.index, n));
    }

    /// Retrieves a previously requested upstream frame. Only frames requested
    /// in the Initial pass of this same request are available, and only in
    /// the AllReady pass.
    pub fn frame(&self, upstream: &NodeRef, n: i32) -> Option<Arc<Frame>> {
        self.delivered
            .get(&(upstream.node.id, upstream.index, n))
            .cloned()
    }

    /// Stores per-request filter state that survives the suspension between
    /// activation passes.
    pub fn set_frame_data(&mut self, data: Box<dyn Any + Send>) {
        self.frame_data = Some(data);
    }

    /// Takes back state stored with [`set_frame_data`](Self::set_frame_data).
    pub fn take_frame_data(&mut self) -> Option<Box<dyn Any + Send>> {
        self.frame_data.take()
    }

    /// Borrows the per-request state slot.
    pub fn frame_data(&mut self) -> Option<&mut (dyn Any + Send)> {
        self.frame_data.as_deref_mut()
    }
}
