//! The ordered, typed property map.
//!
//! Property maps ride along with every frame as an opaque key→value
//! side-channel, and double as the argument/result envelope for plugin
//! function invocation. Keys map to homogeneous arrays of values; insertion
//! order of distinct keys is preserved. A map can be stamped with an error
//! message, turning it into a failure carrier: all queries on an errored map
//! report [`PropsError::Errored`].

use std::fmt;
use std::sync::Arc;

use crate::frames::Frame;
use crate::node::NodeRef;
use crate::Core;

/// The value kinds a property map can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropType {
    Int,
    Float,
    Data,
    VideoNode,
    AudioNode,
    VideoFrame,
    AudioFrame,
    Function,
}

impl fmt::Display for PropType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PropType::Int => "int",
            PropType::Float => "float",
            PropType::Data => "data",
            PropType::VideoNode => "vnode",
            PropType::AudioNode => "anode",
            PropType::VideoFrame => "vframe",
            PropType::AudioFrame => "aframe",
            PropType::Function => "func",
        };
        f.write_str(name)
    }
}

/// Sub-tag on byte-string values recording whether the bytes are known to be
/// UTF-8 text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataTypeHint {
    Utf8,
    Binary,
}

/// A callable published through a property map.
///
/// Functions receive the argument map and the core, and produce a result map
/// (which may itself be error-stamped).
#[derive(Clone)]
pub struct Function(Arc<dyn Fn(&PropertyMap, &Core) -> PropertyMap + Send + Sync>);

impl Function {
    pub fn new(f: impl Fn(&PropertyMap, &Core) -> PropertyMap + Send + Sync + 'static) -> Self {
        Function(Arc::new(f))
    }

    pub fn call(&self, args: &PropertyMap, core: &Core) -> PropertyMap {
        (self.0)(args, core)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Function")
    }
}

#[derive(Debug, Clone)]
enum Value {
    Int(Vec<i64>),
    Float(Vec<f64>),
    Data(Vec<(Vec<u8>, DataTypeHint)>),
    VideoNode(Vec<NodeRef>),
    AudioNode(Vec<NodeRef>),
    VideoFrame(Vec<Arc<Frame>>),
    AudioFrame(Vec<Arc<Frame>>),
    Function(Vec<Function>),
}

impl Value {
    fn prop_type(&self) -> PropType {
        match self {
            Value::Int(_) => PropType::Int,
            Value::Float(_) => PropType::Float,
            Value::Data(_) => PropType::Data,
            Value::VideoNode(_) => PropType::VideoNode,
            Value::AudioNode(_) => PropType::AudioNode,
            Value::VideoFrame(_) => PropType::VideoFrame,
            Value::AudioFrame(_) => PropType::AudioFrame,
            Value::Function(_) => PropType::Function,
        }
    }

    fn len(&self) -> usize {
        match self {
            Value::Int(v) => v.len(),
            Value::Float(v) => v.len(),
            Value::Data(v) => v.len(),
            Value::VideoNode(v) => v.len(),
            Value::AudioNode(v) => v.len(),
            Value::VideoFrame(v) => v.len(),
            Value::AudioFrame(v) => v.len(),
            Value::Function(v) => v.len(),
        }
    }
}

/// Why a property query produced no value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PropsError {
    #[error("key is not set")]
    Unset,
    #[error("value has a different type")]
    WrongType,
    #[error("index out of bounds")]
    Index,
    #[error("map carries an error")]
    Errored,
}

type PropResult<T> = std::result::Result<T, PropsError>;

/// Ordered mapping from string keys to typed value arrays.
///
/// # Examples
///
/// ```
/// use frameflow::PropertyMap;
///
/// let mut map = PropertyMap::new();
/// map.set_int("width", 1920);
/// map.append_int("width", 1280);
/// assert_eq!(map.get_ints("width")?, &[1920, 1280]);
/// assert_eq!(map.get_int("width", 0)?, 1920);
/// # Ok::<(), frameflow::PropsError>(())
/// ```
#[derive(Debug, Clone, Default)]
pub struct PropertyMap {
    entries: Vec<(String, Value)>,
    error: Option<String>,
}

macro_rules! typed_accessors {
    ($set:ident, $append:ident, $get_one:ident, $get_all:ident, $variant:ident, $ty:ty, $ret:ty) => {
        /// Replaces the key with a single value.
        pub fn $set(&mut self, key: &str, value: $ty) {
            self.set_value(key, Value::$variant(vec![value]));
        }

        /// Appends a value to the key's array, creating the key if absent.
        /// Appending to a key of a different type replaces it.
        pub fn $append(&mut self, key: &str, value: $ty) {
            match self.entry_mut(key) {
                Some(Value::$variant(values)) => values.push(value),
                _ => self.set_value(key, Value::$variant(vec![value])),
            }
        }

        /// Reads one element of the key's array.
        pub fn $get_one(&self, key: &str, index: usize) -> PropResult<$ret> {
            match self.entry(key)? {
                Value::$variant(values) => {
                    values.get(index).cloned().ok_or(PropsError::Index)
                }
                _ => Err(PropsError::WrongType),
            }
        }

        /// Reads the key's whole array.
        pub fn $get_all(&self, key: &str) -> PropResult<&[$ret]> {
            match self.entry(key)? {
                Value::$variant(values) => Ok(values),
                _ => Err(PropsError::WrongType),
            }
        }
    };
}

impl PropertyMap {
    pub fn new() -> Self {
        PropertyMap::default()
    }

    fn entry(&self, key: &str) -> PropResult<&Value> {
        if self.error.is_some() {
            return Err(PropsError::Errored);
        }
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
            .ok_or(PropsError::Unset)
    }

    fn entry_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.entries
            .iter_mut()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    fn set_value(&mut self, key: &str, value: Value) {
        match self.entry_mut(key) {
            Some(existing) => *existing = value,
            None => self.entries.push((key.to_owned(), value)),
        }
    }

    typed_accessors!(set_int, append_int, get_int, get_ints, Int, i64, i64);
    typed_accessors!(set_float, append_float, get_float, get_floats, Float, f64, f64);
    typed_accessors!(
        set_video_node,
        append_video_node,
        get_video_node,
        get_video_nodes,
        VideoNode,
        NodeRef,
        NodeRef
    );
    typed_accessors!(
        set_audio_node,
        append_audio_node,
        get_audio_node,
        get_audio_nodes,
        AudioNode,
        NodeRef,
        NodeRef
    );
    typed_accessors!(
        set_video_frame,
        append_video_frame,
        get_video_frame,
        get_video_frames,
        VideoFrame,
        Arc<Frame>,
        Arc<Frame>
    );
    typed_accessors!(
        set_audio_frame,
        append_audio_frame,
        get_audio_frame,
        get_audio_frames,
        AudioFrame,
        Arc<Frame>,
        Arc<Frame>
    );
    typed_accessors!(
        set_function,
        append_function,
        get_function,
        get_functions,
        Function,
        Function,
        Function
    );

    /// Replaces the key with a whole integer array (which may be empty).
    pub fn set_int_array(&mut self, key: &str, values: &[i64]) {
        self.set_value(key, Value::Int(values.to_vec()));
    }

    /// Replaces the key with a whole float array (which may be empty).
    pub fn set_float_array(&mut self, key: &str, values: &[f64]) {
        self.set_value(key, Value::Float(values.to_vec()));
    }

    /// Replaces the key with a single byte-string value.
    pub fn set_data(&mut self, key: &str, value: impl Into<Vec<u8>>, hint: DataTypeHint) {
        self.set_value(key, Value::Data(vec![(value.into(), hint)]));
    }

    /// Appends a byte-string value to the key's array.
    pub fn append_data(&mut self, key: &str, value: impl Into<Vec<u8>>, hint: DataTypeHint) {
        match self.entry_mut(key) {
            Some(Value::Data(values)) => values.push((value.into(), hint)),
            _ => self.set_value(key, Value::Data(vec![(value.into(), hint)])),
        }
    }

    /// Convenience setter for UTF-8 text data.
    pub fn set_utf8(&mut self, key: &str, value: &str) {
        self.set_data(key, value.as_bytes().to_vec(), DataTypeHint::Utf8);
    }

    /// Reads one byte-string element.
    pub fn get_data(&self, key: &str, index: usize) -> PropResult<&[u8]> {
        match self.entry(key)? {
            Value::Data(values) => values
                .get(index)
                .map(|(bytes, _)| bytes.as_slice())
                .ok_or(PropsError::Index),
            _ => Err(PropsError::WrongType),
        }
    }

    /// Reads one byte-string element as UTF-8 text.
    pub fn get_utf8(&self, key: &str, index: usize) -> PropResult<&str> {
        std::str::from_utf8(self.get_data(key, index)?).map_err(|_| PropsError::WrongType)
    }

    /// The sub-tag of a byte-string element.
    pub fn data_type_hint(&self, key: &str, index: usize) -> PropResult<DataTypeHint> {
        match self.entry(key)? {
            Value::Data(values) => values
                .get(index)
                .map(|(_, hint)| *hint)
                .ok_or(PropsError::Index),
            _ => Err(PropsError::WrongType),
        }
    }

    /// The type of a key's value array, or `None` if unset (or errored).
    pub fn prop_type(&self, key: &str) -> Option<PropType> {
        self.entry(key).ok().map(Value::prop_type)
    }

    /// The number of elements stored under a key.
    pub fn num_elements(&self, key: &str) -> Option<usize> {
        self.entry(key).ok().map(Value::len)
    }

    /// Keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes a key. Returns whether it was present.
    pub fn delete_key(&mut self, key: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| k != key);
        self.entries.len() != before
    }

    /// Stamps the map as a failure carrier. Existing content is discarded and
    /// subsequent queries report [`PropsError::Errored`].
    pub fn set_error(&mut self, message: impl Into<String>) {
        self.entries.clear();
        self.error = Some(message.into());
    }

    /// The error message, if this map is a failure carrier.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Builds an error-stamped map in one step.
    pub fn error_map(message: impl Into<String>) -> Self {
        let mut map = PropertyMap::new();
        map.set_error(message);
        map
    }

    /// True if the map holds any audio node or audio frame value (refused by
    /// the legacy invocation checks).
    pub(crate) fn has_audio_values(&self) -> bool {
        self.entries.iter().any(|(_, v)| {
            matches!(
                v.prop_type(),
                PropType::AudioNode | PropType::AudioFrame
            )
        })
    }

    /// All node references stored anywhere in the map.
    pub(crate) fn nodes(&self) -> impl Iterator<Item = &NodeRef> {
        self.entries.iter().flat_map(|(_, v)| -> &[NodeRef] {
            match v {
                Value::VideoNode(nodes) | Value::AudioNode(nodes) => nodes.as_slice(),
                _ => &[],
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_preserved() {
        let mut map = PropertyMap::new();
        map.set_int("b", 1);
        map.set_float("a", 2.0);
        map.set_utf8("c", "x");
        let keys: Vec<&str> = map.keys().collect();
        assert_eq!(keys, ["b", "a", "c"]);
    }

    #[test]
    fn test_append_extends_array() {
        let mut map = PropertyMap::new();
        map.append_int("n", 1);
        map.append_int("n", 2);
        map.append_int("n", 3);
        assert_eq!(map.get_ints("n").unwrap(), &[1, 2, 3]);
        assert_eq!(map.num_elements("n"), Some(3));
    }

    #[test]
    fn test_set_replaces_array() {
        let mut map = PropertyMap::new();
        map.append_int("n", 1);
        map.append_int("n", 2);
        map.set_int("n", 9);
        assert_eq!(map.get_ints("n").unwrap(), &[9]);
    }

    #[test]
    fn test_type_mismatch_signaled_not_fatal() {
        let mut map = PropertyMap::new();
        map.set_int("n", 1);
        assert_eq!(map.get_float("n", 0), Err(PropsError::WrongType));
        assert_eq!(map.get_int("missing", 0), Err(PropsError::Unset));
        assert_eq!(map.get_int("n", 5), Err(PropsError::Index));
    }

    #[test]
    fn test_error_stamp_converts_to_failure_carrier() {
        let mut map = PropertyMap::new();
        map.set_int("n", 1);
        map.set_error("boom");
        assert_eq!(map.error(), Some("boom"));
        assert_eq!(map.get_int("n", 0), Err(PropsError::Errored));
        assert_eq!(map.prop_type("n"), None);
    }

    #[test]
    fn test_data_hint_round_trip() {
        let mut map = PropertyMap::new();
        map.set_utf8("s", "hello");
        map.append_data("s", vec![0u8, 1, 2], DataTypeHint::Binary);
        assert_eq!(map.get_utf8("s", 0).unwrap(), "hello");
        assert_eq!(map.data_type_hint("s", 0).unwrap(), DataTypeHint::Utf8);
        assert_eq!(map.data_type_hint("s", 1).unwrap(), DataTypeHint::Binary);
        assert_eq!(map.get_data("s", 1).unwrap(), &[0, 1, 2]);
    }

    #[test]
    fn test_delete_key() {
        let mut map = PropertyMap::new();
        map.set_int("n", 1);
        assert!(map.delete_key("n"));
        assert!(!map.delete_key("n"));
        assert!(map.is_empty());
    }
}
