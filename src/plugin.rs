//! Plugins, published functions, argument schemas, and invocation.
//!
//! A plugin is a unit of publication: a namespace holding named functions,
//! each with a typed argument schema parsed from the compact text grammar
//! (`name:type[]:opt:empty;...`). Invocation validates the caller's argument
//! map against the schema before the function body runs; failures come back
//! as error-stamped maps, never as panics.
//!
//! Dynamic loading of plugin binaries is a collaborator concern behind the
//! [`PluginLoader`] trait; the core only consumes resolved entry points.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::core::{CoreInner, MessageLevel};
use crate::props::{PropType, PropertyMap};
use crate::{Core, Error, Result, API_MAJOR, LEGACY_API_MAJOR};

/// One record in a node's creation provenance chain: the function invocation
/// that produced it, with an argument snapshot.
pub struct FunctionFrame {
    pub(crate) name: String,
    pub(crate) args: PropertyMap,
    pub(crate) next: Option<Arc<FunctionFrame>>,
}

/// A parsed entry of an argument or return schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FilterArgument {
    pub(crate) name: String,
    pub(crate) typ: PropType,
    pub(crate) arr: bool,
    pub(crate) empty: bool,
    pub(crate) opt: bool,
}

pub(crate) fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parses a semicolon-delimited argument schema. The `api_major` governs the
/// accepted type spellings: the legacy ABI says `clip`/`frame` where the
/// current one says `vnode`/`vframe`, and has no audio types at all.
pub(crate) fn parse_arg_string(spec: &str, api_major: i32) -> Result<Vec<FilterArgument>> {
    let mut out = Vec::new();
    for entry in spec.split(';').filter(|e| !e.is_empty()) {
        let parts: Vec<&str> = entry.split(':').filter(|p| !p.is_empty()).collect();
        if parts.len() < 2 {
            return Err(Error::Argument(format!(
                "invalid argument specifier '{entry}', it appears to be incomplete"
            )));
        }
        let name = parts[0];
        let mut type_name = parts[1];
        let arr = type_name.ends_with("[]");
        if arr {
            type_name = &type_name[..type_name.len() - 2];
        }

        let legacy = api_major == LEGACY_API_MAJOR;
        let typ = match type_name {
            "int" => PropType::Int,
            "float" => PropType::Float,
            "data" => PropType::Data,
            "vnode" if !legacy => PropType::VideoNode,
            "clip" if legacy => PropType::VideoNode,
            "anode" if !legacy => PropType::AudioNode,
            "vframe" if !legacy => PropType::VideoFrame,
            "frame" if legacy => PropType::VideoFrame,
            "aframe" if !legacy => PropType::AudioFrame,
            "func" => PropType::Function,
            _ => {
                return Err(Error::Argument(format!(
                    "argument '{name}' has invalid type '{type_name}'"
                )))
            }
        };

        let mut opt = false;
        let mut empty = false;
        for modifier in &parts[2..] {
            match *modifier {
                "opt" => {
                    if opt {
                        return Err(Error::Argument(format!(
                            "argument '{name}' has duplicate specifier 'opt'"
                        )));
                    }
                    opt = true;
                }
                "empty" => {
                    if empty {
                        return Err(Error::Argument(format!(
                            "argument '{name}' has duplicate specifier 'empty'"
                        )));
                    }
                    empty = true;
                }
                other => {
                    return Err(Error::Argument(format!(
                        "argument '{name}' has unknown modifier '{other}'"
                    )))
                }
            }
        }

        if !is_valid_identifier(name) {
            return Err(Error::Argument(format!(
                "argument name '{name}' contains illegal characters"
            )));
        }
        if empty && !arr {
            return Err(Error::Argument(format!(
                "argument '{name}' is not an array, only array arguments can accept empty"
            )));
        }
        out.push(FilterArgument {
            name: name.to_owned(),
            typ,
            arr,
            empty,
            opt,
        });
    }
    Ok(out)
}

/// Re-emits a schema in the legacy ABI spelling, or `None` if it carries
/// audio types the legacy ABI cannot express.
pub(crate) fn legacy_arg_string(args: &[FilterArgument]) -> Option<String> {
    let mut out = String::new();
    for fa in args {
        let type_name = match fa.typ {
            PropType::Int => "int",
            PropType::Float => "float",
            PropType::Data => "data",
            PropType::VideoNode => "clip",
            PropType::VideoFrame => "frame",
            PropType::Function => "func",
            PropType::AudioNode | PropType::AudioFrame => return None,
        };
        out.push_str(&fa.name);
        out.push(':');
        out.push_str(type_name);
        if fa.arr {
            out.push_str("[]");
        }
        if fa.opt {
            out.push_str(":opt");
        }
        if fa.empty {
            out.push_str(":empty");
        }
        out.push(';');
    }
    Some(out)
}

/// Body of a published function.
pub type FunctionBody =
    Arc<dyn Fn(&PropertyMap, &Core) -> Result<PropertyMap> + Send + Sync>;

/// A named function published by a plugin, with parsed schemas.
pub struct PluginFunction {
    name: String,
    arg_string: String,
    return_string: String,
    pub(crate) args: Vec<FilterArgument>,
    pub(crate) ret_args: Vec<FilterArgument>,
    api_major: i32,
    body: FunctionBody,
}

impl PluginFunction {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The schema text the function was registered with.
    pub fn arg_string(&self) -> &str {
        &self.arg_string
    }

    pub fn return_string(&self) -> &str {
        &self.return_string
    }

    /// Whether both schemas can be expressed under the legacy ABI.
    pub fn is_legacy_compatible(&self) -> bool {
        legacy_arg_string(&self.args).is_some() && legacy_arg_string(&self.ret_args).is_some()
    }

    /// The argument schema re-emitted in legacy spelling.
    pub fn legacy_arg_string(&self) -> Option<String> {
        legacy_arg_string(&self.args)
    }
}

struct PluginConfig {
    id: String,
    namespace: String,
    fullname: String,
    version: i32,
    api_major: i32,
    api_minor: i32,
    lock_after_init: bool,
}

/// A unit of publication: named functions under one namespace.
///
/// Plugins are created and owned by a [`Core`]; hosts and loaders interact
/// with them through `Arc<Plugin>` handles.
pub struct Plugin {
    core: Weak<CoreInner>,
    config: Mutex<Option<PluginConfig>>,
    configured: AtomicBool,
    functions: Mutex<BTreeMap<String, Arc<PluginFunction>>>,
    read_only: AtomicBool,
    /// Whether functions of this plugin accept variable-format node inputs.
    variable_input: AtomicBool,
    /// Absolute path the plugin was loaded from, when applicable.
    filename: Mutex<Option<String>>,
}

impl Plugin {
    pub(crate) fn new(core: &Core, forced_namespace: Option<&str>, forced_id: Option<&str>) -> Plugin {
        let plugin = Plugin {
            core: Arc::downgrade(&core.inner),
            config: Mutex::new(None),
            configured: AtomicBool::new(false),
            functions: Mutex::new(BTreeMap::new()),
            read_only: AtomicBool::new(false),
            variable_input: AtomicBool::new(false),
            filename: Mutex::new(None),
        };
        if forced_namespace.is_some() || forced_id.is_some() {
            *plugin.config.lock() = Some(PluginConfig {
                id: forced_id.unwrap_or_default().to_owned(),
                namespace: forced_namespace.unwrap_or_default().to_owned(),
                fullname: String::new(),
                version: -1,
                api_major: API_MAJOR,
                api_minor: 0,
                lock_after_init: false,
            });
        }
        plugin
    }

    fn core(&self) -> Option<Core> {
        self.core.upgrade().map(|inner| Core { inner })
    }

    /// Sets the plugin's identity. Called exactly once, from the module's
    /// init entry point. `api_version` packs `major << 16 | minor` (a bare
    /// major is also accepted).
    pub fn configure(
        &self,
        identifier: &str,
        namespace: &str,
        fullname: &str,
        plugin_version: i32,
        api_version: i32,
        read_only: bool,
    ) -> Result<()> {
        let mut config = self.config.lock();
        if self.configured.load(Ordering::Acquire) {
            return Err(Error::Plugin(format!(
                "attempted to configure plugin {identifier} twice"
            )));
        }
        let (api_major, api_minor) = if api_version >= 0x10000 {
            (api_version >> 16, api_version & 0xFFFF)
        } else {
            (api_version, 0)
        };
        if api_major != API_MAJOR && api_major != LEGACY_API_MAJOR {
            return Err(Error::Plugin(format!(
                "plugin {identifier} requires unsupported API major {api_major}"
            )));
        }
        let forced = config.take();
        let (id, ns) = match &forced {
            Some(f) => (
                if f.id.is_empty() { identifier } else { &f.id }.to_owned(),
                if f.namespace.is_empty() {
                    namespace
                } else {
                    &f.namespace
                }
                .to_owned(),
            ),
            None => (identifier.to_owned(), namespace.to_owned()),
        };
        *config = Some(PluginConfig {
            id,
            namespace: ns,
            fullname: fullname.to_owned(),
            version: plugin_version,
            api_major,
            api_minor,
            lock_after_init: read_only,
        });
        self.configured.store(true, Ordering::Release);
        Ok(())
    }

    pub fn id(&self) -> String {
        self.config
            .lock()
            .as_ref()
            .map(|c| c.id.clone())
            .unwrap_or_default()
    }

    pub fn namespace(&self) -> String {
        self.config
            .lock()
            .as_ref()
            .map(|c| c.namespace.clone())
            .unwrap_or_default()
    }

    pub fn fullname(&self) -> String {
        self.config
            .lock()
            .as_ref()
            .map(|c| c.fullname.clone())
            .unwrap_or_default()
    }

    pub fn version(&self) -> i32 {
        self.config.lock().as_ref().map(|c| c.version).unwrap_or(-1)
    }

    pub fn api_major(&self) -> i32 {
        self.config
            .lock()
            .as_ref()
            .map(|c| c.api_major)
            .unwrap_or(API_MAJOR)
    }

    pub fn api_minor(&self) -> i32 {
        self.config
            .lock()
            .as_ref()
            .map(|c| c.api_minor)
            .unwrap_or(0)
    }

    pub(crate) fn is_configured(&self) -> bool {
        self.configured.load(Ordering::Acquire)
    }

    pub(crate) fn lock_after_init(&self) -> bool {
        self.config
            .lock()
            .as_ref()
            .is_some_and(|c| c.lock_after_init)
    }

    pub(crate) fn set_filename(&self, path: &str) {
        *self.filename.lock() = Some(path.to_owned());
    }

    pub fn filename(&self) -> Option<String> {
        self.filename.lock().clone()
    }

    /// Marks the plugin read-only; later registration attempts fail.
    pub fn lock(&self) {
        self.read_only.store(true, Ordering::Release);
    }

    /// Allows functions of this plugin to accept variable-format node inputs,
    /// which are otherwise rejected at invocation.
    pub fn enable_variable_input(&self) {
        self.variable_input.store(true, Ordering::Release);
    }

    fn log(&self, level: MessageLevel, msg: &str) {
        if let Some(core) = self.core() {
            core.log_message(level, msg);
        }
    }

    /// Publishes a function under this plugin.
    ///
    /// The argument and return schemas follow the grammar in the module docs
    /// and are parsed under the plugin's ABI major.
    pub fn register_function(
        &self,
        name: &str,
        args: &str,
        return_type: &str,
        body: impl Fn(&PropertyMap, &Core) -> Result<PropertyMap> + Send + Sync + 'static,
    ) -> Result<()> {
        if self.read_only.load(Ordering::Acquire) {
            let msg = format!(
                "tried to register function {name} but plugin {} is read only",
                self.id()
            );
            self.log(MessageLevel::Critical, &msg);
            return Err(Error::Plugin(msg));
        }
        if !is_valid_identifier(name) {
            let msg = format!(
                "plugin {} tried to register '{name}' which is an illegal identifier",
                self.id()
            );
            self.log(MessageLevel::Critical, &msg);
            return Err(Error::Plugin(msg));
        }
        let api_major = self.api_major();
        let parsed_args = parse_arg_string(args, api_major)?;
        let parsed_ret = parse_arg_string(return_type, api_major)?;

        let mut functions = self.functions.lock();
        if functions.contains_key(name) {
            let msg = format!(
                "tried to register function '{name}' more than once for plugin {}",
                self.id()
            );
            self.log(MessageLevel::Critical, &msg);
            return Err(Error::Plugin(msg));
        }
        functions.insert(
            name.to_owned(),
            Arc::new(PluginFunction {
                name: name.to_owned(),
                arg_string: args.to_owned(),
                return_string: return_type.to_owned(),
                args: parsed_args,
                ret_args: parsed_ret,
                api_major,
                body: Arc::new(body),
            }),
        );
        Ok(())
    }

    /// Looks a published function up by name.
    pub fn function(&self, name: &str) -> Option<Arc<PluginFunction>> {
        self.functions.lock().get(name).cloned()
    }

    /// Names of every published function, sorted.
    pub fn function_names(&self) -> Vec<String> {
        self.functions.lock().keys().cloned().collect()
    }

    /// Invokes a published function with schema validation.
    ///
    /// Never panics and never returns `Err`: all failures come back as an
    /// error-stamped map for the caller to inspect with
    /// [`PropertyMap::error`].
    pub fn invoke(&self, core: &Core, func_name: &str, args: &PropertyMap) -> PropertyMap {
        let Some(func) = self.function(func_name) else {
            return PropertyMap::error_map(format!(
                "Function '{func_name}' not found in {}",
                self.id()
            ));
        };

        if let Err(msg) = self.validate_args(&func, func_name, args) {
            return PropertyMap::error_map(msg);
        }

        let inspecting = core.graph_inspection_enabled();
        if inspecting {
            core.push_function_frame(func_name, args.clone());
        }
        let result = (func.body)(args, core);
        if inspecting {
            core.pop_function_frame();
        }

        match result {
            Ok(out) => {
                if func.api_major == LEGACY_API_MAJOR && out.has_audio_values() {
                    return PropertyMap::error_map(format!(
                        "{func_name}: legacy function returned audio values"
                    ));
                }
                out
            }
            Err(e) => PropertyMap::error_map(format!("{func_name}: {e}")),
        }
    }

    fn validate_args(
        &self,
        func: &PluginFunction,
        func_name: &str,
        args: &PropertyMap,
    ) -> std::result::Result<(), String> {
        if let Some(error) = args.error() {
            return Err(format!("{func_name}: argument map carries an error: {error}"));
        }
        if !self.variable_input.load(Ordering::Acquire) {
            for node in args.nodes() {
                let variable = node
                    .video_info()
                    .is_some_and(|vi| vi.format.color_family == crate::ColorFamily::Undefined);
                if variable {
                    return Err(format!(
                        "{func_name}: only filters accepting variable input may take variable format clips"
                    ));
                }
            }
        }
        if func.api_major == LEGACY_API_MAJOR && args.has_audio_values() {
            return Err(format!(
                "{func_name}: legacy functions cannot accept audio values"
            ));
        }

        let mut remaining: Vec<&str> = args.keys().collect();
        for fa in &func.args {
            match args.prop_type(&fa.name) {
                Some(prop_type) => {
                    remaining.retain(|k| *k != fa.name);
                    if prop_type != fa.typ {
                        return Err(format!(
                            "{func_name}: argument {} is not of the correct type",
                            fa.name
                        ));
                    }
                    let len = args.num_elements(&fa.name).unwrap_or(0);
                    if !fa.arr && len > 1 {
                        return Err(format!(
                            "{func_name}: argument {} is not of array type but more than one value was supplied",
                            fa.name
                        ));
                    }
                    if !fa.empty && len < 1 {
                        return Err(format!(
                            "{func_name}: argument {} does not accept empty arrays",
                            fa.name
                        ));
                    }
                }
                None => {
                    if !fa.opt {
                        return Err(format!(
                            "{func_name}: argument {} is required",
                            fa.name
                        ));
                    }
                }
            }
        }
        if !remaining.is_empty() {
            return Err(format!(
                "{func_name}: no argument(s) named {}",
                remaining.join(", ")
            ));
        }
        Ok(())
    }
}

/// Resolved entry point of a plugin module.
///
/// Mirrors the two supported entry-point generations: implementations
/// targeting the current ABI report [`API_MAJOR`]; shims for old modules
/// report [`LEGACY_API_MAJOR`] and are restricted to the legacy type
/// vocabulary.
pub trait PluginInit: Send {
    /// ABI major this module targets.
    fn api_major(&self) -> i32 {
        API_MAJOR
    }

    /// Configures the plugin and registers its functions.
    fn init(self: Box<Self>, plugin: &Plugin, core: &Core) -> Result<()>;
}

/// Abstract loader of plugin modules; dynamic library handling lives behind
/// this seam.
pub trait PluginLoader: Send + Sync {
    /// Resolves a module path to its init entry point, preferring the current
    /// ABI entry point over the legacy one when a module exports both.
    fn load(&self, path: &str, alt_search_path: bool) -> Result<Box<dyn PluginInit>>;

    /// Lists candidate module paths in `dir` ending with `suffix`.
    fn list(&self, dir: &str, suffix: &str) -> Result<Vec<String>>;
}
