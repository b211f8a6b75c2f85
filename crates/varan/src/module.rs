//! Modules and the per-interpreter module table.
//!
//! The table maps dotted names to modules and is owned by one interpreter
//! instance; nothing is process-global, so independent interpreters never
//! share registration state. Registering `a.b.c` creates package
//! placeholders for `a` and `a.b` as needed and links each child into its
//! parent's dict.

use std::{cell::RefCell, fmt, rc::Rc};

use indexmap::IndexMap;

use crate::{
    bytecode::Code,
    value::{Map, Namespace, Value},
};

/// A guest module: a name, its dict of top-level bindings, and the dotted
/// name of its parent package.
#[derive(Debug)]
pub struct ModuleObject {
    name: Rc<str>,
    package: Option<Rc<str>>,
    dict: Namespace,
}

impl ModuleObject {
    /// Creates an empty module. `name` is the full dotted name.
    #[must_use]
    pub(crate) fn new(name: &str) -> Self {
        let package = name.rsplit_once('.').map(|(parent, _)| Rc::from(parent));
        let mut dict = Map::default();
        dict.insert("__name__".to_string(), Value::str(name));
        Self {
            name: Rc::from(name),
            package,
            dict: Rc::new(RefCell::new(dict)),
        }
    }

    /// Creates a package placeholder: an empty module carrying the package
    /// marker so guest code can distinguish it from a plain module.
    #[must_use]
    pub(crate) fn new_package(name: &str) -> Self {
        let module = Self::new(name);
        module.dict.borrow_mut().insert("__path__".to_string(), Value::list(vec![]));
        module
    }

    /// Full dotted name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dotted name of the parent package, if any.
    #[must_use]
    pub fn package(&self) -> Option<&str> {
        self.package.as_deref()
    }

    /// Returns a top-level binding.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Value> {
        self.dict.borrow().get(name).cloned()
    }

    /// Sets a top-level binding.
    pub fn set(&self, name: impl Into<String>, value: Value) {
        self.dict.borrow_mut().insert(name.into(), value);
    }

    /// The module's shared dict, used as the globals of code executing in
    /// this module.
    pub(crate) fn dict(&self) -> &Namespace {
        &self.dict
    }
}

/// Resolves imports that are not satisfied by an already-registered module.
pub trait ModuleLoader {
    /// Returns the compiled body of the named module, or `None` when this
    /// loader cannot provide it.
    fn load(&mut self, name: &str) -> Option<Code>;
}

/// Per-interpreter table of registered modules, keyed by dotted name.
pub(crate) struct ModuleTable {
    modules: IndexMap<String, Rc<ModuleObject>, ahash::RandomState>,
    loader: Option<Box<dyn ModuleLoader>>,
}

impl fmt::Debug for ModuleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleTable")
            .field("modules", &self.modules.keys().collect::<Vec<_>>())
            .field("has_loader", &self.loader.is_some())
            .finish()
    }
}

impl ModuleTable {
    pub(crate) fn new() -> Self {
        Self {
            modules: IndexMap::default(),
            loader: None,
        }
    }

    pub(crate) fn set_loader(&mut self, loader: Box<dyn ModuleLoader>) {
        self.loader = Some(loader);
    }

    pub(crate) fn get(&self, name: &str) -> Option<Rc<ModuleObject>> {
        self.modules.get(name).cloned()
    }

    /// Asks the pluggable loader for a module body not in the table.
    pub(crate) fn load_from_loader(&mut self, name: &str) -> Option<Code> {
        self.loader.as_mut()?.load(name)
    }

    /// Inserts a module under its dotted name, creating package placeholders
    /// for missing ancestors and linking every child into its parent's dict.
    pub(crate) fn insert(&mut self, module: Rc<ModuleObject>) {
        let full_name = module.name().to_string();

        // Materialize ancestor packages left to right.
        let mut prefix_end = 0;
        while let Some(dot) = full_name[prefix_end..].find('.') {
            let prefix = &full_name[..prefix_end + dot];
            if !self.modules.contains_key(prefix) {
                let placeholder = Rc::new(ModuleObject::new_package(prefix));
                self.link_into_parent(&placeholder);
                self.modules.insert(prefix.to_string(), placeholder);
            }
            prefix_end += dot + 1;
        }

        self.link_into_parent(&module);
        self.modules.insert(full_name, module);
    }

    /// Binds `module` into its parent package's dict under its last name
    /// segment.
    fn link_into_parent(&self, module: &Rc<ModuleObject>) {
        let Some(parent_name) = module.package() else { return };
        let Some(parent) = self.modules.get(parent_name) else { return };
        let last_segment = module.name().rsplit('.').next().unwrap_or(module.name());
        parent.set(last_segment, Value::Module(Rc::clone(module)));
    }
}
