//! Type objects, C3 linearization, and instance attribute storage.
//!
//! A [`ClassObject`] is immutable once built: its namespace, linearization,
//! and protocol-slot table are all computed by [`ClassObject::build`] and
//! never change afterwards. Instances point at their class and carry either
//! a dict-style attribute store or a fixed-slot array, chosen at class-build
//! time.

use std::{cell::RefCell, fmt, rc::Rc};

use strum::{EnumCount as _, IntoEnumIterator as _};

use crate::{
    exception::{ExcType, RunError, RunResult, VmException},
    resource::{MAX_INHERITANCE_DEPTH, MAX_MRO_LENGTH},
    slots::Slot,
    value::{Map, Value},
};

/// How instances of a class store their attributes.
#[derive(Debug, Clone)]
pub(crate) enum AttrModel {
    /// Open-ended string-keyed store.
    Dict,
    /// Fixed set of attribute names declared at class-build time.
    Slots(Rc<[Rc<str>]>),
}

/// A type object: name, direct bases, computed linearization, attribute
/// namespace, and a dense table of resolved protocol slots.
pub struct ClassObject {
    name: String,
    bases: Vec<Rc<ClassObject>>,
    /// Ancestors in method-resolution order, excluding the class itself
    /// (which is always first in the full linearization).
    ancestors: Vec<Rc<ClassObject>>,
    /// Longest base-chain length, used to bound inheritance depth.
    depth: usize,
    namespace: Map,
    /// Protocol slots resolved over the full linearization at build time,
    /// indexed by `Slot as usize`. Avoids string hashing on hot paths.
    slots: Box<[Option<Value>]>,
    metaclass: Option<Rc<ClassObject>>,
    attr_model: AttrModel,
}

impl fmt::Debug for ClassObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassObject")
            .field("name", &self.name)
            .field("bases", &self.bases.iter().map(|b| b.name()).collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ClassObject {
    /// Creates the universal root class. Every class built with no explicit
    /// bases inherits from this; one root is shared per interpreter instance
    /// so ancestor checks can use pointer identity.
    #[must_use]
    pub(crate) fn new_root() -> Rc<Self> {
        Rc::new(Self {
            name: "object".to_string(),
            bases: Vec::new(),
            ancestors: Vec::new(),
            depth: 0,
            namespace: Map::default(),
            slots: vec![None; Slot::COUNT].into_boxed_slice(),
            metaclass: None,
            attr_model: AttrModel::Dict,
        })
    }

    /// Builds a class from its direct bases and members.
    ///
    /// `members` is the full namespace in install order; protocol slots are
    /// recognized by their conventional names and resolved into the dense
    /// slot table over the finished linearization. Fails with an uncatchable
    /// `InconsistentHierarchy` error when C3 merging is impossible.
    pub(crate) fn build(
        name: &str,
        bases: Vec<Rc<Self>>,
        members: Map,
        attr_model: AttrModel,
        metaclass: Option<Rc<Self>>,
    ) -> RunResult<Rc<Self>> {
        let depth = bases.iter().map(|b| b.depth + 1).max().unwrap_or(0);
        if depth > MAX_INHERITANCE_DEPTH {
            return Err(hierarchy_error(format!(
                "inheritance chain of '{name}' exceeds the maximum depth of {MAX_INHERITANCE_DEPTH}"
            )));
        }
        let ancestors = compute_c3_mro(name, &bases)?;

        let mut slots = vec![None; Slot::COUNT].into_boxed_slice();
        for slot in Slot::iter() {
            let method_name = slot.method_name();
            let resolved = members
                .get(method_name)
                .or_else(|| ancestors.iter().find_map(|a| a.namespace.get(method_name)))
                .cloned();
            slots[slot.index()] = resolved;
        }

        Ok(Rc::new(Self {
            name: name.to_string(),
            bases,
            ancestors,
            depth,
            namespace: members,
            slots,
            metaclass,
            attr_model,
        }))
    }

    /// Returns the class name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the direct bases in declaration order.
    #[must_use]
    pub fn bases(&self) -> &[Rc<Self>] {
        &self.bases
    }

    /// Returns the metaclass, if one was assigned at build time.
    #[must_use]
    pub fn metaclass(&self) -> Option<&Rc<Self>> {
        self.metaclass.as_ref()
    }

    /// Returns the names of the full linearization, the class itself first.
    #[must_use]
    pub fn linearization_names(&self) -> Vec<&str> {
        std::iter::once(self.name())
            .chain(self.ancestors.iter().map(|a| a.name()))
            .collect()
    }

    /// Looks up a name over the full linearization: own namespace first,
    /// then each ancestor in order.
    #[must_use]
    pub(crate) fn lookup(&self, name: &str) -> Option<Value> {
        if let Some(v) = self.namespace.get(name) {
            return Some(v.clone());
        }
        self.ancestors.iter().find_map(|a| a.namespace.get(name).cloned())
    }

    /// Returns the resolved implementation of a protocol slot, if any class
    /// in the linearization defines it.
    #[must_use]
    pub(crate) fn slot(&self, slot: Slot) -> Option<&Value> {
        self.slots[slot.index()].as_ref()
    }

    /// True when `self` is `other` or `other` appears in the linearization.
    #[must_use]
    pub(crate) fn is_subclass_of(self: &Rc<Self>, other: &Rc<Self>) -> bool {
        Rc::ptr_eq(self, other) || self.ancestors.iter().any(|a| Rc::ptr_eq(a, other))
    }

    /// The attribute-storage model instances of this class use.
    pub(crate) fn attr_model(&self) -> &AttrModel {
        &self.attr_model
    }
}

/// Builds an uncatchable linearization failure.
fn hierarchy_error(msg: String) -> RunError {
    RunError::UncatchableExc(Box::new(VmException::new(ExcType::InconsistentHierarchy, Some(msg))))
}

/// C3 merge over the bases' linearizations plus the base list itself.
///
/// Repeatedly selects the first head that appears in no other list's tail,
/// appends it, and removes it everywhere. An empty selection with non-empty
/// lists means the declared base orders conflict; that is a hard failure.
/// Returns the merged linearization excluding the class under construction.
pub(crate) fn compute_c3_mro(name: &str, bases: &[Rc<ClassObject>]) -> RunResult<Vec<Rc<ClassObject>>> {
    if bases.is_empty() {
        return Ok(Vec::new());
    }

    // Each base contributes its own full linearization (base first, then its
    // ancestors); the declared base order is the final list.
    let mut lists: Vec<Vec<Rc<ClassObject>>> = bases
        .iter()
        .map(|base| {
            std::iter::once(Rc::clone(base))
                .chain(base.ancestors.iter().cloned())
                .collect()
        })
        .collect();
    lists.push(bases.to_vec());

    let mut merged: Vec<Rc<ClassObject>> = Vec::new();
    loop {
        lists.retain(|list| !list.is_empty());
        if lists.is_empty() {
            return Ok(merged);
        }
        if merged.len() > MAX_MRO_LENGTH {
            return Err(hierarchy_error(format!(
                "method resolution order of '{name}' exceeds the maximum length of {MAX_MRO_LENGTH}"
            )));
        }

        let candidate = lists
            .iter()
            .map(|list| &list[0])
            .find(|head| !lists.iter().any(|list| list[1..].iter().any(|c| Rc::ptr_eq(c, head))))
            .cloned();

        let Some(winner) = candidate else {
            let base_names: Vec<&str> = bases.iter().map(|b| b.name()).collect();
            return Err(hierarchy_error(format!(
                "cannot create a consistent method resolution order for '{name}' with bases {}",
                base_names.join(", ")
            )));
        };

        for list in &mut lists {
            list.retain(|c| !Rc::ptr_eq(c, &winner));
        }
        merged.push(winner);
    }
}

/// Instance attribute storage.
#[derive(Debug)]
pub(crate) enum AttrStore {
    Dict(RefCell<Map>),
    Slots {
        names: Rc<[Rc<str>]>,
        values: RefCell<Box<[Option<Value>]>>,
    },
}

/// An instance: a class pointer plus attribute storage.
#[derive(Debug)]
pub struct Instance {
    class: Rc<ClassObject>,
    attrs: AttrStore,
}

impl Instance {
    /// Allocates an empty instance using the class's attribute model.
    #[must_use]
    pub(crate) fn new(class: Rc<ClassObject>) -> Self {
        let attrs = match class.attr_model() {
            AttrModel::Dict => AttrStore::Dict(RefCell::new(Map::default())),
            AttrModel::Slots(names) => AttrStore::Slots {
                names: Rc::clone(names),
                values: RefCell::new(vec![None; names.len()].into_boxed_slice()),
            },
        };
        Self { class, attrs }
    }

    /// Returns the class of this instance.
    #[must_use]
    pub fn class(&self) -> &Rc<ClassObject> {
        &self.class
    }

    /// Reads an attribute from the instance's own store.
    #[must_use]
    pub(crate) fn get_attr(&self, name: &str) -> Option<Value> {
        match &self.attrs {
            AttrStore::Dict(map) => map.borrow().get(name).cloned(),
            AttrStore::Slots { names, values } => {
                let idx = names.iter().position(|n| &**n == name)?;
                values.borrow()[idx].clone()
            }
        }
    }

    /// Writes an attribute into the instance's own store. Fails with
    /// `AttributeError` for a name outside a fixed-slot layout.
    pub(crate) fn set_attr(&self, name: &str, value: Value) -> RunResult<()> {
        match &self.attrs {
            AttrStore::Dict(map) => {
                map.borrow_mut().insert(name.to_string(), value);
                Ok(())
            }
            AttrStore::Slots { names, values } => {
                let Some(idx) = names.iter().position(|n| &**n == name) else {
                    return Err(ExcType::attribute_error(self.class.name(), name));
                };
                values.borrow_mut()[idx] = Some(value);
                Ok(())
            }
        }
    }

    /// Deletes an attribute from the instance's own store.
    pub(crate) fn del_attr(&self, name: &str) -> RunResult<()> {
        let found = match &self.attrs {
            AttrStore::Dict(map) => map.borrow_mut().shift_remove(name).is_some(),
            AttrStore::Slots { names, values } => match names.iter().position(|n| &**n == name) {
                Some(idx) => values.borrow_mut()[idx].take().is_some(),
                None => false,
            },
        };
        if found {
            Ok(())
        } else {
            Err(ExcType::attribute_error(self.class.name(), name))
        }
    }
}

/// Host-facing class definition, consumed by the interpreter's
/// class-construction entry point.
///
/// Members are installed in a fixed order: plain attributes, then the
/// constructor hooks, then instance methods, then class methods, static
/// methods, and properties. Later installs of the same name win.
#[derive(Debug, Default)]
pub struct ClassBuilder {
    name: String,
    bases: Vec<Rc<ClassObject>>,
    attrs: Vec<(String, Value)>,
    methods: Vec<(String, Value)>,
    classmethods: Vec<(String, Value)>,
    staticmethods: Vec<(String, Value)>,
    properties: Vec<(String, Value, Option<Value>)>,
    fixed_slots: Option<Vec<Rc<str>>>,
    metaclass: Option<Rc<ClassObject>>,
}

impl ClassBuilder {
    /// Starts a class definition. With no explicit bases the class inherits
    /// from the interpreter's root class.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Adds a direct base. Declaration order is significant for
    /// linearization.
    #[must_use]
    pub fn base(mut self, class: &Rc<ClassObject>) -> Self {
        self.bases.push(Rc::clone(class));
        self
    }

    /// Adds a plain class attribute.
    #[must_use]
    pub fn attr(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attrs.push((name.into(), value));
        self
    }

    /// Adds an instance method. Protocol slots are declared here under their
    /// conventional names (e.g. `__add__`).
    #[must_use]
    pub fn method(mut self, name: impl Into<String>, func: Value) -> Self {
        self.methods.push((name.into(), func));
        self
    }

    /// Adds a class method (receives the class instead of the instance).
    #[must_use]
    pub fn classmethod(mut self, name: impl Into<String>, func: Value) -> Self {
        self.classmethods.push((name.into(), func));
        self
    }

    /// Adds a static method (no implicit receiver).
    #[must_use]
    pub fn staticmethod(mut self, name: impl Into<String>, func: Value) -> Self {
        self.staticmethods.push((name.into(), func));
        self
    }

    /// Adds a computed attribute with an optional setter.
    #[must_use]
    pub fn property(mut self, name: impl Into<String>, getter: Value, setter: Option<Value>) -> Self {
        self.properties.push((name.into(), getter, setter));
        self
    }

    /// Restricts instances to a fixed set of attribute names, stored in a
    /// flat array instead of a dict.
    #[must_use]
    pub fn fixed_slots(mut self, names: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        self.fixed_slots = Some(names.into_iter().map(|n| Rc::from(n.as_ref())).collect());
        self
    }

    /// Assigns a metaclass. Metaclasses are assigned, not inherited through
    /// the linearization.
    #[must_use]
    pub fn metaclass(mut self, class: &Rc<ClassObject>) -> Self {
        self.metaclass = Some(Rc::clone(class));
        self
    }

    /// Returns the declared class name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Assembles the namespace in install order and builds the class.
    /// `root` is used as the implicit base when none was declared.
    pub(crate) fn build(self, root: &Rc<ClassObject>) -> RunResult<Rc<ClassObject>> {
        let bases = if self.bases.is_empty() {
            vec![Rc::clone(root)]
        } else {
            self.bases
        };

        let mut members = Map::default();
        for (name, value) in self.attrs {
            members.insert(name, value);
        }
        let (ctors, methods): (Vec<_>, Vec<_>) = self
            .methods
            .into_iter()
            .partition(|(name, _)| name == "__new__" || name == "__init__");
        for (name, func) in ctors.into_iter().chain(methods) {
            members.insert(name, func);
        }
        for (name, func) in self.classmethods {
            members.insert(name, Value::ClassMethod(Rc::new(func)));
        }
        for (name, func) in self.staticmethods {
            members.insert(name, Value::StaticMethod(Rc::new(func)));
        }
        for (name, getter, setter) in self.properties {
            members.insert(
                name,
                Value::Property(Rc::new(crate::value::PropertyDescriptor { getter, setter })),
            );
        }

        let attr_model = match self.fixed_slots {
            Some(names) => AttrModel::Slots(Rc::from(names)),
            None => AttrModel::Dict,
        };
        ClassObject::build(&self.name, bases, members, attr_model, self.metaclass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn class(name: &str, bases: &[&Rc<ClassObject>]) -> Rc<ClassObject> {
        let mut builder = ClassBuilder::new(name);
        for base in bases {
            builder = builder.base(base);
        }
        builder.build(&ClassObject::new_root()).unwrap()
    }

    #[test]
    fn diamond_linearizes_left_to_right() {
        let root = ClassObject::new_root();
        let a = ClassBuilder::new("A").build(&root).unwrap();
        let b = ClassBuilder::new("B").base(&a).build(&root).unwrap();
        let c = ClassBuilder::new("C").base(&a).build(&root).unwrap();
        let d = ClassBuilder::new("D").base(&b).base(&c).build(&root).unwrap();
        assert_eq!(d.linearization_names(), vec!["D", "B", "C", "A", "object"]);
    }

    #[test]
    fn inconsistent_order_fails_construction() {
        let root = ClassObject::new_root();
        let a = ClassBuilder::new("A").build(&root).unwrap();
        let b = ClassBuilder::new("B").build(&root).unwrap();
        let ab = ClassBuilder::new("AB").base(&a).base(&b).build(&root).unwrap();
        let ba = ClassBuilder::new("BA").base(&b).base(&a).build(&root).unwrap();
        let err = ClassBuilder::new("Broken").base(&ab).base(&ba).build(&root).unwrap_err();
        assert_eq!(err.exc_type(), Some(ExcType::InconsistentHierarchy));
        assert!(!err.is_catchable_as(ExcType::BaseException));
    }

    #[test]
    fn linearization_has_no_duplicates_and_preserves_base_order() {
        let d = {
            let root = ClassObject::new_root();
            let a = class("A", &[]);
            let b = ClassBuilder::new("B").base(&a).build(&root).unwrap();
            let c = ClassBuilder::new("C").base(&a).build(&root).unwrap();
            ClassBuilder::new("D").base(&b).base(&c).build(&root).unwrap()
        };
        let names = d.linearization_names();
        let mut deduped = names.clone();
        deduped.dedup();
        assert_eq!(names, deduped);
        let pos = |n: &str| names.iter().position(|x| *x == n).unwrap();
        assert!(pos("B") < pos("C"));
    }

    #[test]
    fn slot_table_resolves_over_linearization() {
        let root = ClassObject::new_root();
        let base = ClassBuilder::new("Base")
            .method("__len__", Value::Int(0))
            .build(&root)
            .unwrap();
        let derived = ClassBuilder::new("Derived").base(&base).build(&root).unwrap();
        assert!(derived.slot(Slot::Len).is_some());
        assert!(derived.slot(Slot::Add).is_none());
    }

    #[test]
    fn fixed_slot_instances_reject_unknown_names() {
        let root = ClassObject::new_root();
        let point = ClassBuilder::new("Point")
            .fixed_slots(["x", "y"])
            .build(&root)
            .unwrap();
        let inst = Instance::new(point);
        inst.set_attr("x", Value::Int(1)).unwrap();
        assert!(matches!(inst.get_attr("x"), Some(Value::Int(1))));
        let err = inst.set_attr("z", Value::Int(3)).unwrap_err();
        assert_eq!(err.exc_type(), Some(ExcType::AttributeError));
    }

    #[test]
    fn attribute_deletion() {
        let root = ClassObject::new_root();
        let c = ClassBuilder::new("C").build(&root).unwrap();
        let inst = Instance::new(c);
        inst.set_attr("x", Value::Int(1)).unwrap();
        inst.del_attr("x").unwrap();
        assert!(inst.get_attr("x").is_none());
        assert!(inst.del_attr("x").is_err());
    }

    #[test]
    fn subclass_check_uses_identity() {
        let root = ClassObject::new_root();
        let a = class("A", &[]);
        let b = ClassBuilder::new("B").base(&a).build(&root).unwrap();
        assert!(b.is_subclass_of(&a));
        assert!(!a.is_subclass_of(&b));
        let other_a = class("A", &[]);
        assert!(!b.is_subclass_of(&other_a));
    }
}
