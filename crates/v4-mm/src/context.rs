//! Engine-side root sources
//!
//! The memory manager does not own the engine. It reads the engine's
//! globals and the live execution-context chain through [`EngineRoots`]
//! whenever it needs to enumerate roots.

use std::cell::{Cell, Ref, RefCell};
use std::rc::Rc;

use crate::object::ObjectRef;
use crate::value::Value;

/// Root sources the execution engine exposes to the collector.
pub trait EngineRoots {
    /// The global object
    fn global_object(&self) -> Value;

    /// The currently pending exception (or `undefined`)
    fn exception(&self) -> Value;

    /// Visit every synthesized accessor function pair (getter, setter).
    fn for_each_accessor_pair(&self, visit: &mut dyn FnMut(Value, Value));

    /// Innermost active execution context
    fn current_context(&self) -> Option<Rc<ExecutionContext>>;
}

/// Activation record of a running function.
///
/// Contexts form a chain through `parent`, from the innermost call outwards.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    parent: Option<Rc<ExecutionContext>>,
    this_object: Cell<Value>,
    function: Cell<Value>,
    arguments: RefCell<Vec<Value>>,
    locals: RefCell<Vec<Value>>,
    activation: Cell<Option<ObjectRef>>,
    /// Objects bound by enclosing `with` statements, innermost last
    with_scope: RefCell<Vec<ObjectRef>>,
}

impl ExecutionContext {
    /// Create a context nested inside `parent`
    pub fn new(parent: Option<Rc<ExecutionContext>>) -> Self {
        Self {
            parent,
            ..Self::default()
        }
    }

    /// Enclosing context
    pub fn parent(&self) -> Option<&Rc<ExecutionContext>> {
        self.parent.as_ref()
    }

    /// `this` binding
    pub fn this_value(&self) -> Value {
        self.this_object.get()
    }

    /// Set the `this` binding
    pub fn set_this(&self, value: Value) {
        self.this_object.set(value);
    }

    /// Function being executed
    pub fn function(&self) -> Value {
        self.function.get()
    }

    /// Set the function being executed
    pub fn set_function(&self, value: Value) {
        self.function.set(value);
    }

    /// Argument values
    pub fn arguments(&self) -> Ref<'_, [Value]> {
        Ref::map(self.arguments.borrow(), Vec::as_slice)
    }

    /// Append an argument value
    pub fn push_argument(&self, value: Value) {
        self.arguments.borrow_mut().push(value);
    }

    /// Argument at `index`, `undefined` when absent
    pub fn argument(&self, index: usize) -> Value {
        self.arguments.borrow().get(index).copied().unwrap_or_default()
    }

    /// Local variable values
    pub fn locals(&self) -> Ref<'_, [Value]> {
        Ref::map(self.locals.borrow(), Vec::as_slice)
    }

    /// Store a local, growing the local table with `undefined` as needed
    pub fn set_local(&self, index: usize, value: Value) {
        let mut locals = self.locals.borrow_mut();
        if locals.len() <= index {
            locals.resize(index + 1, Value::undefined());
        }
        locals[index] = value;
    }

    /// Local at `index`, `undefined` when absent
    pub fn local(&self, index: usize) -> Value {
        self.locals.borrow().get(index).copied().unwrap_or_default()
    }

    /// Activation object, if one was materialised
    pub fn activation(&self) -> Option<ObjectRef> {
        self.activation.get()
    }

    /// Install or clear the activation object
    pub fn set_activation(&self, activation: Option<ObjectRef>) {
        self.activation.set(activation);
    }

    /// Enter a `with` block
    pub fn push_with_scope(&self, object: ObjectRef) {
        self.with_scope.borrow_mut().push(object);
    }

    /// Leave the innermost `with` block
    pub fn pop_with_scope(&self) -> Option<ObjectRef> {
        self.with_scope.borrow_mut().pop()
    }

    /// Objects bound by enclosing `with` statements
    pub fn with_scope(&self) -> Ref<'_, [ObjectRef]> {
        Ref::map(self.with_scope.borrow(), Vec::as_slice)
    }
}
