use std::any::Any;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock, RwLock};

use anyhow::bail;
use rustc_hash::FxHashMap;

use crate::callback::remote::RemoteCallback;
use crate::dispatch::context::SessionContext;
use crate::fault::Fault;
use crate::wire::value::{Value, ValueKind};

/// Per-call components are constructed fresh for every dispatched call and
///  discarded afterwards; shared components are constructed lazily exactly
///  once and reused for every call.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Activation {
    PerCall,
    Shared,
}

pub type ComponentInstance = Arc<dyn Any + Send + Sync>;
pub type MethodFuture = Pin<Box<dyn Future<Output = Result<Value, Fault>> + Send>>;
type MethodHandlerFn =
    dyn Fn(ComponentInstance, Vec<CallArg>, SessionContext) -> MethodFuture + Send + Sync;

/// One argument after callback resolution: a plain value, or an adapter
///  bridging to the caller's callable.
#[derive(Debug)]
pub enum CallArg {
    Value(Value),
    Callback(RemoteCallback),
}

impl CallArg {
    pub fn kind(&self) -> ValueKind {
        match self {
            CallArg::Value(value) => value.kind(),
            CallArg::Callback(_) => ValueKind::Callback,
        }
    }
}

/// What a parameter slot accepts.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ParamKind {
    Bool,
    I32,
    I64,
    F64,
    Str,
    Bytes,
    List,
    Callback,
    /// any value, including null
    Any,
}

impl ParamKind {
    fn matches_exact(&self, kind: ValueKind) -> bool {
        match self {
            ParamKind::Bool => kind == ValueKind::Bool,
            ParamKind::I32 => kind == ValueKind::I32,
            ParamKind::I64 => kind == ValueKind::I64,
            ParamKind::F64 => kind == ValueKind::F64,
            ParamKind::Str => kind == ValueKind::Str,
            ParamKind::Bytes => kind == ValueKind::Bytes,
            ParamKind::List => kind == ValueKind::List,
            ParamKind::Callback => kind == ValueKind::Callback,
            ParamKind::Any => true,
        }
    }

    /// widening fallback: an i32 argument fits an i64 or f64 slot
    fn accepts_widened(&self, kind: ValueKind) -> bool {
        if self.matches_exact(kind) {
            return true;
        }
        match self {
            ParamKind::I64 => kind == ValueKind::I32,
            ParamKind::F64 => matches!(kind, ValueKind::I32 | ValueKind::I64),
            _ => false,
        }
    }
}

/// One registered method: its parameter signature and the handler bridging
///  the untyped call into typed component code.
pub struct MethodEntry {
    name: String,
    params: Vec<ParamKind>,
    handler: Arc<MethodHandlerFn>,
}

impl MethodEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[ParamKind] {
        &self.params
    }

    pub fn invoke(
        &self,
        instance: ComponentInstance,
        args: Vec<CallArg>,
        context: SessionContext,
    ) -> MethodFuture {
        (self.handler)(instance, args, context)
    }
}

impl std::fmt::Debug for MethodEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MethodEntry{{name:{}, params:{:?}}}", self.name, self.params)
    }
}

/// The method table of one registration, keyed by (name, arity, parameter
///  signature). Built once when the component is registered; resolution at
///  dispatch time is a lookup, never reflection.
#[derive(Debug, Default)]
pub struct MethodTable {
    methods: FxHashMap<(String, usize), Vec<MethodEntry>>,
}

impl MethodTable {
    fn insert(&mut self, entry: MethodEntry) -> anyhow::Result<()> {
        let overloads = self
            .methods
            .entry((entry.name.clone(), entry.params.len()))
            .or_default();
        if overloads.iter().any(|existing| existing.params == entry.params) {
            bail!(
                "duplicate registration of method {} with signature {:?}",
                entry.name,
                entry.params
            );
        }
        overloads.push(entry);
        Ok(())
    }

    /// Resolves by name, arity and argument kinds: an exact signature match
    ///  first, then a single widening match.
    pub fn resolve(&self, name: &str, kinds: &[ValueKind]) -> Option<&MethodEntry> {
        let overloads = self.methods.get(&(name.to_owned(), kinds.len()))?;

        if let Some(exact) = overloads.iter().find(|entry| {
            entry
                .params
                .iter()
                .zip(kinds)
                .all(|(param, kind)| param.matches_exact(*kind))
        }) {
            return Some(exact);
        }
        overloads.iter().find(|entry| {
            entry
                .params
                .iter()
                .zip(kinds)
                .all(|(param, kind)| param.accepts_widened(*kind))
        })
    }

    pub fn len(&self) -> usize {
        self.methods.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// One interface's registration: how instances come to be, and what can be
///  called on them.
pub struct ComponentRegistration {
    interface: String,
    activation: Activation,
    factory: Box<dyn Fn() -> ComponentInstance + Send + Sync>,
    methods: MethodTable,
    shared_slot: OnceLock<ComponentInstance>,
}

impl ComponentRegistration {
    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn methods(&self) -> &MethodTable {
        &self.methods
    }

    /// Obtains the instance for one call. Per-call activation constructs a
    ///  fresh instance; shared activation creates the one instance at most
    ///  once - the slot's lock-free read is the fast path, creation races
    ///  serialize on the per-registration slot.
    pub fn instance(&self) -> ComponentInstance {
        match self.activation {
            Activation::PerCall => (self.factory)(),
            Activation::Shared => self.shared_slot.get_or_init(|| (self.factory)()).clone(),
        }
    }
}

impl std::fmt::Debug for ComponentRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ComponentRegistration{{interface:{}, activation:{:?}, methods:{}}}",
            self.interface,
            self.activation,
            self.methods.len()
        )
    }
}

/// The component catalog the dispatcher consumes: registration lookup by
///  interface name. One lock guards the mapping; it is never held while a
///  component runs.
#[derive(Debug, Default)]
pub struct ComponentCatalog {
    registrations: RwLock<FxHashMap<String, Arc<ComponentRegistration>>>,
}

impl ComponentCatalog {
    pub fn new() -> ComponentCatalog {
        Default::default()
    }

    pub fn register(&self, registration: ComponentRegistration) -> anyhow::Result<()> {
        let mut registrations = self.registrations.write().unwrap();
        if registrations.contains_key(&registration.interface) {
            bail!(
                "a component is already registered for interface {}",
                registration.interface
            );
        }
        registrations.insert(registration.interface.clone(), Arc::new(registration));
        Ok(())
    }

    pub fn get_registration(&self, interface: &str) -> Option<Arc<ComponentRegistration>> {
        self.registrations.read().unwrap().get(interface).cloned()
    }

    pub fn interfaces(&self) -> Vec<String> {
        self.registrations.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.registrations.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.read().unwrap().is_empty()
    }
}

/// Conversion from a resolved argument into a typed parameter. The widening
///  accepted here mirrors [ParamKind::accepts_widened].
pub trait FromArg: Sized {
    const PARAM: ParamKind;
    fn from_arg(arg: CallArg) -> Result<Self, Fault>;
}

fn arg_mismatch(expected: ParamKind, arg: &CallArg) -> Fault {
    Fault::Encoding(format!(
        "argument of kind {:?} does not fit parameter {:?}",
        arg.kind(),
        expected
    ))
}

impl FromArg for bool {
    const PARAM: ParamKind = ParamKind::Bool;
    fn from_arg(arg: CallArg) -> Result<Self, Fault> {
        match arg {
            CallArg::Value(Value::Bool(value)) => Ok(value),
            other => Err(arg_mismatch(Self::PARAM, &other)),
        }
    }
}

impl FromArg for i32 {
    const PARAM: ParamKind = ParamKind::I32;
    fn from_arg(arg: CallArg) -> Result<Self, Fault> {
        match arg {
            CallArg::Value(Value::I32(value)) => Ok(value),
            other => Err(arg_mismatch(Self::PARAM, &other)),
        }
    }
}

impl FromArg for i64 {
    const PARAM: ParamKind = ParamKind::I64;
    fn from_arg(arg: CallArg) -> Result<Self, Fault> {
        match arg {
            CallArg::Value(Value::I64(value)) => Ok(value),
            CallArg::Value(Value::I32(value)) => Ok(value as i64),
            other => Err(arg_mismatch(Self::PARAM, &other)),
        }
    }
}

impl FromArg for f64 {
    const PARAM: ParamKind = ParamKind::F64;
    fn from_arg(arg: CallArg) -> Result<Self, Fault> {
        match arg {
            CallArg::Value(Value::F64(value)) => Ok(value),
            CallArg::Value(Value::I32(value)) => Ok(value as f64),
            CallArg::Value(Value::I64(value)) => Ok(value as f64),
            other => Err(arg_mismatch(Self::PARAM, &other)),
        }
    }
}

impl FromArg for String {
    const PARAM: ParamKind = ParamKind::Str;
    fn from_arg(arg: CallArg) -> Result<Self, Fault> {
        match arg {
            CallArg::Value(Value::Str(value)) => Ok(value),
            other => Err(arg_mismatch(Self::PARAM, &other)),
        }
    }
}

impl FromArg for Vec<u8> {
    const PARAM: ParamKind = ParamKind::Bytes;
    fn from_arg(arg: CallArg) -> Result<Self, Fault> {
        match arg {
            CallArg::Value(Value::Bytes(value)) => Ok(value),
            other => Err(arg_mismatch(Self::PARAM, &other)),
        }
    }
}

impl FromArg for Vec<Value> {
    const PARAM: ParamKind = ParamKind::List;
    fn from_arg(arg: CallArg) -> Result<Self, Fault> {
        match arg {
            CallArg::Value(Value::List(values)) => Ok(values),
            other => Err(arg_mismatch(Self::PARAM, &other)),
        }
    }
}

impl FromArg for Value {
    const PARAM: ParamKind = ParamKind::Any;
    fn from_arg(arg: CallArg) -> Result<Self, Fault> {
        match arg {
            CallArg::Value(value) => Ok(value),
            other => Err(arg_mismatch(Self::PARAM, &other)),
        }
    }
}

impl FromArg for RemoteCallback {
    const PARAM: ParamKind = ParamKind::Callback;
    fn from_arg(arg: CallArg) -> Result<Self, Fault> {
        match arg {
            CallArg::Callback(callback) => Ok(callback),
            other => Err(arg_mismatch(Self::PARAM, &other)),
        }
    }
}

/// Conversion of a typed return value into the wire value.
pub trait IntoValue {
    fn into_value(self) -> Value;
}

impl IntoValue for () {
    fn into_value(self) -> Value {
        Value::Null
    }
}
impl IntoValue for bool {
    fn into_value(self) -> Value {
        Value::Bool(self)
    }
}
impl IntoValue for i32 {
    fn into_value(self) -> Value {
        Value::I32(self)
    }
}
impl IntoValue for i64 {
    fn into_value(self) -> Value {
        Value::I64(self)
    }
}
impl IntoValue for f64 {
    fn into_value(self) -> Value {
        Value::F64(self)
    }
}
impl IntoValue for String {
    fn into_value(self) -> Value {
        Value::Str(self)
    }
}
impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::Str(self.to_owned())
    }
}
impl IntoValue for Vec<u8> {
    fn into_value(self) -> Value {
        Value::Bytes(self)
    }
}
impl IntoValue for Vec<Value> {
    fn into_value(self) -> Value {
        Value::List(self)
    }
}
impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

fn downcast<T: Send + Sync + 'static>(instance: ComponentInstance) -> Result<Arc<T>, Fault> {
    instance
        .downcast::<T>()
        .map_err(|_| Fault::Target("component instance has an unexpected type".to_owned()))
}

fn ready(result: Result<Value, Fault>) -> MethodFuture {
    Box::pin(std::future::ready(result))
}

/// Typed registration of a component: the factory, the activation policy,
///  and one handler per method. The handlers close over plain functions of
///  `&T`; no runtime code generation, no per-call reflection.
pub struct ComponentBuilder<T: Send + Sync + 'static> {
    interface: String,
    activation: Activation,
    factory: Box<dyn Fn() -> Arc<T> + Send + Sync>,
    methods: MethodTable,
}

impl<T: Send + Sync + 'static> ComponentBuilder<T> {
    pub fn new(
        interface: &str,
        activation: Activation,
        factory: impl Fn() -> T + Send + Sync + 'static,
    ) -> ComponentBuilder<T> {
        ComponentBuilder {
            interface: interface.to_owned(),
            activation,
            factory: Box::new(move || Arc::new(factory())),
            methods: MethodTable::default(),
        }
    }

    fn push(mut self, name: &str, params: Vec<ParamKind>, handler: Arc<MethodHandlerFn>) -> Self {
        self.methods
            .insert(MethodEntry {
                name: name.to_owned(),
                params,
                handler,
            })
            .expect("duplicate method signature in component registration");
        self
    }

    pub fn method0<R>(self, name: &str, f: impl Fn(&T) -> Result<R, Fault> + Send + Sync + 'static) -> Self
    where
        R: IntoValue + Send + 'static,
    {
        let handler: Arc<MethodHandlerFn> = Arc::new(move |instance, _args, _context| {
            let result = downcast::<T>(instance).and_then(|t| f(&t).map(IntoValue::into_value));
            ready(result)
        });
        self.push(name, vec![], handler)
    }

    pub fn method1<A1, R>(
        self,
        name: &str,
        f: impl Fn(&T, A1) -> Result<R, Fault> + Send + Sync + 'static,
    ) -> Self
    where
        A1: FromArg + Send + 'static,
        R: IntoValue + Send + 'static,
    {
        let handler: Arc<MethodHandlerFn> = Arc::new(move |instance, args, _context| {
            let result = downcast::<T>(instance).and_then(|t| {
                let mut args = args.into_iter();
                let a1 = A1::from_arg(args.next().expect("arity checked at resolution"))?;
                f(&t, a1).map(IntoValue::into_value)
            });
            ready(result)
        });
        self.push(name, vec![A1::PARAM], handler)
    }

    pub fn method2<A1, A2, R>(
        self,
        name: &str,
        f: impl Fn(&T, A1, A2) -> Result<R, Fault> + Send + Sync + 'static,
    ) -> Self
    where
        A1: FromArg + Send + 'static,
        A2: FromArg + Send + 'static,
        R: IntoValue + Send + 'static,
    {
        let handler: Arc<MethodHandlerFn> = Arc::new(move |instance, args, _context| {
            let result = downcast::<T>(instance).and_then(|t| {
                let mut args = args.into_iter();
                let a1 = A1::from_arg(args.next().expect("arity checked at resolution"))?;
                let a2 = A2::from_arg(args.next().expect("arity checked at resolution"))?;
                f(&t, a1, a2).map(IntoValue::into_value)
            });
            ready(result)
        });
        self.push(name, vec![A1::PARAM, A2::PARAM], handler)
    }

    pub fn method3<A1, A2, A3, R>(
        self,
        name: &str,
        f: impl Fn(&T, A1, A2, A3) -> Result<R, Fault> + Send + Sync + 'static,
    ) -> Self
    where
        A1: FromArg + Send + 'static,
        A2: FromArg + Send + 'static,
        A3: FromArg + Send + 'static,
        R: IntoValue + Send + 'static,
    {
        let handler: Arc<MethodHandlerFn> = Arc::new(move |instance, args, _context| {
            let result = downcast::<T>(instance).and_then(|t| {
                let mut args = args.into_iter();
                let a1 = A1::from_arg(args.next().expect("arity checked at resolution"))?;
                let a2 = A2::from_arg(args.next().expect("arity checked at resolution"))?;
                let a3 = A3::from_arg(args.next().expect("arity checked at resolution"))?;
                f(&t, a1, a2, a3).map(IntoValue::into_value)
            });
            ready(result)
        });
        self.push(name, vec![A1::PARAM, A2::PARAM, A3::PARAM], handler)
    }

    /// Async method of one argument, for component code that awaits - most
    ///  prominently, invoking a callback argument.
    pub fn method1_async<A1, R, F, Fut>(self, name: &str, f: F) -> Self
    where
        A1: FromArg + Send + 'static,
        R: IntoValue + Send + 'static,
        F: Fn(Arc<T>, A1) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Fault>> + Send + 'static,
    {
        let handler: Arc<MethodHandlerFn> = Arc::new(move |instance, args, _context| {
            let prepared = downcast::<T>(instance).and_then(|t| {
                let mut args = args.into_iter();
                let a1 = A1::from_arg(args.next().expect("arity checked at resolution"))?;
                Ok((t, a1))
            });
            match prepared {
                Ok((t, a1)) => {
                    let fut = f(t, a1);
                    Box::pin(async move { fut.await.map(IntoValue::into_value) })
                }
                Err(fault) => ready(Err(fault)),
            }
        });
        self.push(name, vec![A1::PARAM], handler)
    }

    pub fn method2_async<A1, A2, R, F, Fut>(self, name: &str, f: F) -> Self
    where
        A1: FromArg + Send + 'static,
        A2: FromArg + Send + 'static,
        R: IntoValue + Send + 'static,
        F: Fn(Arc<T>, A1, A2) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, Fault>> + Send + 'static,
    {
        let handler: Arc<MethodHandlerFn> = Arc::new(move |instance, args, _context| {
            let prepared = downcast::<T>(instance).and_then(|t| {
                let mut args = args.into_iter();
                let a1 = A1::from_arg(args.next().expect("arity checked at resolution"))?;
                let a2 = A2::from_arg(args.next().expect("arity checked at resolution"))?;
                Ok((t, a1, a2))
            });
            match prepared {
                Ok((t, a1, a2)) => {
                    let fut = f(t, a1, a2);
                    Box::pin(async move { fut.await.map(IntoValue::into_value) })
                }
                Err(fault) => ready(Err(fault)),
            }
        });
        self.push(name, vec![A1::PARAM, A2::PARAM], handler)
    }

    /// Escape hatch for methods that need the raw arguments or the ambient
    ///  session context.
    pub fn raw_method(
        self,
        name: &str,
        params: Vec<ParamKind>,
        f: impl Fn(Arc<T>, Vec<CallArg>, SessionContext) -> MethodFuture + Send + Sync + 'static,
    ) -> Self {
        let handler: Arc<MethodHandlerFn> = Arc::new(move |instance, args, context| {
            match downcast::<T>(instance) {
                Ok(t) => f(t, args, context),
                Err(fault) => ready(Err(fault)),
            }
        });
        self.push(name, params, handler)
    }

    pub fn build(self) -> ComponentRegistration {
        let factory = self.factory;
        ComponentRegistration {
            interface: self.interface,
            activation: self.activation,
            factory: Box::new(move || factory() as ComponentInstance),
            methods: self.methods,
            shared_slot: OnceLock::new(),
        }
    }
}
