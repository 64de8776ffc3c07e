//! Operation definitions and overload dispatch.
//!
//! An [`OpDef`] names a typed operation: its input signature, how its output
//! type is derived, whether it is pure, whether tags flow through it, and the
//! implementation the engine invokes. [`OpRegistry`] resolves a call by exact
//! name or, failing that, by dispatch name and input assignability.

pub mod builtins;

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::boxed::Boxed;
use crate::error::TypeError;
use crate::storage::StorageContext;
use crate::types::{Type, assignable, is_optional, non_none, optional};
use crate::value::Value;

/// Error raised by an op implementation. The engine wraps it into an
/// `OperationError` carrying the op name.
pub type OpFailure = Box<dyn std::error::Error + Send + Sync>;
pub type OpResult = Result<Boxed, OpFailure>;

type Implementation = Arc<dyn Fn(&OpContext<'_>, &[Boxed]) -> OpResult + Send + Sync>;
type OutputFn = Arc<dyn Fn(&[Type]) -> Type + Send + Sync>;
type RefineFn =
    Arc<dyn Fn(&OpContext<'_>, &[Type], &[Value]) -> Result<Type, OpFailure> + Send + Sync>;

/// What an implementation may see of the running execution.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpContext<'a> {
    storage: Option<&'a StorageContext>,
}

impl<'a> OpContext<'a> {
    pub fn new(storage: Option<&'a StorageContext>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> Result<&'a StorageContext, OpFailure> {
        self.storage
            .ok_or_else(|| "no storage context configured".into())
    }
}

#[derive(Clone)]
pub enum OutputType {
    Static(Type),
    /// Derived from the (non-None) input types at graph construction.
    Computed(OutputFn),
}

#[derive(Clone)]
pub struct OpDef {
    name: Arc<str>,
    dispatch: Option<Arc<str>>,
    inputs: Vec<(Arc<str>, Type)>,
    output: OutputType,
    refine: Option<RefineFn>,
    pure: bool,
    flows_tags: bool,
    implementation: Implementation,
}

impl fmt::Debug for OpDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpDef")
            .field("name", &self.name)
            .field("dispatch", &self.dispatch)
            .field("inputs", &self.inputs)
            .field("pure", &self.pure)
            .field("flows_tags", &self.flows_tags)
            .finish_non_exhaustive()
    }
}

/// How a call's input types matched an op's signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputMatch {
    Exact,
    /// Some optional input only fits once `None` is removed; the call yields
    /// `None` whenever such an input is `None`.
    Nullable,
}

impl OpDef {
    pub fn new<F>(
        name: impl Into<Arc<str>>,
        inputs: impl IntoIterator<Item = (impl Into<Arc<str>>, Type)>,
        output: Type,
        implementation: F,
    ) -> Self
    where
        F: Fn(&OpContext<'_>, &[Boxed]) -> OpResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            dispatch: None,
            inputs: inputs.into_iter().map(|(n, t)| (n.into(), t)).collect(),
            output: OutputType::Static(output),
            refine: None,
            pure: true,
            flows_tags: false,
            implementation: Arc::new(implementation),
        }
    }

    pub fn dispatch_as(mut self, name: impl Into<Arc<str>>) -> Self {
        self.dispatch = Some(name.into());
        self
    }

    pub fn output_fn(mut self, f: impl Fn(&[Type]) -> Type + Send + Sync + 'static) -> Self {
        self.output = OutputType::Computed(Arc::new(f));
        self
    }

    pub fn refine_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&OpContext<'_>, &[Type], &[Value]) -> Result<Type, OpFailure> + Send + Sync + 'static,
    {
        self.refine = Some(Arc::new(f));
        self
    }

    /// Mark the op as impure: it always runs and is never cached.
    pub fn impure(mut self) -> Self {
        self.pure = false;
        self
    }

    /// Tags on the first input flow onto every non-`None` output.
    pub fn flows_tags(mut self) -> Self {
        self.flows_tags = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dispatch_name(&self) -> Option<&str> {
        self.dispatch.as_deref()
    }

    pub fn inputs(&self) -> &[(Arc<str>, Type)] {
        &self.inputs
    }

    pub fn is_pure(&self) -> bool {
        self.pure
    }

    pub fn tag_flow(&self) -> bool {
        self.flows_tags
    }

    pub fn has_refine(&self) -> bool {
        self.refine.is_some()
    }

    /// Whether the input at `index` is declared to accept `None`.
    pub fn accepts_none(&self, index: usize) -> bool {
        self.inputs
            .get(index)
            .is_some_and(|(_, ty)| assignable(&Type::None, ty))
    }

    pub fn match_inputs(&self, types: &[Type]) -> Option<InputMatch> {
        if types.len() != self.inputs.len() {
            return None;
        }
        let mut result = InputMatch::Exact;
        for (have, (_, want)) in types.iter().zip(&self.inputs) {
            if assignable(have, want) {
                continue;
            }
            if is_optional(have) && assignable(&non_none(have), want) {
                result = InputMatch::Nullable;
                continue;
            }
            // A bare `None` can only ever short-circuit.
            if have.is_none() {
                result = InputMatch::Nullable;
                continue;
            }
            return None;
        }
        Some(result)
    }

    /// Declared output type for the given input types, before tag flow and
    /// nullability are applied.
    pub fn output_type(&self, inputs: &[Type]) -> Type {
        match &self.output {
            OutputType::Static(ty) => ty.clone(),
            OutputType::Computed(f) => f(inputs),
        }
    }

    /// Full node type for a call: output type, wrapped in the first input's
    /// tag shape when tags flow, made optional when the match is nullable.
    pub fn call_type(&self, inputs: &[Type], matched: InputMatch) -> Result<Type, TypeError> {
        if self.always_short_circuits(inputs) {
            return Ok(Type::None);
        }
        let stripped: Vec<Type> = match matched {
            InputMatch::Exact => inputs.to_vec(),
            InputMatch::Nullable => inputs.iter().map(non_none).collect(),
        };
        self.wrap_output(inputs, matched, self.output_type(&stripped))
    }

    /// True when some input is statically `None` where `None` is not
    /// accepted, so every call yields an untagged `None`.
    fn always_short_circuits(&self, inputs: &[Type]) -> bool {
        inputs
            .iter()
            .enumerate()
            .any(|(i, ty)| ty.is_none() && !self.accepts_none(i))
    }

    /// Apply tag flow and nullability to a bare output type.
    pub fn wrap_output(
        &self,
        inputs: &[Type],
        matched: InputMatch,
        mut ty: Type,
    ) -> Result<Type, TypeError> {
        if self.flows_tags {
            let first = inputs.first().map(non_none);
            if let Some(shape) = first.as_ref().and_then(Type::tag_shape) {
                ty = Type::tagged(shape.clone(), ty)?;
            }
        }
        if matched == InputMatch::Nullable {
            ty = optional(ty);
        }
        Ok(ty)
    }

    pub fn invoke(&self, ctx: &OpContext<'_>, inputs: &[Boxed]) -> OpResult {
        (self.implementation)(ctx, inputs)
    }
}

/// Precise output type for `op` given concrete input values. Ops without a
/// refinement report their declared output type.
pub fn refine(
    op: &OpDef,
    ctx: &OpContext<'_>,
    input_types: &[Type],
    input_values: &[Value],
) -> Result<Type, OpFailure> {
    match &op.refine {
        Some(f) => f(ctx, input_types, input_values),
        None => Ok(op.output_type(input_types)),
    }
}

/// Resolved call target.
#[derive(Clone, Debug)]
pub struct Dispatch {
    pub op: Arc<OpDef>,
    pub matched: InputMatch,
}

#[derive(Clone, Debug, Default)]
pub struct OpRegistry {
    ops: Vec<Arc<OpDef>>,
    by_name: FxHashMap<Arc<str>, usize>,
}

impl OpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for op in builtins::all() {
            registry.register(op);
        }
        registry
    }

    /// Register `op`, replacing any op with the same exact name.
    pub fn register(&mut self, op: OpDef) -> Arc<OpDef> {
        let op = Arc::new(op);
        match self.by_name.get(&op.name) {
            Some(&index) => self.ops[index] = op.clone(),
            None => {
                self.by_name.insert(op.name.clone(), self.ops.len());
                self.ops.push(op.clone());
            }
        }
        op
    }

    pub fn get(&self, name: &str) -> Option<&Arc<OpDef>> {
        self.by_name.get(name).map(|&index| &self.ops[index])
    }

    pub fn ops(&self) -> impl Iterator<Item = &Arc<OpDef>> {
        self.ops.iter()
    }

    /// Resolve `name` for the given input types. An exact op name wins;
    /// otherwise overloads sharing the dispatch name are tried in registration
    /// order, preferring a match that needs no nullability.
    pub fn dispatch(&self, name: &str, inputs: &[Type]) -> Result<Dispatch, TypeError> {
        if let Some(op) = self.get(name) {
            if op.inputs.len() != inputs.len() {
                return Err(TypeError::Arity {
                    op: name.to_string(),
                    expected: op.inputs.len(),
                    found: inputs.len(),
                });
            }
            return match op.match_inputs(inputs) {
                Some(matched) => Ok(Dispatch {
                    op: op.clone(),
                    matched,
                }),
                None => Err(TypeError::NoMatchingOverload {
                    op: name.to_string(),
                    inputs: inputs.to_vec(),
                }),
            };
        }

        let candidates: Vec<&Arc<OpDef>> = self
            .ops
            .iter()
            .filter(|op| op.dispatch_name() == Some(name))
            .collect();
        if candidates.is_empty() {
            return Err(TypeError::UnknownOp(name.to_string()));
        }
        let mut nullable = None;
        for op in candidates {
            match op.match_inputs(inputs) {
                Some(InputMatch::Exact) => {
                    return Ok(Dispatch {
                        op: op.clone(),
                        matched: InputMatch::Exact,
                    });
                }
                Some(InputMatch::Nullable) if nullable.is_none() => nullable = Some(op.clone()),
                _ => {}
            }
        }
        nullable
            .map(|op| Dispatch {
                op,
                matched: InputMatch::Nullable,
            })
            .ok_or_else(|| TypeError::NoMatchingOverload {
                op: name.to_string(),
                inputs: inputs.to_vec(),
            })
    }
}

/// Op reading the tag `tag_name` off its input. Untagged inputs, including the
/// `None` produced by indexing past a list's end, yield `None`.
pub fn tag_getter(tag_name: &str, tag_type: Type, op_name: &str) -> Result<OpDef, TypeError> {
    let shape = Type::typed_dict([(tag_name, tag_type.clone())])?;
    // Accepts None so a tagged None still reaches the getter.
    let input = optional(Type::tagged(shape, Type::Any)?);
    let tag: Arc<str> = Arc::from(tag_name);
    Ok(OpDef::new(
        op_name,
        [("obj", input)],
        optional(tag_type),
        move |_, inputs| {
            let value = inputs
                .first()
                .and_then(|input| input.get_tag(&tag))
                .cloned()
                .unwrap_or(Value::None);
            Ok(Boxed::new(value))
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overloads_resolve_by_input_types() {
        let registry = OpRegistry::with_builtins();
        let num = registry.dispatch("add", &[Type::Int, Type::Number]).unwrap();
        assert_eq!(num.op.name(), "number-add");
        let text = registry.dispatch("add", &[Type::String, Type::String]).unwrap();
        assert_eq!(text.op.name(), "string-add");
        assert!(matches!(
            registry.dispatch("add", &[Type::String, Type::Int]),
            Err(TypeError::NoMatchingOverload { .. })
        ));
        assert!(matches!(
            registry.dispatch("frobnicate", &[]),
            Err(TypeError::UnknownOp(_))
        ));
    }

    #[test]
    fn exact_names_bypass_overloading() {
        let registry = OpRegistry::with_builtins();
        let op = registry.dispatch("number-add", &[Type::Int, Type::Int]).unwrap();
        assert_eq!(op.op.name(), "number-add");
        assert!(matches!(
            registry.dispatch("number-add", &[Type::Int]),
            Err(TypeError::Arity { expected: 2, found: 1, .. })
        ));
    }

    #[test]
    fn optional_inputs_make_optional_outputs() {
        let registry = OpRegistry::with_builtins();
        let inputs = [optional(Type::Int), Type::Int];
        let call = registry.dispatch("add", &inputs).unwrap();
        assert_eq!(call.matched, InputMatch::Nullable);
        assert_eq!(call.op.call_type(&inputs, call.matched).unwrap(), optional(Type::Int));
    }

    #[test]
    fn none_typed_inputs_yield_none() {
        let registry = OpRegistry::with_builtins();
        let inputs = [Type::None, Type::Int];
        let call = registry.dispatch("add", &inputs).unwrap();
        assert_eq!(call.matched, InputMatch::Nullable);
        assert_eq!(call.op.call_type(&inputs, call.matched).unwrap(), Type::None);
    }

    #[test]
    fn tag_flow_wraps_output_in_input_tag_shape() {
        let registry = OpRegistry::with_builtins();
        let shape = Type::typed_dict([("a_tag", Type::Int)]).unwrap();
        let list = Type::tagged(shape.clone(), Type::list(Type::Int)).unwrap();
        let inputs = [list, Type::Int];
        let call = registry.dispatch("index", &inputs).unwrap();
        let ty = call.op.call_type(&inputs, call.matched).unwrap();
        assert_eq!(ty, Type::tagged(shape, optional(Type::Int)).unwrap());
    }

    #[test]
    fn tag_getters_read_tags_and_tolerate_untagged_inputs() {
        let getter = tag_getter("a_tag", Type::Int, "get-a_tag").unwrap();
        let ctx = OpContext::default();
        let tagged = Boxed::new(Value::number(5.0)).tagged([("a_tag", Value::number(1.0))]);
        assert_eq!(getter.invoke(&ctx, &[tagged]).unwrap(), Value::number(1.0));
        assert_eq!(getter.invoke(&ctx, &[Boxed::none()]).unwrap(), Value::None);
        assert_eq!(getter.output_type(&[]), optional(Type::Int));
    }

    #[test]
    fn refine_falls_back_to_declared_output() {
        let registry = OpRegistry::with_builtins();
        let ctx = OpContext::default();
        let count = registry.get("list-count").unwrap();
        let ty = refine(count, &ctx, &[Type::list(Type::Int)], &[Value::list([])]).unwrap();
        assert_eq!(ty, Type::Int);

        let parse = registry.get("json-parse").unwrap();
        let ty = refine(parse, &ctx, &[Type::String], &[Value::string(r#"{"a": 1}"#)]).unwrap();
        assert_eq!(ty, Type::typed_dict([("a", Type::Int)]).unwrap());
    }
}
