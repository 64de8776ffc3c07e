//! Structural type system.
//!
//! Types are immutable trees compared structurally. Unions are kept in a
//! canonical form (flattened, deduplicated, sorted) so that structural
//! equality is set equality over members, and `optional(optional(T))` is the
//! same type as `optional(T)`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::value::Value;

/// Ordered property name -> type mapping used by typed dicts and objects.
pub type Props = BTreeMap<Arc<str>, Type>;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Type {
    None,
    Bool,
    /// Integral number; assignable to `Number`.
    Int,
    Number,
    String,
    /// Top type: every type is assignable to it.
    Any,
    List {
        element: Box<Type>,
    },
    TypedDict {
        props: Props,
    },
    Dict {
        key: Box<Type>,
        value: Box<Type>,
    },
    Union(UnionType),
    Const {
        value_type: Box<Type>,
        value: Value,
    },
    /// Indirection to a stored value; never recursed into structurally.
    Ref {
        target: Box<Type>,
    },
    Object {
        name: Arc<str>,
        props: Props,
    },
    TaggedValue(TaggedValueType),
}

/// Canonical union members: at least two, flattened, deduplicated, sorted.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawUnion", into = "RawUnion")]
pub struct UnionType(Vec<Type>);

impl UnionType {
    pub fn members(&self) -> &[Type] {
        &self.0
    }
}

#[derive(Serialize, Deserialize)]
struct RawUnion {
    members: Vec<Type>,
}

impl TryFrom<RawUnion> for UnionType {
    type Error = TypeError;

    fn try_from(raw: RawUnion) -> Result<Self, TypeError> {
        match Type::union(raw.members)? {
            Type::Union(union) => Ok(union),
            other => Err(TypeError::Malformed(format!(
                "union collapses to a single member: {other}"
            ))),
        }
    }
}

impl From<UnionType> for RawUnion {
    fn from(union: UnionType) -> Self {
        RawUnion { members: union.0 }
    }
}

/// A value type carrying a type-level tag shape. The tag shape is always a
/// typed dict and the value type is never itself tagged.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawTaggedValue", into = "RawTaggedValue")]
pub struct TaggedValueType {
    tags: Box<Type>,
    value: Box<Type>,
}

impl TaggedValueType {
    pub fn tags(&self) -> &Type {
        &self.tags
    }

    pub fn value(&self) -> &Type {
        &self.value
    }

    /// Tag property types, in name order.
    pub fn tag_props(&self) -> &Props {
        match self.tags.as_ref() {
            Type::TypedDict { props } => props,
            _ => unreachable!("tagged value tags are validated as typed dicts"),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawTaggedValue {
    tags: Type,
    value: Type,
}

impl TryFrom<RawTaggedValue> for TaggedValueType {
    type Error = TypeError;

    fn try_from(raw: RawTaggedValue) -> Result<Self, TypeError> {
        match Type::tagged(raw.tags, raw.value)? {
            Type::TaggedValue(tagged) => Ok(tagged),
            other => Err(TypeError::Malformed(format!("not a tagged value: {other}"))),
        }
    }
}

impl From<TaggedValueType> for RawTaggedValue {
    fn from(tagged: TaggedValueType) -> Self {
        RawTaggedValue {
            tags: *tagged.tags,
            value: *tagged.value,
        }
    }
}

impl Type {
    pub fn list(element: Type) -> Type {
        Type::List {
            element: Box::new(element),
        }
    }

    pub fn dict(key: Type, value: Type) -> Type {
        Type::Dict {
            key: Box::new(key),
            value: Box::new(value),
        }
    }

    pub fn reference(target: Type) -> Type {
        Type::Ref {
            target: Box::new(target),
        }
    }

    /// Typed dict from `(name, type)` pairs; a repeated name is rejected.
    pub fn typed_dict(
        props: impl IntoIterator<Item = (impl Into<Arc<str>>, Type)>,
    ) -> Result<Type, TypeError> {
        Ok(Type::TypedDict {
            props: collect_props(props)?,
        })
    }

    pub fn object(
        name: impl Into<Arc<str>>,
        props: impl IntoIterator<Item = (impl Into<Arc<str>>, Type)>,
    ) -> Result<Type, TypeError> {
        Ok(Type::Object {
            name: name.into(),
            props: collect_props(props)?,
        })
    }

    /// Const type: the literal must be assignable to the declared value type.
    pub fn constant(value_type: Type, value: Value) -> Result<Type, TypeError> {
        let literal = type_of(&value);
        if !assignable(&literal, &value_type) {
            return Err(TypeError::ConstMismatch {
                declared: value_type,
                literal,
            });
        }
        Ok(Type::Const {
            value_type: Box::new(value_type),
            value,
        })
    }

    /// Union of the given members, flattening nested unions and dropping
    /// duplicates. A single distinct member is returned as itself.
    pub fn union(members: impl IntoIterator<Item = Type>) -> Result<Type, TypeError> {
        let mut flat = Vec::new();
        for member in members {
            match member {
                Type::Union(inner) => flat.extend(inner.0),
                other => flat.push(other),
            }
        }
        flat.sort();
        flat.dedup();
        match flat.len() {
            0 => Err(TypeError::EmptyUnion),
            1 => Ok(flat.remove(0)),
            _ => Ok(Type::Union(UnionType(flat))),
        }
    }

    /// Tagged value type. Tagging an already tagged value merges the tag
    /// shapes, the outer shape winning on name clashes.
    pub fn tagged(tags: Type, value: Type) -> Result<Type, TypeError> {
        let mut outer = match tags {
            Type::TypedDict { props } => props,
            other => return Err(TypeError::NotATypedDict(other)),
        };
        let value = match value {
            Type::TaggedValue(inner) => {
                for (name, ty) in inner.tag_props() {
                    outer.entry(name.clone()).or_insert_with(|| ty.clone());
                }
                *inner.value
            }
            other => other,
        };
        Ok(Type::TaggedValue(TaggedValueType {
            tags: Box::new(Type::TypedDict { props: outer }),
            value: Box::new(value),
        }))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Type::None)
    }

    /// The tag shape, when this is a tagged value type.
    pub fn tag_shape(&self) -> Option<&Type> {
        match self {
            Type::TaggedValue(tagged) => Some(tagged.tags()),
            _ => None,
        }
    }

    /// Strips a tagged value wrapper, if any.
    pub fn untagged(&self) -> &Type {
        match self {
            Type::TaggedValue(tagged) => tagged.value(),
            other => other,
        }
    }
}

fn collect_props(
    props: impl IntoIterator<Item = (impl Into<Arc<str>>, Type)>,
) -> Result<Props, TypeError> {
    let mut out = Props::new();
    for (name, ty) in props {
        let name = name.into();
        if out.contains_key(&name) {
            return Err(TypeError::DuplicateProperty(name.to_string()));
        }
        out.insert(name, ty);
    }
    Ok(out)
}

/// `Union(None, T)`.
pub fn optional(ty: Type) -> Type {
    match Type::union([Type::None, ty]) {
        Ok(ty) => ty,
        Err(_) => unreachable!("a union with None has at least one member"),
    }
}

pub fn is_optional(ty: &Type) -> bool {
    match ty {
        Type::Union(union) => union.members().contains(&Type::None),
        Type::TaggedValue(tagged) => is_optional(tagged.value()),
        _ => false,
    }
}

/// Removes `None` from a union; other types are returned unchanged.
pub fn non_none(ty: &Type) -> Type {
    match ty {
        Type::Union(union) => {
            let rest: Vec<Type> = union
                .members()
                .iter()
                .filter(|m| !m.is_none())
                .cloned()
                .collect();
            Type::union(rest).unwrap_or(Type::None)
        }
        Type::TaggedValue(tagged) => Type::TaggedValue(TaggedValueType {
            tags: tagged.tags.clone(),
            value: Box::new(non_none(tagged.value())),
        }),
        other => other.clone(),
    }
}

/// Structural equality.
pub fn equals(a: &Type, b: &Type) -> bool {
    a == b
}

/// True if every value satisfying `from` also satisfies `to`.
pub fn assignable(from: &Type, to: &Type) -> bool {
    if from == to || matches!(to, Type::Any) {
        return true;
    }
    match (from, to) {
        (Type::Union(union), _) => union.members().iter().all(|m| assignable(m, to)),
        (_, Type::Union(union)) => union.members().iter().any(|m| assignable(from, m)),
        (Type::TaggedValue(a), Type::TaggedValue(b)) => {
            assignable(a.tags(), b.tags()) && assignable(a.value(), b.value())
        }
        (Type::TaggedValue(a), _) => assignable(a.value(), to),
        (Type::Const { value: a, .. }, Type::Const { value: b, .. }) => a == b,
        (Type::Const { value_type, .. }, _) => assignable(value_type, to),
        (Type::Int, Type::Number) => true,
        (Type::List { element: a }, Type::List { element: b }) => assignable(a, b),
        (Type::TypedDict { props: a }, Type::TypedDict { props: b }) => props_assignable(a, b),
        (Type::TypedDict { props }, Type::Dict { key, value }) => {
            assignable(&Type::String, key) && props.values().all(|p| assignable(p, value))
        }
        (
            Type::Dict {
                key: ka,
                value: va,
            },
            Type::Dict {
                key: kb,
                value: vb,
            },
        ) => assignable(ka, kb) && assignable(va, vb),
        (
            Type::Object {
                name: na,
                props: pa,
            },
            Type::Object {
                name: nb,
                props: pb,
            },
        ) => na == nb && props_assignable(pa, pb),
        (Type::Ref { target: a }, Type::Ref { target: b }) => assignable(a, b),
        _ => false,
    }
}

/// Width subtyping: every property `to` requires is present in `from` with an
/// assignable type, or may be absent because `to` accepts `None` there.
fn props_assignable(from: &Props, to: &Props) -> bool {
    to.iter().all(|(name, want)| match from.get(name) {
        Some(have) => assignable(have, want),
        None => assignable(&Type::None, want),
    })
}

/// Most precise type describing a concrete value.
pub fn type_of(value: &Value) -> Type {
    match value {
        Value::None => Type::None,
        Value::Bool(_) => Type::Bool,
        Value::Number(_) => match value.as_int() {
            Some(_) => Type::Int,
            None => Type::Number,
        },
        Value::String(_) => Type::String,
        Value::List(items) => {
            let element = Type::union(items.iter().map(type_of)).unwrap_or(Type::Any);
            Type::list(element)
        }
        Value::Dict(fields) => Type::TypedDict {
            props: fields
                .iter()
                .map(|(k, v)| (k.clone(), type_of(v)))
                .collect(),
        },
        Value::Ref(_) => Type::reference(Type::Any),
    }
}

/// True if the concrete value satisfies the type.
pub fn value_fits(value: &Value, ty: &Type) -> bool {
    match (value, ty) {
        (_, Type::Any) => true,
        (_, Type::Union(union)) => union.members().iter().any(|m| value_fits(value, m)),
        (_, Type::TaggedValue(tagged)) => value_fits(value, tagged.value()),
        (_, Type::Const { value: literal, .. }) => value == literal,
        (Value::List(items), Type::List { element }) => {
            items.iter().all(|item| value_fits(item, element))
        }
        (Value::Dict(fields), Type::TypedDict { props } | Type::Object { props, .. }) => {
            props.iter().all(|(name, prop)| match fields.get(name) {
                Some(v) => value_fits(v, prop),
                None => assignable(&Type::None, prop),
            })
        }
        (Value::Dict(fields), Type::Dict { key, value: value_ty }) => fields
            .iter()
            .all(|(k, v)| value_fits(&Value::String(k.clone()), key) && value_fits(v, value_ty)),
        (Value::Ref(_), Type::Ref { .. }) => true,
        // Integers past the exact range still fit, though they type as numbers.
        (Value::Number(_), Type::Int) => value.is_integral(),
        _ => assignable(&type_of(value), ty),
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn props(f: &mut fmt::Formatter<'_>, props: &Props) -> fmt::Result {
            write!(f, "{{")?;
            for (i, (name, ty)) in props.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{name}: {ty}")?;
            }
            write!(f, "}}")
        }
        match self {
            Type::None => write!(f, "none"),
            Type::Bool => write!(f, "bool"),
            Type::Int => write!(f, "int"),
            Type::Number => write!(f, "number"),
            Type::String => write!(f, "string"),
            Type::Any => write!(f, "any"),
            Type::List { element } => write!(f, "list<{element}>"),
            Type::TypedDict { props: p } => props(f, p),
            Type::Dict { key, value } => write!(f, "dict<{key}, {value}>"),
            Type::Union(union) => {
                for (i, member) in union.members().iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{member}")?;
                }
                Ok(())
            }
            Type::Const { value_type, value } => write!(f, "const<{value_type}>({value})"),
            Type::Ref { target } => write!(f, "ref<{target}>"),
            Type::Object { name, props: p } => {
                write!(f, "{name}")?;
                props(f, p)
            }
            Type::TaggedValue(tagged) => {
                write!(f, "tagged<{}, {}>", tagged.tags(), tagged.value())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_is_idempotent() {
        let once = optional(Type::Int);
        let twice = optional(optional(Type::Int));
        assert_eq!(once, twice);
        assert!(is_optional(&once));
    }

    #[test]
    fn nested_unions_flatten() {
        let nested = Type::union([
            Type::None,
            Type::union([Type::None, Type::Int]).unwrap(),
        ])
        .unwrap();
        assert_eq!(nested, optional(Type::Int));
        match &nested {
            Type::Union(union) => assert_eq!(union.members().len(), 2),
            other => panic!("expected union, got {other}"),
        }
    }

    #[test]
    fn union_member_order_does_not_matter() {
        let a = Type::union([Type::String, Type::Int]).unwrap();
        let b = Type::union([Type::Int, Type::String, Type::Int]).unwrap();
        assert!(equals(&a, &b));
    }

    #[test]
    fn empty_union_is_rejected() {
        assert_eq!(Type::union(Vec::new()), Err(TypeError::EmptyUnion));
    }

    #[test]
    fn single_member_union_collapses() {
        assert_eq!(Type::union([Type::Bool, Type::Bool]).unwrap(), Type::Bool);
    }

    #[test]
    fn non_none_strips_optional() {
        assert_eq!(non_none(&optional(Type::Int)), Type::Int);
        assert_eq!(non_none(&Type::String), Type::String);
    }

    #[test]
    fn assignability_rules() {
        assert!(assignable(&Type::Int, &Type::Number));
        assert!(!assignable(&Type::Number, &Type::Int));
        assert!(assignable(&Type::Int, &optional(Type::Int)));
        assert!(!assignable(&optional(Type::Int), &Type::Int));
        assert!(assignable(&Type::None, &optional(Type::String)));
        assert!(assignable(&Type::list(Type::Int), &Type::list(Type::Any)));

        let wide = Type::typed_dict([("a", Type::Int), ("b", Type::String)]).unwrap();
        let narrow = Type::typed_dict([("a", Type::Number)]).unwrap();
        assert!(assignable(&wide, &narrow));
        assert!(!assignable(&narrow, &wide));
        assert!(assignable(&narrow, &Type::dict(Type::String, Type::Number)));
    }

    #[test]
    fn tagged_values_assign_to_their_value_type() {
        let tags = Type::typed_dict([("a_tag", Type::Int)]).unwrap();
        let tagged = Type::tagged(tags, Type::list(Type::Int)).unwrap();
        assert!(assignable(&tagged, &Type::list(Type::Number)));
        assert!(!assignable(&Type::list(Type::Int), &tagged));
    }

    #[test]
    fn tagging_twice_merges_tag_shapes() {
        let inner = Type::tagged(
            Type::typed_dict([("a", Type::Int)]).unwrap(),
            Type::String,
        )
        .unwrap();
        let outer = Type::tagged(Type::typed_dict([("b", Type::Bool)]).unwrap(), inner).unwrap();
        let expected = Type::tagged(
            Type::typed_dict([("a", Type::Int), ("b", Type::Bool)]).unwrap(),
            Type::String,
        )
        .unwrap();
        assert_eq!(outer, expected);
    }

    #[test]
    fn malformed_constructions_fail_immediately() {
        assert!(matches!(
            Type::tagged(Type::Int, Type::String),
            Err(TypeError::NotATypedDict(_))
        ));
        assert!(matches!(
            Type::constant(Type::Int, Value::string("x")),
            Err(TypeError::ConstMismatch { .. })
        ));
        assert!(matches!(
            Type::typed_dict([("a", Type::Int), ("a", Type::Bool)]),
            Err(TypeError::DuplicateProperty(_))
        ));
    }

    #[test]
    fn unknown_variant_fails_to_deserialize() {
        let err = serde_json::from_str::<Type>(r#"{"kind":"quaternion"}"#);
        assert!(err.is_err());
        let single = serde_json::from_str::<Type>(r#"{"kind":"union","members":[{"kind":"int"}]}"#);
        assert!(single.is_err());
    }

    #[test]
    fn type_of_infers_precise_types() {
        let value = Value::list([Value::number(1.0), Value::None]);
        assert_eq!(type_of(&value), Type::list(optional(Type::Int)));
        assert_eq!(type_of(&Value::list([])), Type::list(Type::Any));
        let record = Value::dict([("x", Value::number(0.5))]);
        assert_eq!(
            type_of(&record),
            Type::typed_dict([("x", Type::Number)]).unwrap()
        );
    }

    #[test]
    fn integers_past_the_exact_range_type_as_numbers() {
        let huge = Value::number(1e20);
        assert_eq!(type_of(&huge), Type::Number);
        assert_eq!(type_of(&Value::number(9_007_199_254_740_992.0)), Type::Int);
        assert!(value_fits(&huge, &Type::Int));
        assert!(!value_fits(&Value::number(0.5), &Type::Int));
    }

    #[test]
    fn types_round_trip_through_serde() {
        let ty = Type::tagged(
            Type::typed_dict([("run", Type::String)]).unwrap(),
            optional(Type::list(Type::constant(Type::Int, Value::number(3.0)).unwrap())),
        )
        .unwrap();
        let json = serde_json::to_string(&ty).unwrap();
        let back: Type = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ty);
    }
}
