//! Mapper factory.
//!
//! [`build`] walks a [`Type`] tree and produces a [`Mapper`] tree of the same
//! shape. Each node knows how to save a value of its type into a JSON shape and
//! load it back. The on-disk shape per variant:
//!
//! | type | stored shape |
//! |------|--------------|
//! | none / bool / int / number / string | JSON scalar |
//! | list | array |
//! | typed dict | object, one entry per present property |
//! | dict | object, keys passed through the key mapper |
//! | union | `{"_union_id": i, "_val": …}` over canonical member order |
//! | const | shape of its value type |
//! | ref | the reference URI string; the referent is never visited |
//! | object | `{"_type": name, …props}` |
//! | tagged value | shape of its value type, or `{"_tag": …, "_value": …}` when saved boxed |
//! | any | `{"_type": <type>, "_val": …}` |
//!
//! Keep this table stable: values written by one release must load in the next.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use rustc_hash::FxHashMap;
use serde_json::{Map, json};

use crate::boxed::{Boxed, TagMap};
use crate::error::{MapperError, TypeError};
use crate::types::{Type, assignable, optional, type_of, value_fits};
use crate::value::Value;

/// Storage context a mapper tree is built for. Mapper addresses are derived
/// from its namespace and the property path.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MapperContext {
    namespace: Arc<str>,
}

impl MapperContext {
    pub fn new(namespace: impl Into<Arc<str>>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Context for values crossing a transport boundary.
    pub fn transport() -> Self {
        Self::new("transport")
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn address(&self, path: &[Arc<str>]) -> String {
        let mut address = self.namespace.to_string();
        for segment in path {
            address.push('/');
            address.push_str(segment);
        }
        address
    }
}

#[derive(Clone, Debug)]
pub struct Mapper {
    ty: Type,
    address: String,
    kind: MapperKind,
}

#[derive(Clone, Debug)]
enum MapperKind {
    None,
    Bool,
    Int,
    Number,
    String,
    Any {
        ctx: MapperContext,
        path: Vec<Arc<str>>,
    },
    List(Box<Mapper>),
    TypedDict(BTreeMap<Arc<str>, Mapper>),
    Dict {
        key: Box<Mapper>,
        value: Box<Mapper>,
    },
    Union(Vec<Mapper>),
    Const(Box<Mapper>),
    Ref,
    Object {
        name: Arc<str>,
        props: BTreeMap<Arc<str>, Mapper>,
    },
    TaggedValue {
        tags: Box<Mapper>,
        value: Box<Mapper>,
    },
}

/// Build the mapper tree for `ty`. `path` locates this subtree from the root
/// value and is extended with property names on the way down.
pub fn build(ty: &Type, ctx: &MapperContext, path: &[Arc<str>]) -> Result<Mapper, TypeError> {
    let child = |ty: &Type| build(ty, ctx, path);
    let prop = |name: &Arc<str>, ty: &Type| {
        let mut sub = path.to_vec();
        sub.push(name.clone());
        build(ty, ctx, &sub)
    };
    let kind = match ty {
        Type::None => MapperKind::None,
        Type::Bool => MapperKind::Bool,
        Type::Int => MapperKind::Int,
        Type::Number => MapperKind::Number,
        Type::String => MapperKind::String,
        Type::Any => MapperKind::Any {
            ctx: ctx.clone(),
            path: path.to_vec(),
        },
        Type::List { element } => MapperKind::List(Box::new(child(element)?)),
        Type::TypedDict { props } => MapperKind::TypedDict(
            props
                .iter()
                .map(|(name, ty)| -> Result<_, TypeError> { Ok((name.clone(), prop(name, ty)?)) })
                .collect::<Result<_, TypeError>>()?,
        ),
        Type::Dict { key, value } => {
            if !assignable(key, &Type::String) {
                return Err(TypeError::Malformed(format!(
                    "dict keys must be strings, got {key}"
                )));
            }
            MapperKind::Dict {
                key: Box::new(child(key)?),
                value: Box::new(child(value)?),
            }
        }
        Type::Union(union) => MapperKind::Union(
            union
                .members()
                .iter()
                .map(child)
                .collect::<Result<_, TypeError>>()?,
        ),
        Type::Const { value_type, .. } => MapperKind::Const(Box::new(child(value_type)?)),
        Type::Ref { .. } => MapperKind::Ref,
        Type::Object { name, props } => MapperKind::Object {
            name: name.clone(),
            props: props
                .iter()
                .map(|(name, ty)| -> Result<_, TypeError> { Ok((name.clone(), prop(name, ty)?)) })
                .collect::<Result<_, TypeError>>()?,
        },
        Type::TaggedValue(tagged) => {
            // Any tag may be absent, as on a None past the end of a list.
            let shape = match tagged.tags() {
                Type::TypedDict { props } => Type::typed_dict(
                    props.iter().map(|(name, ty)| (name.clone(), optional(ty.clone()))),
                )?,
                other => other.clone(),
            };
            MapperKind::TaggedValue {
                tags: Box::new(child(&shape)?),
                value: Box::new(child(tagged.value())?),
            }
        }
    };
    Ok(Mapper {
        ty: ty.clone(),
        address: ctx.address(path),
        kind,
    })
}

impl Mapper {
    pub fn ty(&self) -> &Type {
        &self.ty
    }

    /// Storage address of this subtree.
    pub fn address(&self) -> &str {
        &self.address
    }

    fn error(&self, message: impl Into<String>) -> MapperError {
        MapperError::new(self.address.clone(), message)
    }

    fn mismatch(&self, value: &Value) -> MapperError {
        self.error(format!("value {value} does not fit {}", self.ty))
    }

    pub fn save(&self, value: &Value) -> Result<serde_json::Value, MapperError> {
        match (&self.kind, value) {
            (MapperKind::None, Value::None) => Ok(serde_json::Value::Null),
            (MapperKind::Bool, Value::Bool(b)) => Ok(json!(b)),
            (MapperKind::Int, Value::Number(n)) if value.is_integral() => match value.as_int() {
                Some(i) => Ok(json!(i)),
                // Integral but past the exact range: stored as a float so it
                // loads back unchanged.
                None => serde_json::Number::from_f64(n.0)
                    .map(serde_json::Value::Number)
                    .ok_or_else(|| self.mismatch(value)),
            },
            (MapperKind::Number, Value::Number(n)) => serde_json::Number::from_f64(n.0)
                .map(serde_json::Value::Number)
                .ok_or_else(|| self.error("non-finite number")),
            (MapperKind::String, Value::String(s)) => Ok(json!(s.as_ref())),
            (MapperKind::Any { ctx, path }, _) => {
                let ty = type_of(value);
                let inner = build(&ty, ctx, path).map_err(|e| self.error(e.to_string()))?;
                let ty_json =
                    serde_json::to_value(&ty).map_err(|e| self.error(e.to_string()))?;
                Ok(json!({ "_type": ty_json, "_val": inner.save(value)? }))
            }
            (MapperKind::List(element), Value::List(items)) => Ok(serde_json::Value::Array(
                items
                    .iter()
                    .map(|item| element.save(item))
                    .collect::<Result<_, _>>()?,
            )),
            (MapperKind::TypedDict(props), Value::Dict(fields)) => {
                Ok(serde_json::Value::Object(self.save_props(props, fields)?))
            }
            (MapperKind::Dict { key, value: val }, Value::Dict(fields)) => {
                let mut out = Map::new();
                for (k, v) in fields.iter() {
                    let saved_key = match key.save(&Value::String(k.clone()))? {
                        serde_json::Value::String(s) => s,
                        other => return Err(self.error(format!("dict key saved as {other}"))),
                    };
                    out.insert(saved_key, val.save(v)?);
                }
                Ok(serde_json::Value::Object(out))
            }
            (MapperKind::Union(members), _) => {
                let (id, member) = members
                    .iter()
                    .enumerate()
                    .find(|(_, m)| value_fits(value, &m.ty))
                    .ok_or_else(|| self.mismatch(value))?;
                Ok(json!({ "_union_id": id, "_val": member.save(value)? }))
            }
            (MapperKind::Const(inner), _) => inner.save(value),
            (MapperKind::Ref, Value::Ref(uri)) => Ok(json!(uri.as_ref())),
            (MapperKind::Object { name, props }, Value::Dict(fields)) => {
                let mut out = self.save_props(props, fields)?;
                out.insert("_type".to_string(), json!(name.as_ref()));
                Ok(serde_json::Value::Object(out))
            }
            (MapperKind::TaggedValue { value: inner, .. }, _) => inner.save(value),
            _ => Err(self.mismatch(value)),
        }
    }

    fn save_props(
        &self,
        props: &BTreeMap<Arc<str>, Mapper>,
        fields: &BTreeMap<Arc<str>, Value>,
    ) -> Result<Map<String, serde_json::Value>, MapperError> {
        if let Some(extra) = fields.keys().find(|k| !props.contains_key(*k)) {
            return Err(self.error(format!("property {extra} is not part of {}", self.ty)));
        }
        let mut out = Map::new();
        for (name, mapper) in props {
            match fields.get(name) {
                Some(v) => {
                    out.insert(name.to_string(), mapper.save(v)?);
                }
                None if assignable(&Type::None, &mapper.ty) => {}
                None => return Err(self.error(format!("missing property {name}"))),
            }
        }
        Ok(out)
    }

    pub fn load(&self, stored: &serde_json::Value) -> Result<Value, MapperError> {
        use serde_json::Value as Json;
        match (&self.kind, stored) {
            (MapperKind::None, Json::Null) => Ok(Value::None),
            (MapperKind::Bool, Json::Bool(b)) => Ok(Value::Bool(*b)),
            (MapperKind::Int, Json::Number(n)) => n
                .as_i64()
                .map(|i| Value::number(i as f64))
                .or_else(|| n.as_f64().map(Value::number).filter(Value::is_integral))
                .ok_or_else(|| self.error(format!("expected integer, found {n}"))),
            (MapperKind::Number, Json::Number(n)) => n
                .as_f64()
                .map(Value::number)
                .ok_or_else(|| self.error(format!("expected number, found {n}"))),
            (MapperKind::String, Json::String(s)) => Ok(Value::string(s.as_str())),
            (MapperKind::Any { ctx, path }, Json::Object(obj)) => {
                let ty: Type = obj
                    .get("_type")
                    .map(|t| serde_json::from_value(t.clone()))
                    .transpose()
                    .map_err(|e| self.error(e.to_string()))?
                    .ok_or_else(|| self.error("missing _type"))?;
                let inner = build(&ty, ctx, path).map_err(|e| self.error(e.to_string()))?;
                inner.load(obj.get("_val").unwrap_or(&Json::Null))
            }
            (MapperKind::List(element), Json::Array(items)) => Ok(Value::List(Arc::new(
                items
                    .iter()
                    .map(|item| element.load(item))
                    .collect::<Result<_, _>>()?,
            ))),
            (MapperKind::TypedDict(props), Json::Object(obj)) => {
                Ok(Value::Dict(Arc::new(self.load_props(props, obj)?)))
            }
            (MapperKind::Dict { key, value }, Json::Object(obj)) => {
                let mut out = BTreeMap::new();
                for (k, v) in obj {
                    let loaded_key = match key.load(&Json::String(k.clone()))? {
                        Value::String(s) => s,
                        other => return Err(self.error(format!("dict key loaded as {other}"))),
                    };
                    out.insert(loaded_key, value.load(v)?);
                }
                Ok(Value::Dict(Arc::new(out)))
            }
            (MapperKind::Union(members), Json::Object(obj)) => {
                let id = obj
                    .get("_union_id")
                    .and_then(Json::as_u64)
                    .ok_or_else(|| self.error("missing union discriminant"))?;
                let member = members
                    .get(id as usize)
                    .ok_or_else(|| self.error(format!("union discriminant {id} out of range")))?;
                member.load(obj.get("_val").unwrap_or(&Json::Null))
            }
            (MapperKind::Const(inner), _) => inner.load(stored),
            (MapperKind::Ref, Json::String(uri)) => Ok(Value::reference(uri.as_str())),
            (MapperKind::Object { name, props }, Json::Object(obj)) => {
                match obj.get("_type").and_then(Json::as_str) {
                    Some(found) if found == name.as_ref() => {}
                    found => {
                        return Err(self.error(format!(
                            "expected object {name}, found {}",
                            found.unwrap_or("untyped object")
                        )));
                    }
                }
                let mut fields = obj.clone();
                fields.remove("_type");
                Ok(Value::Dict(Arc::new(self.load_props(props, &fields)?)))
            }
            (MapperKind::TaggedValue { value, .. }, _) => value.load(stored),
            _ => Err(self.error(format!("cannot load {stored} as {}", self.ty))),
        }
    }

    fn load_props(
        &self,
        props: &BTreeMap<Arc<str>, Mapper>,
        obj: &Map<String, serde_json::Value>,
    ) -> Result<BTreeMap<Arc<str>, Value>, MapperError> {
        let mut out = BTreeMap::new();
        for (name, stored) in obj {
            let mapper = props
                .get(name.as_str())
                .ok_or_else(|| self.error(format!("unexpected property {name}")))?;
            out.insert(Arc::from(name.as_str()), mapper.load(stored)?);
        }
        Ok(out)
    }

    /// Save a boxed value. Only a tagged value type surfaces the box's tags;
    /// every other type saves the bare value.
    pub fn save_boxed(&self, boxed: &Boxed) -> Result<serde_json::Value, MapperError> {
        match &self.kind {
            MapperKind::TaggedValue { tags, value } => {
                let shape = match tags.ty() {
                    Type::TypedDict { props } => props,
                    _ => return Err(self.error("tag shape is not a typed dict")),
                };
                let surfaced = Value::dict(
                    boxed
                        .tags()
                        .iter()
                        .filter(|(name, _)| shape.contains_key(*name))
                        .map(|(name, v)| (name.clone(), v.clone())),
                );
                Ok(json!({ "_tag": tags.save(&surfaced)?, "_value": value.save(boxed)? }))
            }
            MapperKind::Union(members) => {
                let (id, member) = members
                    .iter()
                    .enumerate()
                    .find(|(_, m)| value_fits(boxed.value(), &m.ty))
                    .ok_or_else(|| self.mismatch(boxed.value()))?;
                Ok(json!({ "_union_id": id, "_val": member.save_boxed(boxed)? }))
            }
            _ => self.save(boxed),
        }
    }

    pub fn load_boxed(&self, stored: &serde_json::Value) -> Result<Boxed, MapperError> {
        match &self.kind {
            MapperKind::TaggedValue { tags, value } => {
                let obj = stored
                    .as_object()
                    .ok_or_else(|| self.error("expected tagged value object"))?;
                let tag_value = tags.load(obj.get("_tag").unwrap_or(&serde_json::Value::Null))?;
                let inner = value.load(obj.get("_value").unwrap_or(&serde_json::Value::Null))?;
                let tag_map: TagMap = tag_value
                    .as_dict()
                    .map(|fields| fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
                    .unwrap_or_default();
                Ok(Boxed::with_tags(inner, tag_map))
            }
            MapperKind::Union(members) => {
                let obj = stored
                    .as_object()
                    .ok_or_else(|| self.error("expected union object"))?;
                let id = obj
                    .get("_union_id")
                    .and_then(serde_json::Value::as_u64)
                    .ok_or_else(|| self.error("missing union discriminant"))?;
                let member = members
                    .get(id as usize)
                    .ok_or_else(|| self.error(format!("union discriminant {id} out of range")))?;
                member.load_boxed(obj.get("_val").unwrap_or(&serde_json::Value::Null))
            }
            _ => Ok(Boxed::new(self.load(stored)?)),
        }
    }
}

/// Builds mappers once per type for a fixed storage context.
#[derive(Debug)]
pub struct MapperFactory {
    ctx: MapperContext,
    built: Mutex<FxHashMap<Type, Arc<Mapper>>>,
}

impl MapperFactory {
    pub fn new(ctx: MapperContext) -> Self {
        Self {
            ctx,
            built: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn context(&self) -> &MapperContext {
        &self.ctx
    }

    pub fn mapper_for(&self, ty: &Type) -> Result<Arc<Mapper>, TypeError> {
        let mut built = self.built.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(mapper) = built.get(ty) {
            return Ok(mapper.clone());
        }
        let mapper = Arc::new(build(ty, &self.ctx, &[])?);
        built.insert(ty.clone(), mapper.clone());
        Ok(mapper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::optional;

    fn round_trip(ty: &Type, value: &Value) -> Value {
        let mapper = build(ty, &MapperContext::new("test"), &[]).unwrap();
        let saved = mapper.save(value).unwrap();
        mapper.load(&saved).unwrap()
    }

    #[test]
    fn scalars_round_trip() {
        assert_eq!(round_trip(&Type::Int, &Value::number(12.0)), Value::number(12.0));
        assert_eq!(round_trip(&Type::Number, &Value::number(0.25)), Value::number(0.25));
        assert_eq!(round_trip(&Type::String, &Value::string("hi")), Value::string("hi"));
        assert_eq!(round_trip(&Type::None, &Value::None), Value::None);
    }

    #[test]
    fn nested_unions_and_typed_dicts_round_trip() {
        let inner = Type::typed_dict([
            ("id", Type::Int),
            ("label", optional(Type::String)),
        ])
        .unwrap();
        let ty = Type::list(optional(Type::union([inner, Type::Bool]).unwrap()));
        let value = Value::list([
            Value::dict([("id", Value::number(1.0)), ("label", Value::string("a"))]),
            Value::None,
            Value::Bool(false),
            Value::dict([("id", Value::number(2.0)), ("label", Value::None)]),
            Value::dict([("id", Value::number(3.0))]),
        ]);
        assert_eq!(round_trip(&ty, &value), value);
    }

    #[test]
    fn dicts_objects_and_refs_round_trip() {
        let dict = Type::dict(Type::String, Type::list(Type::Number));
        let value = Value::dict([("xs", Value::list([Value::number(0.5)]))]);
        assert_eq!(round_trip(&dict, &value), value);

        let object = Type::object("run", [("name", Type::String)]).unwrap();
        let value = Value::dict([("name", Value::string("r1"))]);
        assert_eq!(round_trip(&object, &value), value);

        let reference = Type::reference(Type::list(Type::Int));
        let value = Value::reference("local-artifact:///nums/abc");
        assert_eq!(round_trip(&reference, &value), value);
    }

    #[test]
    fn any_records_the_concrete_type() {
        let value = Value::dict([("a", Value::list([Value::number(1.0), Value::None]))]);
        assert_eq!(round_trip(&Type::Any, &value), value);
    }

    #[test]
    fn const_uses_its_value_type() {
        let ty = Type::constant(Type::String, Value::string("k")).unwrap();
        let mapper = build(&ty, &MapperContext::new("test"), &[]).unwrap();
        assert_eq!(mapper.save(&Value::string("k")).unwrap(), json!("k"));
    }

    #[test]
    fn property_mappers_carry_their_path() {
        let ty = Type::typed_dict([(
            "outer",
            Type::typed_dict([("inner", Type::Int)]).unwrap(),
        )])
        .unwrap();
        let mapper = build(&ty, &MapperContext::new("ns"), &[]).unwrap();
        let bad = Value::dict([("outer", Value::dict([("inner", Value::string("x"))]))]);
        let err = mapper.save(&bad).unwrap_err();
        assert_eq!(err.address, "ns/outer/inner");
    }

    #[test]
    fn tagged_values_surface_tags_only_when_boxed() {
        let ty = Type::tagged(
            Type::typed_dict([("a_tag", Type::Int)]).unwrap(),
            Type::String,
        )
        .unwrap();
        let mapper = build(&ty, &MapperContext::transport(), &[]).unwrap();
        let boxed = Boxed::new(Value::string("v")).tagged([
            ("a_tag", Value::number(1.0)),
            ("hidden", Value::Bool(true)),
        ]);
        let saved = mapper.save_boxed(&boxed).unwrap();
        let loaded = mapper.load_boxed(&saved).unwrap();
        assert_eq!(loaded, Value::string("v"));
        assert_eq!(loaded.get_tag("a_tag"), Some(&Value::number(1.0)));
        assert_eq!(loaded.get_tag("hidden"), None);
        assert_eq!(mapper.save(&Value::string("v")).unwrap(), json!("v"));
    }

    #[test]
    fn absent_tags_and_optional_wrappers_survive_boxed_saves() {
        let tagged = Type::tagged(
            Type::typed_dict([("a_tag", Type::Int)]).unwrap(),
            optional(Type::String),
        )
        .unwrap();
        let mapper = build(&tagged, &MapperContext::transport(), &[]).unwrap();
        let saved = mapper.save_boxed(&Boxed::none()).unwrap();
        let loaded = mapper.load_boxed(&saved).unwrap();
        assert_eq!(loaded, Value::None);
        assert!(!loaded.is_tagged());

        let wrapped = build(&optional(tagged), &MapperContext::transport(), &[]).unwrap();
        let boxed = Boxed::new(Value::string("v")).tagged([("a_tag", Value::number(2.0))]);
        let loaded = wrapped.load_boxed(&wrapped.save_boxed(&boxed).unwrap()).unwrap();
        assert_eq!(loaded.get_tag("a_tag"), Some(&Value::number(2.0)));
    }

    #[test]
    fn large_integers_round_trip_exactly() {
        let mapper = build(&Type::Int, &MapperContext::transport(), &[]).unwrap();
        for n in [9_007_199_254_740_992.0, -9_007_199_254_740_992.0, 1e20, -3e30] {
            let value = Value::number(n);
            assert_eq!(mapper.load(&mapper.save(&value).unwrap()).unwrap(), value);
        }
        assert_eq!(mapper.save(&Value::number(1e20)).unwrap(), json!(1e20));
        assert_eq!(type_of(&Value::number(1e20)), Type::Number);
        assert!(mapper.load(&json!(2.5)).is_err());
    }

    #[test]
    fn ill_typed_values_are_rejected() {
        let mapper = build(&Type::Int, &MapperContext::new("t"), &[]).unwrap();
        assert!(mapper.save(&Value::number(1.5)).is_err());
        assert!(mapper.load(&json!("1")).is_err());
    }

    #[test]
    fn factory_reuses_mappers_per_type() {
        let factory = MapperFactory::new(MapperContext::transport());
        let a = factory.mapper_for(&Type::list(Type::Int)).unwrap();
        let b = factory.mapper_for(&Type::list(Type::Int)).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }
}
