//! Builtin operations.

use crate::boxed::Boxed;
use crate::storage;
use crate::types::{Type, assignable, optional, type_of};
use crate::value::Value;

use super::{OpContext, OpDef, OpFailure};

pub fn all() -> Vec<OpDef> {
    vec![
        arithmetic("number-add", "add", true, |a, b| Ok(a + b)),
        arithmetic("number-sub", "sub", true, |a, b| Ok(a - b)),
        arithmetic("number-mul", "mul", true, |a, b| Ok(a * b)),
        arithmetic("number-div", "div", false, |a, b| {
            if b == 0.0 {
                return Err("division by zero".into());
            }
            Ok(a / b)
        }),
        string_add(),
        string_len(),
        list_count(),
        list_index(),
        dict_pick(),
        json_parse(),
        file_read(),
        artifact_save(),
        artifact_get(),
    ]
}

fn number(input: &Boxed) -> Result<f64, OpFailure> {
    input
        .as_number()
        .ok_or_else(|| format!("expected number, got {}", input.value()).into())
}

fn string(input: &Boxed) -> Result<&str, OpFailure> {
    input
        .as_str()
        .ok_or_else(|| format!("expected string, got {}", input.value()).into())
}

fn list(input: &Boxed) -> Result<&[Value], OpFailure> {
    input
        .as_list()
        .ok_or_else(|| format!("expected list, got {}", input.value()).into())
}

/// Binary number op. Integer inputs give an integer output when the
/// operation is closed over integers.
fn arithmetic(
    name: &str,
    dispatch: &str,
    int_closed: bool,
    f: fn(f64, f64) -> Result<f64, OpFailure>,
) -> OpDef {
    OpDef::new(
        name,
        [("lhs", Type::Number), ("rhs", Type::Number)],
        Type::Number,
        move |_, inputs| {
            let value = f(number(&inputs[0])?, number(&inputs[1])?)?;
            Ok(Boxed::new(Value::number(value)))
        },
    )
    .dispatch_as(dispatch)
    .output_fn(move |inputs| {
        if int_closed && inputs.iter().all(|t| assignable(t, &Type::Int)) {
            Type::Int
        } else {
            Type::Number
        }
    })
}

fn string_add() -> OpDef {
    OpDef::new(
        "string-add",
        [("lhs", Type::String), ("rhs", Type::String)],
        Type::String,
        |_, inputs| {
            let joined = format!("{}{}", string(&inputs[0])?, string(&inputs[1])?);
            Ok(Boxed::new(Value::string(joined)))
        },
    )
    .dispatch_as("add")
}

fn string_len() -> OpDef {
    OpDef::new("string-len", [("str", Type::String)], Type::Int, |_, inputs| {
        let len = string(&inputs[0])?.chars().count();
        Ok(Boxed::new(Value::number(len as f64)))
    })
    .dispatch_as("len")
}

fn list_count() -> OpDef {
    OpDef::new(
        "list-count",
        [("arr", Type::list(Type::Any))],
        Type::Int,
        |_, inputs| Ok(Boxed::new(Value::number(list(&inputs[0])?.len() as f64))),
    )
    .dispatch_as("count")
}

fn list_index() -> OpDef {
    OpDef::new(
        "list-index",
        [("arr", Type::list(Type::Any)), ("index", Type::Int)],
        optional(Type::Any),
        |_, inputs| {
            let items = list(&inputs[0])?;
            let index = inputs[1]
                .as_int()
                .ok_or_else(|| format!("expected integer index, got {}", inputs[1].value()))?;
            let item = usize::try_from(index)
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
                .unwrap_or(Value::None);
            Ok(Boxed::new(item))
        },
    )
    .dispatch_as("index")
    .output_fn(|inputs| match inputs.first().map(Type::untagged) {
        Some(Type::List { element }) => optional(element.as_ref().clone()),
        _ => optional(Type::Any),
    })
    .flows_tags()
}

fn dict_pick() -> OpDef {
    OpDef::new(
        "dict-pick",
        [("obj", Type::dict(Type::String, Type::Any)), ("key", Type::String)],
        optional(Type::Any),
        |_, inputs| {
            let key = string(&inputs[1])?;
            let value = inputs[0].get_field(key).cloned().unwrap_or(Value::None);
            Ok(Boxed::new(value))
        },
    )
    .dispatch_as("pick")
    .output_fn(|inputs| {
        let key = match inputs.get(1) {
            Some(Type::Const { value, .. }) => value.as_str(),
            _ => None,
        };
        match (inputs.first().map(Type::untagged), key) {
            (Some(Type::TypedDict { props }), Some(key)) => {
                props.get(key).cloned().unwrap_or(Type::None)
            }
            (Some(Type::Dict { value, .. }), _) => optional(value.as_ref().clone()),
            _ => optional(Type::Any),
        }
    })
    .flows_tags()
}

fn json_parse() -> OpDef {
    OpDef::new("json-parse", [("json", Type::String)], Type::Any, |_, inputs| {
        let parsed: serde_json::Value = serde_json::from_str(string(&inputs[0])?)?;
        Ok(Boxed::new(Value::from_json(&parsed)))
    })
    .dispatch_as("parse")
    .refine_with(|_, _, values| {
        let text = values
            .first()
            .and_then(Value::as_str)
            .ok_or("json-parse refinement needs a string")?;
        let parsed: serde_json::Value = serde_json::from_str(text)?;
        Ok(type_of(&Value::from_json(&parsed)))
    })
}

fn file_read() -> OpDef {
    OpDef::new(
        "file-read",
        [("path", Type::String)],
        Type::String,
        |ctx: &OpContext<'_>, inputs: &[Boxed]| {
            let text = ctx.storage()?.root().read_to_string(string(&inputs[0])?)?;
            Ok(Boxed::new(Value::string(text)))
        },
    )
    .impure()
}

fn artifact_save() -> OpDef {
    OpDef::new(
        "artifact-save",
        [("name", Type::String), ("value", Type::Any)],
        Type::reference(Type::Any),
        |ctx, inputs| {
            let value = inputs[1].value();
            let reference = storage::save(ctx.storage()?, string(&inputs[0])?, &type_of(value), value)?;
            Ok(Boxed::new(reference))
        },
    )
    .output_fn(|inputs| Type::reference(inputs.get(1).cloned().unwrap_or(Type::Any)))
    .impure()
}

fn artifact_get() -> OpDef {
    OpDef::new(
        "artifact-get",
        [("ref", Type::reference(Type::Any))],
        Type::Any,
        |ctx, inputs| {
            let uri = inputs[0]
                .as_ref_uri()
                .ok_or_else(|| format!("expected reference, got {}", inputs[0].value()))?;
            let (_, value) = storage::get(ctx.storage()?, uri)?;
            Ok(Boxed::new(value))
        },
    )
    .output_fn(|inputs| match inputs.first().map(Type::untagged) {
        Some(Type::Ref { target }) => target.as_ref().clone(),
        _ => Type::Any,
    })
    .refine_with(|ctx, _, values| {
        let uri = values
            .first()
            .and_then(Value::as_ref_uri)
            .ok_or("artifact-get refinement needs a reference")?;
        let (ty, _) = storage::get(ctx.storage()?, uri)?;
        Ok(ty)
    })
    .impure()
}
