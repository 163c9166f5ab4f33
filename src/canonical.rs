//! Canonical request text.
//!
//! Stubs are matched against requests as text, so every request is rendered
//! into one deterministic JSON form first: compact, with object keys sorted at
//! every depth, and integral floating-point numbers written without a
//! fraction.

use prost_reflect::{DynamicMessage, Kind, MessageDescriptor, ReflectMessage, SerializeOptions};
use serde::ser::Error as _;
use serde::{Serialize, Serializer};

/// A request value could not be rendered as JSON.
#[derive(Debug, thiserror::Error)]
#[error("could not marshal the request to JSON: {source}")]
pub struct EncodingError {
    #[from]
    source: serde_json::Error,
}

/// Serializes a [`DynamicMessage`] the way Go's `encoding/json` renders
/// generated types: schema field names, default values omitted, 64-bit
/// integers and enums as numbers, and `float` fields at `float` precision.
#[derive(Debug, Clone, Copy)]
pub struct CanonicalMessage<'a>(pub &'a DynamicMessage);

impl Serialize for CanonicalMessage<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let options = SerializeOptions::new()
            .use_proto_field_name(true)
            .skip_default_fields(true)
            .use_enum_numbers(true)
            .stringify_64_bit_integers(false);
        let mut value = self
            .0
            .serialize_with_options(serde_json::value::Serializer, &options)
            .map_err(S::Error::custom)?;
        narrow_floats(&mut value, &self.0.descriptor());
        value.serialize(serializer)
    }
}

/// Rewrite `float` fields with the shortest decimal that round-trips at
/// 32-bit precision (`0.1f32` is `0.1`, not `0.10000000149011612`).
fn narrow_floats(value: &mut serde_json::Value, message: &MessageDescriptor) {
    let serde_json::Value::Object(object) = value else {
        return;
    };
    for (key, item) in object.iter_mut() {
        let Some(field) = message.get_field_by_name(key) else {
            continue;
        };
        let kind = field.kind();
        match item {
            serde_json::Value::Array(items) if field.is_list() => {
                items.iter_mut().for_each(|i| narrow_value(i, &kind));
            }
            serde_json::Value::Object(entries) if field.is_map() => {
                if let Kind::Message(entry) = &kind {
                    let value_kind = entry.map_entry_value_field().kind();
                    entries.values_mut().for_each(|v| narrow_value(v, &value_kind));
                }
            }
            single => narrow_value(single, &kind),
        }
    }
}

fn narrow_value(value: &mut serde_json::Value, kind: &Kind) {
    match kind {
        Kind::Float => {
            let shortest = value
                .as_f64()
                .and_then(|n| (n as f32).to_string().parse::<f64>().ok())
                .and_then(serde_json::Number::from_f64);
            if let Some(n) = shortest {
                *value = serde_json::Value::Number(n);
            }
        }
        Kind::Message(message) => narrow_floats(value, message),
        _ => {}
    }
}

/// Render a request value into its canonical JSON text.
///
/// [`DynamicMessage`] requests should be wrapped in [`CanonicalMessage`].
pub fn canonicalize<T: Serialize + ?Sized>(request: &T) -> Result<String, EncodingError> {
    let value = serde_json::to_value(request)?;
    let mut out = String::new();
    write_canonical(&value, &mut out)?;
    Ok(out)
}

fn write_canonical(value: &serde_json::Value, out: &mut String) -> Result<(), EncodingError> {
    match value {
        serde_json::Value::Object(object) => {
            let mut entries: Vec<_> = object.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key)?);
                out.push(':');
                write_canonical(item, out)?;
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out)?;
            }
            out.push(']');
        }
        serde_json::Value::Number(n) => match n.as_f64() {
            // Go writes integral floats below 1e21 without a fraction
            Some(f) if n.is_f64() && f.fract() == 0.0 && f.abs() < 1e21 => {
                out.push_str(&format!("{:.0}", f));
            }
            _ => out.push_str(&n.to_string()),
        },
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}
