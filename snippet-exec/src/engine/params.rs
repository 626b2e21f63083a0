//! Converts JSON request parameters into the text a module parses.

use serde_json::Value;

use crate::template::Shape;

/// Coerces each parameter to the shape declared at the same position.
///
/// Extra parameters are dropped. `null` becomes an empty field, which the
/// module reads as the type's default, the same as a missing parameter.
pub fn coerce_all(values: &[Value], shapes: &[Shape]) -> Vec<String> {
    values
        .iter()
        .zip(shapes.iter())
        .map(|(value, shape)| coerce(value, *shape))
        .collect()
}

/// Best-effort conversion of one value. Anything that cannot be converted
/// passes through as its raw text and fails, if at all, inside the module.
pub fn coerce(value: &Value, shape: Shape) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(flag) => {
            if shape.is_integer() || shape.is_float() {
                if *flag { "1" } else { "0" }.to_string()
            } else {
                flag.to_string()
            }
        }
        Value::Number(number) => coerce_number(number, shape),
        Value::String(text) => coerce_text(text, shape),
        other => other.to_string(),
    }
}

fn coerce_number(number: &serde_json::Number, shape: Shape) -> String {
    match shape {
        Shape::Bool => {
            let truthy = number.as_f64().map(|n| n != 0.0).unwrap_or(false);
            truthy.to_string()
        }
        Shape::Char => number
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_else(|| number.to_string()),
        s if s.is_integer() => {
            if number.is_i64() || number.is_u64() {
                number.to_string()
            } else {
                match number.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.is_finite() => format!("{}", f as i128),
                    _ => number.to_string(),
                }
            }
        }
        _ => number.to_string(),
    }
}

fn coerce_text(text: &str, shape: Shape) -> String {
    match shape {
        Shape::String | Shape::Str => text.to_string(),
        Shape::Char => text.to_string(),
        Shape::Bool => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => "true".to_string(),
            "false" | "0" | "no" | "off" | "" => "false".to_string(),
            _ => text.to_string(),
        },
        s if s.is_integer() => {
            let trimmed = text.trim();
            if trimmed.parse::<i128>().is_ok() || trimmed.parse::<u128>().is_ok() {
                return trimmed.to_string();
            }
            match trimmed.parse::<f64>() {
                Ok(f) if f.fract() == 0.0 && f.is_finite() => format!("{}", f as i128),
                _ => text.to_string(),
            }
        }
        _ => {
            let trimmed = text.trim();
            if trimmed.parse::<f64>().is_ok() {
                trimmed.to_string()
            } else {
                text.to_string()
            }
        }
    }
}
