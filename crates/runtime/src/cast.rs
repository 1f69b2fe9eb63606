//! Loose conversions between runtime types: truthiness, numeric coercion
//! and stringification. These back the operator tables, THROW's message
//! formatting and string concatenation.

use meow_core::Value;
use meow_core::object::ObjectKind;

/// Truthiness: null and false are false, zero numbers and NaN are false,
/// empty strings are false, everything else is true.
pub fn truthy(value: Value) -> bool {
    if value.is_bool() {
        return value.as_bool();
    }
    if value.is_null() {
        return false;
    }
    if value.is_int() {
        return value.as_int() != 0;
    }
    if value.is_float() {
        let f = value.as_float();
        return f != 0.0 && !f.is_nan();
    }
    if value.is_string() {
        // Safety check done by the predicate.
        let s = unsafe { value.as_object().downcast::<meow_core::object::ObjString>() };
        return !s.is_empty();
    }
    true
}

/// Numeric coercion for mixed comparisons: bools become 0/1, ints widen,
/// numeric strings parse, everything else is 0.
pub fn to_float_lossy(value: Value) -> f64 {
    if value.is_float() {
        return value.as_float();
    }
    if value.is_int() {
        return value.as_int() as f64;
    }
    if value.is_bool() {
        return if value.as_bool() { 1.0 } else { 0.0 };
    }
    if value.is_string() {
        let s = unsafe { value.as_object().downcast::<meow_core::object::ObjString>() };
        let trimmed = s.as_str().trim();
        return match trimmed {
            "NaN" | "nan" => f64::NAN,
            "Infinity" | "inf" => f64::INFINITY,
            "-Infinity" | "-inf" => f64::NEG_INFINITY,
            _ => trimmed.parse().unwrap_or(0.0),
        };
    }
    0.0
}

/// Integer coercion: floats saturate and NaN maps to 0.
pub fn to_int_lossy(value: Value) -> i64 {
    if value.is_int() {
        return value.as_int();
    }
    if value.is_bool() {
        return value.as_bool() as i64;
    }
    if value.is_float() {
        let f = value.as_float();
        if f.is_nan() {
            return 0;
        }
        if f >= i64::MAX as f64 {
            return i64::MAX;
        }
        if f <= i64::MIN as f64 {
            return i64::MIN;
        }
        return f as i64;
    }
    if value.is_string() {
        let s = unsafe { value.as_object().downcast::<meow_core::object::ObjString>() };
        return s.as_str().trim().parse().unwrap_or(0);
    }
    0
}

fn format_float(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() }
    } else if f == f.trunc() && f.abs() < 1e15 {
        format!("{f:.1}")
    } else {
        format!("{f}")
    }
}

/// Display form of any value, used by string concatenation and THROW.
pub fn stringify(value: Value) -> String {
    if value.is_null() {
        return "null".to_string();
    }
    if value.is_bool() {
        return value.as_bool().to_string();
    }
    if value.is_int() {
        return value.as_int().to_string();
    }
    if value.is_float() {
        return format_float(value.as_float());
    }
    if value.is_native() {
        return "<native fn>".to_string();
    }
    if value.is_pointer() {
        return format!("<ptr {:p}>", value.as_pointer());
    }

    let object = value.as_object();
    unsafe {
        match object.kind() {
            ObjectKind::String => object
                .downcast::<meow_core::object::ObjString>()
                .as_str()
                .to_string(),
            ObjectKind::Array => {
                let array = object.downcast::<meow_core::object::ObjArray>();
                let parts: Vec<String> = array.iter().map(|&v| stringify(v)).collect();
                format!("[{}]", parts.join(", "))
            }
            ObjectKind::Table => {
                let table = object.downcast::<meow_core::object::ObjTable>();
                let mut parts: Vec<String> = table
                    .iter()
                    .map(|(k, v)| format!("{}: {}", k.as_str(), stringify(v)))
                    .collect();
                parts.sort();
                format!("{{{}}}", parts.join(", "))
            }
            ObjectKind::Class => {
                let class = object.downcast::<meow_core::object::ObjClass>();
                format!("<class {}>", class.name().as_str())
            }
            ObjectKind::Instance => {
                let instance = object.downcast::<meow_core::object::ObjInstance>();
                format!("<instance of {}>", instance.class().name().as_str())
            }
            ObjectKind::BoundMethod => "<bound method>".to_string(),
            ObjectKind::Closure => {
                let closure = object.downcast::<meow_core::object::ObjClosure>();
                match closure.proto().name() {
                    Some(name) => format!("<fn {}>", name.as_str()),
                    None => "<fn>".to_string(),
                }
            }
            ObjectKind::Proto => "<proto>".to_string(),
            ObjectKind::Upvalue => "<upvalue>".to_string(),
            ObjectKind::Shape => "<shape>".to_string(),
            ObjectKind::Module => {
                let module = object.downcast::<meow_core::object::ObjModule>();
                format!("<module {}>", module.name().as_str())
            }
        }
    }
}

/// Short type name for diagnostics.
pub fn type_name(value: Value) -> &'static str {
    if value.is_null() {
        "Null"
    } else if value.is_bool() {
        "Bool"
    } else if value.is_int() {
        "Int"
    } else if value.is_float() {
        "Float"
    } else if value.is_native() {
        "NativeFn"
    } else if value.is_pointer() {
        "Pointer"
    } else {
        match value.as_object().kind() {
            ObjectKind::String => "String",
            ObjectKind::Array => "Array",
            ObjectKind::Table => "Hash",
            ObjectKind::Class => "Class",
            ObjectKind::Instance => "Instance",
            ObjectKind::Shape => "Shape",
            ObjectKind::BoundMethod => "BoundMethod",
            ObjectKind::Upvalue => "Upvalue",
            ObjectKind::Proto => "Proto",
            ObjectKind::Closure => "Function",
            ObjectKind::Module => "Module",
        }
    }
}
