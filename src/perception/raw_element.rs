/// Untrusted element description from model output, accessed through a
/// canonical-field → alias table.
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    X,
    Y,
    XNorm,
    YNorm,
    Bbox,
    Width,
    Height,
    WidthNorm,
    HeightNorm,
    Label,
    Type,
    Confidence,
}

impl Field {
    /// Aliases in priority order.
    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            Field::X => &["x"],
            Field::Y => &["y"],
            Field::XNorm => &["x_norm"],
            Field::YNorm => &["y_norm"],
            Field::Bbox => &["bbox"],
            Field::Width => &["width", "w", "width_pixels"],
            Field::Height => &["height", "h", "height_pixels"],
            Field::WidthNorm => &["width_norm"],
            Field::HeightNorm => &["height_norm"],
            Field::Label => &["label", "description", "name"],
            Field::Type => &["type", "category"],
            Field::Confidence => &["confidence"],
        }
    }

    /// Size hints of exactly zero carry no information and fall through to the
    /// next alias.
    fn skips_zero(self) -> bool {
        matches!(self, Field::Width | Field::Height)
    }
}

/// Numbers or numeric strings, finite only.
pub fn coerce_f64(value: &Value) -> Option<f64> {
    let v = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    v.is_finite().then_some(v)
}

#[derive(Debug, Clone, Copy)]
pub struct RawElement<'a> {
    map: &'a Map<String, Value>,
}

impl<'a> RawElement<'a> {
    pub fn new(map: &'a Map<String, Value>) -> Self {
        Self { map }
    }

    pub fn from_value(value: &'a Value) -> Option<Self> {
        value.as_object().map(Self::new)
    }

    pub fn has(&self, field: Field) -> bool {
        field.aliases().iter().any(|a| self.map.contains_key(*a))
    }

    /// First alias holding a usable number.
    pub fn number(&self, field: Field) -> Option<f64> {
        field
            .aliases()
            .iter()
            .filter_map(|a| self.map.get(*a))
            .filter_map(coerce_f64)
            .find(|v| !(field.skips_zero() && *v == 0.0))
    }

    /// First alias holding a non-empty string (numbers are stringified).
    pub fn text(&self, field: Field) -> Option<String> {
        field
            .aliases()
            .iter()
            .filter_map(|a| self.map.get(*a))
            .find_map(|v| match v {
                Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
    }

    /// `[x1, y1, x2, y2]` corners, only when all four are numeric.
    pub fn corners(&self) -> Option<[f64; 4]> {
        let arr = self.map.get("bbox")?.as_array()?;
        if arr.len() != 4 {
            return None;
        }
        let mut out = [0.0; 4];
        for (slot, v) in out.iter_mut().zip(arr) {
            *slot = coerce_f64(v)?;
        }
        Some(out)
    }
}

/// Pull element candidates out of an extracted JSON value:
/// `{"elements": [...]}`, a bare object, or an array of objects.
pub fn candidates(data: &Value) -> Option<Vec<&Map<String, Value>>> {
    match data {
        Value::Object(map) => match map.get("elements") {
            Some(Value::Array(items)) => Some(items.iter().filter_map(Value::as_object).collect()),
            _ => Some(vec![map]),
        },
        Value::Array(items) => Some(items.iter().filter_map(Value::as_object).collect()),
        _ => None,
    }
}
