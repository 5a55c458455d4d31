use serde::{Deserialize, Serialize};

use crate::record::Record;

/// Storage format tag for an [`Atom`]. Closed over the formats the bucket
/// backends know how to lay out on disk, with an escape hatch for anything
/// else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    /// A scalar or small structured value, inlined into the record
    /// descriptor rather than written to a sidecar file.
    Data,
    /// Opaque bytes with no further structure.
    Blob,
    /// Image bytes (png/jpeg/...).
    Image,
    /// A dense numeric array.
    Ndarray,
    /// Plain text.
    Text,
    /// A format name not covered above. Backends fall back to `.dat`.
    Ext(String),
}

impl Format {
    /// The file extension a directory bucket uses for this format.
    pub fn extension(&self) -> &str {
        match self {
            Format::Image => "png",
            Format::Ndarray => "npz",
            Format::Text => "txt",
            Format::Data | Format::Blob | Format::Ext(_) => "dat",
        }
    }
}

/// The dynamically-typed payload an [`Atom`] carries. Closed sum type large
/// enough to round-trip through JSON losslessly, since this is both the
/// bucket descriptor format and the process-mode IPC wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AtomValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<AtomValue>),
    Blob(Vec<u8>),
    Json(serde_json::Value),
    /// A group of whole records, as produced by `batch`'s `precord_batch`
    /// channel and consumed by `unbatch`. Distinct from `List`, which holds
    /// bare atom values — this carries each record's own id/timestamp/
    /// channels intact, the way the original's `batch` groups whole
    /// `PRecord`s rather than their values.
    RecordBatch(Vec<Record>),
}

/// Infers a [`Format`] from a value the way the original's
/// `_infer_format_from_type` did: prefix-sniff strings that look like image
/// paths, recognize array-like lists, and otherwise fall back to `data` for
/// scalars and `blob` for everything else.
pub fn infer_format(value: &AtomValue) -> Format {
    match value {
        AtomValue::Text(s) => {
            let lower = s.to_ascii_lowercase();
            if lower.starts_with("image") || lower.starts_with("img") {
                Format::Image
            } else {
                Format::Text
            }
        }
        AtomValue::List(items) if !items.is_empty() && items.iter().all(is_numeric) => {
            Format::Ndarray
        }
        AtomValue::Null | AtomValue::Bool(_) | AtomValue::Int(_) | AtomValue::Float(_) => {
            Format::Data
        }
        // A plain Python `list` (of anything, records included) infers as
        // "data" in the original; `RecordBatch` follows the same rule.
        AtomValue::RecordBatch(_) => Format::Data,
        AtomValue::Blob(_) => Format::Blob,
        AtomValue::List(_) | AtomValue::Json(_) => Format::Blob,
    }
}

fn is_numeric(v: &AtomValue) -> bool {
    matches!(v, AtomValue::Int(_) | AtomValue::Float(_))
}

/// Infers a [`Format`] the way `_infer_format_from_type(channel_name, value)`
/// did: the channel's name takes priority over the value when it carries an
/// `image`/`img` prefix (so an `image_raw` channel is always `image`,
/// whatever gets written to it), falling back to [`infer_format`] otherwise.
pub fn infer_format_for_channel(channel: &str, value: &AtomValue) -> Format {
    let lower = channel.to_ascii_lowercase();
    if lower.starts_with("image") || lower.starts_with("img") {
        Format::Image
    } else {
        infer_format(value)
    }
}

/// A single typed value flowing through a channel of a [`crate::Record`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Atom {
    pub value: AtomValue,
    pub format: Format,
}

impl Atom {
    /// Builds an atom, inferring its format from the value alone. Prefer
    /// [`Atom::for_channel`] when a channel name is available, since format
    /// inference also keys off the channel's name prefix.
    pub fn new(value: AtomValue) -> Self {
        let format = infer_format(&value);
        Atom { value, format }
    }

    /// Builds an atom, inferring its format from the value and the
    /// destination channel's name (e.g. `image*` ⇒ `image`).
    pub fn for_channel(channel: &str, value: AtomValue) -> Self {
        let format = infer_format_for_channel(channel, &value);
        Atom { value, format }
    }

    pub fn with_format(value: AtomValue, format: Format) -> Self {
        Atom { value, format }
    }
}

impl From<&str> for Atom {
    fn from(s: &str) -> Self {
        Atom::new(AtomValue::Text(s.to_string()))
    }
}

impl From<String> for Atom {
    fn from(s: String) -> Self {
        Atom::new(AtomValue::Text(s))
    }
}

impl From<i64> for Atom {
    fn from(v: i64) -> Self {
        Atom::new(AtomValue::Int(v))
    }
}

impl From<f64> for Atom {
    fn from(v: f64) -> Self {
        Atom::new(AtomValue::Float(v))
    }
}

impl From<bool> for Atom {
    fn from(v: bool) -> Self {
        Atom::new(AtomValue::Bool(v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_infers_data() {
        assert_eq!(infer_format(&AtomValue::Int(3)), Format::Data);
        assert_eq!(infer_format(&AtomValue::Float(3.0)), Format::Data);
        assert_eq!(infer_format(&AtomValue::Bool(true)), Format::Data);
    }

    #[test]
    fn image_prefixed_text_infers_image() {
        let f = infer_format(&AtomValue::Text("image_path.png".into()));
        assert_eq!(f, Format::Image);
        let f = infer_format(&AtomValue::Text("img001".into()));
        assert_eq!(f, Format::Image);
    }

    #[test]
    fn plain_text_infers_text() {
        assert_eq!(infer_format(&AtomValue::Text("hello".into())), Format::Text);
    }

    #[test]
    fn numeric_list_infers_ndarray() {
        let v = AtomValue::List(vec![AtomValue::Float(1.0), AtomValue::Float(2.0)]);
        assert_eq!(infer_format(&v), Format::Ndarray);
    }

    #[test]
    fn opaque_bytes_infer_blob() {
        assert_eq!(infer_format(&AtomValue::Blob(vec![1, 2, 3])), Format::Blob);
    }

    #[test]
    fn channel_name_prefix_overrides_value_inference() {
        let f = infer_format_for_channel("image_raw", &AtomValue::Blob(vec![1]));
        assert_eq!(f, Format::Image);
        let f = infer_format_for_channel("img2", &AtomValue::Int(3));
        assert_eq!(f, Format::Image);
        let f = infer_format_for_channel("default", &AtomValue::Int(3));
        assert_eq!(f, Format::Data);
    }

    #[test]
    fn extension_table_has_expected_entries() {
        assert_eq!(Format::Image.extension(), "png");
        assert_eq!(Format::Ndarray.extension(), "npz");
        assert_eq!(Format::Text.extension(), "txt");
        assert_eq!(Format::Data.extension(), "dat");
        assert_eq!(Format::Blob.extension(), "dat");
    }
}
