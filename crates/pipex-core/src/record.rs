use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::atom::{Atom, AtomValue};

fn now_unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// An immutable record flowing through a pipeline: an identity, a
/// timestamp, a set of named channels each carrying one [`Atom`], and a
/// pointer to which channel is "active" (the one `value`/`with_value`
/// operate on).
///
/// `channels` is a `BTreeMap` rather than a `HashMap` so the descriptor
/// JSON a directory bucket writes is deterministically ordered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    id: String,
    timestamp: f64,
    active_channel: String,
    channels: BTreeMap<String, Atom>,
}

impl Record {
    pub const DEFAULT_CHANNEL: &'static str = "default";

    /// Builds a record from a raw value on `channel_name`, as the original
    /// `PRecord.from_object` constructor did: a fresh id, current
    /// timestamp, and exactly one populated channel.
    pub fn from_object(value: AtomValue, channel_name: &str, id: String, timestamp: f64) -> Self {
        let mut channels = BTreeMap::new();
        channels.insert(channel_name.to_string(), Atom::for_channel(channel_name, value));
        Record {
            id,
            timestamp,
            active_channel: channel_name.to_string(),
            channels,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn active_channel(&self) -> &str {
        &self.active_channel
    }

    pub fn channels(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    /// The atom on the active channel, if present.
    pub fn atom(&self) -> Option<&Atom> {
        self.channels.get(&self.active_channel)
    }

    /// The value on the active channel, if present.
    pub fn value(&self) -> Option<&AtomValue> {
        self.atom().map(|a| &a.value)
    }

    pub fn get_atom(&self, channel: &str) -> Option<&Atom> {
        self.channels.get(channel)
    }

    pub fn get(&self, channel: &str) -> Option<&AtomValue> {
        self.get_atom(channel).map(|a| &a.value)
    }

    /// Returns a copy with `active_channel` switched to `channel`. The
    /// channel need not already exist in `channels` — `value`/`atom` simply
    /// read as absent until something writes to it, mirroring
    /// `pdatastructures.py`'s `with_channel`, which sets the pointer with no
    /// existence check.
    pub fn with_channel(&self, channel: &str) -> Self {
        let mut next = self.clone();
        next.active_channel = channel.to_string();
        next
    }

    /// Returns a copy with `channel` set to `atom`, creating it if absent.
    /// Does not change the active channel.
    pub fn with_channel_item(&self, channel: &str, atom: Atom) -> Self {
        let mut next = self.clone();
        next.channels.insert(channel.to_string(), atom);
        next
    }

    /// Upserts `channel => value` pairs, inferring each one's format from
    /// its channel name and value (same rule as [`Record::with_value`]), and
    /// bumps `timestamp`. The Rust analogue of `PRecord.merge(**kwargs)`.
    pub fn merge<I, K>(&self, values: I) -> Self
    where
        I: IntoIterator<Item = (K, AtomValue)>,
        K: Into<String>,
    {
        let mut next = self.clone();
        for (name, value) in values {
            let name = name.into();
            let atom = Atom::for_channel(&name, value);
            next.channels.insert(name, atom);
        }
        next.timestamp = next.timestamp.max(now_unix_seconds());
        next
    }

    /// Unions `other`'s channels into a copy of `self`, `other` winning on
    /// overlap. Used by the chain algebra's `∥` (pipe) combinator to merge
    /// two branches' output records by position; distinct from the public
    /// `merge(k=v,…)` upsert surface above since it carries whole atoms
    /// (already-inferred formats) rather than raw values.
    pub(crate) fn union_channels(&self, other: &Record) -> Self {
        let mut next = self.clone();
        for (name, atom) in &other.channels {
            next.channels.insert(name.clone(), atom.clone());
        }
        next
    }

    pub fn with_id(&self, id: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.id = id.into();
        next
    }

    /// Returns a copy with the active channel's value replaced, keeping its
    /// format unless `value`'s inferred format differs (the original always
    /// re-infers on `with_value`).
    pub fn with_value(&self, value: AtomValue) -> Self {
        let mut next = self.clone();
        let atom = Atom::for_channel(&next.active_channel, value);
        next.channels.insert(next.active_channel.clone(), atom);
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        Record::from_object(AtomValue::Int(1), "default", "id-1".into(), 0.0)
    }

    #[test]
    fn from_object_populates_single_channel() {
        let r = sample();
        assert_eq!(r.active_channel(), "default");
        assert_eq!(r.value(), Some(&AtomValue::Int(1)));
        assert_eq!(r.channels().count(), 1);
    }

    #[test]
    fn with_channel_item_adds_without_switching_active() {
        let r = sample().with_channel_item("aux", Atom::new(AtomValue::Text("x".into())));
        assert_eq!(r.active_channel(), "default");
        assert_eq!(r.get("aux"), Some(&AtomValue::Text("x".into())));
    }

    #[test]
    fn with_channel_switches_active() {
        let r = sample().with_channel_item("aux", Atom::new(AtomValue::Text("x".into())));
        let r = r.with_channel("aux");
        assert_eq!(r.active_channel(), "aux");
        assert_eq!(r.value(), Some(&AtomValue::Text("x".into())));
    }

    #[test]
    fn with_channel_on_unknown_channel_just_moves_the_pointer() {
        let r = sample().with_channel("nope");
        assert_eq!(r.active_channel(), "nope");
        assert_eq!(r.value(), None);
        assert_eq!(r.channels().count(), 1);
    }

    #[test]
    fn with_channel_then_with_channel_lands_on_the_last_one() {
        let r = sample().with_channel("a").with_channel("b");
        assert_eq!(r.active_channel(), "b");
    }

    #[test]
    fn merge_upserts_named_channels_and_bumps_timestamp() {
        let a = sample();
        let merged = a.merge([("extra", AtomValue::Int(2))]);
        assert_eq!(merged.get("default"), Some(&AtomValue::Int(1)));
        assert_eq!(merged.get("extra"), Some(&AtomValue::Int(2)));
        assert!(merged.timestamp() >= a.timestamp());
    }

    #[test]
    fn merge_on_image_prefixed_channel_infers_image_format() {
        let r = sample().merge([("image_thumb", AtomValue::Blob(vec![1, 2, 3]))]);
        assert_eq!(r.get_atom("image_thumb").unwrap().format, crate::atom::Format::Image);
    }

    #[test]
    fn with_value_reinfers_format() {
        let r = sample().with_value(AtomValue::Text("image_foo".into()));
        assert_eq!(r.atom().unwrap().format, crate::atom::Format::Image);
    }

    #[test]
    fn with_value_on_image_channel_infers_image_regardless_of_value() {
        let r = Record::from_object(AtomValue::Int(1), "image_raw", "id-1".into(), 0.0)
            .with_value(AtomValue::Blob(vec![9, 9]));
        assert_eq!(r.atom().unwrap().format, crate::atom::Format::Image);
    }

    #[test]
    fn record_is_immutable_copy_on_write() {
        let a = sample();
        let b = a.with_id("id-2");
        assert_eq!(a.id(), "id-1");
        assert_eq!(b.id(), "id-2");
    }
}
