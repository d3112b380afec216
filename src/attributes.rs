//! Open-ended attribute maps exposed by blocks, filesystems and entries.

use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDateTime;

/// A primitive attribute value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    UInt(u64),
    Bool(bool),
    Time(NaiveDateTime),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Str(s) => write!(f, "{s}"),
            AttrValue::Int(i) => write!(f, "{i}"),
            AttrValue::UInt(u) => write!(f, "{u}"),
            AttrValue::Bool(b) => write!(f, "{b}"),
            AttrValue::Time(t) => write!(f, "{t}"),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::Str(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::Str(value)
    }
}

impl From<u64> for AttrValue {
    fn from(value: u64) -> Self {
        AttrValue::UInt(value)
    }
}

impl From<u32> for AttrValue {
    fn from(value: u32) -> Self {
        AttrValue::UInt(value.into())
    }
}

impl From<u16> for AttrValue {
    fn from(value: u16) -> Self {
        AttrValue::UInt(value.into())
    }
}

impl From<u8> for AttrValue {
    fn from(value: u8) -> Self {
        AttrValue::UInt(value.into())
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl From<NaiveDateTime> for AttrValue {
    fn from(value: NaiveDateTime) -> Self {
        AttrValue::Time(value)
    }
}

/// Ordered map of attribute names to values. Key sets depend on the format.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Attributes(BTreeMap<String, AttrValue>);

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: impl Into<AttrValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Sets `key` only when `value` is present.
    pub fn set_opt<V: Into<AttrValue>>(&mut self, key: &str, value: Option<V>) {
        if let Some(value) = value {
            self.set(key, value);
        }
    }

    pub fn get(&self, key: &str) -> Option<&AttrValue> {
        self.0.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Copies every attribute of `other` into `self`, overwriting duplicates.
    pub fn extend(&mut self, other: &Attributes) {
        for (k, v) in other.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }
}
