//! Event type filters
//!
//! A muxer has two filters: the read filter decides what the muxer forwards
//! to the engine when its stream writes into it, the write filter decides
//! what the muxer accepts from the engine for its subscriber.

use std::collections::BTreeSet;
use std::ops::{BitOrAssign, SubAssign};

use crate::error::{Error, Result};
use crate::io::EventType;

/// Set of allowed event types
///
/// A type is allowed when it is listed explicitly, or when its category is
/// allowed (or the filter allows everything) and neither the type nor its
/// category was excluded. An explicit type wins over a category exclusion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MuxerFilter {
    allow_all: bool,
    categories: BTreeSet<u16>,
    types: BTreeSet<u32>,
    excluded_categories: BTreeSet<u16>,
    excluded_types: BTreeSet<u32>,
}

impl MuxerFilter {
    /// Filter allowing every type
    pub fn all() -> Self {
        Self {
            allow_all: true,
            ..Default::default()
        }
    }

    /// Filter allowing nothing
    pub fn none() -> Self {
        Self::default()
    }

    /// Filter allowing exactly the given types
    pub fn from_types(types: impl IntoIterator<Item = u32>) -> Self {
        Self {
            types: types.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Also allow `event_type`
    #[must_use]
    pub fn with_type(mut self, event_type: u32) -> Self {
        self.excluded_types.remove(&event_type);
        self.types.insert(event_type);
        self
    }

    /// Also allow every type of `category`
    #[must_use]
    pub fn with_category(mut self, category: u16) -> Self {
        self.excluded_categories.remove(&category);
        self.categories.insert(category);
        self
    }

    /// Parse a configuration list
    ///
    /// Accepted entries: `all`, `<category>:*`, `<category>:<element>`, a hex
    /// (`0x10001`) or decimal type id. Numbers inside `category:element`
    /// can be decimal or hex. An empty list allows everything.
    pub fn parse<S: AsRef<str>>(entries: &[S]) -> Result<Self> {
        if entries.is_empty() {
            return Ok(Self::all());
        }

        let mut filter = Self::none();
        for entry in entries {
            let raw = entry.as_ref().trim();
            let lower = raw.to_ascii_lowercase();
            if lower == "all" {
                filter.allow_all = true;
            } else if let Some((cat, elem)) = lower.split_once(':') {
                let category =
                    parse_number(cat).ok_or_else(|| Error::InvalidFilter(raw.to_string()))?;
                let category =
                    u16::try_from(category).map_err(|_| Error::InvalidFilter(raw.to_string()))?;
                if elem == "*" {
                    filter.categories.insert(category);
                } else {
                    let element = parse_number(elem)
                        .and_then(|e| u16::try_from(e).ok())
                        .ok_or_else(|| Error::InvalidFilter(raw.to_string()))?;
                    filter.types.insert(EventType::new(category, element).value());
                }
            } else {
                let t = parse_number(&lower).ok_or_else(|| Error::InvalidFilter(raw.to_string()))?;
                filter.types.insert(t);
            }
        }
        Ok(filter)
    }

    /// Whether events of type `event_type` pass this filter
    pub fn allows(&self, event_type: u32) -> bool {
        if self.excluded_types.contains(&event_type) {
            return false;
        }
        if self.types.contains(&event_type) {
            return true;
        }
        let category = EventType(event_type).category();
        !self.excluded_categories.contains(&category)
            && (self.allow_all || self.categories.contains(&category))
    }

    pub fn is_all(&self) -> bool {
        self.allow_all && self.excluded_categories.is_empty() && self.excluded_types.is_empty()
    }

    /// Whether nothing can pass
    pub fn is_empty(&self) -> bool {
        !self.allow_all && self.categories.is_empty() && self.types.is_empty()
    }
}

impl BitOrAssign<&MuxerFilter> for MuxerFilter {
    fn bitor_assign(&mut self, other: &MuxerFilter) {
        self.allow_all |= other.allow_all;
        for &c in &other.categories {
            self.excluded_categories.remove(&c);
            self.categories.insert(c);
        }
        for &t in &other.types {
            self.excluded_types.remove(&t);
            self.types.insert(t);
        }
    }
}

impl SubAssign<&MuxerFilter> for MuxerFilter {
    fn sub_assign(&mut self, other: &MuxerFilter) {
        if other.allow_all {
            *self = MuxerFilter::none();
            return;
        }
        for &c in &other.categories {
            self.categories.remove(&c);
            self.types.retain(|t| EventType(*t).category() != c);
            self.excluded_categories.insert(c);
        }
        for &t in &other.types {
            self.types.remove(&t);
            self.excluded_types.insert(t);
        }
    }
}

impl std::fmt::Display for MuxerFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut parts = Vec::new();
        if self.allow_all {
            parts.push("all".to_string());
        }
        parts.extend(self.categories.iter().map(|c| format!("{}:*", c)));
        parts.extend(self.types.iter().map(|t| format!("{:#x}", t)));
        parts.extend(self.excluded_categories.iter().map(|c| format!("!{}:*", c)));
        parts.extend(self.excluded_types.iter().map(|t| format!("!{:#x}", t)));
        f.write_str(&parts.join(", "))
    }
}

fn parse_number(s: &str) -> Option<u32> {
    let s = s.trim();
    match s.strip_prefix("0x") {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST_STATUS: u32 = 0x1000e;
    const SERVICE_STATUS: u32 = 0x1001d;
    const METRIC: u32 = 0x30001;

    #[test]
    fn test_all_and_none() {
        assert!(MuxerFilter::all().allows(METRIC));
        assert!(MuxerFilter::all().is_all());
        assert!(!MuxerFilter::none().allows(METRIC));
        assert!(MuxerFilter::none().is_empty());
    }

    #[test]
    fn test_parse() {
        let f = MuxerFilter::parse(&["1:*", "0x30001"]).unwrap();
        assert!(f.allows(HOST_STATUS));
        assert!(f.allows(SERVICE_STATUS));
        assert!(f.allows(METRIC));
        assert!(!f.allows(0x30002));

        let f = MuxerFilter::parse(&["3:2"]).unwrap();
        assert!(f.allows(0x30002));
        assert!(!f.allows(METRIC));

        let empty: [&str; 0] = [];
        assert!(MuxerFilter::parse(&empty).unwrap().is_all());
        assert!(MuxerFilter::parse(&["ALL"]).unwrap().is_all());
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(
            MuxerFilter::parse(&["storage"]),
            Err(Error::InvalidFilter(_))
        ));
        assert!(MuxerFilter::parse(&["70000:*"]).is_err());
        assert!(MuxerFilter::parse(&["1:x"]).is_err());
    }

    #[test]
    fn test_union_and_difference() {
        let mut f = MuxerFilter::from_types([METRIC]);
        f |= &MuxerFilter::none().with_category(1);
        assert!(f.allows(HOST_STATUS));

        f -= &MuxerFilter::from_types([HOST_STATUS]);
        assert!(!f.allows(HOST_STATUS));
        assert!(f.allows(SERVICE_STATUS));

        f |= &MuxerFilter::from_types([HOST_STATUS]);
        assert!(f.allows(HOST_STATUS));

        f -= &MuxerFilter::none().with_category(3);
        assert!(!f.allows(METRIC));
    }

    #[test]
    fn test_subtract_from_all() {
        let mut f = MuxerFilter::all();
        f -= &MuxerFilter::none().with_category(2);
        assert!(f.allows(HOST_STATUS));
        assert!(!f.allows(0x20001));
        assert!(!f.is_all());

        f -= &MuxerFilter::all();
        assert!(f.is_empty());
    }

    #[test]
    fn test_display() {
        assert_eq!(MuxerFilter::none().to_string(), "none");
        assert_eq!(MuxerFilter::all().to_string(), "all");
        let mut f = MuxerFilter::none().with_category(1).with_type(METRIC);
        f -= &MuxerFilter::from_types([HOST_STATUS]);
        assert_eq!(f.to_string(), "1:*, 0x30001, !0x1000e");
    }
}
