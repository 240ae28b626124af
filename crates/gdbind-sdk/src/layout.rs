//! Resource kinds and their handle widths
//!
//! The engine transmits most of its built-in resources as opaque handles of
//! one, two or three words. Which kind uses which width is a property of the
//! host ABI version, so it lives in a configuration table ([`AbiLayout`])
//! instead of being compiled in.

use std::fmt;

use semver::{Comparator, Op, Prerelease, VersionReq};
use serde::{Deserialize, Serialize};

use crate::abi::{HostVersion, SLOT_WORDS};
use crate::error::{AbiError, AbiResult};

// ============================================================================
// Resource Kinds
// ============================================================================

/// Every non-trivial native value the runtime can hold a handle to.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Engine string
    String = 0,
    /// Interned engine string
    StringName = 1,
    /// Scene tree path
    NodePath = 2,
    /// Bound callable
    Callable = 3,
    /// Object signal
    Signal = 4,
    /// Untyped array
    Array = 5,
    /// Hash map
    Dictionary = 6,
    /// Packed bytes
    PackedByteArray = 7,
    /// Packed 32-bit integers
    PackedInt32Array = 8,
    /// Packed 64-bit integers
    PackedInt64Array = 9,
    /// Packed 32-bit floats
    PackedFloat32Array = 10,
    /// Packed 64-bit floats
    PackedFloat64Array = 11,
    /// Packed strings
    PackedStringArray = 12,
    /// Packed 2D vectors
    PackedVector2Array = 13,
    /// Packed 3D vectors
    PackedVector3Array = 14,
    /// Packed colors
    PackedColorArray = 15,
    /// Tagged "any value"
    Variant = 16,
    /// Engine object
    Object = 17,
}

impl ResourceKind {
    /// Number of resource kinds
    pub const COUNT: usize = 18;

    /// All kinds in index order
    pub const ALL: [ResourceKind; ResourceKind::COUNT] = [
        ResourceKind::String,
        ResourceKind::StringName,
        ResourceKind::NodePath,
        ResourceKind::Callable,
        ResourceKind::Signal,
        ResourceKind::Array,
        ResourceKind::Dictionary,
        ResourceKind::PackedByteArray,
        ResourceKind::PackedInt32Array,
        ResourceKind::PackedInt64Array,
        ResourceKind::PackedFloat32Array,
        ResourceKind::PackedFloat64Array,
        ResourceKind::PackedStringArray,
        ResourceKind::PackedVector2Array,
        ResourceKind::PackedVector3Array,
        ResourceKind::PackedColorArray,
        ResourceKind::Variant,
        ResourceKind::Object,
    ];

    /// Dense index, stable across the C ABI
    #[inline]
    pub fn index(self) -> usize {
        self as u32 as usize
    }

    /// Inverse of [`ResourceKind::index`]
    pub fn from_index(index: usize) -> Option<Self> {
        ResourceKind::ALL.get(index).copied()
    }

    /// Engine-facing name of the kind
    pub fn name(self) -> &'static str {
        match self {
            ResourceKind::String => "String",
            ResourceKind::StringName => "StringName",
            ResourceKind::NodePath => "NodePath",
            ResourceKind::Callable => "Callable",
            ResourceKind::Signal => "Signal",
            ResourceKind::Array => "Array",
            ResourceKind::Dictionary => "Dictionary",
            ResourceKind::PackedByteArray => "PackedByteArray",
            ResourceKind::PackedInt32Array => "PackedInt32Array",
            ResourceKind::PackedInt64Array => "PackedInt64Array",
            ResourceKind::PackedFloat32Array => "PackedFloat32Array",
            ResourceKind::PackedFloat64Array => "PackedFloat64Array",
            ResourceKind::PackedStringArray => "PackedStringArray",
            ResourceKind::PackedVector2Array => "PackedVector2Array",
            ResourceKind::PackedVector3Array => "PackedVector3Array",
            ResourceKind::PackedColorArray => "PackedColorArray",
            ResourceKind::Variant => "Variant",
            ResourceKind::Object => "Object",
        }
    }

    /// Whether the kind is one of the string-like resources
    pub fn is_text(self) -> bool {
        matches!(
            self,
            ResourceKind::String | ResourceKind::StringName | ResourceKind::NodePath
        )
    }

    /// Handle width used when the layout table does not mention the kind
    pub fn default_words(self) -> usize {
        match self {
            ResourceKind::Callable | ResourceKind::Signal => 2,
            ResourceKind::PackedByteArray
            | ResourceKind::PackedInt32Array
            | ResourceKind::PackedInt64Array
            | ResourceKind::PackedFloat32Array
            | ResourceKind::PackedFloat64Array
            | ResourceKind::PackedStringArray
            | ResourceKind::PackedVector2Array
            | ResourceKind::PackedVector3Array
            | ResourceKind::PackedColorArray => 2,
            ResourceKind::Variant => 3,
            _ => 1,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Layout Table
// ============================================================================

/// Width override for one resource kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindWidth {
    /// Resource kind
    pub kind: ResourceKind,
    /// Handle width in words
    pub words: usize,
}

/// Handle widths for one host ABI version.
///
/// ```toml
/// host_version = ">=4.1, <5"
///
/// [[widths]]
/// kind = "variant"
/// words = 3
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbiLayout {
    /// Host versions this table describes
    pub host_version: VersionReq,
    /// Overrides of [`ResourceKind::default_words`]
    pub widths: Vec<KindWidth>,
}

impl Default for AbiLayout {
    fn default() -> Self {
        AbiLayout {
            host_version: VersionReq {
                comparators: vec![
                    Comparator {
                        op: Op::GreaterEq,
                        major: 4,
                        minor: Some(1),
                        patch: None,
                        pre: Prerelease::EMPTY,
                    },
                    Comparator {
                        op: Op::Less,
                        major: 5,
                        minor: None,
                        patch: None,
                        pre: Prerelease::EMPTY,
                    },
                ],
            },
            widths: Vec::new(),
        }
    }
}

impl AbiLayout {
    /// Width of a kind's handle in words. Later overrides win.
    pub fn words(&self, kind: ResourceKind) -> usize {
        self.widths
            .iter()
            .rev()
            .find(|w| w.kind == kind)
            .map(|w| w.words)
            .unwrap_or_else(|| kind.default_words())
    }

    /// Width of a kind's handle in bytes
    pub fn bytes(&self, kind: ResourceKind) -> usize {
        self.words(kind) * std::mem::size_of::<crate::abi::Word>()
    }

    /// Whether the table applies to the given host version
    pub fn supports(&self, version: HostVersion) -> bool {
        self.host_version.matches(&version.to_semver())
    }

    /// Check every width fits in a slot and objects stay single-word.
    pub fn validate(&self) -> AbiResult<()> {
        for kind in ResourceKind::ALL {
            let words = self.words(kind);
            let fits = (1..=SLOT_WORDS).contains(&words);
            if !fits || (kind == ResourceKind::Object && words != 1) {
                return Err(AbiError::UnsupportedLayout {
                    kind,
                    words,
                    max: SLOT_WORDS,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_roundtrip() {
        for (i, kind) in ResourceKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
            assert_eq!(ResourceKind::from_index(i), Some(*kind));
        }
        assert_eq!(ResourceKind::from_index(ResourceKind::COUNT), None);
    }

    #[test]
    fn test_default_widths() {
        let layout = AbiLayout::default();
        assert_eq!(layout.words(ResourceKind::String), 1);
        assert_eq!(layout.words(ResourceKind::PackedInt32Array), 2);
        assert_eq!(layout.words(ResourceKind::Callable), 2);
        assert_eq!(layout.words(ResourceKind::Variant), 3);
        assert_eq!(layout.bytes(ResourceKind::Variant), 24);
        assert!(layout.validate().is_ok());
    }

    #[test]
    fn test_override_wins() {
        let mut layout = AbiLayout::default();
        layout.widths.push(KindWidth {
            kind: ResourceKind::Dictionary,
            words: 2,
        });
        assert_eq!(layout.words(ResourceKind::Dictionary), 2);
        assert_eq!(layout.words(ResourceKind::Array), 1);
    }

    #[test]
    fn test_validate_rejects_wide_and_multiword_objects() {
        let mut layout = AbiLayout::default();
        layout.widths.push(KindWidth {
            kind: ResourceKind::Variant,
            words: 4,
        });
        assert!(matches!(
            layout.validate(),
            Err(AbiError::UnsupportedLayout { words: 4, .. })
        ));

        let mut layout = AbiLayout::default();
        layout.widths.push(KindWidth {
            kind: ResourceKind::Object,
            words: 2,
        });
        assert!(layout.validate().is_err());
    }

    #[test]
    fn test_host_version_match() {
        let layout = AbiLayout::default();
        assert!(layout.supports(HostVersion::new(4, 3, 0)));
        assert!(!layout.supports(HostVersion::new(4, 0, 2)));
        assert!(!layout.supports(HostVersion::new(5, 0, 0)));
    }

    #[test]
    fn test_parse_toml() {
        let text = r#"
            host_version = ">=4.2"

            [[widths]]
            kind = "packed_string_array"
            words = 3
        "#;
        let layout: AbiLayout = toml::from_str(text).unwrap();
        assert_eq!(layout.words(ResourceKind::PackedStringArray), 3);
        assert!(layout.supports(HostVersion::new(4, 2, 0)));
        assert!(!layout.supports(HostVersion::new(4, 1, 3)));
    }
}
