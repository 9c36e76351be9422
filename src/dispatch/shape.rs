//! Classic module shape detection.
//!
//! Classic modules come in four calling conventions, detected from their
//! bytes. Detection is centralized and data-driven; the same classification
//! runs controller-side for local execution and inside the gate runtime for
//! remote execution.

use std::path::Path;

/// The calling convention of a classic module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleShape {
    /// Non-UTF-8 executable; invoked with a JSON args file path argument.
    Binary,
    /// Contains `AnsibleModule(`; takes JSON args on stdin.
    NewStyle,
    /// Contains `WANT_JSON`; takes a JSON args file path argument.
    WantJson,
    /// Everything else; takes a `key=value` space-separated args file.
    OldStyle,
}

/// Marker table: first match wins, checked in order.
const MARKERS: &[(&str, ModuleShape)] = &[
    ("AnsibleModule(", ModuleShape::NewStyle),
    ("WANT_JSON", ModuleShape::WantJson),
];

impl ModuleShape {
    /// Classify module bytes.
    pub fn detect(content: &[u8]) -> Self {
        let Ok(text) = std::str::from_utf8(content) else {
            return ModuleShape::Binary;
        };
        for (marker, shape) in MARKERS {
            if text.contains(marker) {
                return *shape;
            }
        }
        ModuleShape::OldStyle
    }

    /// Classify a module file by reading its bytes.
    pub fn detect_file(path: &Path) -> std::io::Result<Self> {
        Ok(Self::detect(&std::fs::read(path)?))
    }
}

impl std::fmt::Display for ModuleShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ModuleShape::Binary => "binary",
            ModuleShape::NewStyle => "new_style",
            ModuleShape::WantJson => "want_json",
            ModuleShape::OldStyle => "old_style",
        };
        write!(f, "{name}")
    }
}
