//! Encoded build inputs: the literal constants handed to the allocator build.

use serde::{Deserialize, Serialize};

/// Environment variable carrying the space-separated `-DNAME=VALUE` list.
pub const DEFINES_ENV: &str = "MT_TUNE_DEFINES";

/// A single named constant substituted into the allocator build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BuildDefine {
    pub name: String,
    pub literal: String,
}

impl BuildDefine {
    pub fn new(name: impl Into<String>, literal: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            literal: literal.into(),
        }
    }

    /// Compiler flag form, e.g. `-DALIGNMENT=8`.
    pub fn to_flag(&self) -> String {
        format!("-D{}={}", self.name, self.literal)
    }
}

/// Ordered build inputs, one define per declared parameter in declaration order.
///
/// Two `BuildInputs` compare equal exactly when every define matches, which
/// makes the type usable as a cache key for previously evaluated candidates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildInputs {
    defines: Vec<BuildDefine>,
}

impl BuildInputs {
    pub fn new(defines: Vec<BuildDefine>) -> Self {
        Self { defines }
    }

    pub fn defines(&self) -> &[BuildDefine] {
        &self.defines
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.defines
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.literal.as_str())
    }

    pub fn len(&self) -> usize {
        self.defines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.defines.is_empty()
    }

    pub fn to_define_flags(&self) -> Vec<String> {
        self.defines.iter().map(BuildDefine::to_flag).collect()
    }

    /// Value exported through [`DEFINES_ENV`].
    pub fn to_env_value(&self) -> String {
        self.to_define_flags().join(" ")
    }

    /// Header file contents with one guarded `#define` per parameter.
    pub fn to_header(&self) -> String {
        let mut out = String::from("// Generated by mt-tune. Do not edit.\n#pragma once\n\n");
        for define in &self.defines {
            out.push_str(&format!(
                "#undef {name}\n#define {name} {literal}\n",
                name = define.name,
                literal = define.literal
            ));
        }
        out
    }

    /// Stable single-line key, `NAME=VALUE;NAME=VALUE`.
    pub fn canonical(&self) -> String {
        self.defines
            .iter()
            .map(|d| format!("{}={}", d.name, d.literal))
            .collect::<Vec<_>>()
            .join(";")
    }
}

impl std::fmt::Display for BuildInputs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_env_value())
    }
}
