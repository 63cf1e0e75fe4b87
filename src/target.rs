//! Concrete machine descriptions consumed by the code generator. An
//! [`Architecture`] catalogues what a machine family can do; a
//! [`TargetConfig`] selects the subset one compilation actually targets.

use std::collections::BTreeSet;

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Feature {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Architecture {
    pub name: String,
    pub vendor: String,
    pub features: Vec<Feature>,
}

impl Architecture {
    pub fn feature(&self, name: &str) -> Option<&Feature> {
        self.features.iter().find(|feature| feature.name == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum MemoryOrdering {
    Strong,
    AcquireRelease,
    Relaxed,
}

/// Register, vector and memory-model resources of the target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resources {
    pub general_purpose_regs: u32,
    pub vector_width_bits: u32,
    pub min_alignment: u32,
    pub memory_orderings: Vec<MemoryOrdering>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryLayout {
    pub preferred_alignment: u32,
    pub page_size: u32,
    pub cache_line_size: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationHints {
    /// Element count above which vectorization is worth it.
    pub vector_threshold: u32,
    pub unroll_factor: u32,
    pub use_fma: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetConfig {
    pub arch: Architecture,
    pub enabled_features: BTreeSet<String>,
    pub resources: Resources,
    pub memory: MemoryLayout,
    pub hints: OptimizationHints,
}

impl TargetConfig {
    /// True iff every required feature is enabled on this configuration.
    pub fn satisfies<'a, I: IntoIterator<Item = &'a str>>(&self, required: I) -> bool {
        required
            .into_iter()
            .all(|feature| self.enabled_features.contains(feature))
    }

    pub fn by_name(name: &str) -> Option<TargetConfig> {
        match name {
            "x86_64" | "x86-64" | "amd64" => Some(Self::x86_64()),
            _ => None,
        }
    }

    /// The default v1 target: x86-64 with the baseline SSE/SSE2 feature
    /// set, 16 general-purpose registers and a strong memory model.
    pub fn x86_64() -> TargetConfig {
        let features = vec![
            Feature {
                name: "sse".into(),
                description: "128-bit streaming SIMD extensions".into(),
            },
            Feature {
                name: "sse2".into(),
                description: "double-precision SIMD and 64-bit integer vectors".into(),
            },
            Feature {
                name: "avx".into(),
                description: "256-bit advanced vector extensions".into(),
            },
            Feature {
                name: "avx2".into(),
                description: "256-bit integer vector extensions".into(),
            },
            Feature {
                name: "fma".into(),
                description: "fused multiply-add".into(),
            },
        ];
        TargetConfig {
            arch: Architecture {
                name: "x86_64".into(),
                vendor: "generic".into(),
                features,
            },
            enabled_features: ["sse", "sse2"].iter().map(|s| s.to_string()).collect(),
            resources: Resources {
                general_purpose_regs: 16,
                vector_width_bits: 128,
                min_alignment: 1,
                memory_orderings: vec![
                    MemoryOrdering::Strong,
                    MemoryOrdering::AcquireRelease,
                    MemoryOrdering::Relaxed,
                ],
            },
            memory: MemoryLayout {
                preferred_alignment: 16,
                page_size: 4096,
                cache_line_size: 64,
            },
            hints: OptimizationHints {
                vector_threshold: 4,
                unroll_factor: 4,
                use_fma: false,
            },
        }
    }
}
