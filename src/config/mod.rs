use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::tiling::{Dim, NUM_DIMS};

/// Tensor operand of the tiled workload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    /// Indexed by H, M, K.
    Input,
    /// Indexed by H, K, N.
    Weight,
    /// Indexed by H, M, N.
    Output,
}

impl Operand {
    pub const ALL: [Operand; 3] = [Operand::Input, Operand::Weight, Operand::Output];

    /// Whether this operand's tile volume grows with `dim`.
    pub fn contains(self, dim: Dim) -> bool {
        match (self, dim) {
            (_, Dim::H) => true,
            (Operand::Input, Dim::M) | (Operand::Input, Dim::K) => true,
            (Operand::Weight, Dim::K) | (Operand::Weight, Dim::N) => true,
            (Operand::Output, Dim::M) | (Operand::Output, Dim::N) => true,
            _ => false,
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "input" => Some(Operand::Input),
            "weight" => Some(Operand::Weight),
            "output" => Some(Operand::Output),
            _ => None,
        }
    }
}

/// Which operands occupy a level's physical buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Residency {
    pub input: bool,
    pub weight: bool,
    pub output: bool,
}

impl Residency {
    pub const ALL: Residency = Residency {
        input: true,
        weight: true,
        output: true,
    };

    /// Only the listed operands are resident.
    pub fn only(operands: &[Operand]) -> Self {
        let mut r = Residency {
            input: false,
            weight: false,
            output: false,
        };
        for &op in operands {
            *r.slot(op) = true;
        }
        r
    }

    /// All operands except `op`.
    pub fn without(op: Operand) -> Self {
        let mut r = Self::ALL;
        *r.slot(op) = false;
        r
    }

    pub fn holds(&self, op: Operand) -> bool {
        match op {
            Operand::Input => self.input,
            Operand::Weight => self.weight,
            Operand::Output => self.output,
        }
    }

    fn slot(&mut self, op: Operand) -> &mut bool {
        match op {
            Operand::Input => &mut self.input,
            Operand::Weight => &mut self.weight,
            Operand::Output => &mut self.output,
        }
    }
}

/// Role of a memory level in the hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LevelKind {
    /// Innermost register-file-like storage; the output operand is not kept here.
    RegisterFile,
    /// On-chip shared memory; the input operand is not kept here.
    SharedMemory,
    /// Everything else holds all three operands.
    Generic,
}

impl LevelKind {
    pub fn default_residency(self) -> Residency {
        match self {
            LevelKind::RegisterFile => Residency::without(Operand::Output),
            LevelKind::SharedMemory => Residency::without(Operand::Input),
            LevelKind::Generic => Residency::ALL,
        }
    }

    fn parse(name: &str) -> Option<Self> {
        match name {
            "register_file" => Some(LevelKind::RegisterFile),
            "shared_memory" => Some(LevelKind::SharedMemory),
            "generic" => Some(LevelKind::Generic),
            _ => None,
        }
    }
}

/// Static configuration of one memory level.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LevelConfig {
    /// Short identifier (e.g. "rf", "smem").
    pub name: String,
    pub kind: LevelKind,
    /// Physical capacity in data elements.
    pub buffer_size: f64,
    /// Parallel lanes available to spatially mapped dimensions.
    pub spmap_capacity: f64,
    /// Operands held in this buffer. Defaults from `kind`.
    pub residency: Residency,
}

impl LevelConfig {
    pub fn new(name: &str, kind: LevelKind, buffer_size: f64, spmap_capacity: f64) -> Self {
        Self {
            name: name.to_string(),
            kind,
            buffer_size,
            spmap_capacity,
            residency: kind.default_residency(),
        }
    }

    pub fn with_residency(mut self, residency: Residency) -> Self {
        self.residency = residency;
        self
    }
}

/// Accelerator description consumed by the sampler.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ArchConfig {
    /// Short identifier (e.g. "tensor_core").
    pub name: String,
    /// Prime basis for tile sizes. The first prime must be 2.
    pub primes: Vec<u32>,
    /// Categories per exponent decision (exponents `0..categories`).
    pub categories: usize,
    /// Sub-steps that make up one level's decision.
    pub steps_per_level: usize,
    /// Memory levels, innermost first. The last level is terminal.
    pub levels: Vec<LevelConfig>,
}

impl ArchConfig {
    /// Built-in tensor-core hierarchy: LRF, RF, SMEM, DRAM.
    ///
    /// LRF keeps only the input operand, RF only the output, SMEM input
    /// and weight. DRAM is terminal and unbounded.
    pub fn tensor_core() -> Self {
        Self {
            name: "tensor_core".to_string(),
            primes: vec![2, 3, 5, 7],
            categories: 12,
            steps_per_level: NUM_DIMS,
            levels: vec![
                LevelConfig::new("lrf", LevelKind::RegisterFile, 64.0, 1.0)
                    .with_residency(Residency::only(&[Operand::Input])),
                LevelConfig::new("rf", LevelKind::RegisterFile, 1024.0, 32.0)
                    .with_residency(Residency::only(&[Operand::Output])),
                LevelConfig::new("smem", LevelKind::SharedMemory, 49152.0, 8.0)
                    .with_residency(Residency::only(&[Operand::Input, Operand::Weight])),
                LevelConfig::new("dram", LevelKind::Generic, f64::INFINITY, 1.0),
            ],
        }
    }

    /// Resolve a built-in preset by name.
    pub fn resolve(name: &str) -> Result<Self, ConfigError> {
        match name {
            "tensor_core" => Ok(Self::tensor_core()),
            other => Err(ConfigError::UnknownArch(other.to_string())),
        }
    }

    /// Load and validate an architecture from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse_toml(&content)
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn num_primes(&self) -> usize {
        self.primes.len()
    }

    /// Index of the terminal (outermost) level.
    pub fn terminal_level(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.levels.is_empty() {
            return invalid("at least one level is required".to_string());
        }
        if self.steps_per_level != NUM_DIMS {
            return invalid(format!(
                "steps_per_level must be {} (one per dimension), got {}",
                NUM_DIMS, self.steps_per_level
            ));
        }
        if self.categories == 0 {
            return invalid("categories must be > 0".to_string());
        }
        match self.primes.first() {
            Some(2) => {}
            Some(p) => return invalid(format!("first prime must be 2, got {}", p)),
            None => return invalid("primes must not be empty".to_string()),
        }
        if self.primes.windows(2).any(|w| w[0] >= w[1]) {
            return invalid("primes must be strictly increasing".to_string());
        }
        for level in &self.levels {
            if level.buffer_size.is_nan() || level.buffer_size <= 0.0 {
                return invalid(format!("level '{}': buffer_size must be > 0", level.name));
            }
            if level.spmap_capacity.is_nan() || level.spmap_capacity < 1.0 {
                return invalid(format!("level '{}': spmap_capacity must be >= 1", level.name));
            }
        }
        Ok(())
    }

    /// Parse the `[arch]` / `[level.NAME]` TOML layout.
    ///
    /// Levels appear innermost first, in file order. A level without an
    /// explicit `residency` list takes the default for its `kind`.
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let mut name = String::new();
        let mut primes: Vec<u32> = Vec::new();
        let mut categories: usize = 0;
        let mut steps_per_level: usize = NUM_DIMS;
        let mut levels: Vec<PartialLevel> = Vec::new();

        let mut section = String::new();

        for (idx, line) in content.lines().enumerate() {
            let line_no = idx + 1;
            let err = |message: String| ConfigError::Parse {
                line: line_no,
                message,
            };
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                section = trimmed[1..trimmed.len() - 1].trim().to_string();
                if let Some(level_name) = section.strip_prefix("level.") {
                    if levels.iter().any(|l| l.name == level_name) {
                        return Err(err(format!("duplicate level '{}'", level_name)));
                    }
                    levels.push(PartialLevel::named(level_name));
                }
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(err(format!("expected 'key = value', got '{}'", trimmed)));
            };
            let key = key.trim();
            let value = value.trim();
            let unquoted = value.trim_matches('"');

            if section == "arch" {
                match key {
                    "name" => name = unquoted.to_string(),
                    "primes" => {
                        primes = parse_array(value)
                            .iter()
                            .map(|p| parse_number(p))
                            .collect::<Option<Vec<u32>>>()
                            .ok_or_else(|| err(format!("invalid arch.primes: {}", value)))?;
                    }
                    "categories" => {
                        categories = parse_number(value)
                            .ok_or_else(|| err(format!("invalid arch.categories: {}", value)))?;
                    }
                    "steps_per_level" => {
                        steps_per_level = parse_number(value).ok_or_else(|| {
                            err(format!("invalid arch.steps_per_level: {}", value))
                        })?;
                    }
                    _ => {}
                }
            } else if section.starts_with("level.") {
                let level = levels.last_mut().expect("pushed on section header");
                match key {
                    "kind" => {
                        level.kind = Some(
                            LevelKind::parse(unquoted)
                                .ok_or_else(|| err(format!("unknown level kind '{}'", unquoted)))?,
                        );
                    }
                    "buffer_size" => {
                        level.buffer_size = Some(parse_number(value).ok_or_else(|| {
                            err(format!("invalid level.{}.buffer_size: {}", level.name, value))
                        })?);
                    }
                    "spmap_capacity" => {
                        level.spmap_capacity = Some(parse_number(value).ok_or_else(|| {
                            err(format!(
                                "invalid level.{}.spmap_capacity: {}",
                                level.name, value
                            ))
                        })?);
                    }
                    "residency" => {
                        let mut operands = Vec::new();
                        for item in parse_array(value) {
                            operands.push(
                                Operand::parse(&item)
                                    .ok_or_else(|| err(format!("unknown operand '{}'", item)))?,
                            );
                        }
                        level.residency = Some(Residency::only(&operands));
                    }
                    _ => {}
                }
            }
        }

        if name.is_empty() {
            return Err(ConfigError::Invalid("missing arch.name".to_string()));
        }

        let levels = levels
            .into_iter()
            .map(PartialLevel::finish)
            .collect::<Result<Vec<_>, _>>()?;

        let config = Self {
            name,
            primes,
            categories,
            steps_per_level,
            levels,
        };
        config.validate()?;
        Ok(config)
    }
}

/// A `[level.NAME]` section while it is still being filled in.
struct PartialLevel {
    name: String,
    kind: Option<LevelKind>,
    buffer_size: Option<f64>,
    spmap_capacity: Option<f64>,
    residency: Option<Residency>,
}

impl PartialLevel {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: None,
            buffer_size: None,
            spmap_capacity: None,
            residency: None,
        }
    }

    fn finish(self) -> Result<LevelConfig, ConfigError> {
        let kind = self.kind.unwrap_or(LevelKind::Generic);
        let buffer_size = self.buffer_size.ok_or_else(|| {
            ConfigError::Invalid(format!("level '{}': missing buffer_size", self.name))
        })?;
        let level = LevelConfig::new(
            &self.name,
            kind,
            buffer_size,
            self.spmap_capacity.unwrap_or(1.0),
        );
        Ok(match self.residency {
            Some(r) => level.with_residency(r),
            None => level,
        })
    }
}

/// Split a `[a, "b", c]` array into unquoted items.
fn parse_array(value: &str) -> Vec<String> {
    let inner = value.trim().trim_start_matches('[').trim_end_matches(']');
    inner
        .split(',')
        .map(|s| s.trim().trim_matches('"').to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse a number, accepting TOML digit separators.
fn parse_number<T: std::str::FromStr>(value: &str) -> Option<T> {
    value.trim().replace('_', "").parse().ok()
}
