//! Hierarchical variable naming and flat layouts.
//!
//! A [`LabeledAxis`] maps slash-separated [`VariableName`]s to contiguous
//! ranges of a flat storage vector. Axes are assembled with an
//! [`AxisBuilder`] and frozen by [`AxisBuilder::build`]; the frozen layout
//! depends only on the structure of the axis, never on insertion order.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Range;

use crate::error::{Error, Result};
use crate::shape::{numel, TensorShape};

/// Slash-separated hierarchical name, e.g. `state/internal/ep`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VariableName(String);

impl VariableName {
    pub fn new(name: impl Into<String>) -> Self {
        let raw: String = name.into();
        let joined = raw
            .split('/')
            .filter(|p| !p.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        VariableName(joined)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Path components.
    pub fn parts(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|p| !p.is_empty())
    }

    /// Number of path components.
    pub fn depth(&self) -> usize {
        self.parts().count()
    }

    /// First path component.
    pub fn first(&self) -> &str {
        self.parts().next().unwrap_or("")
    }

    /// Last path component.
    pub fn last(&self) -> &str {
        self.parts().last().unwrap_or("")
    }

    /// Join `self` and `other` with a slash.
    pub fn join(&self, other: impl AsRef<str>) -> Self {
        if self.is_empty() {
            return VariableName::new(other.as_ref());
        }
        VariableName::new(format!("{}/{}", self.0, other.as_ref()))
    }

    /// Whether `prefix` is a leading component path of `self`.
    pub fn starts_with(&self, prefix: &VariableName) -> bool {
        let mut mine = self.parts();
        prefix.parts().all(|p| mine.next() == Some(p))
    }

    /// Remove a leading component path, if present.
    pub fn strip_prefix(&self, prefix: &VariableName) -> Option<Self> {
        if !self.starts_with(prefix) {
            return None;
        }
        let rest: Vec<_> = self.parts().skip(prefix.depth()).collect();
        Some(VariableName::new(rest.join("/")))
    }

    /// Drop the first component.
    pub fn remove_first(&self) -> Self {
        VariableName::new(self.parts().skip(1).collect::<Vec<_>>().join("/"))
    }
}

impl fmt::Display for VariableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VariableName {
    fn from(s: &str) -> Self {
        VariableName::new(s)
    }
}

impl From<String> for VariableName {
    fn from(s: String) -> Self {
        VariableName::new(s)
    }
}

impl AsRef<str> for VariableName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Placement of one leaf variable within a frozen axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableLayout {
    name: VariableName,
    intmd_sizes: TensorShape,
    base_sizes: TensorShape,
    offset: usize,
}

impl VariableLayout {
    /// Fully qualified name.
    pub fn name(&self) -> &VariableName {
        &self.name
    }

    pub fn intmd_sizes(&self) -> &[usize] {
        &self.intmd_sizes
    }

    pub fn base_sizes(&self) -> &[usize] {
        &self.base_sizes
    }

    /// Number of scalars this variable occupies: `numel(intmd) * numel(base)`.
    pub fn storage_size(&self) -> usize {
        numel(&self.intmd_sizes) * numel(&self.base_sizes)
    }

    /// Range within the owning axis' flat storage.
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.storage_size()
    }
}

/// Mutable description of an axis; see [`LabeledAxis`].
#[derive(Debug, Clone, Default)]
pub struct AxisBuilder {
    variables: BTreeMap<String, (TensorShape, TensorShape)>,
    subaxes: BTreeMap<String, AxisBuilder>,
}

impl AxisBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a leaf variable. Names containing slashes create nested sub-axes.
    pub fn add_variable(
        &mut self,
        name: impl Into<VariableName>,
        intmd_sizes: &[usize],
        base_sizes: &[usize],
    ) -> Result<&mut Self> {
        let name: VariableName = name.into();
        if name.is_empty() {
            return Err(Error::InvalidShape("variable name must not be empty".into()));
        }
        if name.depth() > 1 {
            self.add_subaxis(name.first())?.add_variable(
                name.remove_first(),
                intmd_sizes,
                base_sizes,
            )?;
            return Ok(self);
        }
        let leaf = name.as_str().to_owned();
        if self.variables.contains_key(&leaf) || self.subaxes.contains_key(&leaf) {
            return Err(Error::DuplicateItem(leaf));
        }
        self.variables
            .insert(leaf, (intmd_sizes.to_vec(), base_sizes.to_vec()));
        Ok(self)
    }

    /// Get or create a nested sub-axis.
    pub fn add_subaxis(&mut self, name: impl Into<VariableName>) -> Result<&mut AxisBuilder> {
        let name: VariableName = name.into();
        let mut current = self;
        for part in name.parts() {
            if current.variables.contains_key(part) {
                return Err(Error::DuplicateItem(part.to_owned()));
            }
            current = current.subaxes.entry(part.to_owned()).or_default();
        }
        Ok(current)
    }

    /// Freeze the layout.
    pub fn build(&self) -> LabeledAxis {
        self.build_prefixed(&VariableName::default(), 0)
    }

    fn build_prefixed(&self, prefix: &VariableName, start: usize) -> LabeledAxis {
        let mut variables = Vec::new();
        let mut offset = start;
        for (leaf, (intmd, base)) in &self.variables {
            let layout = VariableLayout {
                name: prefix.join(leaf),
                intmd_sizes: intmd.clone(),
                base_sizes: base.clone(),
                offset: offset - start,
            };
            offset += layout.storage_size();
            variables.push(layout);
        }
        let mut subaxes = BTreeMap::new();
        for (leaf, builder) in &self.subaxes {
            let sub = builder.build_prefixed(&prefix.join(leaf), offset);
            for v in &sub.variables {
                let mut v = v.clone();
                v.offset += offset - start;
                variables.push(v);
            }
            let range = offset - start..offset - start + sub.size;
            offset += sub.size;
            subaxes.insert(leaf.clone(), (range, sub));
        }
        LabeledAxis {
            prefix: prefix.clone(),
            variables,
            subaxes,
            size: offset - start,
        }
    }
}

/// Frozen hierarchical layout of named variables.
#[derive(Debug, Clone)]
pub struct LabeledAxis {
    prefix: VariableName,
    /// All leaf variables (including those of sub-axes) in layout order.
    variables: Vec<VariableLayout>,
    subaxes: BTreeMap<String, (Range<usize>, LabeledAxis)>,
    size: usize,
}

impl PartialEq for LabeledAxis {
    fn eq(&self, other: &Self) -> bool {
        self.variables == other.variables && self.size == other.size
    }
}

impl LabeledAxis {
    /// Total storage size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Prefix carried by a sub-axis (empty for a root axis).
    pub fn prefix(&self) -> &VariableName {
        &self.prefix
    }

    /// Qualify a name relative to this axis.
    pub fn qualify(&self, name: impl AsRef<str>) -> VariableName {
        self.prefix.join(name)
    }

    /// Number of leaf variables.
    pub fn nvariable(&self) -> usize {
        self.variables.len()
    }

    /// Leaf variables in layout order.
    pub fn variables(&self) -> impl Iterator<Item = &VariableLayout> {
        self.variables.iter()
    }

    /// Fully qualified leaf names in layout order.
    pub fn variable_names(&self) -> Vec<VariableName> {
        self.variables.iter().map(|v| v.name.clone()).collect()
    }

    pub fn has_variable(&self, name: &VariableName) -> bool {
        self.variables.iter().any(|v| &v.name == name)
    }

    pub fn variable(&self, name: &VariableName) -> Result<&VariableLayout> {
        self.variables
            .iter()
            .find(|v| &v.name == name)
            .ok_or_else(|| Error::UnknownVariable(name.to_string()))
    }

    /// Storage sizes of all leaf variables in layout order.
    pub fn storage_sizes(&self) -> Vec<usize> {
        self.variables.iter().map(VariableLayout::storage_size).collect()
    }

    /// Names of direct sub-axes, sorted.
    pub fn subaxis_names(&self) -> impl Iterator<Item = &str> {
        self.subaxes.keys().map(String::as_str)
    }

    pub fn has_subaxis(&self, name: impl AsRef<str>) -> bool {
        self.subaxis(name).is_ok()
    }

    /// Nested sub-axis by (possibly multi-component) relative name.
    pub fn subaxis(&self, name: impl AsRef<str>) -> Result<&LabeledAxis> {
        let name = VariableName::new(name.as_ref());
        let mut current = self;
        for part in name.parts() {
            current = &current
                .subaxes
                .get(part)
                .ok_or_else(|| Error::UnknownVariable(self.qualify(name.as_str()).to_string()))?
                .1;
        }
        Ok(current)
    }

    /// Storage range of a direct sub-axis.
    pub fn subaxis_range(&self, name: &str) -> Result<Range<usize>> {
        self.subaxes
            .get(name)
            .map(|(r, _)| r.clone())
            .ok_or_else(|| Error::UnknownVariable(self.qualify(name).to_string()))
    }
}
