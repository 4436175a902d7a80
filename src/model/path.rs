use std::fmt;
use std::str::FromStr;

use smallvec::SmallVec;

use crate::types::{GraphFsError, Result};

const INLINE_ELEMENTS: usize = 4;

/// One step of a [`Path`]: an edge kind, a name, and a positional index.
///
/// Elements order by `(kind, name, index)`, which is also the order staged
/// edges are emitted in.
#[derive(Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PathElement {
    /// Edge kind; empty for plain named children.
    pub kind: String,
    /// Element name.
    pub name: String,
    /// Position among same-named siblings.
    pub index: i64,
}

/// Key identifying one outgoing edge of a node.
///
/// An edge key doubles as the path element naming the edge's target.
pub type EdgeKey = PathElement;

impl PathElement {
    /// Builds an element from its parts.
    pub fn new(kind: impl Into<String>, name: impl Into<String>, index: i64) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
            index,
        }
    }

    /// Plain named element with no kind and index zero.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new("", name, 0)
    }

    fn parse(src: &str) -> Result<Self> {
        if src.is_empty() {
            return Err(GraphFsError::Invalid("empty path element"));
        }
        let (head, index) = match src.rsplit_once('#') {
            Some((head, idx)) => {
                let index = idx.parse::<i64>().map_err(|_| {
                    GraphFsError::InvalidOwned(format!("invalid element index in {src:?}"))
                })?;
                (head, index)
            }
            None => (src, 0),
        };
        let (kind, name) = match head.split_once(':') {
            Some((kind, name)) => (kind, name),
            None => ("", head),
        };
        Ok(Self::new(kind, name, index))
    }
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.kind.is_empty() {
            write!(f, "{}:", self.kind)?;
        }
        f.write_str(&self.name)?;
        if self.index != 0 {
            write!(f, "#{}", self.index)?;
        }
        Ok(())
    }
}

/// Address of a node: a namespace root (superblock UUID) plus elements.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Path {
    root: String,
    elements: SmallVec<[PathElement; INLINE_ELEMENTS]>,
}

impl Path {
    /// The root node of namespace `root`.
    pub fn root_of(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            elements: SmallVec::new(),
        }
    }

    /// Builds a path from a root and a sequence of elements.
    pub fn from_elements(
        root: impl Into<String>,
        elements: impl IntoIterator<Item = PathElement>,
    ) -> Self {
        Self {
            root: root.into(),
            elements: elements.into_iter().collect(),
        }
    }

    /// Namespace UUID this path is rooted at.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Elements below the root, outermost first.
    pub fn elements(&self) -> &[PathElement] {
        &self.elements
    }

    /// Number of elements below the root.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// True for the namespace root itself.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Last element, if any.
    pub fn name(&self) -> Option<&PathElement> {
        self.elements.last()
    }

    /// Path without its last element; the root is its own parent.
    pub fn parent(&self) -> Path {
        let mut parent = self.clone();
        parent.elements.pop();
        parent
    }

    /// Path extended by `element`.
    pub fn child(&self, element: PathElement) -> Path {
        let mut child = self.clone();
        child.elements.push(element);
        child
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}//", self.root)?;
        for (idx, element) in self.elements.iter().enumerate() {
            if idx > 0 {
                f.write_str("/")?;
            }
            write!(f, "{element}")?;
        }
        Ok(())
    }
}

impl FromStr for Path {
    type Err = GraphFsError;

    fn from_str(s: &str) -> Result<Self> {
        let (root, rest) = s
            .split_once("//")
            .ok_or(GraphFsError::Invalid("path must contain a root separator"))?;
        if root.is_empty() {
            return Err(GraphFsError::Invalid("path root must be non-empty"));
        }
        let elements = rest
            .split('/')
            .filter(|part| !part.is_empty())
            .map(PathElement::parse)
            .collect::<Result<SmallVec<[PathElement; INLINE_ELEMENTS]>>>()?;
        Ok(Self {
            root: root.to_string(),
            elements,
        })
    }
}
