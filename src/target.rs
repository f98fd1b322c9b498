use std::collections::BTreeSet;
use std::collections::btree_set;
use std::fmt::{Display, Formatter};

/// One registrable endpoint of a target group.
///
/// `id` is whatever the load balancer accepts as a target identifier, an
/// instance id or an IP address.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target {
    pub id: String,
    pub port: u16,
}

impl Target {
    pub fn new(id: impl Into<String>, port: u16) -> Self {
        Target {
            id: id.into(),
            port,
        }
    }
}

impl Display for Target {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.id, self.port)
    }
}

/// A set of targets, duplicated `(id, port)` pairs collapse.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetSet {
    inner: BTreeSet<Target>,
}

impl TargetSet {
    pub fn new() -> Self {
        TargetSet::default()
    }

    pub fn add(&mut self, id: impl Into<String>, port: u16) {
        self.inner.insert(Target::new(id, port));
    }

    /// Returns whether the target was not present yet.
    pub fn insert(&mut self, target: Target) -> bool {
        self.inner.insert(target)
    }

    pub fn has(&self, id: &str, port: u16) -> bool {
        self.inner.contains(&Target::new(id, port))
    }

    pub fn contains(&self, target: &Target) -> bool {
        self.inner.contains(target)
    }

    /// Every target present in either set.
    pub fn union(&self, other: &TargetSet) -> TargetSet {
        TargetSet {
            inner: self.inner.union(&other.inner).cloned().collect(),
        }
    }

    /// Targets of `self` absent from `other`.
    pub fn subtract(&self, other: &TargetSet) -> TargetSet {
        TargetSet {
            inner: self.inner.difference(&other.inner).cloned().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> btree_set::Iter<'_, Target> {
        self.inner.iter()
    }
}

impl FromIterator<Target> for TargetSet {
    fn from_iter<T: IntoIterator<Item = Target>>(iter: T) -> Self {
        TargetSet {
            inner: iter.into_iter().collect(),
        }
    }
}

impl Extend<Target> for TargetSet {
    fn extend<T: IntoIterator<Item = Target>>(&mut self, iter: T) {
        self.inner.extend(iter)
    }
}

impl IntoIterator for TargetSet {
    type Item = Target;
    type IntoIter = btree_set::IntoIter<Target>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.into_iter()
    }
}

impl<'a> IntoIterator for &'a TargetSet {
    type Item = &'a Target;
    type IntoIter = btree_set::Iter<'a, Target>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

impl Display for TargetSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str("{")?;
        for (index, target) in self.inner.iter().enumerate() {
            if index != 0 {
                f.write_str(", ")?;
            }
            Display::fmt(target, f)?;
        }
        f.write_str("}")
    }
}
