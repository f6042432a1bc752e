// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{self, Display, Formatter};
use std::rc::Rc;

/// An SSA value or basic-block name: either named (`%foo`) or numbered (`%3`).
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Name {
    Named(Rc<str>),
    Numbered(u32),
}

impl Name {
    #[must_use]
    pub fn named(s: &str) -> Self {
        Name::Named(s.into())
    }
}

impl From<u32> for Name {
    fn from(n: u32) -> Self {
        Name::Numbered(n)
    }
}

impl Display for Name {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Name::Named(s) => write!(f, "%{s}"),
            Name::Numbered(n) => write!(f, "%{n}"),
        }
    }
}
