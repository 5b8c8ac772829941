// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use sapling::Env;
use sapling_shared::{Error, Handle, HandleKind, Result};
use serde::{Deserialize, Serialize};

use crate::{LiteralTable, Text, TreeRegistry};

/// Source of literal bytes for LITERAL handle expansion.
pub trait LiteralSource {
    fn literal_bytes(&self, id: u32) -> Result<&[u8]>;
}

/// Source of shared texts for TREE handle expansion.
pub trait TreeSource {
    fn tree(&self, id: u32) -> Result<Text>;
}

impl LiteralSource for LiteralTable {
    fn literal_bytes(&self, id: u32) -> Result<&[u8]> {
        self.get(id)
    }
}

impl TreeSource for TreeRegistry {
    fn tree(&self, id: u32) -> Result<Text> {
        self.get(id)
    }
}

/// Budgets guarding a resolution walk.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverLimits {
    /// Maximum nesting of TREE visits.
    pub max_tree_depth: u32,
    /// Total TREE expansions allowed per top-level call.
    pub max_tree_visits: u32,
}

impl Default for ResolverLimits {
    fn default() -> Self {
        ResolverLimits {
            max_tree_depth: 64,
            max_tree_visits: 4096,
        }
    }
}

/// Expands handles into code points, pushed one at a time into a caller
/// callback. The resolver reads tree contents through its environment.
/// Nested TREE expansion is guarded three ways: a depth budget, a
/// total-visit budget, and cycle detection by id membership on the visit
/// path. Any validation failure — unresolvable id, bytes that are not
/// UTF-8, a blown budget — aborts the whole resolution with `Invalid`.
pub struct Resolver<'a> {
    env: &'a Env,
    literals: Option<&'a dyn LiteralSource>,
    trees: Option<&'a dyn TreeSource>,
    limits: ResolverLimits,
}

struct Walk {
    visits: u32,
    path: Vec<u32>,
}

impl<'a> Resolver<'a> {
    pub fn new(env: &'a Env) -> Resolver<'a> {
        Resolver {
            env,
            literals: None,
            trees: None,
            limits: ResolverLimits::default(),
        }
    }

    pub fn with_literals(mut self, literals: &'a dyn LiteralSource) -> Resolver<'a> {
        self.literals = Some(literals);
        self
    }

    pub fn with_trees(mut self, trees: &'a dyn TreeSource) -> Resolver<'a> {
        self.trees = Some(trees);
        self
    }

    pub fn with_limits(mut self, limits: ResolverLimits) -> Resolver<'a> {
        self.limits = limits;
        self
    }

    /// Expand one handle, emitting every code point it denotes.
    pub fn expand(
        &self,
        handle: Handle,
        emit: &mut dyn FnMut(char) -> Result<()>,
    ) -> Result<()> {
        let mut walk = Walk {
            visits: 0,
            path: Vec::new(),
        };
        self.expand_inner(handle, emit, &mut walk)
    }

    /// Expand every element of a text under one shared budget.
    pub fn expand_text(
        &self,
        text: &Text,
        emit: &mut dyn FnMut(char) -> Result<()>,
    ) -> Result<()> {
        let mut walk = Walk {
            visits: 0,
            path: Vec::new(),
        };
        for handle in text.handles(self.env)? {
            self.expand_inner(handle, emit, &mut walk)?;
        }
        Ok(())
    }

    fn expand_inner(
        &self,
        handle: Handle,
        emit: &mut dyn FnMut(char) -> Result<()>,
        walk: &mut Walk,
    ) -> Result<()> {
        match handle.kind() {
            HandleKind::Codepoint => {
                let c = handle
                    .as_char()
                    .ok_or_else(|| Error::invalid("codepoint handle failed validation"))?;
                emit(c)
            }
            HandleKind::Literal => {
                let source = self
                    .literals
                    .ok_or_else(|| Error::invalid("no literal source configured"))?;
                let bytes = source
                    .literal_bytes(handle.payload())
                    .map_err(|_| Error::invalid("literal id failed to resolve"))?;
                // Literal bytes are re-validated on every expansion.
                let s = std::str::from_utf8(bytes)
                    .map_err(|_| Error::invalid("literal bytes are not valid UTF-8"))?;
                for c in s.chars() {
                    emit(c)?;
                }
                Ok(())
            }
            HandleKind::Tree => {
                let id = handle.payload();
                if walk.path.contains(&id) {
                    return Err(Error::invalid("tree handle cycle"));
                }
                if walk.path.len() as u32 >= self.limits.max_tree_depth {
                    return Err(Error::invalid("tree depth budget exceeded"));
                }
                walk.visits += 1;
                if walk.visits > self.limits.max_tree_visits {
                    return Err(Error::invalid("tree visit budget exceeded"));
                }
                let source = self
                    .trees
                    .ok_or_else(|| Error::invalid("no tree source configured"))?;
                let text = source
                    .tree(id)
                    .map_err(|_| Error::invalid("tree id failed to resolve"))?;
                let children = text.handles(self.env)?;
                walk.path.push(id);
                for child in children {
                    self.expand_inner(child, emit, walk)?;
                }
                walk.path.pop();
                Ok(())
            }
        }
    }
}
