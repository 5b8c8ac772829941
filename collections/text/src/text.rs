// Copyright 2021-2023 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::sync::Arc;

use sapling::{Env, Txn};
use sapling_seq::Seq;
use sapling_shared::{Error, Handle, HandleKind, Result};

use crate::resolve::Resolver;
use crate::LiteralTable;

/// The shared payload behind a [`Text`]: the handle sequence. The Arc's
/// strong count is the COW refcount.
pub(crate) struct TextShared {
    pub(crate) seq: Seq,
}

/// A copy-on-write sequence of tagged handles with code-point semantics.
///
/// `Clone` is O(1) (a refcount bump); every mutator detaches first, deep
/// copying the sequence if it is shared. Indexing is by *element*: a
/// LITERAL or TREE handle counts as one position regardless of what it
/// expands to. The sequence's nodes live in the environment's arena, so
/// content reads take the env; the cached length does not.
///
/// Dropping a `Text` without [`Text::free`] strands its nodes until the
/// environment is destroyed.
pub struct Text {
    shared: Arc<TextShared>,
}

impl Clone for Text {
    fn clone(&self) -> Text {
        Text {
            shared: self.shared.clone(),
        }
    }
}

impl std::fmt::Debug for Text {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Text")
            .field("len", &self.shared.seq.len())
            .finish()
    }
}

impl Text {
    pub fn new(env: &Env) -> Result<Text> {
        Ok(Text {
            shared: Arc::new(TextShared {
                seq: Seq::new(env)?,
            }),
        })
    }

    fn from_seq(seq: Seq) -> Text {
        Text {
            shared: Arc::new(TextShared { seq }),
        }
    }

    /// Drop this handle; the last holder releases the sequence's nodes
    /// back to the arena.
    pub fn free(self, env: &Env) -> Result<()> {
        match Arc::try_unwrap(self.shared) {
            Ok(shared) => shared.seq.free(env),
            Err(_) => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.shared.seq.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.seq.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.shared.seq.is_valid()
    }

    /// How many handles share this content (the COW refcount).
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }

    /// Make this handle the sole owner of its sequence, deep copying if it
    /// is shared. Every write path runs through here.
    fn detach(&mut self, txn: &mut Txn<'_>) -> Result<()> {
        txn.require_writable()?;
        if Arc::get_mut(&mut self.shared).is_none() {
            log::trace!("text detach: copying {} shared elements", self.len());
            let copy = self.shared.seq.try_clone(txn)?;
            self.shared = Arc::new(TextShared { seq: copy });
        }
        Ok(())
    }

    fn seq_mut(&mut self) -> &mut Seq {
        &mut Arc::get_mut(&mut self.shared)
            .expect("detached before mutation")
            .seq
    }

    /// Swap freshly built content in, releasing the old sequence if this
    /// handle was its only owner.
    fn swap_content(&mut self, env: &Env, seq: Seq) -> Result<()> {
        let old = std::mem::replace(&mut self.shared, Arc::new(TextShared { seq }));
        if let Ok(shared) = Arc::try_unwrap(old) {
            shared.seq.free(env)?;
        }
        Ok(())
    }

    pub fn get_handle(&self, env: &Env, i: usize) -> Result<Handle> {
        let raw = self.shared.seq.get(env, i)?;
        Handle::from_raw(raw)
    }

    /// The code point at element `i`; `Invalid` for LITERAL/TREE elements.
    pub fn get(&self, env: &Env, i: usize) -> Result<char> {
        self.get_handle(env, i)?
            .as_char()
            .ok_or_else(|| Error::invalid("element is not a code point"))
    }

    /// The stored handles, left to right.
    pub fn handles(&self, env: &Env) -> Result<Vec<Handle>> {
        self.shared
            .seq
            .to_vec(env)?
            .into_iter()
            .map(Handle::from_raw)
            .collect()
    }

    pub fn push_front(&mut self, txn: &mut Txn<'_>, c: char) -> Result<()> {
        self.push_front_handle(txn, Handle::codepoint(c))
    }

    pub fn push_back(&mut self, txn: &mut Txn<'_>, c: char) -> Result<()> {
        self.push_back_handle(txn, Handle::codepoint(c))
    }

    pub fn push_front_handle(&mut self, txn: &mut Txn<'_>, handle: Handle) -> Result<()> {
        self.detach(txn)?;
        self.seq_mut().push_front(txn, handle.raw())
    }

    pub fn push_back_handle(&mut self, txn: &mut Txn<'_>, handle: Handle) -> Result<()> {
        self.detach(txn)?;
        self.seq_mut().push_back(txn, handle.raw())
    }

    pub fn pop_front_handle(&mut self, txn: &mut Txn<'_>) -> Result<Handle> {
        self.detach(txn)?;
        let raw = self.seq_mut().pop_front(txn)?;
        Handle::from_raw(raw)
    }

    pub fn pop_back_handle(&mut self, txn: &mut Txn<'_>) -> Result<Handle> {
        self.detach(txn)?;
        let raw = self.seq_mut().pop_back(txn)?;
        Handle::from_raw(raw)
    }

    /// Pop the first element as a code point. Fails `Invalid` — without
    /// removing anything — if the element is a LITERAL or TREE handle.
    pub fn pop_front(&mut self, txn: &mut Txn<'_>) -> Result<char> {
        if self.is_empty() {
            return Err(Error::Empty("text"));
        }
        let c = self.get(txn.env(), 0)?;
        self.detach(txn)?;
        self.seq_mut().pop_front(txn)?;
        Ok(c)
    }

    pub fn pop_back(&mut self, txn: &mut Txn<'_>) -> Result<char> {
        let n = self.len();
        if n == 0 {
            return Err(Error::Empty("text"));
        }
        let c = self.get(txn.env(), n - 1)?;
        self.detach(txn)?;
        self.seq_mut().pop_back(txn)?;
        Ok(c)
    }

    /// Replace `remove` elements at `i` with `insert`, by split + edit +
    /// concat on the underlying sequence.
    fn splice(
        &mut self,
        txn: &mut Txn<'_>,
        i: usize,
        remove: usize,
        insert: &[Handle],
    ) -> Result<()> {
        self.detach(txn)?;
        let seq = self.seq_mut();
        let (mut left, mut right) = seq.split_at(txn, i)?;
        for _ in 0..remove {
            right.pop_front(txn)?;
        }
        for handle in insert {
            left.push_back(txn, handle.raw())?;
        }
        left.concat(txn, &mut right)?;
        let emptied = std::mem::replace(seq, left);
        emptied.free(txn.env())?;
        right.free(txn.env())?;
        Ok(())
    }

    pub fn set_handle(&mut self, txn: &mut Txn<'_>, i: usize, handle: Handle) -> Result<()> {
        if i >= self.len() {
            return Err(Error::range("text", i as u64, self.len() as u64));
        }
        self.splice(txn, i, 1, &[handle])
    }

    pub fn set(&mut self, txn: &mut Txn<'_>, i: usize, c: char) -> Result<()> {
        self.set_handle(txn, i, Handle::codepoint(c))
    }

    pub fn insert_handle(&mut self, txn: &mut Txn<'_>, i: usize, handle: Handle) -> Result<()> {
        if i > self.len() {
            return Err(Error::range("text", i as u64, self.len() as u64));
        }
        self.splice(txn, i, 0, &[handle])
    }

    pub fn insert(&mut self, txn: &mut Txn<'_>, i: usize, c: char) -> Result<()> {
        self.insert_handle(txn, i, Handle::codepoint(c))
    }

    pub fn delete(&mut self, txn: &mut Txn<'_>, i: usize) -> Result<()> {
        if i >= self.len() {
            return Err(Error::range("text", i as u64, self.len() as u64));
        }
        self.splice(txn, i, 1, &[])
    }

    /// dest ++= src, leaving `src` empty.
    pub fn concat(&mut self, txn: &mut Txn<'_>, src: &mut Text) -> Result<()> {
        self.detach(txn)?;
        src.detach(txn)?;
        let dst = Arc::get_mut(&mut self.shared).expect("detached before mutation");
        let other = Arc::get_mut(&mut src.shared).expect("detached before mutation");
        dst.seq.concat(txn, &mut other.seq)
    }

    /// Split into two fresh texts, leaving this one empty.
    pub fn split_at(&mut self, txn: &mut Txn<'_>, i: usize) -> Result<(Text, Text)> {
        self.detach(txn)?;
        let (left, right) = self.seq_mut().split_at(txn, i)?;
        Ok((Text::from_seq(left), Text::from_seq(right)))
    }

    /// Encode assuming pure code-point content; any LITERAL or TREE
    /// element fails with `Type`.
    pub fn to_utf8(&self, env: &Env) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for handle in self.handles(env)? {
            match handle.as_char() {
                Some(c) => {
                    let mut buf = [0u8; 4];
                    out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
                }
                None => return Err(Error::Type("text contains unresolved handles")),
            }
        }
        Ok(out)
    }

    /// Validate strictly and replace this text's content with one handle
    /// per code point. The fresh content is swapped in only on success;
    /// other holders of the old content are unaffected.
    pub fn from_utf8(&mut self, txn: &mut Txn<'_>, bytes: &[u8]) -> Result<()> {
        txn.require_writable()?;
        let s = std::str::from_utf8(bytes)
            .map_err(|e| Error::parse(format!("invalid UTF-8 at byte {}", e.valid_up_to())))?;
        let mut seq = Seq::new(txn.env())?;
        for c in s.chars() {
            if let Err(e) = seq.push_back(txn, Handle::codepoint(c).raw()) {
                let _ = seq.free(txn.env());
                return Err(e);
            }
        }
        self.swap_content(txn.env(), seq)
    }

    /// Bulk load: validate, intern the whole byte string in the literal
    /// table, and store a single LITERAL handle.
    pub fn from_utf8_bulk(
        &mut self,
        txn: &mut Txn<'_>,
        bytes: &[u8],
        table: &mut LiteralTable,
    ) -> Result<()> {
        txn.require_writable()?;
        std::str::from_utf8(bytes)
            .map_err(|e| Error::parse(format!("invalid UTF-8 at byte {}", e.valid_up_to())))?;
        let id = table.add(bytes)?;
        let mut seq = Seq::new(txn.env())?;
        if let Err(e) = seq.push_back(txn, Handle::literal(id)?.raw()) {
            let _ = seq.free(txn.env());
            return Err(e);
        }
        self.swap_content(txn.env(), seq)
    }

    /// Replace the LITERAL at element `i` with the code points it resolves
    /// to. Elements of other kinds are left alone.
    pub fn expand_handle_at(
        &mut self,
        txn: &mut Txn<'_>,
        i: usize,
        resolver: &Resolver<'_>,
    ) -> Result<()> {
        let handle = self.get_handle(txn.env(), i)?;
        if handle.kind() != HandleKind::Literal {
            return Ok(());
        }
        let mut expanded = Vec::new();
        resolver.expand(handle, &mut |c| {
            expanded.push(Handle::codepoint(c));
            Ok(())
        })?;
        self.splice(txn, i, 1, &expanded)
    }

    /// Code-point count with LITERAL/TREE elements expanded.
    pub fn codepoint_len_resolved(&self, resolver: &Resolver<'_>) -> Result<usize> {
        let mut n = 0usize;
        resolver.expand_text(self, &mut |_| {
            n += 1;
            Ok(())
        })?;
        Ok(n)
    }

    /// Encoded byte length with LITERAL/TREE elements expanded.
    pub fn utf8_len_resolved(&self, resolver: &Resolver<'_>) -> Result<usize> {
        let mut n = 0usize;
        resolver.expand_text(self, &mut |c| {
            n += c.len_utf8();
            Ok(())
        })?;
        Ok(n)
    }

    /// The `i`-th code point of the fully resolved stream.
    pub fn get_codepoint_resolved(&self, i: usize, resolver: &Resolver<'_>) -> Result<char> {
        let mut seen = 0usize;
        let mut found = None;
        resolver.expand_text(self, &mut |c| {
            if seen == i && found.is_none() {
                found = Some(c);
            }
            seen += 1;
            Ok(())
        })?;
        found.ok_or_else(|| Error::range("resolved text", i as u64, seen as u64))
    }

    /// Full UTF-8 encoding with LITERAL/TREE elements expanded.
    pub fn to_utf8_resolved(&self, resolver: &Resolver<'_>) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        resolver.expand_text(self, &mut |c| {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            Ok(())
        })?;
        Ok(out)
    }
}
