//! Root enumeration
//!
//! Roots come from three places:
//!
//! 1. the attached engine: global object, pending exception and the
//!    synthesized accessor pairs
//! 2. the execution-context chain, innermost first
//! 3. the interpreter's registered frames, plus (with the
//!    `conservative-stack` feature and [`StackScanMode::Conservative`]) every
//!    word of the native stack that passes [`MemoryManager::conservative_candidate`]
//!
//! [`StackScanMode::Conservative`]: crate::StackScanMode

use crate::chunk::find_chunk;
use crate::manager::MemoryManager;
use crate::object::ObjectRef;
use crate::value::Value;

#[inline]
fn push_value(roots: &mut Vec<ObjectRef>, value: Value) {
    if let Some(obj) = value.as_object() {
        roots.push(obj);
    }
}

impl MemoryManager {
    /// Enumerate the current root set. Duplicates are possible; marking is
    /// idempotent.
    pub fn collect_roots(&self) -> Vec<ObjectRef> {
        let mut roots = Vec::new();

        if let Some(engine) = self.engine() {
            push_value(&mut roots, engine.global_object());
            push_value(&mut roots, engine.exception());
            engine.for_each_accessor_pair(&mut |getter, setter| {
                push_value(&mut roots, getter);
                push_value(&mut roots, setter);
            });

            let mut context = engine.current_context();
            while let Some(ctx) = context {
                push_value(&mut roots, ctx.this_value());
                push_value(&mut roots, ctx.function());
                for &arg in ctx.arguments().iter() {
                    push_value(&mut roots, arg);
                }
                for &local in ctx.locals().iter() {
                    push_value(&mut roots, local);
                }
                roots.extend(ctx.activation());
                roots.extend(ctx.with_scope().iter().copied());
                context = ctx.parent().cloned();
            }
        }

        self.frames.for_each_value(|value| push_value(&mut roots, value));

        #[cfg(feature = "conservative-stack")]
        {
            if self.config().stack_scan == crate::config::StackScanMode::Conservative {
                self.scan_native_stack(&mut roots);
            }
        }

        roots
    }

    /// Decide whether a raw stack word designates a live object.
    ///
    /// The word must carry the object tag, its address must fall inside a
    /// chunk, be exactly at a slot start, and that slot must be in use.
    /// Anything else is rejected, so stray integers and stale references to
    /// freed slots never become roots.
    pub fn conservative_candidate(&self, word: u64) -> Option<ObjectRef> {
        let addr = Value::from_bits(word).object_address()?;
        let id = find_chunk(&self.chunk_bounds(), addr)?;
        let chunk = self.chunk(id);
        let index = chunk.slot_index(addr)?;
        chunk
            .header(index)
            .in_use()
            .then(|| chunk.slot_ref(index))
    }

    #[cfg(feature = "conservative-stack")]
    #[inline(never)]
    fn scan_native_stack(&self, roots: &mut Vec<ObjectRef>) {
        let mut found = 0usize;
        let scanned = crate::stack::scan_current_stack(&mut |word| {
            if let Some(obj) = self.conservative_candidate(word) {
                roots.push(obj);
                found += 1;
            }
        });

        match scanned {
            Some(words) => tracing::trace!(
                target: "v4::gc",
                words,
                found,
                "conservative stack scan"
            ),
            None => tracing::warn!(
                target: "v4::gc",
                "stack bounds unavailable, skipping conservative scan"
            ),
        }
    }
}
