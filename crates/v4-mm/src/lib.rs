//! # V4 Memory Manager
//!
//! Heap for a small ECMAScript engine: size-classed chunk allocation with a
//! non-moving, stop-the-world mark/sweep collector.
//!
//! ## Design
//!
//! - **Size classes**: requests are served from 16-byte size classes below
//!   [`MAX_ITEM_SIZE`], each backed by page-aligned chunks
//! - **Free lists**: freed slots are threaded into a per-class list through
//!   their headers
//! - **Roots**: engine globals, the execution-context chain and interpreter
//!   frames, optionally plus a conservative native stack scan
//! - **Blocking**: [`GcBlocker`] keeps collection out of critical sections
//!
//! Everything here is single-threaded. The manager is neither `Send` nor
//! `Sync` and the collector never runs concurrently with the mutator.
//!
//! ```
//! use std::cell::Cell;
//! use v4_mm::{MemoryManager, Trace, Tracer, Value};
//!
//! struct Node {
//!     next: Cell<Value>,
//! }
//!
//! impl Trace for Node {
//!     fn trace(&self, tracer: &mut Tracer) {
//!         self.next.trace(tracer);
//!     }
//! }
//!
//! let mm = MemoryManager::with_defaults();
//! let frame = mm.alloc_stack_frame(1);
//! let head = mm.alloc_object(Node { next: Cell::new(Value::undefined()) });
//! frame.set(0, head.to_value());
//!
//! let tail = mm.alloc_object(Node { next: Cell::new(Value::undefined()) });
//! head.next.set(tail.to_value());
//!
//! assert_eq!(mm.run_gc(), 0);
//! assert!(mm.is_live(tail.object_ref()));
//! mm.dealloc_stack_frame(frame);
//! ```

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod blocker;
pub mod chunk;
pub mod config;
pub mod context;
pub mod error;
pub mod frames;
pub mod manager;
pub mod mark;
pub mod object;
pub mod roots;
#[cfg(feature = "conservative-stack")]
pub mod stack;
pub mod stats;
pub mod value;

pub use blocker::GcBlocker;
pub use chunk::{DEFAULT_CHUNK_SIZE, MAX_ITEM_SIZE, NUM_SIZE_CLASSES, PAGE_SIZE, SLOT_ALIGN};
pub use config::{MmConfig, StackScanMode};
pub use context::{EngineRoots, ExecutionContext};
pub use error::{MmError, MmResult};
pub use frames::{FrameId, StackFrame};
pub use manager::MemoryManager;
pub use mark::Tracer;
pub use object::{Gc, HEADER_SIZE, ObjectRef, SlotHeader, Trace};
pub use stats::MmStats;
pub use value::{Value, ValueKind};
