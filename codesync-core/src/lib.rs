//! # codesync-core: Replicated text buffers for collaborative editing
//!
//! Everything here is synchronous and transport-agnostic: a document
//! converges no matter how its operations are ordered, duplicated or
//! delayed, and the binding keeps an editor widget in step with it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  TextDelta   ┌──────────────┐  Operation   ┌──────────────┐
//! │ EditorWidget │ ───────────► │   Binding    │ ───────────► │OperationSink │
//! │  (any UI)    │ ◄─────────── │ (+ undo)     │              │ (transport)  │
//! └──────────────┘  Remote      └──────┬───────┘              └──────────────┘
//!                                      │ Arc<Mutex<…>>
//!                                      ▼
//!                               ┌──────────────┐
//!                               │   Document   │ ◄── apply_remote(Operation)
//!                               │    (RGA)     │
//!                               └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`crdt`]: RGA document, operations, state vectors, anchors
//! - [`delta`]: Editor-native deltas and minimal text diff
//! - [`observe`]: Listener registry with drop-to-unsubscribe handles
//! - [`undo`]: Local-only undo/redo
//! - [`binding`]: Widget ⇄ document binding without feedback loops

pub mod crdt;
pub mod delta;
pub mod observe;
pub mod undo;
pub mod binding;

// Re-exports for convenience
pub use crdt::{
    Anchor, ApplyOutcome, CrdtError, Document, ElementId, OpKind, Operation,
    SiteId, Snapshot, StateVector, MAX_CLOCK,
};
pub use delta::{diff, TextDelta};
pub use observe::{Observers, Subscription};
pub use undo::UndoManager;
pub use binding::{
    Binding, EditOrigin, EditorWidget, OperationSink, SharedDocument, TextBuffer,
};
