//! Two-way binding between an editor widget and a shared [`Document`].
//!
//! ```text
//!   user types ──► on_widget_change ──► Document::apply_local ──► OperationSink
//!                                              │
//!   remote op ──► Document::apply_remote ──────┴──► listener ──► widget.apply_delta(Remote)
//! ```
//!
//! While a remote delta is being written into the widget the binding
//! ignores every change the widget reports, so programmatic updates never
//! echo back as new operations.
//!
//! Callers must not hold the widget lock while calling into the binding.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::crdt::{Document, Operation};
use crate::delta::{diff, TextDelta};
use crate::observe::Subscription;
use crate::undo::UndoManager;

/// A document shared by every pane showing it.
pub type SharedDocument = Arc<Mutex<Document>>;

/// Where a widget edit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOrigin {
    /// Typed by the local user.
    User,
    /// Written programmatically (remote change, hydration, undo).
    Remote,
}

/// The editor surface a binding drives.
pub trait EditorWidget: Send {
    fn content(&self) -> String;

    fn replace_content(&mut self, text: &str, origin: EditOrigin);

    fn apply_delta(&mut self, delta: &TextDelta, origin: EditOrigin);
}

/// Destination for local operations, usually the transport.
pub trait OperationSink: Send + Sync {
    fn send(&self, op: Operation);
}

impl<F> OperationSink for F
where
    F: Fn(Operation) + Send + Sync,
{
    fn send(&self, op: Operation) {
        self(op)
    }
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Restores the flag on scope exit, also on panic.
struct FlagGuard<'a>(&'a AtomicBool);

impl<'a> FlagGuard<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct Binding<W: EditorWidget + 'static> {
    doc: SharedDocument,
    widget: Arc<Mutex<W>>,
    sink: Arc<dyn OperationSink>,
    /// Set while this binding writes into its widget.
    applying_remote: Arc<AtomicBool>,
    /// Set while this binding announces its own edit to other views.
    local_echo: Arc<AtomicBool>,
    undo: Mutex<UndoManager>,
    _subscription: Subscription,
}

impl<W: EditorWidget + 'static> Binding<W> {
    /// Hydrate `widget` from `doc` and start following remote changes.
    ///
    /// Both happen under the document lock, so no change can slip in
    /// between the snapshot and the subscription.
    pub fn bind(doc: SharedDocument, widget: Arc<Mutex<W>>, sink: Arc<dyn OperationSink>) -> Self {
        let applying_remote = Arc::new(AtomicBool::new(false));
        let local_echo = Arc::new(AtomicBool::new(false));

        let subscription = {
            let guard = lock(&doc);
            {
                let _flag = FlagGuard::raise(&applying_remote);
                lock(&widget).replace_content(&guard.text(), EditOrigin::Remote);
            }

            let widget = widget.clone();
            let applying = applying_remote.clone();
            let echo = local_echo.clone();
            guard.subscribe(move |deltas| {
                if echo.load(Ordering::SeqCst) {
                    return;
                }
                let _flag = FlagGuard::raise(&applying);
                let mut w = lock(&widget);
                for delta in deltas {
                    w.apply_delta(delta, EditOrigin::Remote);
                }
            })
        };

        log::debug!("binding attached to document {:?}", lock(&doc).site());

        Self {
            doc,
            widget,
            sink,
            applying_remote,
            local_echo,
            undo: Mutex::new(UndoManager::new()),
            _subscription: subscription,
        }
    }

    pub fn document(&self) -> &SharedDocument {
        &self.doc
    }

    pub fn widget(&self) -> &Arc<Mutex<W>> {
        &self.widget
    }

    /// Whether a remote delta is currently being written to the widget.
    pub fn is_applying_remote(&self) -> bool {
        self.applying_remote.load(Ordering::SeqCst)
    }

    /// Feed edits reported by the widget. Returns the operations sent.
    pub fn on_widget_change(&self, deltas: &[TextDelta], origin: EditOrigin) -> Vec<Operation> {
        if origin == EditOrigin::Remote || self.is_applying_remote() {
            return Vec::new();
        }
        let ops = {
            let mut doc = lock(&self.doc);
            self.apply_user_deltas(&mut doc, deltas)
        };
        self.dispatch(&ops);
        ops
    }

    /// For widgets that only report their whole content: derive the
    /// minimal delta against the document and apply it.
    pub fn on_widget_content(&self, new_text: &str) -> Vec<Operation> {
        if self.is_applying_remote() {
            return Vec::new();
        }
        let ops = {
            let mut doc = lock(&self.doc);
            let deltas = diff(&doc.text(), new_text);
            self.apply_user_deltas(&mut doc, &deltas)
        };
        self.dispatch(&ops);
        ops
    }

    /// Overwrite the widget with the document's current text.
    pub fn rehydrate(&self) {
        let doc = lock(&self.doc);
        self.write_widget(|w| w.replace_content(&doc.text(), EditOrigin::Remote));
    }

    pub fn undo(&self) -> Vec<Operation> {
        self.step(|undo, doc| undo.undo(doc))
    }

    pub fn redo(&self) -> Vec<Operation> {
        self.step(|undo, doc| undo.redo(doc))
    }

    pub fn can_undo(&self) -> bool {
        lock(&self.undo).can_undo()
    }

    pub fn can_redo(&self) -> bool {
        lock(&self.undo).can_redo()
    }

    fn apply_user_deltas(&self, doc: &mut Document, deltas: &[TextDelta]) -> Vec<Operation> {
        let mut ops = Vec::new();
        let mut applied = Vec::new();
        let mut stale = false;
        {
            let mut undo = lock(&self.undo);
            for delta in deltas {
                match doc.apply_local(delta) {
                    Ok(Some(op)) => {
                        undo.record(doc, &op);
                        ops.push(op);
                        applied.push(delta.clone());
                    }
                    Ok(None) => {}
                    Err(e) => {
                        log::warn!("widget out of sync ({e}), re-hydrating");
                        stale = true;
                        break;
                    }
                }
            }
        }
        self.announce(doc, &applied);
        if stale {
            self.write_widget(|w| w.replace_content(&doc.text(), EditOrigin::Remote));
        }
        ops
    }

    fn step<F>(&self, f: F) -> Vec<Operation>
    where
        F: FnOnce(&mut UndoManager, &mut Document) -> Vec<Operation>,
    {
        let ops = {
            let mut doc = lock(&self.doc);
            let before = doc.text();
            let ops = f(&mut *lock(&self.undo), &mut *doc);
            let deltas = diff(&before, &doc.text());
            self.write_widget(|w| {
                for delta in &deltas {
                    w.apply_delta(delta, EditOrigin::Remote);
                }
            });
            self.announce(&doc, &deltas);
            ops
        };
        self.dispatch(&ops);
        ops
    }

    /// Let other views of the document follow a change made here.
    fn announce(&self, doc: &Document, deltas: &[TextDelta]) {
        let _flag = FlagGuard::raise(&self.local_echo);
        doc.notify(deltas);
    }

    fn write_widget<F: FnOnce(&mut W)>(&self, f: F) {
        let _flag = FlagGuard::raise(&self.applying_remote);
        f(&mut lock(&self.widget));
    }

    fn dispatch(&self, ops: &[Operation]) {
        for op in ops {
            log::trace!("local op {:?}", op.id);
            self.sink.send(op.clone());
        }
    }
}

impl<W: EditorWidget + 'static> std::fmt::Debug for Binding<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Binding")
            .field("applying_remote", &self.is_applying_remote())
            .finish()
    }
}

// ───────────────────────────────────────────────────────────────────
// TextBuffer
// ───────────────────────────────────────────────────────────────────

/// Minimal `String`-backed widget, for headless clients and tests.
#[derive(Debug, Default, Clone)]
pub struct TextBuffer {
    text: String,
    remote_edits: usize,
}

impl TextBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a user edit and return it for [`Binding::on_widget_change`].
    pub fn edit(&mut self, delta: TextDelta) -> TextDelta {
        delta.apply_to(&mut self.text);
        delta
    }

    /// Number of programmatic edits received.
    pub fn remote_edits(&self) -> usize {
        self.remote_edits
    }
}

impl EditorWidget for TextBuffer {
    fn content(&self) -> String {
        self.text.clone()
    }

    fn replace_content(&mut self, text: &str, origin: EditOrigin) {
        if origin == EditOrigin::Remote {
            self.remote_edits += 1;
        }
        self.text = text.to_string();
    }

    fn apply_delta(&mut self, delta: &TextDelta, origin: EditOrigin) {
        if origin == EditOrigin::Remote {
            self.remote_edits += 1;
        }
        delta.apply_to(&mut self.text);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::SiteId;
    use std::sync::Weak;
    use uuid::Uuid;

    #[derive(Default)]
    struct Collect(Mutex<Vec<Operation>>);

    impl OperationSink for Collect {
        fn send(&self, op: Operation) {
            self.0.lock().unwrap().push(op);
        }
    }

    fn shared(n: u128) -> SharedDocument {
        Arc::new(Mutex::new(Document::new(SiteId(Uuid::from_u128(n)))))
    }

    #[test]
    fn test_bind_hydrates_widget() {
        let doc = shared(1);
        doc.lock()
            .unwrap()
            .apply_local(&TextDelta::insert(0, "existing"))
            .unwrap();
        let widget = Arc::new(Mutex::new(TextBuffer::new()));
        let _binding = Binding::bind(doc, widget.clone(), Arc::new(Collect::default()));
        assert_eq!(widget.lock().unwrap().content(), "existing");
    }

    #[test]
    fn test_user_edit_goes_to_sink() {
        let doc = shared(1);
        let widget = Arc::new(Mutex::new(TextBuffer::new()));
        let sink = Arc::new(Collect::default());
        let binding = Binding::bind(doc.clone(), widget.clone(), sink.clone());

        let delta = widget.lock().unwrap().edit(TextDelta::insert(0, "fn"));
        let ops = binding.on_widget_change(&[delta], EditOrigin::User);

        assert_eq!(ops.len(), 1);
        assert_eq!(sink.0.lock().unwrap().len(), 1);
        assert_eq!(doc.lock().unwrap().text(), "fn");
    }

    #[test]
    fn test_remote_op_reaches_widget_without_echo() {
        let doc = shared(1);
        let widget = Arc::new(Mutex::new(TextBuffer::new()));
        let sink = Arc::new(Collect::default());
        let _binding = Binding::bind(doc.clone(), widget.clone(), sink.clone());

        let mut other = Document::new(SiteId(Uuid::from_u128(2)));
        let op = other
            .apply_local(&TextDelta::insert(0, "remote"))
            .unwrap()
            .unwrap();
        doc.lock().unwrap().apply_remote(op);

        assert_eq!(widget.lock().unwrap().content(), "remote");
        assert!(sink.0.lock().unwrap().is_empty());
    }

    /// Reports every change back to the binding as if the user typed it,
    /// the worst case for feedback loops.
    struct EchoWidget {
        text: String,
        binding: Option<Weak<Binding<EchoWidget>>>,
    }

    impl EchoWidget {
        fn echo(&self, delta: &TextDelta) {
            if let Some(binding) = self.binding.as_ref().and_then(Weak::upgrade) {
                binding.on_widget_change(std::slice::from_ref(delta), EditOrigin::User);
            }
        }
    }

    impl EditorWidget for EchoWidget {
        fn content(&self) -> String {
            self.text.clone()
        }

        fn replace_content(&mut self, text: &str, _origin: EditOrigin) {
            self.text = text.to_string();
        }

        fn apply_delta(&mut self, delta: &TextDelta, _origin: EditOrigin) {
            delta.apply_to(&mut self.text);
            self.echo(delta);
        }
    }

    #[test]
    fn test_no_feedback_loop() {
        let doc = shared(1);
        let widget = Arc::new(Mutex::new(EchoWidget {
            text: String::new(),
            binding: None,
        }));
        let sink = Arc::new(Collect::default());
        let binding = Arc::new(Binding::bind(doc.clone(), widget.clone(), sink.clone()));
        widget.lock().unwrap().binding = Some(Arc::downgrade(&binding));

        let mut other = Document::new(SiteId(Uuid::from_u128(2)));
        let op = other.apply_local(&TextDelta::insert(0, "hi")).unwrap().unwrap();
        doc.lock().unwrap().apply_remote(op);

        assert_eq!(widget.lock().unwrap().text, "hi");
        assert_eq!(doc.lock().unwrap().text(), "hi");
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_on_widget_content_uses_minimal_diff() {
        let doc = shared(1);
        let widget = Arc::new(Mutex::new(TextBuffer::new()));
        let sink = Arc::new(Collect::default());
        let binding = Binding::bind(doc.clone(), widget, sink);

        binding.on_widget_content("hello world");
        let ops = binding.on_widget_content("hello brave world");
        assert_eq!(ops.len(), 1);
        assert_eq!(doc.lock().unwrap().text(), "hello brave world");
    }

    #[test]
    fn test_out_of_range_rehydrates() {
        let doc = shared(1);
        let widget = Arc::new(Mutex::new(TextBuffer::new()));
        let binding = Binding::bind(doc.clone(), widget.clone(), Arc::new(Collect::default()));
        binding.on_widget_content("abc");

        // Widget thinks it is longer than the document.
        widget.lock().unwrap().replace_content("abcdefgh", EditOrigin::User);
        let ops = binding.on_widget_change(&[TextDelta::delete(6, 2)], EditOrigin::User);

        assert!(ops.is_empty());
        assert_eq!(widget.lock().unwrap().content(), "abc");
    }

    #[test]
    fn test_undo_redo_through_binding() {
        let doc = shared(1);
        let widget = Arc::new(Mutex::new(TextBuffer::new()));
        let sink = Arc::new(Collect::default());
        let binding = Binding::bind(doc.clone(), widget.clone(), sink.clone());

        let delta = widget.lock().unwrap().edit(TextDelta::insert(0, "draft"));
        binding.on_widget_change(&[delta], EditOrigin::User);

        binding.undo();
        assert_eq!(widget.lock().unwrap().content(), "");
        assert_eq!(doc.lock().unwrap().text(), "");

        binding.redo();
        assert_eq!(widget.lock().unwrap().content(), "draft");
        assert_eq!(sink.0.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_two_panes_share_document() {
        let doc = shared(1);
        let left = Arc::new(Mutex::new(TextBuffer::new()));
        let right = Arc::new(Mutex::new(TextBuffer::new()));
        let a = Binding::bind(doc.clone(), left.clone(), Arc::new(Collect::default()));
        let _b = Binding::bind(doc.clone(), right.clone(), Arc::new(Collect::default()));

        let delta = left.lock().unwrap().edit(TextDelta::insert(0, "split view"));
        a.on_widget_change(&[delta], EditOrigin::User);

        assert_eq!(left.lock().unwrap().content(), "split view");
        assert_eq!(right.lock().unwrap().content(), "split view");
    }

    #[test]
    fn test_drop_unsubscribes_but_keeps_document() {
        let doc = shared(1);
        let widget = Arc::new(Mutex::new(TextBuffer::new()));
        let binding = Binding::bind(doc.clone(), widget.clone(), Arc::new(Collect::default()));
        binding.on_widget_content("kept");
        drop(binding);

        let mut other = Document::new(SiteId(Uuid::from_u128(2)));
        let op = other.apply_local(&TextDelta::insert(0, "x")).unwrap().unwrap();
        doc.lock().unwrap().apply_remote(op);

        assert_eq!(widget.lock().unwrap().content(), "kept");
        assert_eq!(doc.lock().unwrap().text(), "xkept");
    }
}
