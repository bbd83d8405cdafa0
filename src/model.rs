//! Document Model (spec §3, §4.1): the immutable, arena-indexed
//! representation of a parsed SCXML document.
//!
//! Per the redesign in §9 ("shared-pointer graphs with parent back-edges"
//! becomes "arena indexed by StateId"), every cross-reference between
//! states, transitions and executable-content blocks is a plain integer
//! index into a `Vec` owned by `Document`, never a pointer or `Rc`. A
//! `Document` is built once via `DocumentBuilder` and is immutable and
//! `Send + Sync` afterwards, so an `Arc<Document>` can be shared by any
//! number of sessions running the same statechart concurrently.

use std::collections::HashMap;
use std::fmt;

use crate::data_model::{BindingType, Data};
use crate::executable_content::Action;

pub type StateId = u32;
pub type TransitionId = u32;
pub type ExecutableContentId = u32;
pub type DocId = u32;

/// Sentinel meaning "no state"/"no transition"/"no content" — index 0 is
/// never allocated to a real element, mirroring the teacher's convention of
/// reserving id 0 for "absent".
pub const NONE: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryType {
    Shallow,
    Deep,
    None,
}

impl std::str::FromStr for HistoryType {
    type Err = ();

    fn from_str(s: &str) -> Result<HistoryType, ()> {
        match s.to_ascii_lowercase().as_str() {
            "shallow" => Ok(HistoryType::Shallow),
            "deep" => Ok(HistoryType::Deep),
            "" => Ok(HistoryType::None),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionType {
    Internal,
    External,
}

impl std::str::FromStr for TransitionType {
    type Err = ();

    fn from_str(s: &str) -> Result<TransitionType, ()> {
        match s.to_ascii_lowercase().as_str() {
            "internal" => Ok(TransitionType::Internal),
            "external" | "" => Ok(TransitionType::External),
            _ => Err(()),
        }
    }
}

/// `<donedata>`: either a single `<content>` expression or a set of
/// `<param>` name/expr pairs, evaluated when a final state is entered.
#[derive(Debug, Clone, Default)]
pub struct DoneData {
    pub content_expr: Option<String>,
    pub params: Vec<ParamSpec>,
}

#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: String,
    pub location: Option<String>,
    pub expr: Option<String>,
}

/// A `<data>` element in a `<datamodel>` block: either an inline literal
/// value or an expression to evaluate at binding time.
#[derive(Debug, Clone)]
pub struct DataSpec {
    pub id: String,
    pub expr: Option<String>,
    pub literal: Option<Data>,
    pub src: Option<String>,
}

/// A `<state>`/`<parallel>`/`<final>` node.
#[derive(Debug)]
pub struct State {
    pub id: StateId,
    pub doc_id: DocId,
    pub name: String,
    pub parent: StateId,
    pub children: Vec<StateId>,
    pub is_parallel: bool,
    pub is_final: bool,
    /// Non-`None` only for `<history>` pseudo-states.
    pub history_type: HistoryType,
    pub initial_transition: TransitionId,
    pub transitions: Vec<TransitionId>,
    pub onentry: Vec<ExecutableContentId>,
    pub onexit: Vec<ExecutableContentId>,
    pub invoke: Vec<InvokeDecl>,
    pub datamodel: Vec<DataSpec>,
    pub donedata: Option<DoneData>,
}

impl State {
    pub fn is_atomic(&self) -> bool {
        self.children.is_empty()
    }

    pub fn is_history(&self) -> bool {
        !matches!(self.history_type, HistoryType::None)
    }

    pub fn is_compound(&self) -> bool {
        !self.children.is_empty() && !self.is_parallel
    }
}

/// A `<transition>`.
#[derive(Debug)]
pub struct Transition {
    pub id: TransitionId,
    pub doc_id: DocId,
    pub source: StateId,
    pub events: Vec<String>,
    /// `true` if the transition carries no `event` attribute at all.
    pub is_eventless: bool,
    pub cond: Option<String>,
    pub target: Vec<StateId>,
    pub transition_type: TransitionType,
    pub content: Vec<ExecutableContentId>,
}

impl Transition {
    pub fn matches_event(&self, name: &str) -> bool {
        if self.is_eventless {
            return false;
        }
        self.events
            .iter()
            .any(|tok| crate::event::Event::descriptor_matches(tok, name))
    }
}

/// An `<invoke>` declaration attached to a state (static; per-activation
/// bookkeeping lives in `session::InvokeRegistry`).
#[derive(Debug, Clone)]
pub struct InvokeDecl {
    pub doc_id: DocId,
    pub id: Option<String>,
    pub id_location: Option<String>,
    pub type_name: Option<String>,
    pub type_expr: Option<String>,
    pub src: Option<String>,
    pub src_expr: Option<String>,
    pub autoforward: bool,
    pub name_list: Vec<String>,
    pub params: Vec<ParamSpec>,
    pub content_expr: Option<String>,
    /// Raw inline child-document markup when `<content>` holds a nested
    /// `<scxml>` element rather than a scalar expression (W3C 6.4.1: "the
    /// SCXML Processor MUST use the content of the content element as the
    /// source"). Takes priority over `content_expr`, which is only ever a
    /// scalar value to hand the invoked component, not a document.
    pub content_doc: Option<String>,
    pub finalize: Vec<ExecutableContentId>,
}

/// A fully parsed, immutable SCXML document.
pub struct Document {
    pub name: Option<String>,
    pub datamodel_name: String,
    pub binding: BindingType,
    /// Pseudo-root holding the top-level `<state>`/`<parallel>`/`<final>`
    /// children and the document-level `<datamodel>`/`<script>`.
    pub root: StateId,
    pub initial_transition: TransitionId,
    pub script: Option<String>,
    states: Vec<State>,
    transitions: Vec<Transition>,
    content: Vec<Vec<Action>>,
    name_index: HashMap<String, StateId>,
}

impl Document {
    pub fn state(&self, id: StateId) -> &State {
        &self.states[(id - 1) as usize]
    }

    pub fn transition(&self, id: TransitionId) -> &Transition {
        &self.transitions[(id - 1) as usize]
    }

    pub fn content(&self, id: ExecutableContentId) -> &[Action] {
        if id == NONE {
            &[]
        } else {
            &self.content[(id - 1) as usize]
        }
    }

    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.states.iter()
    }

    pub fn transitions(&self) -> impl Iterator<Item = &Transition> {
        self.transitions.iter()
    }

    pub fn state_by_name(&self, name: &str) -> Option<StateId> {
        self.name_index.get(name).copied()
    }

    /// All ancestors of `id`, nearest first, not including `id` itself.
    pub fn ancestors(&self, id: StateId) -> Vec<StateId> {
        let mut out = Vec::new();
        let mut cur = self.state(id).parent;
        while cur != NONE {
            out.push(cur);
            cur = self.state(cur).parent;
        }
        out
    }

    pub fn is_descendant(&self, id: StateId, maybe_ancestor: StateId) -> bool {
        let mut cur = self.state(id).parent;
        while cur != NONE {
            if cur == maybe_ancestor {
                return true;
            }
            cur = self.state(cur).parent;
        }
        false
    }

    /// *W3C says* (§3.13, `findLCCA`): "the Least Common Compound Ancestor
    /// is the \<state\> or \<scxml\> element s such that s is a proper
    /// ancestor of all states on stateList and no descendant of s has this
    /// property." Returns the document root if no tighter ancestor exists.
    pub fn find_lcca(&self, state_ids: &[StateId]) -> StateId {
        let mut candidates = self.ancestors(state_ids[0]);
        candidates.push(self.root);
        candidates.retain(|anc| {
            let anc_state = self.state(*anc);
            (anc_state.is_compound() || *anc == self.root)
                && state_ids
                    .iter()
                    .all(|s| *s == *anc || self.is_descendant(*s, *anc))
        });
        *candidates.first().unwrap_or(&self.root)
    }

    /// Document-order comparator used throughout transition selection and
    /// entry-set ordering (spec §8 invariant 2).
    pub fn document_order(&self, a: StateId, b: StateId) -> std::cmp::Ordering {
        self.state(a).doc_id.cmp(&self.state(b).doc_id)
    }

    pub fn transition_document_order(&self, a: TransitionId, b: TransitionId) -> std::cmp::Ordering {
        self.transition(a).doc_id.cmp(&self.transition(b).doc_id)
    }
}

impl fmt::Debug for Document {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Document{{name:{:?} states:{} transitions:{}}}",
            self.name,
            self.states.len(),
            self.transitions.len()
        )
    }
}

/// Incrementally assembled by the reader (spec §4.1's external collaborator)
/// and frozen into a `Document` by `build()`.
#[derive(Default)]
pub struct DocumentBuilder {
    pub name: Option<String>,
    pub datamodel_name: String,
    pub binding: Option<BindingType>,
    pub script: Option<String>,
    states: Vec<State>,
    transitions: Vec<Transition>,
    content: Vec<Vec<Action>>,
    doc_id_counter: DocId,
}

/// Fatal, load-time errors (spec §7: the synchronous-boundary error type).
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("document has no root state")]
    EmptyDocument,
    #[error("transition {0} references unknown target state {1:?}")]
    DanglingTransitionTarget(TransitionId, String),
    #[error("state {0:?} has an unresolvable initial transition")]
    UnresolvableInitial(String),
    #[error("unknown datamodel '{0}'")]
    UnknownDatamodel(String),
    #[error("unknown binding '{0}', expected 'early' or 'late'")]
    InvalidBinding(String),
    #[error("duplicate state id {0:?}")]
    DuplicateStateId(String),
    #[error("parallel state {0:?} must not be atomic")]
    ParallelMustHaveChildren(String),
}

impl DocumentBuilder {
    pub fn new() -> DocumentBuilder {
        DocumentBuilder {
            datamodel_name: crate::data_model::NULL_DATAMODEL.to_string(),
            doc_id_counter: 1,
            ..Default::default()
        }
    }

    pub fn next_doc_id(&mut self) -> DocId {
        let id = self.doc_id_counter;
        self.doc_id_counter += 1;
        id
    }

    pub fn add_state(&mut self, mut state: State) -> StateId {
        let id = (self.states.len() + 1) as StateId;
        state.id = id;
        self.states.push(state);
        id
    }

    pub fn add_transition(&mut self, mut transition: Transition) -> TransitionId {
        let id = (self.transitions.len() + 1) as TransitionId;
        transition.id = id;
        self.transitions.push(transition);
        id
    }

    pub fn add_content(&mut self, actions: Vec<Action>) -> ExecutableContentId {
        if actions.is_empty() {
            return NONE;
        }
        self.content.push(actions);
        self.content.len() as ExecutableContentId
    }

    pub fn state_mut(&mut self, id: StateId) -> &mut State {
        &mut self.states[(id - 1) as usize]
    }

    pub fn transition_mut(&mut self, id: TransitionId) -> &mut Transition {
        &mut self.transitions[(id - 1) as usize]
    }

    pub fn state_by_name(&self, name: &str) -> Option<StateId> {
        self.states.iter().find(|s| s.name == name).map(|s| s.id)
    }

    pub fn build(self, root: StateId, initial_transition: TransitionId) -> Result<Document, DocumentError> {
        if self.states.is_empty() {
            return Err(DocumentError::EmptyDocument);
        }
        let binding = self.binding.unwrap_or(BindingType::Early);

        let mut name_index = HashMap::new();
        for s in &self.states {
            if name_index.insert(s.name.clone(), s.id).is_some() {
                return Err(DocumentError::DuplicateStateId(s.name.clone()));
            }
        }
        for s in &self.states {
            if s.is_parallel && s.children.is_empty() {
                return Err(DocumentError::ParallelMustHaveChildren(s.name.clone()));
            }
        }
        for t in &self.transitions {
            for target in &t.target {
                if (*target as usize) == 0 || (*target as usize) > self.states.len() {
                    return Err(DocumentError::DanglingTransitionTarget(
                        t.id,
                        self.states
                            .iter()
                            .find(|s| s.id == t.source)
                            .map(|s| s.name.clone())
                            .unwrap_or_default(),
                    ));
                }
            }
        }

        Ok(Document {
            name: self.name,
            datamodel_name: self.datamodel_name,
            binding,
            root,
            initial_transition,
            script: self.script,
            states: self.states,
            transitions: self.transitions,
            content: self.content,
            name_index,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(name: &str, parent: StateId, doc_id: DocId) -> State {
        State {
            id: 0,
            doc_id,
            name: name.to_string(),
            parent,
            children: vec![],
            is_parallel: false,
            is_final: false,
            history_type: HistoryType::None,
            initial_transition: NONE,
            transitions: vec![],
            onentry: vec![],
            onexit: vec![],
            invoke: vec![],
            datamodel: vec![],
            donedata: None,
        }
    }

    #[test]
    fn lcca_of_siblings_is_their_compound_parent() {
        let mut b = DocumentBuilder::new();
        let root = b.add_state(leaf("root", NONE, 1));
        let parent = b.add_state(leaf("p", root, 2));
        let a = b.add_state(leaf("a", parent, 3));
        let c = b.add_state(leaf("c", parent, 4));
        b.state_mut(root).children.push(parent);
        b.state_mut(parent).children.push(a);
        b.state_mut(parent).children.push(c);
        let doc = b.build(root, NONE).unwrap();
        assert_eq!(doc.find_lcca(&[a, c]), parent);
    }

    #[test]
    fn duplicate_state_names_rejected() {
        let mut b = DocumentBuilder::new();
        b.add_state(leaf("s", NONE, 1));
        b.add_state(leaf("s", NONE, 2));
        assert!(matches!(
            b.build(1, NONE),
            Err(DocumentError::DuplicateStateId(_))
        ));
    }
}
