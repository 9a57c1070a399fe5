use std::collections::BTreeSet;

use hashbrown::HashMap;
use indexmap::{IndexMap, IndexSet};
use roaring::RoaringBitmap;
use ustr::{Ustr, UstrMap, ustr};

use crate::grammar::{Expr, ExprId, ValidGrammar};
use crate::{StateId, make_dot_string_constant};

pub type CommandId = usize;

/// A transition label: what kind of word gets the completion engine from one state to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Symbol {
    Literal {
        text: Ustr,
        description: Option<Ustr>,
    },
    Regex {
        pattern: Ustr,
    },
    Command {
        id: CommandId,
    },
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Symbol::Literal { text, .. } => write!(f, "{text}"),
            Symbol::Regex { pattern } => write!(f, "@{:?}", pattern.as_str()),
            Symbol::Command { id } => write!(f, "cmd#{id}"),
        }
    }
}

// Transitions with the same key out of one state collapse into a single deterministic transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum SymbolKey {
    Literal(Ustr),
    Regex(Ustr),
    Command(CommandId),
}

impl Symbol {
    fn key(&self) -> SymbolKey {
        match self {
            Symbol::Literal { text, .. } => SymbolKey::Literal(*text),
            Symbol::Regex { pattern } => SymbolKey::Regex(*pattern),
            Symbol::Command { id } => SymbolKey::Command(*id),
        }
    }
}

#[derive(Default)]
struct NfaState {
    epsilons: Vec<StateId>,
    transitions: Vec<(Symbol, StateId)>,
}

// Thompson-style construction, except transitions consume whole shell words instead of
// characters.
struct NfaBuilder<'g> {
    arena: &'g [Expr],
    rules: &'g UstrMap<ExprId>,
    states: Vec<NfaState>,
    commands: IndexSet<Ustr>,
    // Rules whose sub-automaton is under construction further up the call stack.  A reference to
    // one of these links back to the existing entry/exit pair instead of recursing forever.
    open_rules: Vec<(Ustr, StateId, StateId)>,
}

impl<'g> NfaBuilder<'g> {
    fn add_state(&mut self) -> StateId {
        let id = self.states.len() as StateId;
        self.states.push(NfaState::default());
        id
    }

    fn add_epsilon(&mut self, from: StateId, to: StateId) {
        self.states[from as usize].epsilons.push(to);
    }

    fn add_transition(&mut self, from: StateId, symbol: Symbol, to: StateId) {
        self.states[from as usize].transitions.push((symbol, to));
    }

    fn compile(&mut self, expr_id: ExprId, from: StateId, to: StateId) {
        match self.arena[expr_id.to_index()].clone() {
            Expr::Terminal(text, description, _) => {
                self.add_transition(from, Symbol::Literal { text, description }, to);
            }
            Expr::Regex(pattern, _) => {
                self.add_transition(from, Symbol::Regex { pattern }, to);
            }
            Expr::Command(cmd, _) => {
                let (id, _) = self.commands.insert_full(cmd);
                self.add_transition(from, Symbol::Command { id }, to);
            }
            Expr::Sequence(children) => match children.as_slice() {
                [] => self.add_epsilon(from, to),
                [sole] => self.compile(*sole, from, to),
                [head, rest @ ..] => {
                    let mut current = self.add_state();
                    self.compile(*head, from, current);
                    for (i, child) in rest.iter().enumerate() {
                        let next = if i + 1 == rest.len() {
                            to
                        } else {
                            self.add_state()
                        };
                        self.compile(*child, current, next);
                        current = next;
                    }
                }
            },
            Expr::Alternative(children) => {
                for child in &children {
                    self.compile(*child, from, to);
                }
            }
            Expr::Optional(child) => {
                self.compile(child, from, to);
                self.add_epsilon(from, to);
            }
            Expr::Many1(child) => {
                let entry = self.add_state();
                let exit = self.add_state();
                self.add_epsilon(from, entry);
                self.compile(child, entry, exit);
                self.add_epsilon(exit, entry);
                self.add_epsilon(exit, to);
            }
            Expr::NontermRef(name, _) => {
                if let Some((_, entry, exit)) = self
                    .open_rules
                    .iter()
                    .rev()
                    .find(|(open, ..)| *open == name)
                    .copied()
                {
                    self.add_epsilon(from, entry);
                    self.add_epsilon(exit, to);
                    return;
                }
                let entry = self.add_state();
                let exit = self.add_state();
                let body = *self.rules.get(&name).expect("reference validated earlier");
                self.open_rules.push((name, entry, exit));
                self.compile(body, entry, exit);
                self.open_rules.pop();
                self.add_epsilon(from, entry);
                self.add_epsilon(exit, to);
            }
            Expr::DistributiveDescription(..) => {
                unreachable!("descriptions are distributed before automaton construction")
            }
        }
    }

    fn epsilon_closure(&self, seeds: impl IntoIterator<Item = StateId>) -> BTreeSet<StateId> {
        let mut closure: BTreeSet<StateId> = Default::default();
        let mut stack: Vec<StateId> = seeds.into_iter().collect();
        while let Some(state) = stack.pop() {
            if !closure.insert(state) {
                continue;
            }
            stack.extend(&self.states[state as usize].epsilons);
        }
        closure
    }
}

/// The compiled lookup automaton: one state per point in the command line, with the admissible
/// next words on the outgoing transitions.  States are integers, contiguous from 0, with the
/// starting state first.
#[derive(Debug, Clone)]
pub struct Automaton {
    pub starting_state: StateId,
    // IndexMap keeps iteration order (and therefore emitted scripts) deterministic
    pub transitions: IndexMap<StateId, IndexMap<Symbol, StateId>>,
    pub accepting_states: RoaringBitmap,
    // External command snippets, id == insertion index.  Assignment order follows the
    // depth-first walk of the grammar, so it is stable across recompilations.
    pub commands: IndexSet<Ustr>,
}

impl Automaton {
    /// Compile a validated grammar.  Where several transitions out of one state carry the same
    /// literal, the description of the lexically later declaration wins.
    pub fn from_grammar(grammar: &ValidGrammar) -> Self {
        let mut builder = NfaBuilder {
            arena: &grammar.arena,
            rules: &grammar.rules,
            states: Vec::default(),
            commands: IndexSet::default(),
            open_rules: Vec::default(),
        };
        let nfa_start = builder.add_state();
        let nfa_accept = builder.add_state();
        builder.compile(grammar.expr, nfa_start, nfa_accept);

        let (mut states, accepting) = determinize(&builder, nfa_start, nfa_accept);
        reduce(&mut states, &accepting);
        let (transitions, accepting_states) = renumber(&states, &accepting);

        Automaton {
            starting_state: 0,
            transitions,
            accepting_states,
            commands: builder.commands,
        }
    }

    pub fn get_all_states(&self) -> RoaringBitmap {
        let mut states = RoaringBitmap::default();
        for (from, tos) in &self.transitions {
            states.insert(*from);
            for to in tos.values() {
                states.insert(*to);
            }
        }
        states.insert(self.starting_state);
        states
    }

    pub fn iter_transitions(&self) -> impl Iterator<Item = (StateId, &Symbol, StateId)> + '_ {
        self.transitions
            .iter()
            .flat_map(|(from, tos)| tos.iter().map(|(symbol, to)| (*from, symbol, *to)))
    }

    /// All distinct literals with their descriptions, in first-occurrence order.
    pub fn get_all_literals(&self) -> Vec<(Ustr, Option<Ustr>)> {
        let mut literals: IndexSet<(Ustr, Option<Ustr>)> = Default::default();
        for (_, symbol, _) in self.iter_transitions() {
            if let Symbol::Literal { text, description } = symbol {
                literals.insert((*text, *description));
            }
        }
        literals.into_iter().collect()
    }

    /// All distinct regex patterns, in first-occurrence order.
    pub fn get_all_regexes(&self) -> Vec<Ustr> {
        let mut regexes: IndexSet<Ustr> = Default::default();
        for (_, symbol, _) in self.iter_transitions() {
            if let Symbol::Regex { pattern } = symbol {
                regexes.insert(*pattern);
            }
        }
        regexes.into_iter().collect()
    }

    pub fn get_literal_transitions_from(&self, from: StateId) -> Vec<(Ustr, Ustr, StateId)> {
        let Some(tos) = self.transitions.get(&from) else {
            return Vec::default();
        };
        tos.iter()
            .filter_map(|(symbol, to)| match symbol {
                Symbol::Literal { text, description } => {
                    Some((*text, description.unwrap_or(ustr("")), *to))
                }
                _ => None,
            })
            .collect()
    }

    pub fn get_regex_transitions_from(&self, from: StateId) -> Vec<(Ustr, StateId)> {
        let Some(tos) = self.transitions.get(&from) else {
            return Vec::default();
        };
        tos.iter()
            .filter_map(|(symbol, to)| match symbol {
                Symbol::Regex { pattern } => Some((*pattern, *to)),
                _ => None,
            })
            .collect()
    }

    pub fn get_command_transitions_from(&self, from: StateId) -> Vec<(CommandId, StateId)> {
        let Some(tos) = self.transitions.get(&from) else {
            return Vec::default();
        };
        tos.iter()
            .filter_map(|(symbol, to)| match symbol {
                Symbol::Command { id } => Some((*id, *to)),
                _ => None,
            })
            .collect()
    }

    pub fn has_commands(&self) -> bool {
        !self.commands.is_empty()
    }

    pub fn has_regexes(&self) -> bool {
        self.iter_transitions()
            .any(|(_, symbol, _)| matches!(symbol, Symbol::Regex { .. }))
    }

    // Test helper mirroring what the generated dispatch sections do at completion time.
    pub fn accepts(&self, words: &[&str]) -> bool {
        let mut state = self.starting_state;
        'words: for word in words {
            let Some(outgoing) = self.transitions.get(&state) else {
                return false;
            };
            for (symbol, to) in outgoing {
                let matched = match symbol {
                    Symbol::Literal { text, .. } => text.as_str() == *word,
                    Symbol::Regex { pattern } => regex::Regex::new(&format!("^(?:{pattern})$"))
                        .map(|rx| rx.is_match(word))
                        .unwrap_or(false),
                    Symbol::Command { .. } => true,
                };
                if matched {
                    state = *to;
                    continue 'words;
                }
            }
            return false;
        }
        self.accepting_states.contains(state)
    }

    pub fn to_dot<W: std::io::Write>(
        &self,
        output: &mut W,
    ) -> std::result::Result<(), std::io::Error> {
        writeln!(output, "digraph tabgen {{")?;
        writeln!(output, "\trankdir=LR;")?;

        for state in self.get_all_states() {
            let shape = if self.accepting_states.contains(state) {
                "doublecircle"
            } else {
                "circle"
            };
            writeln!(output, "\t_{state}[label={state}, shape={shape}];")?;
        }

        for (from, symbol, to) in self.iter_transitions() {
            let label = make_dot_string_constant(&symbol.to_string());
            writeln!(output, "\t_{from} -> _{to} [label={label}];")?;
        }

        writeln!(output, "}}")?;
        Ok(())
    }

    pub fn to_dot_file<P: AsRef<std::path::Path>>(
        &self,
        path: P,
    ) -> std::result::Result<(), std::io::Error> {
        let mut file = std::fs::File::create(path)?;
        self.to_dot(&mut file)?;
        Ok(())
    }
}

// Classic subset construction over the word-level NFA.  Literal transitions with the same text
// merge into one; the lexically later description overwrites the earlier one (last-write-wins).
fn determinize(
    builder: &NfaBuilder,
    nfa_start: StateId,
    nfa_accept: StateId,
) -> (Vec<IndexMap<Symbol, StateId>>, RoaringBitmap) {
    let start_closure = builder.epsilon_closure([nfa_start]);

    let mut subset_ids: IndexMap<BTreeSet<StateId>, StateId> = Default::default();
    subset_ids.insert(start_closure, 0);

    let mut states: Vec<IndexMap<Symbol, StateId>> = Default::default();
    let mut accepting = RoaringBitmap::default();

    let mut index = 0;
    while index < subset_ids.len() {
        let (subset, _) = subset_ids.get_index(index).unwrap();
        let subset = subset.clone();

        if subset.contains(&nfa_accept) {
            accepting.insert(index as StateId);
        }

        // NFA state ids grow in document order, so iterating the subset in ascending order makes
        // the merge below honor "later declaration wins".
        let mut outgoing: IndexMap<SymbolKey, (Symbol, BTreeSet<StateId>)> = Default::default();
        for nfa_state in &subset {
            for (symbol, to) in &builder.states[*nfa_state as usize].transitions {
                let entry = outgoing
                    .entry(symbol.key())
                    .or_insert_with(|| (*symbol, BTreeSet::default()));
                entry.0 = *symbol;
                entry.1.insert(*to);
            }
        }

        let mut transitions: IndexMap<Symbol, StateId> = Default::default();
        for (_, (symbol, targets)) in outgoing {
            let target_closure = builder.epsilon_closure(targets);
            let next_id = subset_ids.len() as StateId;
            let to = *subset_ids.entry(target_closure).or_insert(next_id);
            transitions.insert(symbol, to);
        }

        states.push(transitions);
        index += 1;
    }

    (states, accepting)
}

// Collapse states with identical transition sets and acceptance until a fixpoint; this is what
// makes shared suffixes and repetition self-loops come out as single states.
fn reduce(states: &mut [IndexMap<Symbol, StateId>], accepting: &RoaringBitmap) {
    loop {
        let mut representative: HashMap<(Vec<(Symbol, StateId)>, bool), StateId> =
            Default::default();
        let mut remap: Vec<StateId> = (0..states.len() as StateId).collect();

        for (id, transitions) in states.iter().enumerate() {
            let signature = (
                transitions.iter().map(|(s, to)| (*s, *to)).collect(),
                accepting.contains(id as StateId),
            );
            match representative.get(&signature) {
                Some(canonical) => remap[id] = *canonical,
                None => {
                    representative.insert(signature, id as StateId);
                }
            }
        }

        // Merged states stay in the arena until the renumbering pass drops them, so the fixpoint
        // is reached once redirecting targets stops changing anything.
        let mut changed = false;
        for transitions in states.iter_mut() {
            for to in transitions.values_mut() {
                if *to != remap[*to as usize] {
                    *to = remap[*to as usize];
                    changed = true;
                }
            }
        }

        if !changed {
            return;
        }
    }
}

// Renumber reachable states breadth-first from the start so ids are contiguous and the start
// state is 0, dropping states orphaned by the reduction pass.
fn renumber(
    states: &[IndexMap<Symbol, StateId>],
    accepting: &RoaringBitmap,
) -> (IndexMap<StateId, IndexMap<Symbol, StateId>>, RoaringBitmap) {
    let mut order: IndexSet<StateId> = Default::default();
    order.insert(0);
    let mut index = 0;
    while index < order.len() {
        let state = *order.get_index(index).unwrap();
        for to in states[state as usize].values() {
            order.insert(*to);
        }
        index += 1;
    }

    let mut transitions: IndexMap<StateId, IndexMap<Symbol, StateId>> = Default::default();
    let mut new_accepting = RoaringBitmap::default();
    for (new_id, old_id) in order.iter().enumerate() {
        let renumbered: IndexMap<Symbol, StateId> = states[*old_id as usize]
            .iter()
            .map(|(symbol, to)| (*symbol, order.get_index_of(to).unwrap() as StateId))
            .collect();
        if !renumbered.is_empty() {
            transitions.insert(new_id as StateId, renumbered);
        }
        if accepting.contains(*old_id) {
            new_accepting.insert(new_id as StateId);
        }
    }

    (transitions, new_accepting)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{Grammar, ValidGrammar};

    fn compile(input: &str) -> Automaton {
        let grammar = Grammar::parse(input).unwrap();
        let validated = ValidGrammar::from_grammar(grammar).unwrap();
        Automaton::from_grammar(&validated)
    }

    #[test]
    fn alternation_fans_out_from_one_state() {
        let automaton = compile(r#"cmd (foo "d1" | bar "d2");"#);
        let literals = automaton.get_literal_transitions_from(automaton.starting_state);
        assert_eq!(literals.len(), 2);
        assert!(literals.contains(&(ustr("foo"), ustr("d1"), 1)));
        assert!(literals.contains(&(ustr("bar"), ustr("d2"), 1)));
    }

    #[test]
    fn sequence_chains_states() {
        let automaton = compile("cmd foo bar;");
        assert!(automaton.accepts(&["foo", "bar"]));
        assert!(!automaton.accepts(&["foo"]));
        assert!(!automaton.accepts(&["bar", "foo"]));
    }

    #[test]
    fn optional_admits_empty_path() {
        let automaton = compile("cmd [--verbose] build;");
        assert!(automaton.accepts(&["build"]));
        assert!(automaton.accepts(&["--verbose", "build"]));
        assert!(!automaton.accepts(&["--verbose"]));
    }

    #[test]
    fn bare_command_accepts_no_arguments() {
        let automaton = compile("true;");
        assert!(automaton.accepts(&[]));
        assert!(!automaton.accepts(&["anything"]));
    }

    #[test]
    fn repetition_produces_self_loop() {
        let automaton = compile(
            r#"
mygrep [<OPTION>]... <PATTERN>;
<OPTION> ::= --color | --line-number;
<PATTERN> ::= @"[^-].*";
"#,
        );
        let start = automaton.starting_state;
        let literals = automaton.get_literal_transitions_from(start);
        assert_eq!(literals.len(), 2);
        // Consuming an option keeps offering the same option set: every literal loops back.
        for (_, _, to) in &literals {
            assert_eq!(*to, start);
        }
        let regexes = automaton.get_regex_transitions_from(start);
        assert_eq!(regexes.len(), 1);
        assert_eq!(regexes[0].0, ustr("[^-].*"));
        assert!(automaton.accepts(&["pattern"]));
        assert!(automaton.accepts(&["--color", "pattern"]));
        assert!(automaton.accepts(&["--color", "--color", "--line-number", "pattern"]));
        assert!(!automaton.accepts(&["--color"]));
    }

    #[test]
    fn command_table_assigns_stable_ids_in_discovery_order() {
        let automaton = compile("cmd ({{{ git tag }}} | {{{ git branch }}}) {{{ git tag }}};");
        assert_eq!(automaton.commands.len(), 2);
        assert_eq!(automaton.commands.get_index(0), Some(&ustr("git tag")));
        assert_eq!(automaton.commands.get_index(1), Some(&ustr("git branch")));
    }

    #[test]
    fn identical_snippets_share_one_id() {
        let automaton = compile("cmd {{{ echo hello }}};");
        assert_eq!(automaton.commands.len(), 1);
        let commands = automaton.get_command_transitions_from(automaton.starting_state);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].0, 0);
    }

    #[test]
    fn later_description_wins_for_same_literal() {
        let automaton = compile(r#"cmd (foo "old" | foo "new");"#);
        let literals = automaton.get_literal_transitions_from(automaton.starting_state);
        assert_eq!(literals, vec![(ustr("foo"), ustr("new"), 1)]);
    }

    #[test]
    fn recursive_rule_produces_cycle_not_unrolling() {
        let automaton = compile(
            r#"
calc <SUM>;
<SUM> ::= <NUM> [plus <SUM>];
<NUM> ::= @"[0-9]+";
"#,
        );
        assert!(automaton.accepts(&["1"]));
        assert!(automaton.accepts(&["1", "plus", "2"]));
        assert!(automaton.accepts(&["1", "plus", "2", "plus", "3"]));
        assert!(!automaton.accepts(&["1", "plus"]));
        // A cycle, not an unrolling: the state count must not grow with the recursion depth.
        assert!(automaton.get_all_states().len() < 8);
    }

    #[test]
    fn shared_suffixes_collapse() {
        let automaton = compile("cmd (add <FILE> | remove <FILE>);\n<FILE> ::= @\".+\";");
        let add_target = automaton
            .get_literal_transitions_from(automaton.starting_state)
            .iter()
            .find(|(text, _, _)| *text == ustr("add"))
            .map(|(_, _, to)| *to)
            .unwrap();
        let remove_target = automaton
            .get_literal_transitions_from(automaton.starting_state)
            .iter()
            .find(|(text, _, _)| *text == ustr("remove"))
            .map(|(_, _, to)| *to)
            .unwrap();
        assert_eq!(add_target, remove_target);
    }

    #[test]
    fn compilation_is_deterministic() {
        const GRAMMAR: &str = r#"
darcs (add <FILE> | remove <FILE> | {{{ darcs help }}});
<FILE> ::= @".+" | {{{ ls }}};
"#;
        let render = |automaton: &Automaton| {
            let mut out: Vec<u8> = Default::default();
            automaton.to_dot(&mut out).unwrap();
            String::from_utf8(out).unwrap()
        };
        let first = compile(GRAMMAR);
        let second = compile(GRAMMAR);
        assert_eq!(render(&first), render(&second));
        assert_eq!(first.commands, second.commands);
    }

    #[test]
    fn dot_dump_is_loadable_from_a_file() {
        let automaton = compile(r#"cmd (foo "d1" | bar);"#);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("automaton.dot");
        automaton.to_dot_file(&path).unwrap();
        let rendered = std::fs::read_to_string(&path).unwrap();
        assert!(rendered.starts_with("digraph"));
        assert!(rendered.contains("doublecircle"));
        assert!(rendered.contains("foo"));
    }

    #[test]
    fn starting_state_is_zero_and_ids_are_contiguous() {
        let automaton = compile("cmd foo bar baz;");
        assert_eq!(automaton.starting_state, 0);
        let states = automaton.get_all_states();
        assert_eq!(states.len(), 4);
        assert_eq!(states.max(), Some(3));
    }
}
