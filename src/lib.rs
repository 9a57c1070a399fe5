use grammar::HumanSpan;
use std::string::FromUtf8Error;
use ustr::Ustr;

use crate::automaton::Automaton;

pub mod automaton;
pub mod bash;
pub mod fish;
pub mod grammar;
pub mod pwsh;
pub mod quoting;
pub mod zsh;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Syntax error")]
    SyntaxError(HumanSpan),

    #[error("Grammar needs to contain at least one call variant, e.g. grep;")]
    MissingCallVariants,

    #[error("Multiple commands")]
    VaryingCommandNames(Box<[Ustr]>),

    #[error("Duplicate nonterminal definition: <{}>", .0)]
    DuplicateNonterminalDefinition(Ustr, HumanSpan),

    #[error("Undefined nonterminal: <{}>", .0)]
    UndefinedRule(Ustr, HumanSpan),

    #[error("Nonterminal definition(s) never produce a word: {:?}", .0)]
    UnproductiveCycle(Box<[Ustr]>),

    #[error("Invalid regular expression {:?}: {}", .0, .1)]
    InvalidRegex(Ustr, String, HumanSpan),

    #[error("{} has no representation in the requested shell", .0)]
    UnsupportedConstruct(&'static str, HumanSpan),

    #[error("Emission invariant violated: {}", .0)]
    EmissionError(String),

    #[error("UTF-8 conversion error")]
    FromUtf8Error(#[from] FromUtf8Error),

    #[error("Formatting error")]
    FmtError(#[from] std::fmt::Error),

    #[error("IO error")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub type StateId = u32;

/// The closed set of supported target shells.  Each one has materially
/// different quoting, array and registration idioms, so emission dispatches
/// over this enum rather than any open-ended abstraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Shell {
    Bash,
    Fish,
    Zsh,
    Pwsh,
}

impl Shell {
    pub fn name(&self) -> &'static str {
        match self {
            Shell::Bash => "bash",
            Shell::Fish => "fish",
            Shell::Zsh => "zsh",
            Shell::Pwsh => "pwsh",
        }
    }

    pub fn write_completion_script<W: std::io::Write>(
        &self,
        buffer: &mut W,
        command: &str,
        automaton: &Automaton,
    ) -> Result<()> {
        match self {
            Shell::Bash => bash::write_completion_script(buffer, command, automaton),
            Shell::Fish => fish::write_completion_script(buffer, command, automaton),
            Shell::Zsh => zsh::write_completion_script(buffer, command, automaton),
            Shell::Pwsh => pwsh::write_completion_script(buffer, command, automaton),
        }
    }

    pub fn completion_script(&self, command: &str, automaton: &Automaton) -> Result<String> {
        let mut buffer: Vec<u8> = Default::default();
        self.write_completion_script(&mut buffer, command, automaton)?;
        Ok(String::from_utf8(buffer)?)
    }
}

pub(crate) fn make_dot_string_constant(s: &str) -> String {
    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
    format!(r#""{escaped}""#)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automaton::Automaton;
    use crate::grammar::{Grammar, ValidGrammar};

    const ALL_SHELLS: [Shell; 4] = [Shell::Bash, Shell::Fish, Shell::Zsh, Shell::Pwsh];

    fn compile(input: &str) -> (String, Automaton) {
        let grammar = Grammar::parse(input).unwrap();
        let validated = ValidGrammar::from_grammar(grammar).unwrap();
        let automaton = Automaton::from_grammar(&validated);
        (validated.command.to_string(), automaton)
    }

    #[test]
    fn every_backend_emits_for_command_free_grammars() {
        let (command, automaton) = compile("cmd (add | remove) --force;");
        assert!(!automaton.has_commands());
        assert!(!automaton.has_regexes());
        for shell in ALL_SHELLS {
            let script = shell.completion_script(&command, &automaton).unwrap();
            assert!(!script.is_empty(), "{} emitted nothing", shell.name());
            assert!(script.contains("add"), "{} lost a literal", shell.name());
        }
    }

    #[test]
    fn emission_is_deterministic_per_backend() {
        const GRAMMAR: &str = r#"
darcs (add <FILE> | remove <FILE> | {{{ darcs help | tail -n +2 }}});
<FILE> ::= @".+" | {{{ ls }}};
"#;
        for shell in ALL_SHELLS {
            let (command, first) = compile(GRAMMAR);
            let (_, second) = compile(GRAMMAR);
            let once = shell.completion_script(&command, &first).unwrap();
            let twice = shell.completion_script(&command, &second).unwrap();
            assert_eq!(once, twice, "{} output varies across runs", shell.name());
        }
    }

    #[test]
    fn alternation_literals_and_descriptions_reach_every_backend() {
        let (command, automaton) = compile(r#"cmd (foo "d1" | bar "d2");"#);
        for shell in ALL_SHELLS {
            let script = shell.completion_script(&command, &automaton).unwrap();
            for needle in ["foo", "bar", "d1", "d2"] {
                assert!(
                    script.contains(needle),
                    "{} output is missing {:?}",
                    shell.name(),
                    needle
                );
            }
        }
    }

    #[test]
    fn external_command_snippet_reaches_every_backend_once() {
        let (command, automaton) = compile("cmd {{{ echo hello }}};");
        assert!(automaton.has_commands());
        assert_eq!(automaton.commands.len(), 1);
        for shell in ALL_SHELLS {
            let script = shell.completion_script(&command, &automaton).unwrap();
            assert_eq!(
                script.matches("echo hello").count(),
                1,
                "{} must wire the snippet into exactly one invocation branch",
                shell.name()
            );
        }
    }
}
