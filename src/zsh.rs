use std::io::Write;

use hashbrown::HashMap;
use indexmap::{IndexMap, IndexSet};
use ustr::{Ustr, ustr};

use crate::automaton::Automaton;
use crate::quoting::{make_string_constant, make_word_list};
use crate::{Result, Shell, StateId};

// Array indexes in ZSH start from 1 (!)
// `for i in {1..$#array}; do ...; done` loops do not behave well if array is empty!  Prefer i++
// loops instead.
// Zsh uses *dynamic* scoping for local variables, even if declared with 'local', hence 'declare'
// is used as slightly less misleading (!)

pub const ARRAY_START: u32 = 1;

fn quoted(s: &str) -> String {
    make_string_constant(Shell::Zsh, s)
}

fn write_invocation_fn<W: Write>(
    buffer: &mut W,
    command: &str,
    automaton: &Automaton,
) -> Result<()> {
    // `shift` restores the `$1 == current word` convention the snippets are written against.
    writeln!(
        buffer,
        r#"_{command}_invoke () {{
    declare command_id=$1
    shift
    case $command_id in"#
    )?;
    for (id, cmd) in automaton.commands.iter().enumerate() {
        writeln!(
            buffer,
            r#"        {id})
            {cmd}
            ;;"#
        )?;
    }
    writeln!(
        buffer,
        r#"        *)
            ;;
    esac
}}
"#
    )?;
    Ok(())
}

fn write_lookup_tables<W: Write>(
    buffer: &mut W,
    automaton: &Automaton,
) -> Result<()> {
    let all_literals: Vec<(usize, Ustr, Ustr)> = automaton
        .get_all_literals()
        .into_iter()
        .enumerate()
        .map(|(id, (literal, description))| {
            (
                id + ARRAY_START as usize,
                literal,
                description.unwrap_or(ustr("")),
            )
        })
        .collect();

    let literal_id_from_input_description: HashMap<(Ustr, Ustr), usize> = all_literals
        .iter()
        .map(|(id, input, description)| ((*input, *description), *id))
        .collect();
    let literals = make_word_list(
        Shell::Zsh,
        all_literals
            .iter()
            .map(|(_, literal, _)| quoted(literal)),
    );
    writeln!(buffer, r#"    declare -a literals=({literals})"#)?;

    let descrs: IndexSet<Ustr> = all_literals
        .iter()
        .map(|(_, _, descr)| *descr)
        .filter(|d| !d.is_empty())
        .collect();
    writeln!(buffer, r#"    declare -A descrs=()"#)?;
    for descr in &descrs {
        let id = descrs.get_index_of(descr).unwrap();
        writeln!(buffer, r#"    descrs[{id}]={}"#, quoted(descr))?;
    }

    let descr_id_from_literal_id: IndexMap<usize, usize> = all_literals
        .iter()
        .filter_map(|(id, _, description)| descrs.get_index_of(description).map(|d| (*id, d)))
        .collect();
    let initializer = make_word_list(
        Shell::Zsh,
        descr_id_from_literal_id
            .iter()
            .map(|(literal_id, descr_id)| format!("[{literal_id}]={descr_id}")),
    );
    writeln!(
        buffer,
        r#"    declare -A descr_id_from_literal_id=({initializer})"#
    )?;

    writeln!(buffer, r#"    declare -A literal_transitions=()"#)?;
    for state in automaton.get_all_states() {
        let literal_transitions = automaton.get_literal_transitions_from(state as StateId);
        if literal_transitions.is_empty() {
            continue;
        }
        let literal_transitions: Vec<(usize, StateId)> = literal_transitions
            .into_iter()
            .map(|(input, description, to)| {
                (
                    *literal_id_from_input_description
                        .get(&(input, description))
                        .unwrap(),
                    to,
                )
            })
            .collect();
        let state_transitions: String = itertools::join(
            literal_transitions
                .into_iter()
                .map(|(input, to)| format!("[{input}]={}", to + ARRAY_START)),
            " ",
        );
        writeln!(
            buffer,
            r#"    literal_transitions[{}]="({state_transitions})""#,
            state + ARRAY_START
        )?;
    }

    let regexes = automaton.get_all_regexes();
    let regexes_initializer =
        make_word_list(Shell::Zsh, regexes.iter().map(|regex| quoted(regex)));
    writeln!(buffer, r#"    declare -a regexes=({regexes_initializer})"#)?;

    writeln!(buffer, r#"    declare -A regex_transitions=()"#)?;
    for state in automaton.get_all_states() {
        let regex_transitions = automaton.get_regex_transitions_from(state as StateId);
        if regex_transitions.is_empty() {
            continue;
        }
        let state_transitions: String = itertools::join(
            regex_transitions.into_iter().map(|(pattern, to)| {
                let regex_id = regexes.iter().position(|rx| *rx == pattern).unwrap();
                format!(
                    "[{}]={}",
                    regex_id + ARRAY_START as usize,
                    to + ARRAY_START
                )
            }),
            " ",
        );
        writeln!(
            buffer,
            r#"    regex_transitions[{}]="({state_transitions})""#,
            state + ARRAY_START
        )?;
    }

    writeln!(buffer, r#"    declare -A command_transitions=()"#)?;
    for state in automaton.get_all_states() {
        let command_transitions = automaton.get_command_transitions_from(state as StateId);
        if command_transitions.is_empty() {
            continue;
        }
        let state_transitions: String = itertools::join(
            command_transitions
                .into_iter()
                .map(|(command_id, to)| format!("[{command_id}]={}", to + ARRAY_START)),
            " ",
        );
        writeln!(
            buffer,
            r#"    command_transitions[{}]="({state_transitions})""#,
            state + ARRAY_START
        )?;
    }

    Ok(())
}

pub fn write_completion_script<W: Write>(
    buffer: &mut W,
    command: &str,
    automaton: &Automaton,
) -> Result<()> {
    writeln!(
        buffer,
        r#"#compdef {command}
"#
    )?;

    write_invocation_fn(buffer, command, automaton)?;

    writeln!(buffer, r#"_{command} () {{"#)?;

    write_lookup_tables(buffer, automaton)?;

    write!(
        buffer,
        r#"
    declare state={starting_state}
    declare word_index=2
    while [[ $word_index -lt $CURRENT ]]; do
        declare word=${{words[$word_index]}}

        if [[ -v "literal_transitions[$state]" ]]; then
            eval "declare -A state_transitions=${{literal_transitions[$state]}}"

            declare word_matched=0
            for ((literal_id = 1; literal_id <= $#literals; literal_id++)); do
                if [[ ${{literals[$literal_id]}} = "$word" ]]; then
                    if [[ -v "state_transitions[$literal_id]" ]]; then
                        state=${{state_transitions[$literal_id]}}
                        word_index=$((word_index + 1))
                        word_matched=1
                        break
                    fi
                fi
            done
            if [[ $word_matched -ne 0 ]]; then
                continue
            fi
        fi

        if [[ -v "regex_transitions[$state]" ]]; then
            eval "declare -A state_regexes=${{regex_transitions[$state]}}"

            declare regex_matched=0
            for regex_id in "${{(k)state_regexes}}"; do
                declare regex="^(${{regexes[$regex_id]}})$"
                if [[ $word =~ $regex ]]; then
                    state=${{state_regexes[$regex_id]}}
                    word_index=$((word_index + 1))
                    regex_matched=1
                    break
                fi
            done
            if [[ $regex_matched -ne 0 ]]; then
                continue
            fi
        fi

        if [[ -v "command_transitions[$state]" ]]; then
            eval "declare -A state_commands=${{command_transitions[$state]}}"

            declare command_matched=0
            for command_id in "${{(k)state_commands}}"; do
                state=${{state_commands[$command_id]}}
                word_index=$((word_index + 1))
                command_matched=1
                break
            done
            if [[ $command_matched -ne 0 ]]; then
                continue
            fi
        fi

        return 1
    done

    completions_no_description_trailing_space=()
    completions_trailing_space=()
    suffixes_trailing_space=()
    descriptions_trailing_space=()
    matches=()

    if [[ -v "literal_transitions[$state]" ]]; then
        eval "declare -A state_transitions=${{literal_transitions[$state]}}"
        for literal_id in "${{(k)state_transitions}}"; do
            if [[ -v "descr_id_from_literal_id[$literal_id]" ]]; then
                declare descr_id=$descr_id_from_literal_id[$literal_id]
                completions_trailing_space+=("${{literals[$literal_id]}}")
                suffixes_trailing_space+=("${{literals[$literal_id]}}")
                descriptions_trailing_space+=("${{descrs[$descr_id]}}")
            else
                completions_no_description_trailing_space+=("${{literals[$literal_id]}}")
            fi
        done
    fi

    if [[ -v "regex_transitions[$state]" ]]; then
        eval "declare -A state_regexes=${{regex_transitions[$state]}}"
        for regex_id in "${{(k)state_regexes}}"; do
            completions_no_description_trailing_space+=("${{regexes[$regex_id]}}")
        done
    fi

    if [[ -v "command_transitions[$state]" ]]; then
        eval "declare -A state_commands=${{command_transitions[$state]}}"
        for command_id in "${{(k)state_commands}}"; do
            declare output=$(_{command}_invoke "$command_id" "${{words[$CURRENT]}}")
            declare -a command_completions=("${{(@f)output}}")
            for line in ${{command_completions[@]}}; do
                declare parts=(${{(@s:	:)line}})
                if [[ -v "parts[2]" ]]; then
                    completions_trailing_space+=("${{parts[1]}}")
                    suffixes_trailing_space+=("${{parts[1]}}")
                    descriptions_trailing_space+=("${{parts[2]}}")
                else
                    completions_no_description_trailing_space+=("$line")
                fi
            done
        done
    fi

    declare maxlen=0
    for suffix in ${{suffixes_trailing_space[@]}}; do
        if [[ ${{#suffix}} -gt $maxlen ]]; then
            maxlen=${{#suffix}}
        fi
    done

    for ((i = 1; i <= $#suffixes_trailing_space; i++)); do
        if [[ -z ${{descriptions_trailing_space[$i]}} ]]; then
            descriptions_trailing_space[$i]="${{(r($maxlen)( ))${{suffixes_trailing_space[$i]}}}}"
        else
            descriptions_trailing_space[$i]="${{(r($maxlen)( ))${{suffixes_trailing_space[$i]}}}} -- ${{descriptions_trailing_space[$i]}}"
        fi
    done

    compadd -O m -a completions_no_description_trailing_space; matches+=("${{m[@]}}")
    compadd -O m -a completions_trailing_space; matches+=("${{m[@]}}")

    if [[ ${{#matches}} -gt 0 ]]; then
        compadd -Q -a completions_no_description_trailing_space
        compadd -l -Q -a -d descriptions_trailing_space completions_trailing_space
        return 0
    fi
}}
"#,
        starting_state = automaton.starting_state + ARRAY_START
    )?;

    write!(
        buffer,
        r#"
if [[ $ZSH_EVAL_CONTEXT =~ :file$ ]]; then
    compdef _{command} {command}
else
    _{command}
fi
"#
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::{Grammar, ValidGrammar};

    fn emit(input: &str) -> String {
        let grammar = Grammar::parse(input).unwrap();
        let validated = ValidGrammar::from_grammar(grammar).unwrap();
        let automaton = Automaton::from_grammar(&validated);
        let mut buffer: Vec<u8> = Default::default();
        write_completion_script(&mut buffer, validated.command.as_str(), &automaton).unwrap();
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn registers_via_compdef() {
        let script = emit("cmd foo;");
        assert!(script.starts_with("#compdef cmd"));
        assert!(script.contains("compdef _cmd cmd"));
    }

    #[test]
    fn emits_all_sections_without_commands() {
        let script = emit("cmd --help;");
        assert!(script.contains("_cmd_invoke ()"));
        assert!(script.contains("case $command_id in"));
        assert!(script.contains(r#"declare -a literals=("--help")"#));
        assert!(script.contains("declare -A descrs=()"));
        assert!(script.contains("declare -A command_transitions=()"));
    }

    #[test]
    fn tables_are_one_based() {
        let script = emit("cmd foo bar;");
        assert!(script.contains(r#"literal_transitions[1]="#));
        assert!(script.contains("declare state=1"));
    }

    #[test]
    fn descriptions_feed_compadd_displays() {
        let script = emit(r#"cmd (foo "d1" | bar "d2");"#);
        assert!(script.contains(r#"descrs[0]="d1""#));
        assert!(script.contains(r#"descrs[1]="d2""#));
        assert!(script.contains("compadd -l -Q -a -d descriptions_trailing_space"));
    }

    #[test]
    fn invocation_section_has_one_branch_per_command() {
        let script = emit("cmd {{{ echo hello }}};");
        assert!(script.contains("        0)\n            echo hello"));
        assert!(script.contains("_cmd_invoke"));
    }

    #[test]
    fn strings_are_always_quoted() {
        let script = emit(r#"cmd foo "pay $5";"#);
        assert!(script.contains(r#""pay \$5""#));
    }
}
