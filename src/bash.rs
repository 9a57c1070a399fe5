use std::io::Write;

use hashbrown::HashMap;
use ustr::{Ustr, ustr};

use crate::automaton::Automaton;
use crate::quoting::{make_string_constant, make_word_list};
use crate::{Result, Shell, StateId};

// Bash array indexes start at 0.
// Associative arrays are local by default.
// Bash uses *dynamic* scoping for local variables (!)

fn write_invocation_fn<W: Write>(
    buffer: &mut W,
    command: &str,
    automaton: &Automaton,
) -> Result<()> {
    // The case dispatch exists even with no external commands so that consumers can rely on the
    // section being present.
    writeln!(
        buffer,
        r#"_{command}_invoke () {{
    local command_id=$1
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
        .map(|(id, (literal, description))| (id, literal, description.unwrap_or(ustr(""))))
        .collect();

    let literal_id_from_input_description: HashMap<(Ustr, Ustr), usize> = all_literals
        .iter()
        .map(|(id, input, description)| ((*input, *description), *id))
        .collect();
    let literals = make_word_list(
        Shell::Bash,
        all_literals
            .iter()
            .map(|(_, literal, _)| make_string_constant(Shell::Bash, literal)),
    );
    writeln!(buffer, r#"    declare -a literals=({literals})"#)?;

    writeln!(buffer, r#"    declare -A descriptions=()"#)?;
    for (id, _, description) in &all_literals {
        if description.is_empty() {
            continue;
        }
        let quoted = make_string_constant(Shell::Bash, description);
        writeln!(buffer, r#"    descriptions[{id}]={quoted}"#)?;
    }

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
                .map(|(input, to)| format!("[{input}]={to}")),
            " ",
        );
        writeln!(
            buffer,
            r#"    literal_transitions[{state}]="({state_transitions})""#
        )?;
    }

    let regexes = automaton.get_all_regexes();
    let regexes_initializer = make_word_list(
        Shell::Bash,
        regexes
            .iter()
            .map(|regex| make_string_constant(Shell::Bash, regex)),
    );
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
                format!("[{regex_id}]={to}")
            }),
            " ",
        );
        writeln!(
            buffer,
            r#"    regex_transitions[{state}]="({state_transitions})""#
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
                .map(|(command_id, to)| format!("[{command_id}]={to}")),
            " ",
        );
        writeln!(
            buffer,
            r#"    command_transitions[{state}]="({state_transitions})""#
        )?;
    }

    Ok(())
}

pub fn write_completion_script<W: Write>(
    buffer: &mut W,
    command: &str,
    automaton: &Automaton,
) -> Result<()> {
    write_invocation_fn(buffer, command, automaton)?;

    write!(buffer, r#"_{command} () {{"#)?;

    writeln!(
        buffer,
        r#"
    if [[ $(type -t _get_comp_words_by_ref) != function ]]; then
        echo _get_comp_words_by_ref: function not defined.  Make sure the bash-completions system package is installed
        return 1
    fi

    local words cword
    _get_comp_words_by_ref -n "$COMP_WORDBREAKS" words cword
"#
    )?;

    write_lookup_tables(buffer, automaton)?;

    write!(
        buffer,
        r#"
    local state={starting_state}
    local word_index=1
    while [[ $word_index -lt $cword ]]; do
        local word=${{words[$word_index]}}

        if [[ -v "literal_transitions[$state]" ]]; then
            declare -A state_transitions
            eval "state_transitions=${{literal_transitions[$state]}}"

            local word_matched=0
            for literal_id in $(seq 0 $((${{#literals[@]}} - 1))); do
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
            declare -A state_transitions
            eval "state_transitions=${{regex_transitions[$state]}}"

            local regex_matched=0
            for regex_id in "${{!state_transitions[@]}}"; do
                if [[ $word =~ ^(${{regexes[$regex_id]}})$ ]]; then
                    state=${{state_transitions[$regex_id]}}
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
            declare -A state_transitions
            eval "state_transitions=${{command_transitions[$state]}}"

            local command_matched=0
            for command_id in "${{!state_transitions[@]}}"; do
                state=${{state_transitions[$command_id]}}
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

    local prefix="${{words[$cword]}}"
    local -a matches=()

    if [[ -v "literal_transitions[$state]" ]]; then
        declare -A state_transitions
        eval "state_transitions=${{literal_transitions[$state]}}"
        for literal_id in "${{!state_transitions[@]}}"; do
            local literal="${{literals[$literal_id]}}"
            if [[ $literal = "${{prefix}}"* ]]; then
                matches+=("$literal ")
            fi
        done
    fi

    if [[ -v "regex_transitions[$state]" ]]; then
        declare -A state_transitions
        eval "state_transitions=${{regex_transitions[$state]}}"
        for regex_id in "${{!state_transitions[@]}}"; do
            matches+=("${{regexes[$regex_id]}}")
        done
    fi

    if [[ -v "command_transitions[$state]" ]]; then
        declare -A state_transitions
        eval "state_transitions=${{command_transitions[$state]}}"
        for command_id in "${{!state_transitions[@]}}"; do
            local completions=()
            readarray -t completions < <(_{command}_invoke "$command_id" "$prefix" | cut -f1)
            for item in "${{completions[@]}}"; do
                if [[ $item = "${{prefix}}"* ]]; then
                    matches+=("$item")
                fi
            done
        done
    fi

    if [[ ${{#matches[@]}} -gt 0 ]]; then
        local shortest_suffix="$prefix"
        for ((i=0; i < ${{#COMP_WORDBREAKS}}; i++)); do
            local char="${{COMP_WORDBREAKS:$i:1}}"
            local candidate=${{prefix##*$char}}
            if [[ ${{#candidate}} -lt ${{#shortest_suffix}} ]]; then
                shortest_suffix=$candidate
            fi
        done
        local superfluous_prefix=""
        if [[ "$shortest_suffix" != "$prefix" ]]; then
            local superfluous_prefix=${{prefix%$shortest_suffix}}
        fi
        COMPREPLY=("${{matches[@]#$superfluous_prefix}}")
    fi

    return 0
}}

complete -o nospace -F _{command} {command}
"#,
        starting_state = automaton.starting_state
    )?;

    Ok(())
}
