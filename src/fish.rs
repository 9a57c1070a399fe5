use std::io::Write;

use hashbrown::HashMap;
use indexmap::{IndexMap, IndexSet};
use ustr::{Ustr, ustr};

use crate::automaton::Automaton;
use crate::quoting::{make_string_constant, make_word_list};
use crate::{Result, Shell, StateId};

// * array indices start at 1 in fish, not 0 (!)
// * --local limits the scope of a varible to the innermost block (!), not the function (!).
// * Unlike in other shells, scoping *is not* dynamic in fish!  It's lexical-ish!
// * Metaprogramming:
//   1) $$var_name (https://fishshell.com/docs/current/language.html#dereferencing-variables)
//   2) printf [...] | source
// * echo foo:$bar prints nothing if $bar expands to an empty string (!)

pub const ARRAY_START: u32 = 1;

pub const MATCH_FN_NAME: &str = "__tabgen_match";

fn quoted(s: &str) -> String {
    make_string_constant(Shell::Fish, s)
}

fn write_match_fn<W: Write>(output: &mut W) -> Result<()> {
    // Unzip candidates from stdin into two arrays -- candidates and descriptions
    writeln!(
        output,
        r#"function {MATCH_FN_NAME}
    set prefix $argv[1]

    set candidates
    set descriptions
    while read c
        set a (string split --max 1 -- "	" $c)
        set --append candidates $a[1]
        if set --query a[2]
            set --append descriptions $a[2]
        else
            set --append descriptions ""
        end
    end

    if test -z "$candidates"
        return 1
    end

    set escaped_prefix (string escape --style=regex -- $prefix)
    set regex "^$escaped_prefix.*"

    set matches_case_sensitive
    set descriptions_case_sensitive
    for i in (seq 1 (count $candidates))
        if string match --regex --quiet --entire -- $regex $candidates[$i]
            set --append matches_case_sensitive $candidates[$i]
            set --append descriptions_case_sensitive $descriptions[$i]
        end
    end

    if set --query matches_case_sensitive[1]
        for i in (seq 1 (count $matches_case_sensitive))
            printf '%s	%s\n' $matches_case_sensitive[$i] $descriptions_case_sensitive[$i]
        end
        return 0
    end

    set matches_case_insensitive
    set descriptions_case_insensitive
    for i in (seq 1 (count $candidates))
        if string match --regex --quiet --ignore-case --entire -- $regex $candidates[$i]
            set --append matches_case_insensitive $candidates[$i]
            set --append descriptions_case_insensitive $descriptions[$i]
        end
    end

    if set --query matches_case_insensitive[1]
        for i in (seq 1 (count $matches_case_insensitive))
            printf '%s	%s\n' $matches_case_insensitive[$i] $descriptions_case_insensitive[$i]
        end
        return 0
    end

    return 1
end
"#
    )?;

    Ok(())
}

fn write_invocation_fn<W: Write>(
    buffer: &mut W,
    command: &str,
    automaton: &Automaton,
) -> Result<()> {
    // `set 1 $argv[2]` keeps the `$1` convention snippets are written against.  The default case
    // is always present, even with an empty command table.
    writeln!(
        buffer,
        r#"function _{command}_invoke
    set command_id $argv[1]
    set 1 $argv[2]
    switch $command_id"#
    )?;
    for (id, cmd) in automaton.commands.iter().enumerate() {
        writeln!(
            buffer,
            r#"        case {id}
            {cmd}"#
        )?;
    }
    writeln!(
        buffer,
        r#"        case '*'
    end
end
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
        .map(|(id, literal, description)| ((*literal, *description), *id))
        .collect();
    let literals = make_word_list(
        Shell::Fish,
        all_literals
            .iter()
            .map(|(_, literal, _)| quoted(literal)),
    );
    writeln!(buffer, r#"    set literals {literals}"#)?;

    // Use dummy value as 0th element due to fish arrays starting at 1
    let descrs: IndexSet<Ustr> = std::iter::once(ustr(""))
        .chain(
            all_literals
                .iter()
                .map(|(_, _, descr)| *descr)
                .filter(|d| !d.is_empty()),
        )
        .collect();
    writeln!(buffer, r#"    set descrs"#)?;
    for descr in &descrs {
        if descr.is_empty() {
            continue;
        }
        let id = descrs.get_index_of(descr).unwrap();
        writeln!(buffer, r#"    set descrs[{id}] {}"#, quoted(descr))?;
    }

    let descr_id_from_literal_id: IndexMap<usize, usize> = all_literals
        .iter()
        .filter_map(|(id, _, description)| descrs.get_index_of(description).map(|d| (*id, d)))
        .filter(|(_, d)| *d > 0)
        .collect();
    let descr_literal_ids = make_word_list(
        Shell::Fish,
        descr_id_from_literal_id
            .keys()
            .map(|literal_id| format!("{literal_id}")),
    );
    writeln!(buffer, r#"    set descr_literal_ids {descr_literal_ids}"#)?;
    let descr_ids = make_word_list(
        Shell::Fish,
        descr_id_from_literal_id
            .values()
            .map(|descr_id| format!("{descr_id}")),
    );
    writeln!(buffer, r#"    set descr_ids {descr_ids}"#)?;

    let regexes = automaton.get_all_regexes();
    let regexes_initializer =
        make_word_list(Shell::Fish, regexes.iter().map(|regex| quoted(regex)));
    writeln!(buffer, r#"    set regexes {regexes_initializer}"#)?;

    writeln!(buffer, r#"    set literal_transitions_inputs"#)?;
    for state in automaton.get_all_states() {
        let literal_transitions = automaton.get_literal_transitions_from(state as StateId);
        if literal_transitions.is_empty() {
            continue;
        }
        let transitions: Vec<(usize, StateId)> = literal_transitions
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
        let state_inputs: String = itertools::join(
            transitions
                .iter()
                .map(|(literal_id, _)| format!("{literal_id}")),
            " ",
        );
        writeln!(
            buffer,
            r#"    set literal_transitions_inputs[{}] {}"#,
            state + ARRAY_START,
            quoted(&state_inputs),
        )?;
        let state_tos: String = itertools::join(
            transitions
                .iter()
                .map(|(_, to)| format!("{}", to + ARRAY_START)),
            " ",
        );
        writeln!(
            buffer,
            r#"    set literal_transitions_tos[{}] {}"#,
            state + ARRAY_START,
            quoted(&state_tos),
        )?;
    }

    writeln!(buffer, r#"    set regex_transitions_ids"#)?;
    for state in automaton.get_all_states() {
        let regex_transitions = automaton.get_regex_transitions_from(state as StateId);
        if regex_transitions.is_empty() {
            continue;
        }
        let ids: String = itertools::join(
            regex_transitions.iter().map(|(pattern, _)| {
                let regex_id = regexes.iter().position(|rx| rx == pattern).unwrap();
                format!("{}", regex_id + ARRAY_START as usize)
            }),
            " ",
        );
        writeln!(
            buffer,
            r#"    set regex_transitions_ids[{}] {}"#,
            state + ARRAY_START,
            quoted(&ids),
        )?;
        let tos: String = itertools::join(
            regex_transitions
                .iter()
                .map(|(_, to)| format!("{}", to + ARRAY_START)),
            " ",
        );
        writeln!(
            buffer,
            r#"    set regex_transitions_tos[{}] {}"#,
            state + ARRAY_START,
            quoted(&tos),
        )?;
    }

    writeln!(buffer, r#"    set command_transitions_ids"#)?;
    for state in automaton.get_all_states() {
        let command_transitions = automaton.get_command_transitions_from(state as StateId);
        if command_transitions.is_empty() {
            continue;
        }
        let ids: String = itertools::join(
            command_transitions
                .iter()
                .map(|(command_id, _)| format!("{command_id}")),
            " ",
        );
        writeln!(
            buffer,
            r#"    set command_transitions_ids[{}] {}"#,
            state + ARRAY_START,
            quoted(&ids),
        )?;
        let tos: String = itertools::join(
            command_transitions
                .iter()
                .map(|(_, to)| format!("{}", to + ARRAY_START)),
            " ",
        );
        writeln!(
            buffer,
            r#"    set command_transitions_tos[{}] {}"#,
            state + ARRAY_START,
            quoted(&tos),
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
    write_match_fn(buffer)?;

    write!(buffer, r#"function _{command}"#)?;

    write!(
        buffer,
        r#"
    set COMP_LINE (commandline --cut-at-cursor)

    set COMP_WORDS
    echo $COMP_LINE | read --tokenize --array COMP_WORDS
    if string match --quiet --regex '.*\s$' $COMP_LINE
        set COMP_CWORD (math (count $COMP_WORDS) + 1)
    else
        set COMP_CWORD (count $COMP_WORDS)
    end

"#
    )?;

    write_lookup_tables(buffer, automaton)?;

    write!(
        buffer,
        r#"
    set state {starting_state}
    set word_index 2
    while test $word_index -lt $COMP_CWORD
        set -- word $COMP_WORDS[$word_index]

        if set --query literal_transitions_inputs[$state] && test -n $literal_transitions_inputs[$state]
            set inputs (string split ' ' $literal_transitions_inputs[$state])
            set tos (string split ' ' $literal_transitions_tos[$state])

            set word_matched 0
            for i in (seq 1 (count $inputs))
                if test "$literals[$inputs[$i]]" = "$word"
                    set state $tos[$i]
                    set word_index (math $word_index + 1)
                    set word_matched 1
                    break
                end
            end
            if test $word_matched -ne 0
                continue
            end
        end

        if set --query regex_transitions_ids[$state] && test -n $regex_transitions_ids[$state]
            set ids (string split ' ' $regex_transitions_ids[$state])
            set tos (string split ' ' $regex_transitions_tos[$state])

            set regex_matched 0
            for i in (seq 1 (count $ids))
                set pattern $regexes[$ids[$i]]
                if string match --quiet --regex -- "^($pattern)$" $word
                    set state $tos[$i]
                    set word_index (math $word_index + 1)
                    set regex_matched 1
                    break
                end
            end
            if test $regex_matched -ne 0
                continue
            end
        end

        if set --query command_transitions_tos[$state] && test -n $command_transitions_tos[$state]
            set tos (string split ' ' $command_transitions_tos[$state])
            set state $tos[1]
            set word_index (math $word_index + 1)
            continue
        end

        return 1
    end

    set candidates

    if set --query literal_transitions_inputs[$state] && test -n $literal_transitions_inputs[$state]
        set inputs (string split ' ' $literal_transitions_inputs[$state])
        for literal_id in $inputs
            set descr_index (contains --index -- "$literal_id" $descr_literal_ids)
            if test -n "$descr_index"
                set --append candidates (printf '%s\t%s\n' $literals[$literal_id] $descrs[$descr_ids[$descr_index]])
            else
                set --append candidates (printf '%s\n' $literals[$literal_id])
            end
        end
    end

    if set --query regex_transitions_ids[$state] && test -n $regex_transitions_ids[$state]
        set ids (string split ' ' $regex_transitions_ids[$state])
        for regex_id in $ids
            set --append candidates (printf '%s\n' $regexes[$regex_id])
        end
    end

    if set --query command_transitions_ids[$state] && test -n $command_transitions_ids[$state]
        set ids (string split ' ' $command_transitions_ids[$state])
        for command_id in $ids
            set --append candidates (_{command}_invoke $command_id "$COMP_WORDS[$word_index]")
        end
    end

    printf '%s\n' $candidates | {MATCH_FN_NAME} "$COMP_WORDS[$word_index]" && return 0
end
"#,
        starting_state = automaton.starting_state + ARRAY_START
    )?;

    writeln!(buffer, r#"complete --erase {command}"#)?;
    writeln!(
        buffer,
        r#"complete --command {command} --no-files --arguments "(_{command})""#
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
    fn registers_completion_function() {
        let script = emit("cmd foo bar;");
        assert!(script.contains("complete --erase cmd"));
        assert!(script.contains(r#"complete --command cmd --no-files --arguments "(_cmd)""#));
    }

    #[test]
    fn emits_all_sections_without_commands() {
        let script = emit("cmd --help;");
        assert!(script.contains("function _cmd_invoke"));
        assert!(script.contains("switch $command_id"));
        assert!(script.contains("case '*'"));
        assert!(script.contains("set literals --help"));
        assert!(script.contains("set descrs"));
    }

    #[test]
    fn invocation_section_has_one_branch_per_command() {
        let script = emit("cmd ({{{ git tag }}} | {{{ git branch }}});");
        assert!(script.contains("case 0\n            git tag"));
        assert!(script.contains("case 1\n            git branch"));
    }

    #[test]
    fn descriptions_use_one_based_tables() {
        let script = emit(r#"cmd (foo "d1" | bar "d2");"#);
        assert!(script.contains("set descrs[1] d1"));
        assert!(script.contains("set descrs[2] d2"));
        assert!(script.contains("set descr_literal_ids 1 2"));
    }

    #[test]
    fn candidate_lists_are_escaped() {
        let script = emit(r#"cmd mv\;cp;"#);
        assert!(script.contains(r#"set literals "mv;cp""#));
    }

    #[test]
    fn match_helper_is_defined_once() {
        let script = emit("cmd foo;");
        assert_eq!(script.matches("function __tabgen_match").count(), 1);
    }
}
