use std::io::Write;

use hashbrown::HashMap;
use ustr::{Ustr, ustr};

use crate::automaton::Automaton;
use crate::quoting::make_string_constant;
use crate::{Result, Shell, StateId};

// PowerShell array indexes start at 0 (like Bash).
// Strings are single-quoted: inside them only '' needs care, and $, backticks and double quotes
// stay inert.

pub const ARRAY_START: u32 = 0;

fn quoted(s: &str) -> String {
    make_string_constant(Shell::Pwsh, s)
}

fn write_invocation_fn<W: Write>(buffer: &mut W, automaton: &Automaton) -> Result<()> {
    // The switch covers every external command id; the default branch is present even when the
    // command table is empty so the script shape never changes.
    writeln!(
        buffer,
        r#"function Invoke-Command {{
    param([int]$CommandId, [string]$CurrentWord)
    switch ($CommandId) {{"#
    )?;
    for (id, cmd) in automaton.commands.iter().enumerate() {
        let cmd = cmd.trim();
        // Snippets are written against the `$1 == current word` convention of the other shells.
        let cmd = cmd.replace("$1", "$CurrentWord");
        let cmd = if cmd.is_empty() {
            "# empty command".to_string()
        } else {
            cmd
        };
        writeln!(
            buffer,
            r#"        {id} {{
            {cmd}
        }}"#
        )?;
    }
    writeln!(
        buffer,
        r#"        default {{ return @() }}
    }}
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

    // Write literals array; the last element never gets a trailing comma.
    if all_literals.is_empty() {
        writeln!(buffer, r#"    $literals = @()"#)?;
    } else {
        writeln!(buffer, r#"    $literals = @("#)?;
        for (index, (_, literal, _)) in all_literals.iter().enumerate() {
            let separator = if index + 1 == all_literals.len() { "" } else { "," };
            writeln!(buffer, r#"        {}{separator}"#, quoted(literal))?;
        }
        writeln!(buffer, r#"    )"#)?;
    }

    writeln!(buffer, r#"    $descriptions = @{{}}"#)?;
    for (id, _, description) in &all_literals {
        if description.is_empty() {
            continue;
        }
        writeln!(buffer, r#"    $descriptions[{id}] = {}"#, quoted(description))?;
    }

    writeln!(buffer, r#"    $literal_transitions = @{{}}"#)?;
    for state in automaton.get_all_states() {
        let literal_transitions = automaton.get_literal_transitions_from(state as StateId);
        if literal_transitions.is_empty() {
            continue;
        }
        let literal_transitions: Vec<(usize, StateId)> = literal_transitions
            .into_iter()
            .map(|(literal, description, to)| {
                (
                    *literal_id_from_input_description
                        .get(&(literal, description))
                        .unwrap(),
                    to,
                )
            })
            .collect();
        let state_literal_transitions: String = itertools::join(
            literal_transitions
                .into_iter()
                .map(|(literal_id, to)| format!("{literal_id} = {to}")),
            "; ",
        );
        writeln!(
            buffer,
            r#"    $literal_transitions[{state}] = @{{ {state_literal_transitions} }}"#
        )?;
    }

    let regexes = automaton.get_all_regexes();
    if regexes.is_empty() {
        writeln!(buffer, r#"    $regexes = @()"#)?;
    } else {
        writeln!(buffer, r#"    $regexes = @("#)?;
        for (index, regex) in regexes.iter().enumerate() {
            let separator = if index + 1 == regexes.len() { "" } else { "," };
            writeln!(buffer, r#"        {}{separator}"#, quoted(regex))?;
        }
        writeln!(buffer, r#"    )"#)?;
    }

    writeln!(buffer, r#"    $regex_transitions = @{{}}"#)?;
    for state in automaton.get_all_states() {
        let regex_transitions = automaton.get_regex_transitions_from(state as StateId);
        if regex_transitions.is_empty() {
            continue;
        }
        let state_regex_transitions: String = itertools::join(
            regex_transitions.into_iter().map(|(pattern, to)| {
                let regex_id = regexes.iter().position(|rx| *rx == pattern).unwrap();
                format!("{regex_id} = {to}")
            }),
            "; ",
        );
        writeln!(
            buffer,
            r#"    $regex_transitions[{state}] = @{{ {state_regex_transitions} }}"#
        )?;
    }

    writeln!(buffer, r#"    $command_transitions = @{{}}"#)?;
    for state in automaton.get_all_states() {
        let command_transitions = automaton.get_command_transitions_from(state as StateId);
        if command_transitions.is_empty() {
            continue;
        }
        let state_command_transitions: String = itertools::join(
            command_transitions
                .into_iter()
                .map(|(command_id, to)| format!("{command_id} = {to}")),
            "; ",
        );
        writeln!(
            buffer,
            r#"    $command_transitions[{state}] = @{{ {state_command_transitions} }}"#
        )?;
    }

    Ok(())
}

pub fn write_completion_script<W: Write>(
    buffer: &mut W,
    command: &str,
    automaton: &Automaton,
) -> Result<()> {
    write!(
        buffer,
        r#"# {command} completion script generated by tabgen
# Requires PowerShell 7.0 or later

"#
    )?;

    write_invocation_fn(buffer, automaton)?;

    writeln!(
        buffer,
        r#"Register-ArgumentCompleter -Native -CommandName {} -ScriptBlock {{"#,
        quoted(command)
    )?;

    writeln!(
        buffer,
        r#"    param($wordToComplete, $commandAst, $cursorPosition)

    # Parse command line into words
    $words = @($commandAst.CommandElements | ForEach-Object {{ $_.Extent.Text }})
    $lastElement = $commandAst.CommandElements[-1]
    # Determine current word index: if cursor is past the last element (trailing space),
    # we're completing a new word; otherwise we're completing the current word
    $cword = if ($words.Count -eq 0 -or $cursorPosition -gt $lastElement.Extent.EndOffset) {{ $words.Count }} else {{ $words.Count - 1 }}
"#
    )?;

    write_lookup_tables(buffer, automaton)?;

    write!(
        buffer,
        r#"
    $state = {starting_state}
    $word_index = 1
    while ($word_index -lt $cword) {{
        $word = $words[$word_index]

        if ($literal_transitions.ContainsKey($state)) {{
            $state_transitions = $literal_transitions[$state]

            $word_matched = $false
            for ($literal_id = 0; $literal_id -lt $literals.Count; $literal_id++) {{
                if ($literals[$literal_id] -ceq $word) {{
                    if ($state_transitions.ContainsKey($literal_id)) {{
                        $state = $state_transitions[$literal_id]
                        $word_index++
                        $word_matched = $true
                        break
                    }}
                }}
            }}
            if ($word_matched) {{
                continue
            }}
        }}

        if ($regex_transitions.ContainsKey($state)) {{
            $state_regexes = $regex_transitions[$state]

            $regex_matched = $false
            foreach ($regex_id in $state_regexes.Keys) {{
                $regex = $regexes[$regex_id]
                if ($word -match "^($regex)$") {{
                    $state = $state_regexes[$regex_id]
                    $word_index++
                    $regex_matched = $true
                    break
                }}
            }}
            if ($regex_matched) {{
                continue
            }}
        }}

        if ($command_transitions.ContainsKey($state)) {{
            $state_commands = $command_transitions[$state]
            foreach ($command_id in $state_commands.Keys) {{
                $state = $state_commands[$command_id]
                break
            }}
            $word_index++
            continue
        }}

        # No valid transition found
        return
    }}

    $prefix = if ($cword -lt $words.Count) {{ $words[$cword] }} else {{ "" }}
    $results = @()

    if ($literal_transitions.ContainsKey($state)) {{
        foreach ($literal_id in $literal_transitions[$state].Keys) {{
            $literal = $literals[$literal_id]
            if ($literal.StartsWith($prefix, [StringComparison]::OrdinalIgnoreCase)) {{
                $desc = if ($descriptions.ContainsKey($literal_id)) {{ $descriptions[$literal_id] }} else {{ $literal }}
                $results += [System.Management.Automation.CompletionResult]::new(
                    $literal,
                    $literal,
                    'ParameterValue',
                    $desc
                )
            }}
        }}
    }}

    if ($regex_transitions.ContainsKey($state)) {{
        foreach ($regex_id in $regex_transitions[$state].Keys) {{
            $regex = $regexes[$regex_id]
            $results += [System.Management.Automation.CompletionResult]::new(
                $regex,
                $regex,
                'ParameterValue',
                $regex
            )
        }}
    }}

    if ($command_transitions.ContainsKey($state)) {{
        foreach ($command_id in $command_transitions[$state].Keys) {{
            $output = Invoke-Command -CommandId $command_id -CurrentWord $prefix
            foreach ($line in $output) {{
                if ([string]::IsNullOrWhiteSpace($line)) {{ continue }}
                $parts = $line -split "`t", 2
                $text = $parts[0]
                $desc = if ($parts.Count -gt 1) {{ $parts[1] }} else {{ $text }}
                if ($text.StartsWith($prefix, [StringComparison]::OrdinalIgnoreCase)) {{
                    $results += [System.Management.Automation.CompletionResult]::new(
                        $text,
                        $text,
                        'ParameterValue',
                        $desc
                    )
                }}
            }}
        }}
    }}

    return $results
}}
"#,
        starting_state = automaton.starting_state
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
    fn registers_argument_completer() {
        let script = emit("cmd foo bar;");
        assert!(script.contains("Register-ArgumentCompleter -Native -CommandName 'cmd'"));
        assert!(script.contains("$literals = @("));
        assert!(script.contains("'foo'"));
        assert!(script.contains("'bar'"));
    }

    #[test]
    fn emits_switch_with_default_even_without_commands() {
        let script = emit("cmd --help;");
        assert!(script.contains("function Invoke-Command {"));
        assert!(script.contains("switch ($CommandId) {"));
        assert!(script.contains("default { return @() }"));
        assert!(script.contains("$descriptions = @{}"));
        assert!(script.contains("$regexes = @()"));
    }

    #[test]
    fn invocation_section_has_one_branch_per_command() {
        let script = emit("cmd {{{ echo hello }}};");
        assert!(script.contains("        0 {\n            echo hello\n        }"));
        assert!(script.contains("Invoke-Command -CommandId $command_id"));
    }

    #[test]
    fn literal_arrays_have_no_trailing_comma() {
        let script = emit("cmd foo bar baz;");
        for line in script.lines() {
            if line.trim() == "'baz'," {
                panic!("last literal must not carry a trailing comma");
            }
        }
        assert!(script.contains("        'baz'\n    )"));
    }

    #[test]
    fn descriptions_are_assigned_by_literal_id() {
        let script = emit(r#"cmd (foo "First option" | bar "Second option");"#);
        assert!(script.contains("$descriptions[0] = 'First option'"));
        assert!(script.contains("$descriptions[1] = 'Second option'"));
    }

    #[test]
    fn single_quotes_are_doubled() {
        let script = emit(r#"cmd dont "it's fine";"#);
        assert!(script.contains("'it''s fine'"));
    }

    #[test]
    fn completion_results_are_constructed() {
        let script = emit("cmd foo;");
        assert!(script.contains("System.Management.Automation.CompletionResult"));
        assert!(script.contains("CompletionResult]::new("));
    }

    #[test]
    fn snippet_placeholder_is_translated() {
        let script = emit(r#"cmd {{{ compgen -A file "$1" }}};"#);
        assert!(script.contains(r#"compgen -A file "$CurrentWord""#));
    }
}
