use crate::Shell;

// Every string that ends up inside a generated script -- literals, descriptions, snippets --
// goes through this module.  Each shell gets exactly one escape map and one list separator, so
// an emitter cannot accidentally invent its own quoting.

// * Bash words only need quotes when they contain word-breaking or expanding characters; `"`,
//   `` ` ``, `$` and `\` are backslash-escaped inside the quotes.
// * Fish follows the same rules but has no backquote expansion.
// * Zsh strings are always quoted; backslash, `"`, `` ` `` and `$` are escaped.
// * PowerShell strings are single-quoted; the only escape is doubling an embedded single quote,
//   which keeps `$`, backticks and double quotes inert.

// Quote-forcing characters for the shells that allow bare words, following the POSIX word rules.
fn needs_quoting(c: char) -> bool {
    match c {
        ';' | '&' | '|' | '(' | ')' | '<' | '>' | '{' | '}' | '[' | ']' => true,
        '*' | '?' | '!' | '#' | '~' | '\'' | '"' | '`' | '$' | '\\' => true,
        _ => c.is_whitespace(),
    }
}

pub fn make_string_constant(shell: Shell, s: &str) -> String {
    match shell {
        Shell::Bash => {
            if s.is_empty() {
                return r#""""#.to_string();
            }
            let escaped = s
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('`', "\\`")
                .replace('$', "\\$");
            if s.chars().any(needs_quoting) {
                format!(r#""{escaped}""#)
            } else {
                escaped
            }
        }
        Shell::Fish => {
            if s.is_empty() {
                return r#""""#.to_string();
            }
            let escaped = s
                .replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('$', "\\$");
            if s.chars().any(needs_quoting) {
                format!(r#""{escaped}""#)
            } else {
                escaped
            }
        }
        Shell::Zsh => format!(
            r#""{}""#,
            s.replace('\\', "\\\\")
                .replace('"', "\\\"")
                .replace('`', "\\`")
                .replace('$', "\\$")
        ),
        Shell::Pwsh => format!("'{}'", s.replace('\'', "''")),
    }
}

/// Join already-escaped elements with the shell's collection separator.  `itertools::join` never
/// produces a trailing separator, which is what PowerShell's array syntax requires.
pub fn make_word_list<I>(shell: Shell, items: I) -> String
where
    I: IntoIterator,
    I::Item: std::fmt::Display,
{
    let separator = match shell {
        Shell::Bash | Shell::Fish | Shell::Zsh => " ",
        Shell::Pwsh => ", ",
    };
    itertools::join(items, separator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bash_plain_word_stays_bare() {
        assert_eq!(make_string_constant(Shell::Bash, "--help"), "--help");
    }

    #[test]
    fn bash_whitespace_forces_quotes() {
        assert_eq!(
            make_string_constant(Shell::Bash, "two words"),
            r#""two words""#
        );
    }

    #[test]
    fn bash_escapes_expansion_characters() {
        assert_eq!(
            make_string_constant(Shell::Bash, r#"a"b`c$d"#),
            r#""a\"b\`c\$d""#
        );
    }

    #[test]
    fn bash_quotes_word_break_characters() {
        assert_eq!(
            make_string_constant(Shell::Bash, "money;maker"),
            r#""money;maker""#
        );
        assert_eq!(make_string_constant(Shell::Bash, "--color="), "--color=");
    }

    #[test]
    fn fish_escapes_backslash_first() {
        assert_eq!(
            make_string_constant(Shell::Fish, r#"a\b"c"#),
            r#""a\\b\"c""#
        );
    }

    #[test]
    fn fish_quotes_pipe() {
        assert_eq!(make_string_constant(Shell::Fish, "a|b"), r#""a|b""#);
    }

    #[test]
    fn zsh_always_quotes() {
        assert_eq!(make_string_constant(Shell::Zsh, "plain"), r#""plain""#);
        assert_eq!(
            make_string_constant(Shell::Zsh, r#"pay $5 `now`"#),
            r#""pay \$5 \`now\`""#
        );
    }

    #[test]
    fn pwsh_doubles_single_quotes() {
        assert_eq!(
            make_string_constant(Shell::Pwsh, "it's"),
            "'it''s'"
        );
        // Expansion characters are inert inside single quotes and stay untouched.
        assert_eq!(
            make_string_constant(Shell::Pwsh, r#"say "hi" $user"#),
            r#"'say "hi" $user'"#
        );
    }

    #[test]
    fn empty_strings_still_produce_a_literal() {
        for shell in [Shell::Bash, Shell::Fish, Shell::Zsh] {
            assert_eq!(make_string_constant(shell, ""), r#""""#);
        }
        assert_eq!(make_string_constant(Shell::Pwsh, ""), "''");
    }

    #[test]
    fn word_lists_have_no_trailing_separator() {
        let items = ["a", "b", "c"];
        assert_eq!(make_word_list(Shell::Bash, items), "a b c");
        assert_eq!(make_word_list(Shell::Pwsh, items), "a, b, c");
        assert_eq!(make_word_list(Shell::Pwsh, ["solo"]), "solo");
        assert_eq!(make_word_list(Shell::Pwsh, Vec::<String>::new()), "");
    }
}
