use std::ffi::OsStr;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::process::exit;

use anyhow::Context;
use clap::Parser;

use tabgen::automaton::Automaton;
use tabgen::grammar::{Grammar, HumanSpan, ValidGrammar, to_railroad_diagram_file};
use tabgen::{Error, Shell};

#[derive(clap::Parser)]
struct Cli {
    #[clap(subcommand)]
    mode: Mode,
}

#[derive(clap::Subcommand)]
enum Mode {
    #[command(about = "Do not emit anything -- only check a grammar file for errors")]
    Check(CheckArgs),

    #[command(about = "Write autocompletion shell script files")]
    Aot(AotArgs),

    #[command(about = "Show version and exit")]
    Version,
}

#[derive(clap::Args)]
struct CheckArgs {
    usage_file_path: String,
}

#[derive(clap::Args)]
struct AotArgs {
    usage_file_path: String,

    #[clap(long)]
    bash_script: Option<String>,

    #[clap(long)]
    fish_script: Option<String>,

    #[clap(long)]
    zsh_script: Option<String>,

    #[clap(long)]
    pwsh_script: Option<String>,

    #[clap(long)]
    dfa_dot: Option<String>,

    #[clap(long)]
    railroad_svg: Option<String>,
}

fn get_file_or_stdin(path: &str) -> anyhow::Result<Box<dyn Read>> {
    let result: Box<dyn Read> = if path == "-" {
        Box::new(std::io::stdin())
    } else {
        Box::new(std::fs::File::open(path).context(path.to_owned())?)
    };
    Ok(result)
}

fn get_file_or_stdout(path: &str) -> anyhow::Result<Box<dyn Write>> {
    let result: Box<dyn Write> = if path == "-" {
        Box::new(std::io::stdout())
    } else {
        Box::new(std::fs::File::create(path).context(path.to_owned())?)
    };
    Ok(result)
}

fn print_span_error(message: &str, span: HumanSpan, input: &str) {
    let HumanSpan::Significant {
        line_start,
        start,
        end,
    } = span
    else {
        eprintln!("{message}");
        return;
    };
    let source_line = input.lines().nth(line_start).unwrap_or("");
    let error = chic::Error::new(message).error(line_start, start, end, source_line, "");
    eprintln!("{}", error.to_string());
}

fn handle_parse_error(input: &str) -> Grammar {
    match Grammar::parse(input) {
        Ok(g) => g,
        Err(Error::SyntaxError(span)) => {
            print_span_error("Syntax error", span, input);
            exit(1);
        }
        Err(e) => {
            eprintln!("{e}");
            exit(1);
        }
    }
}

fn handle_validation_error(grammar: Grammar, input: &str) -> ValidGrammar {
    match ValidGrammar::from_grammar(grammar) {
        Ok(validated) => validated,
        Err(e @ Error::UndefinedRule(_, span))
        | Err(e @ Error::DuplicateNonterminalDefinition(_, span))
        | Err(e @ Error::InvalidRegex(_, _, span)) => {
            print_span_error(&e.to_string(), span, input);
            exit(1);
        }
        Err(e) => {
            eprintln!("{e}");
            exit(1);
        }
    }
}

fn read_input(path: &str) -> anyhow::Result<String> {
    let mut input_file = get_file_or_stdin(path)?;
    let mut input: String = Default::default();
    input_file.read_to_string(&mut input).context(path.to_owned())?;
    Ok(input)
}

fn check(args: &CheckArgs) -> anyhow::Result<()> {
    let input = read_input(&args.usage_file_path)?;
    let grammar = handle_parse_error(&input);
    let validated = handle_validation_error(grammar, &input);
    let _ = Automaton::from_grammar(&validated);
    Ok(())
}

fn compile(args: &AotArgs) -> anyhow::Result<()> {
    if let (None, None, None, None, None, None) = (
        &args.railroad_svg,
        &args.dfa_dot,
        &args.bash_script,
        &args.fish_script,
        &args.zsh_script,
        &args.pwsh_script,
    ) {
        eprintln!(
            "Please specify at least one of --railroad-svg, --dfa-dot, --bash-script, --fish-script, --zsh-script, --pwsh-script options"
        );
        exit(1);
    }

    let input = read_input(&args.usage_file_path)?;

    let grammar = handle_parse_error(&input);

    if let Some(railroad_svg_path) = &args.railroad_svg {
        to_railroad_diagram_file(&grammar, railroad_svg_path).context(railroad_svg_path.clone())?;
    }

    let validated = handle_validation_error(grammar, &input);

    if !validated.unused_nonterminals.is_empty() {
        let joined = itertools::join(validated.unused_nonterminals.iter(), " ");
        eprintln!("Warning: Unused nonterminal(s): {joined}");
    }

    log::debug!("Grammar -> Automaton");
    let automaton = Automaton::from_grammar(&validated);

    if let Some(dot_file_path) = &args.dfa_dot {
        let mut dot_file = get_file_or_stdout(dot_file_path)?;
        automaton.to_dot(&mut dot_file).context(dot_file_path.clone())?;
    }

    let command = validated.command.as_str();

    // Scripts are rendered in full before anything is written out: a failed emission must not
    // leave a truncated script behind.
    if let Some(path) = &args.bash_script {
        log::debug!("Writing Bash completion script");
        let script = Shell::Bash.completion_script(command, &automaton)?;
        write_script(path, &script)?;
    }

    if let Some(path) = &args.fish_script {
        log::debug!("Writing Fish completion script");
        let script = Shell::Fish.completion_script(command, &automaton)?;
        write_script(path, &script)?;
    }

    if let Some(path) = &args.zsh_script {
        log::debug!("Writing Zsh completion script");
        let expected_name = format!("_{command}");
        if path != "-" && Path::new(path).file_name().unwrap_or_default() != OsStr::new(&expected_name)
        {
            eprintln!(
                "Warning: ZSH requires the output script to be named {expected_name:?} for autoloading to work"
            );
        }
        let script = Shell::Zsh.completion_script(command, &automaton)?;
        write_script(path, &script)?;
    }

    if let Some(path) = &args.pwsh_script {
        log::debug!("Writing PowerShell completion script");
        let script = Shell::Pwsh.completion_script(command, &automaton)?;
        write_script(path, &script)?;
    }

    Ok(())
}

fn write_script(path: &str, script: &str) -> anyhow::Result<()> {
    let script_file = get_file_or_stdout(path)?;
    let mut writer = BufWriter::new(script_file);
    writer.write_all(script.as_bytes()).context(path.to_owned())?;
    writer.flush().context(path.to_owned())?;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Cli::parse();
    match args.mode {
        Mode::Check(args) => check(&args)?,
        Mode::Aot(args) => compile(&args)?,
        Mode::Version => {
            println!("{}", env!("TABGEN_VERSION"));
        }
    };
    Ok(())
}
