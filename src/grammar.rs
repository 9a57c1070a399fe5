use nom::{
    Finish, IResult, Parser,
    branch::alt,
    bytes::complete::{escaped_transform, is_not, tag, take_till, take_until, take_while1},
    character::complete::{char, multispace1, one_of},
    combinator::{fail, map, opt, value, verify},
    error::context,
    multi::{fold_many0, many0},
    sequence::preceded,
};

use crate::{Error, Result};
use ustr::{Ustr, UstrMap, UstrSet, ustr};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ExprId(usize);

impl ExprId {
    pub fn to_index(&self) -> usize {
        self.0
    }
}

#[derive(Clone, PartialEq)]
pub enum Expr {
    // `--help`
    Terminal(Ustr, Option<Ustr>, HumanSpan), // terminal, optional description

    // `<PATH>`, `<DIRECTORY>`, etc.
    NontermRef(Ustr, HumanSpan),

    // `{{{ git tag }}}`
    Command(Ustr, HumanSpan),

    // `@"[0-9]+"` -- a word-class placeholder constrained by a regex
    Regex(Ustr, HumanSpan),

    // `foo bar`
    Sequence(Vec<ExprId>),

    // `foo | bar`
    Alternative(Vec<ExprId>),

    // `[EXPR]`
    Optional(ExprId),

    // `EXPR...`
    Many1(ExprId),

    // `(b | build) "Compile the current package"` means the description applies to both `b` and
    // `build`.
    DistributiveDescription(ExprId, Ustr),
}

impl std::fmt::Debug for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Terminal(term, Some(descr), ..) => f.write_fmt(format_args!(
                r#"Terminal(ustr("{term}"), Some(ustr("{descr}")))"#
            )),
            Expr::Terminal(term, None, ..) => {
                f.write_fmt(format_args!(r#"Terminal(ustr("{term}"), None)"#))
            }
            Expr::NontermRef(nonterm, _) => {
                f.write_fmt(format_args!(r#"NontermRef(ustr("{nonterm}"))"#))
            }
            Self::Command(cmd, ..) => f.write_fmt(format_args!(r#"Command(ustr({cmd:?}))"#)),
            Self::Regex(pattern, ..) => f.write_fmt(format_args!(r#"Regex(ustr({pattern:?}))"#)),
            Self::Sequence(arg0) => f.write_fmt(format_args!(r#"Sequence(vec!{arg0:?})"#)),
            Self::Alternative(arg0) => f.write_fmt(format_args!(r#"Alternative(vec!{arg0:?})"#)),
            Self::Optional(arg0) => f.write_fmt(format_args!(r#"Optional({arg0:?})"#)),
            Self::Many1(arg0) => f.write_fmt(format_args!(r#"Many1({arg0:?})"#)),
            Self::DistributiveDescription(expr, descr) => f.write_fmt(format_args!(
                r#"DistributiveDescription({expr:?}, {descr:?})"#
            )),
        }
    }
}

pub fn alloc(arena: &mut Vec<Expr>, elem: Expr) -> ExprId {
    let id = arena.len();
    arena.push(elem);
    ExprId(id)
}

fn railroad_node_from_expr(arena: &[Expr], expr_id: ExprId) -> Box<dyn railroad::Node> {
    match &arena[expr_id.to_index()] {
        Expr::Terminal(s, ..) => Box::new(railroad::Terminal::new(s.as_str().to_string())),
        Expr::NontermRef(s, ..) => Box::new(railroad::NonTerminal::new(s.as_str().to_string())),
        Expr::Command(s, ..) => Box::new(railroad::Comment::new(s.as_str().to_string())),
        Expr::Regex(s, ..) => Box::new(railroad::Comment::new(format!("@{:?}", s.as_str()))),
        Expr::Sequence(subexprs) => {
            let subnodes: Vec<Box<dyn railroad::Node>> = subexprs
                .iter()
                .map(|e| railroad_node_from_expr(arena, *e))
                .collect();
            Box::new(railroad::Sequence::new(subnodes))
        }
        Expr::Alternative(subexprs) => {
            let subnodes: Vec<Box<dyn railroad::Node>> = subexprs
                .iter()
                .map(|e| railroad_node_from_expr(arena, *e))
                .collect();
            Box::new(railroad::Choice::new(subnodes))
        }
        Expr::Optional(subexpr) => Box::new(railroad::Optional::new(railroad_node_from_expr(
            arena, *subexpr,
        ))),
        Expr::Many1(subexpr) => {
            let subnode = railroad_node_from_expr(arena, *subexpr);
            Box::new(railroad::Repeat::new(subnode, Box::new(railroad::Empty)))
        }
        Expr::DistributiveDescription(subexpr, description) => {
            let inner = railroad_node_from_expr(arena, *subexpr);
            let label = railroad::Comment::new(description.to_string());
            Box::new(railroad::LabeledBox::new(inner, label))
        }
    }
}

pub fn to_railroad_diagram<W: std::io::Write>(
    grammar: &Grammar,
    output: &mut W,
) -> std::result::Result<(), std::io::Error> {
    let mut vertical: railroad::VerticalGrid<Box<dyn railroad::Node>> = Default::default();

    for stmt in &grammar.statements {
        let node: Box<dyn railroad::Node> = match stmt {
            Statement::CallVariant { head, expr } => {
                let mut seq: Box<railroad::Sequence<Box<dyn railroad::Node>>> = Default::default();
                seq.push(Box::new(railroad::Start));
                seq.push(Box::new(railroad::Terminal::new(head.to_string())));
                seq.push(railroad_node_from_expr(&grammar.arena, *expr));
                seq.push(Box::new(railroad::End));
                seq
            }
            Statement::NonterminalDefinition { symbol, expr, .. } => {
                let inner = railroad_node_from_expr(&grammar.arena, *expr);
                let label = railroad::Comment::new(symbol.to_string());
                Box::new(railroad::LabeledBox::new(inner, label))
            }
        };
        vertical.push(node);
    }

    let mut dia = railroad::Diagram::new(vertical);
    dia.add_element(
        railroad::svg::Element::new("style")
            .set("type", "text/css")
            .text(railroad::DEFAULT_CSS),
    );
    dia.write(output)
}

pub fn to_railroad_diagram_file<P: AsRef<std::path::Path>>(
    grammar: &Grammar,
    path: P,
) -> std::result::Result<(), std::io::Error> {
    let mut file = std::fs::File::create(path)?;
    to_railroad_diagram(grammar, &mut file)?;
    Ok(())
}

use nom_locate::LocatedSpan;
pub type Span<'a> = LocatedSpan<&'a str>;

#[derive(Debug, Clone, Copy, Eq, Hash)]
pub enum HumanSpan {
    Significant {
        line_start: usize,
        start: usize,
        end: usize,
    },
    Dummy, // For tests
}

impl PartialEq for HumanSpan {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Dummy {}, _) => true,
            (_, Self::Dummy {}) => true,
            (
                Self::Significant {
                    line_start: l_line_start,
                    start: l_start,
                    end: l_end,
                },
                Self::Significant {
                    line_start: r_line_start,
                    start: r_start,
                    end: r_end,
                },
            ) => l_line_start == r_line_start && l_start == r_start && l_end == r_end,
        }
    }
}

impl HumanSpan {
    fn new(before: Span, after: Span) -> Self {
        // XXX Doesn't handle tabs
        Self::Significant {
            line_start: before.location_line() as usize - 1,
            start: before.get_column() - 1,
            end: after.get_column() - 1,
        }
    }
}

fn comment(input: Span) -> IResult<Span, Span> {
    let (input, _) = char('#')(input)?;
    let (input, content) = take_till(|c| c == '\n')(input)?;
    Ok((input, content))
}

fn form_feed(input: Span) -> IResult<Span, Span> {
    let (input, _) = char('\u{000C}')(input)?;
    Ok((input, input))
}

fn blanks(input: Span) -> IResult<Span, ()> {
    let (input, _) = alt((multispace1, comment, form_feed))(input)?;
    Ok((input, ()))
}

fn multiblanks0(mut input: Span) -> IResult<Span, ()> {
    while let Ok((rest, _)) = blanks(input) {
        input = rest;
    }
    Ok((input, ()))
}

fn multiblanks1(input: Span) -> IResult<Span, ()> {
    let (input, _) = blanks(input)?;
    let (input, _) = multiblanks0(input)?;
    Ok((input, ()))
}

const ESCAPE_CHARACTER: char = '\\';
const RESERVED_CHARACTERS: &str = r#"()[]{}<>|;"@"#;

fn is_terminal_char(c: char) -> bool {
    if c == ESCAPE_CHARACTER {
        return false;
    }

    if RESERVED_CHARACTERS.find(c).is_some() {
        return false;
    }

    c.is_ascii_alphanumeric() || c.is_ascii_punctuation()
}

fn terminal(input: Span) -> IResult<Span, String> {
    let (input, term) = escaped_transform(
        take_while1(is_terminal_char),
        ESCAPE_CHARACTER,
        one_of(RESERVED_CHARACTERS),
    )(input)?;
    if term.is_empty() {
        return fail(input);
    }
    Ok((input, term))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StringFragment<'a> {
    Literal(Span<'a>),
    EscapedChar(char),
    EscapedWS,
}

fn parse_literal(input: Span) -> IResult<Span, Span> {
    verify(is_not("\"\\"), |s: &Span| !s.is_empty()).parse(input)
}

fn parse_escaped_char(input: Span) -> IResult<Span, char> {
    preceded(
        char('\\'),
        alt((value('\\', char('\\')), value('"', char('"')))),
    )
    .parse(input)
}

fn parse_escaped_whitespace(input: Span) -> IResult<Span, Span> {
    preceded(char('\\'), multispace1).parse(input)
}

fn parse_fragment(input: Span) -> IResult<Span, StringFragment> {
    alt((
        map(parse_literal, StringFragment::Literal),
        map(parse_escaped_char, StringFragment::EscapedChar),
        value(StringFragment::EscapedWS, parse_escaped_whitespace),
    ))
    .parse(input)
}

fn description_inner(input: Span) -> IResult<Span, String> {
    let (input, inner) = fold_many0(parse_fragment, String::new, |mut string, fragment| {
        match fragment {
            StringFragment::Literal(s) => string.push_str(&String::from_utf8_lossy(s.as_bytes())),
            StringFragment::EscapedChar(c) => string.push(c),
            StringFragment::EscapedWS => {}
        }
        string
    })(input)?;
    Ok((input, inner))
}

fn description(input: Span) -> IResult<Span, String> {
    let (input, _) = char('"')(input)?;
    let (input, descr) = description_inner(input)?;
    let (input, _) = char('"')(input)?;
    Ok((input, descr))
}

fn terminal_opt_description_expr<'a, 's>(
    arena: &'a mut Vec<Expr>,
    input: Span<'s>,
) -> IResult<Span<'s>, ExprId> {
    let (after, term) = terminal(input)?;
    let (after, descr) = opt(preceded(multiblanks0, description))(after)?;
    let expr = Expr::Terminal(
        ustr(&term),
        descr.map(|descr| ustr(&descr)),
        HumanSpan::new(input, after),
    );
    let id = alloc(arena, expr);
    Ok((after, id))
}

fn nonterm(input: Span) -> IResult<Span, Span> {
    let (input, _) = char('<')(input)?;
    let (input, name) = is_not(">")(input)?;
    let (input, _) = char('>')(input)?;
    Ok((input, name))
}

fn nonterm_expr<'a, 's>(arena: &'a mut Vec<Expr>, input: Span<'s>) -> IResult<Span<'s>, ExprId> {
    let (after, nonterm) = context("nonterminal", nonterm)(input)?;
    let diagnostic_span = HumanSpan::new(input, after);
    let e = Expr::NontermRef(ustr(nonterm.into_fragment()), diagnostic_span);
    let id = alloc(arena, e);
    Ok((after, id))
}

fn triple_bracket_command(input: Span) -> IResult<Span, Span> {
    let (input, _) = tag("{{{")(input)?;
    let (input, cmd) = take_until("}}}")(input)?;
    let (input, _) = tag("}}}")(input)?;
    Ok((input, Span::new(cmd.into_fragment().trim())))
}

fn command_expr<'a, 's>(arena: &'a mut Vec<Expr>, input: Span<'s>) -> IResult<Span<'s>, ExprId> {
    let (after, cmd) = triple_bracket_command(input)?;
    let command_span = HumanSpan::new(input, after);
    let e = Expr::Command(ustr(cmd.into_fragment()), command_span);
    let id = alloc(arena, e);
    Ok((after, id))
}

fn regex_expr<'a, 's>(arena: &'a mut Vec<Expr>, input: Span<'s>) -> IResult<Span<'s>, ExprId> {
    let (after, _) = char('@')(input)?;
    let (after, pattern) = description(after)?;
    let e = Expr::Regex(ustr(&pattern), HumanSpan::new(input, after));
    let id = alloc(arena, e);
    Ok((after, id))
}

fn optional_expr<'a, 's>(arena: &'a mut Vec<Expr>, input: Span<'s>) -> IResult<Span<'s>, ExprId> {
    let (input, _) = char('[')(input)?;
    let (input, _) = multiblanks0(input)?;
    let (input, expr) = expr(arena, input)?;
    let (input, _) = multiblanks0(input)?;
    let (input, _) = char(']')(input)?;
    let id = alloc(arena, Expr::Optional(expr));
    Ok((input, id))
}

fn parenthesized_expr<'a, 's>(
    arena: &'a mut Vec<Expr>,
    input: Span<'s>,
) -> IResult<Span<'s>, ExprId> {
    let (input, _) = char('(')(input)?;
    let (input, _) = multiblanks0(input)?;
    let (input, e) = expr(arena, input)?;
    let (input, _) = multiblanks0(input)?;
    let (input, _) = char(')')(input)?;
    Ok((input, e))
}

fn many1_tag(input: Span) -> IResult<Span, ()> {
    let (input, _) = multiblanks0(input)?;
    let (input, _) = tag("...")(input)?;
    Ok((input, ()))
}

fn unary_expr<'a, 's>(arena: &'a mut Vec<Expr>, input: Span<'s>) -> IResult<Span<'s>, ExprId> {
    let (input, e) = 'alt: {
        if let Ok((input, e)) = nonterm_expr(arena, input) {
            break 'alt (input, e);
        }

        if let Ok((input, e)) = optional_expr(arena, input) {
            break 'alt (input, e);
        }

        if let Ok((input, e)) = parenthesized_expr(arena, input) {
            break 'alt (input, e);
        }

        if let Ok((input, e)) = command_expr(arena, input) {
            break 'alt (input, e);
        }

        if let Ok((input, e)) = regex_expr(arena, input) {
            break 'alt (input, e);
        }

        terminal_opt_description_expr(arena, input)?
    };

    if let Ok((input, ())) = many1_tag(input) {
        let e = Expr::Many1(e);
        let id = alloc(arena, e);
        return Ok((input, id));
    }

    Ok((input, e))
}

// Adjacent unary expressions (no blanks in between, e.g. `--color=<WHEN>`) form a sequence just
// like blank-separated ones do.
fn juxtaposition_expr<'a, 's>(
    arena: &'a mut Vec<Expr>,
    input: Span<'s>,
) -> IResult<Span<'s>, ExprId> {
    let (mut after, left) = unary_expr(arena, input)?;
    let mut factors: Vec<ExprId> = vec![left];
    while let Ok((rest, right)) = unary_expr(arena, after) {
        factors.push(right);
        after = rest;
    }
    let result = if factors.len() == 1 {
        factors.into_iter().next().unwrap()
    } else {
        alloc(arena, Expr::Sequence(factors))
    };
    Ok((after, result))
}

fn juxtaposition_expr_opt_description<'a, 's>(
    arena: &'a mut Vec<Expr>,
    input: Span<'s>,
) -> IResult<Span<'s>, ExprId> {
    let (input, expr_id) = juxtaposition_expr(arena, input)?;
    let (input, description) = opt(preceded(multiblanks0, description))(input)?;
    let result = match description {
        Some(descr) => {
            let e = Expr::DistributiveDescription(expr_id, ustr(&descr));
            alloc(arena, e)
        }
        None => expr_id,
    };
    Ok((input, result))
}

fn sequence_expr<'a, 's>(arena: &'a mut Vec<Expr>, input: Span<'s>) -> IResult<Span<'s>, ExprId> {
    let (mut input, left) = juxtaposition_expr_opt_description(arena, input)?;
    let mut factors: Vec<ExprId> = vec![left];
    while let Ok((rest, right)) = preceded(multiblanks1, |i| {
        juxtaposition_expr_opt_description(arena, i)
    })(input)
    {
        factors.push(right);
        input = rest;
    }
    let result = if factors.len() == 1 {
        factors.drain(..).next().unwrap()
    } else {
        alloc(arena, Expr::Sequence(factors))
    };
    Ok((input, result))
}

fn do_alternative_expr<'a, 's>(
    arena: &'a mut Vec<Expr>,
    input: Span<'s>,
) -> IResult<Span<'s>, ExprId> {
    let (input, _) = multiblanks0(input)?;
    let (input, _) = char('|')(input)?;
    let (input, _) = multiblanks0(input)?;
    let (input, right) = sequence_expr(arena, input)?;
    Ok((input, right))
}

fn alternative_expr<'a, 's>(
    arena: &'a mut Vec<Expr>,
    input: Span<'s>,
) -> IResult<Span<'s>, ExprId> {
    let (mut input, left) = sequence_expr(arena, input)?;
    let mut elems: Vec<ExprId> = vec![left];
    while let Ok((rest, right)) = do_alternative_expr(arena, input) {
        elems.push(right);
        input = rest;
    }
    let result = if elems.len() == 1 {
        elems.drain(..).next().unwrap()
    } else {
        alloc(arena, Expr::Alternative(elems))
    };
    Ok((input, result))
}

fn expr<'a, 's>(arena: &'a mut Vec<Expr>, input: Span<'s>) -> IResult<Span<'s>, ExprId> {
    alternative_expr(arena, input)
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CallVariant {
        head: Ustr,
        expr: ExprId,
    },
    NonterminalDefinition {
        symbol: Ustr,
        expr: ExprId,
        span: HumanSpan,
    },
}

fn call_variant<'a, 's>(arena: &'a mut Vec<Expr>, input: Span<'s>) -> IResult<Span<'s>, Statement> {
    let (input, name) = terminal(input)?;
    let (input, expr) = opt(preceded(multiblanks1, |i| expr(arena, i)))(input)?;
    let (input, _) = multiblanks0(input)?;
    let (input, _) = char(';')(input)?;

    let expr = match expr {
        Some(id) => id,
        None => alloc(arena, Expr::Sequence(vec![])),
    };

    let production = Statement::CallVariant {
        head: ustr(&name),
        expr,
    };

    Ok((input, production))
}

fn nonterm_def_statement<'a, 's>(
    arena: &'a mut Vec<Expr>,
    input: Span<'s>,
) -> IResult<Span<'s>, Statement> {
    let (after_name, name) = nonterm(input)?;
    let span = HumanSpan::new(input, after_name);
    let (input, _) = multiblanks0(after_name)?;
    let (input, _) = tag("::=")(input)?;
    let (input, _) = multiblanks0(input)?;
    let (input, e) = expr(arena, input)?;
    let (input, _) = multiblanks0(input)?;
    let (input, _) = char(';')(input)?;

    let stmt = Statement::NonterminalDefinition {
        symbol: ustr(name.into_fragment()),
        expr: e,
        span,
    };

    Ok((input, stmt))
}

fn statement<'a, 's>(arena: &'a mut Vec<Expr>, input: Span<'s>) -> IResult<Span<'s>, Statement> {
    let (input, stmt) = 'alt: {
        if let Ok((input, stmt)) = nonterm_def_statement(arena, input) {
            break 'alt (input, stmt);
        }

        call_variant(arena, input)?
    };

    let (input, _) = multiblanks0(input)?;
    Ok((input, stmt))
}

fn grammar(input: Span) -> IResult<Span, (Vec<Expr>, Vec<Statement>)> {
    let mut arena = Vec::new();
    let (input, _) = multiblanks0(input)?;
    let (input, statements) = many0(|i| statement(&mut arena, i))(input)?;
    let (input, _) = multiblanks0(input)?;
    Ok((input, (arena, statements)))
}

#[derive(Debug, PartialEq, Clone)]
pub struct Grammar {
    pub arena: Vec<Expr>,
    pub statements: Vec<Statement>,
}

impl Grammar {
    pub fn parse(input: &str) -> Result<Self> {
        let (input_after, (arena, statements)) = match grammar(Span::new(input)).finish() {
            Ok((rest, parsed)) => (rest, parsed),
            Err(e) => {
                let line_start = e.input.location_line() as usize - 1;
                let start = e.input.get_column() - 1;
                return Err(Error::SyntaxError(HumanSpan::Significant {
                    line_start,
                    start,
                    end: start + 1,
                }));
            }
        };

        if !input_after.is_empty() {
            let line_start = input_after.location_line() as usize - 1;
            let start = input_after.get_column() - 1;
            return Err(Error::SyntaxError(HumanSpan::Significant {
                line_start,
                start,
                end: start + 1,
            }));
        }

        let g = Grammar { arena, statements };

        Ok(g)
    }
}

// Move descriptions to their corresponding terminals.
fn do_distribute_descriptions(
    arena: &mut Vec<Expr>,
    expr_id: ExprId,
    description: &mut Option<Ustr>,
) -> ExprId {
    match arena[expr_id.to_index()].clone() {
        Expr::DistributiveDescription(child, descr) => {
            let new_child = do_distribute_descriptions(arena, child, &mut Some(descr));
            if child == new_child { child } else { new_child }
        }
        Expr::Terminal(term, None, span) if description.is_some() => {
            let result = Expr::Terminal(term, *description, span);
            *description = None; // spend it
            alloc(arena, result)
        }
        Expr::Terminal(..) => expr_id,
        Expr::NontermRef(..) | Expr::Command(..) | Expr::Regex(..) => expr_id,
        Expr::Sequence(children) => {
            let new_children: Vec<ExprId> = children
                .iter()
                .map(|e| do_distribute_descriptions(arena, *e, description))
                .collect();
            if children == new_children {
                expr_id
            } else {
                alloc(arena, Expr::Sequence(new_children))
            }
        }
        Expr::Alternative(children) => {
            let new_children: Vec<ExprId> = children
                .iter()
                .map(|e| do_distribute_descriptions(arena, *e, &mut description.clone()))
                .collect();
            if children == new_children {
                expr_id
            } else {
                alloc(arena, Expr::Alternative(new_children))
            }
        }
        Expr::Optional(child) => {
            let new_child = do_distribute_descriptions(arena, child, description);
            if child == new_child {
                expr_id
            } else {
                alloc(arena, Expr::Optional(new_child))
            }
        }
        Expr::Many1(child) => {
            let new_child = do_distribute_descriptions(arena, child, description);
            if child == new_child {
                expr_id
            } else {
                alloc(arena, Expr::Many1(new_child))
            }
        }
    }
}

fn distribute_descriptions(arena: &mut Vec<Expr>, expr_id: ExprId) -> ExprId {
    let mut description = None;
    do_distribute_descriptions(arena, expr_id, &mut description)
}

fn do_get_expression_nonterminals(
    arena: &[Expr],
    expr_id: ExprId,
    deps: &mut Vec<(Ustr, HumanSpan)>,
) {
    match &arena[expr_id.to_index()] {
        Expr::Terminal(..) | Expr::Command(..) | Expr::Regex(..) => {}
        Expr::NontermRef(varname, span) => {
            deps.push((*varname, *span));
        }
        Expr::Sequence(children) | Expr::Alternative(children) => {
            for child in children {
                do_get_expression_nonterminals(arena, *child, deps);
            }
        }
        Expr::Optional(child) | Expr::Many1(child) => {
            do_get_expression_nonterminals(arena, *child, deps);
        }
        Expr::DistributiveDescription(child, _) => {
            do_get_expression_nonterminals(arena, *child, deps);
        }
    }
}

fn get_expression_nonterminals(arena: &[Expr], expr_id: ExprId) -> Vec<(Ustr, HumanSpan)> {
    let mut result: Vec<(Ustr, HumanSpan)> = Default::default();
    do_get_expression_nonterminals(arena, expr_id, &mut result);
    result
}

// Can some derivation of `expr_id` end after a finite number of words?  Referenced rules count as
// terminating only if already known to.
fn terminates(arena: &[Expr], expr_id: ExprId, productive: &UstrSet) -> bool {
    match &arena[expr_id.to_index()] {
        Expr::Terminal(..) | Expr::Command(..) | Expr::Regex(..) => true,
        Expr::NontermRef(name, _) => productive.contains(name),
        Expr::Sequence(children) => children
            .iter()
            .all(|child| terminates(arena, *child, productive)),
        Expr::Alternative(children) => children
            .iter()
            .any(|child| terminates(arena, *child, productive)),
        Expr::Optional(_) => true,
        Expr::Many1(child) => terminates(arena, *child, productive),
        Expr::DistributiveDescription(child, _) => terminates(arena, *child, productive),
    }
}

fn do_validate_regexes(arena: &[Expr], expr_id: ExprId) -> Result<()> {
    match &arena[expr_id.to_index()] {
        Expr::Terminal(..) | Expr::Command(..) | Expr::NontermRef(..) => Ok(()),
        Expr::Regex(pattern, span) => match regex::Regex::new(pattern) {
            Ok(_) => Ok(()),
            Err(e) => Err(Error::InvalidRegex(*pattern, e.to_string(), *span)),
        },
        Expr::Sequence(children) | Expr::Alternative(children) => {
            for child in children {
                do_validate_regexes(arena, *child)?;
            }
            Ok(())
        }
        Expr::Optional(child) | Expr::Many1(child) => do_validate_regexes(arena, *child),
        Expr::DistributiveDescription(child, _) => do_validate_regexes(arena, *child),
    }
}

#[derive(Debug)]
pub struct ValidGrammar {
    pub arena: Vec<Expr>,
    pub command: Ustr,
    pub expr: ExprId,
    pub rules: UstrMap<ExprId>,
    pub unused_nonterminals: UstrSet,
}

impl ValidGrammar {
    pub fn from_grammar(mut grammar: Grammar) -> Result<Self> {
        let command = {
            let mut commands: Vec<Ustr> = grammar
                .statements
                .iter()
                .filter_map(|v| match v {
                    Statement::CallVariant { head, .. } => Some(*head),
                    Statement::NonterminalDefinition { .. } => None,
                })
                .collect();

            if commands.is_empty() {
                return Err(Error::MissingCallVariants);
            }

            commands.sort_unstable();
            commands.dedup();

            if commands.len() > 1 {
                return Err(Error::VaryingCommandNames(commands.into_iter().collect()));
            }
            commands[0]
        };

        let expr = {
            let call_variants: Vec<ExprId> = grammar
                .statements
                .iter()
                .filter_map(|v| match v {
                    Statement::CallVariant { expr, .. } => Some(*expr),
                    Statement::NonterminalDefinition { .. } => None,
                })
                .collect();

            if call_variants.len() == 1 {
                call_variants[0]
            } else {
                alloc(&mut grammar.arena, Expr::Alternative(call_variants))
            }
        };

        let mut rules: UstrMap<ExprId> = Default::default();
        for definition in &grammar.statements {
            let (symbol, expr, span) = match definition {
                Statement::NonterminalDefinition { symbol, expr, span } => (*symbol, *expr, *span),
                Statement::CallVariant { .. } => continue,
            };
            if rules.contains_key(&symbol) {
                return Err(Error::DuplicateNonterminalDefinition(symbol, span));
            }
            rules.insert(symbol, expr);
        }

        let expr = distribute_descriptions(&mut grammar.arena, expr);
        for expr_id in rules.values_mut() {
            *expr_id = distribute_descriptions(&mut grammar.arena, *expr_id);
        }

        // Rule bodies are visited in name order so that the reported error does not depend on
        // map iteration order.
        let rule_bodies: Vec<ExprId> = {
            let mut names: Vec<Ustr> = rules.keys().copied().collect();
            names.sort_unstable();
            names.iter().map(|name| rules[name]).collect()
        };

        // Every reference, reachable or not, has to point at a defined rule.
        for referenced_expr in std::iter::once(expr).chain(rule_bodies.iter().copied()) {
            for (name, span) in get_expression_nonterminals(&grammar.arena, referenced_expr) {
                if !rules.contains_key(&name) {
                    return Err(Error::UndefinedRule(name, span));
                }
            }
        }

        do_validate_regexes(&grammar.arena, expr)?;
        for expr_id in &rule_bodies {
            do_validate_regexes(&grammar.arena, *expr_id)?;
        }

        // Cycles between rules are fine as long as every rule has some derivation that actually
        // ends.  Fixpoint: keep marking rules terminating until nothing changes.
        {
            let mut productive: UstrSet = Default::default();
            loop {
                let mut changed = false;
                for (name, expr_id) in &rules {
                    if productive.contains(name) {
                        continue;
                    }
                    if terminates(&grammar.arena, *expr_id, &productive) {
                        productive.insert(*name);
                        changed = true;
                    }
                }
                if !changed {
                    break;
                }
            }
            let mut unproductive: Vec<Ustr> = rules
                .keys()
                .filter(|name| !productive.contains(*name))
                .copied()
                .collect();
            if !unproductive.is_empty() {
                unproductive.sort_unstable();
                return Err(Error::UnproductiveCycle(unproductive.into()));
            }
        }

        let unused_nonterminals = {
            let mut reachable: UstrSet = Default::default();
            let mut worklist: Vec<Ustr> = get_expression_nonterminals(&grammar.arena, expr)
                .into_iter()
                .map(|(name, _)| name)
                .collect();
            while let Some(name) = worklist.pop() {
                if !reachable.insert(name) {
                    continue;
                }
                let body = rules.get(&name).unwrap();
                for (child, _) in get_expression_nonterminals(&grammar.arena, *body) {
                    worklist.push(child);
                }
            }
            rules
                .keys()
                .filter(|name| !reachable.contains(*name))
                .copied()
                .collect()
        };

        let g = ValidGrammar {
            arena: grammar.arena,
            command,
            expr,
            rules,
            unused_nonterminals,
        };
        Ok(g)
    }
}

#[cfg(test)]
pub mod tests {
    use proptest::prelude::*;

    use super::*;

    impl HumanSpan {
        pub fn dummy() -> Self {
            Self::Dummy {}
        }
    }

    impl Expr {
        pub fn term(s: &str) -> Self {
            Self::Terminal(ustr(s), None, HumanSpan::Dummy)
        }

        fn term_descr(s: &str, d: &str) -> Self {
            Self::Terminal(ustr(s), Some(ustr(d)), HumanSpan::Dummy)
        }

        pub fn nontermref(s: &str) -> Self {
            Self::NontermRef(ustr(s), HumanSpan::dummy())
        }
    }

    fn parse_expr(input: &str) -> (Vec<Expr>, ExprId) {
        let mut arena: Vec<Expr> = Default::default();
        let (rest, id) = expr(&mut arena, Span::new(input)).unwrap();
        assert!(rest.is_empty(), "unparsed input: {rest:?}");
        (arena, id)
    }

    #[test]
    fn parses_lone_terminal() {
        let (arena, id) = parse_expr("foo");
        assert_eq!(arena[id.to_index()], Expr::term("foo"));
    }

    #[test]
    fn parses_described_terminal() {
        let (arena, id) = parse_expr(r#"--help "show help""#);
        assert_eq!(arena[id.to_index()], Expr::term_descr("--help", "show help"));
    }

    #[test]
    fn parses_terminal_with_escaped_reserved_char() {
        let (arena, id) = parse_expr(r#"foo\|bar"#);
        assert_eq!(arena[id.to_index()], Expr::term("foo|bar"));
    }

    #[test]
    fn parses_description_with_escapes() {
        let (arena, id) = parse_expr(r#"foo "escaped \"quote\" and \\backslash""#);
        assert_eq!(
            arena[id.to_index()],
            Expr::term_descr("foo", r#"escaped "quote" and \backslash"#)
        );
    }

    #[test]
    fn parses_nonterminal_reference() {
        let (arena, id) = parse_expr("<FILE>");
        assert_eq!(arena[id.to_index()], Expr::nontermref("FILE"));
    }

    #[test]
    fn parses_command() {
        let (arena, id) = parse_expr("{{{ git tag }}}");
        assert_eq!(
            arena[id.to_index()],
            Expr::Command(ustr("git tag"), HumanSpan::dummy())
        );
    }

    #[test]
    fn parses_regex_placeholder() {
        let (arena, id) = parse_expr(r#"@"[0-9]+""#);
        assert_eq!(
            arena[id.to_index()],
            Expr::Regex(ustr("[0-9]+"), HumanSpan::dummy())
        );
    }

    #[test]
    fn parses_sequence() {
        let (arena, id) = parse_expr("foo bar baz");
        let Expr::Sequence(children) = &arena[id.to_index()] else {
            panic!("expected sequence: {:?}", arena[id.to_index()]);
        };
        assert_eq!(children.len(), 3);
        assert_eq!(arena[children[0].to_index()], Expr::term("foo"));
        assert_eq!(arena[children[2].to_index()], Expr::term("baz"));
    }

    #[test]
    fn parses_juxtaposed_terms_as_sequence() {
        let (arena, id) = parse_expr("--color=<WHEN>");
        let Expr::Sequence(children) = &arena[id.to_index()] else {
            panic!("expected sequence: {:?}", arena[id.to_index()]);
        };
        assert_eq!(children.len(), 2);
        assert_eq!(arena[children[0].to_index()], Expr::term("--color="));
        assert_eq!(arena[children[1].to_index()], Expr::nontermref("WHEN"));
    }

    #[test]
    fn parses_alternative() {
        let (arena, id) = parse_expr("foo | bar");
        let Expr::Alternative(children) = &arena[id.to_index()] else {
            panic!("expected alternative: {:?}", arena[id.to_index()]);
        };
        assert_eq!(children.len(), 2);
    }

    #[test]
    fn parses_optional() {
        let (arena, id) = parse_expr("[--verbose]");
        let Expr::Optional(child) = &arena[id.to_index()] else {
            panic!("expected optional: {:?}", arena[id.to_index()]);
        };
        assert_eq!(arena[child.to_index()], Expr::term("--verbose"));
    }

    #[test]
    fn parses_repetition() {
        let (arena, id) = parse_expr("[<OPTION>]...");
        let Expr::Many1(child) = &arena[id.to_index()] else {
            panic!("expected repetition: {:?}", arena[id.to_index()]);
        };
        let Expr::Optional(inner) = &arena[child.to_index()] else {
            panic!("expected optional inside repetition");
        };
        assert_eq!(arena[inner.to_index()], Expr::nontermref("OPTION"));
    }

    #[test]
    fn parses_group_description() {
        let (arena, id) = parse_expr(r#"(b | build) "Compile the current package""#);
        let Expr::DistributiveDescription(child, descr) = &arena[id.to_index()] else {
            panic!("expected distributive description: {:?}", arena[id.to_index()]);
        };
        assert_eq!(*descr, ustr("Compile the current package"));
        assert!(matches!(arena[child.to_index()], Expr::Alternative(..)));
    }

    #[test]
    fn parses_statements() {
        const INPUT: &str = r#"
# grep-alike
mygrep [<OPTION>]... <PATTERN>;
<OPTION> ::= --color "use markers" | --help;
<PATTERN> ::= @"[^-].*";
"#;
        let g = Grammar::parse(INPUT).unwrap();
        assert_eq!(g.statements.len(), 3);
        assert!(matches!(g.statements[0], Statement::CallVariant { .. }));
        assert!(matches!(
            g.statements[1],
            Statement::NonterminalDefinition { .. }
        ));
    }

    #[test]
    fn parses_bare_command_statement() {
        let g = Grammar::parse("grep;").unwrap();
        assert_eq!(g.statements.len(), 1);
    }

    #[test]
    fn rejects_missing_semicolon() {
        assert!(matches!(
            Grammar::parse("cmd foo bar"),
            Err(Error::SyntaxError(_))
        ));
    }

    #[test]
    fn rejects_unterminated_group() {
        assert!(matches!(
            Grammar::parse("cmd (foo | bar;"),
            Err(Error::SyntaxError(_))
        ));
    }

    #[test]
    fn rejects_unterminated_command() {
        assert!(matches!(
            Grammar::parse("cmd {{{ echo hello ;"),
            Err(Error::SyntaxError(_))
        ));
    }

    #[test]
    fn reports_error_position() {
        let Err(Error::SyntaxError(HumanSpan::Significant { line_start, .. })) =
            Grammar::parse("cmd foo;\ncmd (bar;\n")
        else {
            panic!("expected a syntax error with a position");
        };
        assert_eq!(line_start, 1);
    }

    fn validate(input: &str) -> Result<ValidGrammar> {
        ValidGrammar::from_grammar(Grammar::parse(input).unwrap())
    }

    #[test]
    fn validates_command_name() {
        let g = validate("mygrep foo;").unwrap();
        assert_eq!(g.command, ustr("mygrep"));
    }

    #[test]
    fn merges_call_variants() {
        let g = validate("cmd add;\ncmd remove;").unwrap();
        assert!(matches!(g.arena[g.expr.to_index()], Expr::Alternative(..)));
    }

    #[test]
    fn rejects_empty_grammar() {
        assert!(matches!(validate("<X> ::= foo;"), Err(Error::MissingCallVariants)));
    }

    #[test]
    fn rejects_varying_command_names() {
        assert!(matches!(
            validate("foo bar;\nbaz quux;"),
            Err(Error::VaryingCommandNames(..))
        ));
    }

    #[test]
    fn rejects_duplicate_rule() {
        assert!(matches!(
            validate("cmd <X>;\n<X> ::= foo;\n<X> ::= bar;"),
            Err(Error::DuplicateNonterminalDefinition(name, _)) if name == ustr("X")
        ));
    }

    #[test]
    fn rejects_undefined_rule() {
        assert!(matches!(
            validate("cmd <UNDEFINED>;"),
            Err(Error::UndefinedRule(name, _)) if name == ustr("UNDEFINED")
        ));
    }

    #[test]
    fn rejects_unproductive_cycle() {
        assert!(matches!(
            validate("cmd <A>;\n<A> ::= <B>;\n<B> ::= <A>;"),
            Err(Error::UnproductiveCycle(names)) if *names == [ustr("A"), ustr("B")]
        ));
    }

    #[test]
    fn accepts_productive_cycle() {
        let g = validate("find <EXPR>;\n<EXPR> ::= ( <EXPR> ) | -name foo;").unwrap();
        assert!(g.rules.contains_key(&ustr("EXPR")));
    }

    #[test]
    fn optional_self_reference_is_productive() {
        assert!(validate("cmd <A>;\n<A> ::= foo [<A>];").is_ok());
    }

    #[test]
    fn rejects_invalid_regex() {
        assert!(matches!(
            validate(r#"cmd @"[unclosed";"#),
            Err(Error::InvalidRegex(..))
        ));
    }

    #[test]
    fn collects_unused_nonterminals() {
        let g = validate("cmd foo;\n<UNUSED> ::= bar;").unwrap();
        assert!(g.unused_nonterminals.contains(&ustr("UNUSED")));
    }

    #[test]
    fn distributes_description_over_alternative() {
        let g = validate(r#"cmd (fast | slow) "speed";"#).unwrap();
        let Expr::Alternative(children) = &g.arena[g.expr.to_index()] else {
            panic!("expected alternative at the top: {:?}", g.arena[g.expr.to_index()]);
        };
        for child in children {
            assert!(matches!(
                &g.arena[child.to_index()],
                Expr::Terminal(_, Some(descr), _) if *descr == ustr("speed")
            ));
        }
    }

    #[test]
    fn description_applies_to_first_terminal_of_sequence() {
        let g = validate(r#"cmd (foo bar) "desc";"#).unwrap();
        let Expr::Sequence(children) = &g.arena[g.expr.to_index()] else {
            panic!("expected sequence: {:?}", g.arena[g.expr.to_index()]);
        };
        assert_eq!(g.arena[children[0].to_index()], Expr::term_descr("foo", "desc"));
        assert_eq!(g.arena[children[1].to_index()], Expr::term("bar"));
    }

    proptest! {
        #[test]
        fn parses_arbitrary_literal_alternatives(words in proptest::collection::vec("[a-z][a-z0-9-]{0,11}", 2..8)) {
            let input = format!("cmd ({});", words.join("|"));
            let g = Grammar::parse(&input).unwrap();
            let Statement::CallVariant { expr, .. } = &g.statements[0] else {
                panic!("expected a call variant");
            };
            let Expr::Alternative(children) = &g.arena[expr.to_index()] else {
                panic!("expected an alternative");
            };
            prop_assert_eq!(children.len(), words.len());
        }
    }
}
