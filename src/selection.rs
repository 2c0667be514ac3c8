use crate::date::Date;
use crate::error::command_error;
use crate::event::Committish;
use crate::event::Event;
use crate::event::FileOp;
use crate::orderedset::OrderedIntSet;
use crate::repository::Repository;
use anyhow::Result;
use bstr::BStr;
use bstr::ByteSlice as _;
use std::collections::HashMap;

/// A compiled selection expression: a function from a preselection to a
/// selection, both ordered sets of event indices.
#[derive(Debug)]
pub struct Selection {
    root: Expr,
}

#[derive(Debug)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    /// Postfix `?`: neighborhood expansion.
    Neighbors(Box<Expr>),
    Polyrange(Vec<Atom>),
    Mark(String),
    Name(String),
    TextSearch {
        regex: regex::bytes::Regex,
        flags: String,
    },
    PathSet {
        matcher: PathMatcher,
        flags: String,
    },
    Visibility(String),
    Function(String, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Atom {
    /// 1-origin event number.
    Number(u64),
    /// `$`, the last event.
    Dollar,
    /// `..`, a span joining the adjacent atoms.
    Span,
}

#[derive(Debug)]
enum PathMatcher {
    Literal(bstr::BString),
    Regex(regex::bytes::Regex),
}

impl PathMatcher {
    fn matches(&self, path: &BStr) -> bool {
        match self {
            PathMatcher::Literal(literal) => literal.as_bstr() == path,
            PathMatcher::Regex(regex) => regex.is_match(path),
        }
    }
}

/// Compiles a selection expression. Errors are command errors: the caller's
/// repository has not been touched.
pub fn compile(text: &str) -> Result<Selection> {
    let mut parser = Parser {
        input: text.as_bytes(),
        pos: 0,
    };
    let root = parser.parse_or()?;
    parser.skip_ws();
    if parser.pos != parser.input.len() {
        return Err(command_error(format!(
            "trailing junk in selection expression at byte {}: {:?}",
            parser.pos,
            &text[parser.pos..]
        )));
    }
    Ok(Selection { root })
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn skip_ws(&mut self) {
        while self.input.get(self.pos) == Some(&b' ') {
            self.pos += 1;
        }
    }

    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        loop {
            self.skip_ws();
            if self.peek() == Some(b'|') {
                self.pos += 1;
                let rhs = self.parse_and()?;
                lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
            } else {
                return Ok(lhs);
            }
        }
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            self.skip_ws();
            if self.peek() == Some(b'&') {
                self.pos += 1;
                let rhs = self.parse_unary()?;
                lhs = Expr::And(Box::new(lhs), Box::new(rhs));
            } else {
                return Ok(lhs);
            }
        }
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        self.skip_ws();
        if self.peek() == Some(b'~') {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        let mut term = self.parse_term()?;
        while self.peek() == Some(b'?') {
            self.pos += 1;
            term = Expr::Neighbors(Box::new(term));
        }
        Ok(term)
    }

    fn parse_term(&mut self) -> Result<Expr> {
        self.skip_ws();
        match self.peek() {
            Some(b'(') => {
                self.pos += 1;
                let inner = self.parse_or()?;
                self.skip_ws();
                if self.bump() != Some(b')') {
                    return Err(command_error("unbalanced parenthesis in selection"));
                }
                Ok(inner)
            }
            Some(b'@') => self.parse_function(),
            Some(b'=') => {
                self.pos += 1;
                let mut letters = String::new();
                while let Some(b) = self.peek() {
                    if b.is_ascii_alphabetic() {
                        letters.push(b as char);
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                if letters.is_empty() {
                    return Err(command_error("= with no visibility letters"));
                }
                Ok(Expr::Visibility(letters))
            }
            Some(b'/') => self.parse_text_search(),
            Some(b'[') => self.parse_path_set(),
            Some(b':') => {
                self.pos += 1;
                let mut digits = String::from(":");
                while let Some(b) = self.peek() {
                    if b.is_ascii_digit() {
                        digits.push(b as char);
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
                if digits.len() == 1 {
                    return Err(command_error("mark reference with no digits"));
                }
                Ok(Expr::Mark(digits))
            }
            Some(b) if b.is_ascii_digit() || b == b'$' => self.parse_polyrange(),
            Some(b'<') => {
                // A <token> name reference.
                self.pos += 1;
                let start = self.pos;
                while let Some(b) = self.peek() {
                    if b == b'>' {
                        break;
                    }
                    self.pos += 1;
                }
                if self.bump() != Some(b'>') {
                    return Err(command_error("unterminated <name> reference"));
                }
                let name = String::from_utf8_lossy(&self.input[start..self.pos - 1]).into_owned();
                Ok(Expr::Name(name))
            }
            Some(_) => {
                // A bare name token.
                let start = self.pos;
                while let Some(b) = self.peek() {
                    if b" |&~?()[]".contains(&b) {
                        break;
                    }
                    self.pos += 1;
                }
                if self.pos == start {
                    return Err(command_error("empty selection term"));
                }
                let name = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
                Ok(Expr::Name(name))
            }
            None => Err(command_error("empty selection expression")),
        }
    }

    fn parse_polyrange(&mut self) -> Result<Expr> {
        let mut atoms = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some(b'$') => {
                    self.pos += 1;
                    atoms.push(Atom::Dollar);
                }
                Some(b) if b.is_ascii_digit() => {
                    let mut value: u64 = 0;
                    while let Some(b) = self.peek() {
                        if b.is_ascii_digit() {
                            value = value * 10 + u64::from(b - b'0');
                            self.pos += 1;
                        } else {
                            break;
                        }
                    }
                    atoms.push(Atom::Number(value));
                }
                Some(b'.') if self.input.get(self.pos + 1) == Some(&b'.') => {
                    self.pos += 2;
                    atoms.push(Atom::Span);
                }
                Some(b',') => {
                    self.pos += 1;
                }
                _ => break,
            }
        }
        if atoms.is_empty() {
            return Err(command_error("empty polyrange"));
        }
        Ok(Expr::Polyrange(atoms))
    }

    fn parse_text_search(&mut self) -> Result<Expr> {
        // /regex/flags with \/ escapes inside.
        self.pos += 1;
        let start = self.pos;
        let mut pattern = Vec::new();
        loop {
            match self.bump() {
                Some(b'\\') if self.peek() == Some(b'/') => {
                    pattern.push(b'/');
                    self.pos += 1;
                }
                Some(b'\\') => {
                    pattern.push(b'\\');
                    if let Some(b) = self.bump() {
                        pattern.push(b);
                    }
                }
                Some(b'/') => break,
                Some(b) => pattern.push(b),
                None => {
                    return Err(command_error(format!(
                        "unterminated /regex/ starting at byte {start}"
                    )));
                }
            }
        }
        let mut flags = String::new();
        while let Some(b) = self.peek() {
            if b.is_ascii_alphabetic() {
                flags.push(b as char);
                self.pos += 1;
            } else {
                break;
            }
        }
        let regex = regex::bytes::Regex::new(&String::from_utf8_lossy(&pattern))
            .map_err(|e| command_error(format!("bad selection regex: {e}")))?;
        Ok(Expr::TextSearch { regex, flags })
    }

    fn parse_path_set(&mut self) -> Result<Expr> {
        self.pos += 1;
        let (matcher, flags) = if self.peek() == Some(b'/') {
            self.pos += 1;
            let mut pattern = Vec::new();
            loop {
                match self.bump() {
                    Some(b'\\') if self.peek() == Some(b'/') => {
                        pattern.push(b'/');
                        self.pos += 1;
                    }
                    Some(b'/') => break,
                    Some(b) => pattern.push(b),
                    None => return Err(command_error("unterminated [/regex/] path set")),
                }
            }
            let mut flags = String::new();
            while let Some(b) = self.peek() {
                if b == b']' {
                    break;
                }
                flags.push(b as char);
                self.pos += 1;
            }
            let regex = regex::bytes::Regex::new(&String::from_utf8_lossy(&pattern))
                .map_err(|e| command_error(format!("bad path regex: {e}")))?;
            (PathMatcher::Regex(regex), flags)
        } else {
            let mut literal = Vec::new();
            while let Some(b) = self.peek() {
                if b == b']' {
                    break;
                }
                literal.push(b);
                self.pos += 1;
            }
            (PathMatcher::Literal(literal.into()), String::new())
        };
        if self.bump() != Some(b']') {
            return Err(command_error("unterminated [path] set"));
        }
        Ok(Expr::PathSet { matcher, flags })
    }

    fn parse_function(&mut self) -> Result<Expr> {
        self.pos += 1;
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphabetic() {
                self.pos += 1;
            } else {
                break;
            }
        }
        let name = String::from_utf8_lossy(&self.input[start..self.pos]).into_owned();
        if self.bump() != Some(b'(') {
            return Err(command_error(format!("@{name} requires parentheses")));
        }
        let inner = self.parse_or()?;
        self.skip_ws();
        if self.bump() != Some(b')') {
            return Err(command_error(format!("unbalanced parenthesis in @{name}()")));
        }
        const KNOWN: &[&str] = &[
            "min", "max", "amp", "pre", "suc", "srt", "rev", "par", "chn", "anc", "dsc",
        ];
        if !KNOWN.contains(&name.as_str()) {
            return Err(command_error(format!("unknown selection function @{name}()")));
        }
        Ok(Expr::Function(name, Box::new(inner)))
    }
}

impl Selection {
    /// Resolves the expression against the repository. The preselection
    /// defaults to all events.
    pub fn evaluate(
        &self,
        repo: &Repository,
        preselection: Option<&OrderedIntSet>,
    ) -> Result<OrderedIntSet> {
        let all: OrderedIntSet = (0..repo.events.len()).collect();
        let pre = preselection.unwrap_or(&all);
        eval(repo, &self.root, pre, &all)
    }
}

fn eval(
    repo: &Repository,
    expr: &Expr,
    pre: &OrderedIntSet,
    all: &OrderedIntSet,
) -> Result<OrderedIntSet> {
    match expr {
        Expr::Or(lhs, rhs) => {
            let mut out = eval(repo, lhs, pre, all)?.union(&eval(repo, rhs, pre, all)?);
            out.sort();
            Ok(out)
        }
        Expr::And(lhs, rhs) => {
            // The left result becomes the right term's preselection; this is
            // what lets an inner polyrange span the whole repository while
            // field filters narrow it.
            let left = eval(repo, lhs, pre, all)?;
            let right = eval(repo, rhs, &left, all)?;
            let mut out = left.intersection(&right);
            out.sort();
            Ok(out)
        }
        Expr::Not(inner) => {
            let exclude = eval(repo, inner, pre, all)?;
            Ok(all.difference(&exclude))
        }
        Expr::Neighbors(inner) => {
            let base = eval(repo, inner, pre, all)?;
            let mut out = base.clone();
            for index in base.iter() {
                match &repo.events[index] {
                    Event::Commit(commit) => {
                        for parent in commit.parent_marks() {
                            if let Some(i) = repo.find_mark(parent) {
                                out.push(i);
                            }
                        }
                        for child in &commit.children {
                            if let Some(i) = repo.find_mark(child) {
                                out.push(i);
                            }
                        }
                    }
                    Event::Blob(blob) => {
                        for (i, event) in repo.events.iter().enumerate() {
                            if let Some(commit) = event.as_commit()
                                && commit
                                    .fileops
                                    .iter()
                                    .any(|op| op.blob_mark() == Some(blob.mark.as_str()))
                            {
                                out.push(i);
                            }
                        }
                    }
                    Event::Tag(tag) => {
                        if let Some(mark) = tag.committish.mark()
                            && let Some(i) = repo.find_mark(mark)
                        {
                            out.push(i);
                        }
                    }
                    Event::Reset(reset) => {
                        if let Some(mark) = reset.committish.as_ref().and_then(Committish::mark)
                            && let Some(i) = repo.find_mark(mark)
                        {
                            out.push(i);
                        }
                    }
                    _ => {}
                }
            }
            out.sort();
            Ok(out)
        }
        // A polyrange resolves against the whole repository, not the
        // preselection.
        Expr::Polyrange(atoms) => resolve_polyrange(repo, atoms),
        Expr::Mark(mark) => Ok(repo.find_mark(mark).into_iter().collect()),
        Expr::Name(name) => resolve_name(repo, name),
        Expr::TextSearch { regex, flags } => {
            Ok(pre
                .iter()
                .filter(|&i| text_search_hit(repo, i, regex, flags))
                .collect())
        }
        Expr::PathSet { matcher, flags } => path_set(repo, pre, matcher, flags),
        Expr::Visibility(letters) => {
            Ok(pre
                .iter()
                .filter(|&i| visibility_hit(repo, i, letters))
                .collect())
        }
        Expr::Function(name, inner) => {
            let base = eval(repo, inner, pre, all)?;
            apply_function(repo, name, base)
        }
    }
}

fn resolve_polyrange(repo: &Repository, atoms: &[Atom]) -> Result<OrderedIntSet> {
    let last = repo.events.len().checked_sub(1);
    let value_of = |atom: &Atom| -> Result<usize> {
        match atom {
            Atom::Number(n) => {
                if *n == 0 {
                    return Err(command_error("event numbers are 1-origin"));
                }
                Ok((*n - 1) as usize)
            }
            Atom::Dollar => last.ok_or_else(|| command_error("$ in an empty repository")),
            Atom::Span => Err(command_error("misplaced .. in polyrange")),
        }
    };
    let mut out = OrderedIntSet::new();
    let mut i = 0;
    while i < atoms.len() {
        if atoms.get(i + 1) == Some(&Atom::Span) {
            let Some(right) = atoms.get(i + 2) else {
                return Err(command_error(".. lacks a right bound"));
            };
            let lo = value_of(&atoms[i])?;
            let hi = value_of(right)?;
            if lo > hi {
                return Err(command_error("descending span in polyrange"));
            }
            for v in lo..=hi {
                out.push(v);
            }
            i += 3;
        } else {
            match &atoms[i] {
                Atom::Span => return Err(command_error(".. lacks a left bound")),
                atom => out.push(value_of(atom)?),
            }
            i += 1;
        }
    }
    // Clamp to the repository.
    Ok(out
        .iter()
        .filter(|&v| v < repo.events.len())
        .collect())
}

/// Resolves a bare name: symbolic assignments, then the name cache (tag and
/// reset names, legacy IDs, action stamps), then branch tips, then dates.
fn resolve_name(repo: &Repository, name: &str) -> Result<OrderedIntSet> {
    if let Some(assigned) = repo.assignments.get(name) {
        return Ok(assigned.clone());
    }
    // Event-ordinal references like #3.
    if let Some(ordinal) = name.strip_prefix('#')
        && let Ok(n) = ordinal.parse::<usize>()
        && n >= 1
        && n <= repo.events.len()
    {
        return Ok([n - 1].into_iter().collect());
    }
    let mut hits = OrderedIntSet::new();
    for (i, event) in repo.events.iter().enumerate() {
        match event {
            Event::Tag(tag) if tag.name == name => hits.push(i),
            Event::Reset(reset) => {
                let base = reset.ref_name.rsplit('/').next().unwrap_or(&reset.ref_name);
                if name == format!("reset@{base}") || name == reset.ref_name {
                    hits.push(i);
                }
            }
            _ => {}
        }
    }
    if !hits.is_empty() {
        return Ok(hits);
    }
    if let Some(mark) = repo.legacy_map.get(name)
        && let Some(i) = repo.find_mark(mark)
    {
        return Ok([i].into_iter().collect());
    }
    // A branch name selects the branch tip.
    for candidate in [name.to_owned(), format!("refs/heads/{name}")] {
        if let Some(tip) = repo.branch_tip(&candidate) {
            return Ok([tip].into_iter().collect());
        }
    }
    // Action stamps, full timestamps, and bare dates.
    if name.contains('!') {
        return resolve_action_stamp(repo, name);
    }
    if let Ok(date) = Date::parse(name) {
        let mut hits = OrderedIntSet::new();
        for (i, event) in repo.events.iter().enumerate() {
            if event_timestamp(event) == Some(date.timestamp()) {
                hits.push(i);
            }
        }
        return Ok(hits);
    }
    if regex::Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap().is_match(name) {
        let mut hits = OrderedIntSet::new();
        for (i, event) in repo.events.iter().enumerate() {
            if let Some(day) = event_day(event)
                && day == name
            {
                hits.push(i);
            }
        }
        return Ok(hits);
    }
    // Unknown names resolve to the empty set, not an error.
    Ok(OrderedIntSet::new())
}

fn resolve_action_stamp(repo: &Repository, stamp: &str) -> Result<OrderedIntSet> {
    let Ok((date, email, ordinal)) = crate::date::parse_action_stamp(stamp) else {
        return Ok(OrderedIntSet::new());
    };
    let mut hits = OrderedIntSet::new();
    for (i, event) in repo.events.iter().enumerate() {
        let matched = match event {
            Event::Commit(commit) => {
                commit.committer.date.timestamp() == date.timestamp()
                    && commit.committer.email == email
            }
            Event::Tag(tag) => tag
                .tagger
                .as_ref()
                .is_some_and(|t| t.date.timestamp() == date.timestamp() && t.email == email),
            _ => false,
        };
        if matched {
            hits.push(i);
        }
    }
    match ordinal {
        Some(n) => Ok(hits.iter().nth(n.saturating_sub(1)).into_iter().collect()),
        None => Ok(hits),
    }
}

fn event_timestamp(event: &Event) -> Option<i64> {
    match event {
        Event::Commit(commit) => Some(commit.committer.date.timestamp()),
        Event::Tag(tag) => tag.tagger.as_ref().map(|t| t.date.timestamp()),
        _ => None,
    }
}

fn event_day(event: &Event) -> Option<String> {
    match event {
        Event::Commit(commit) => Some(commit.committer.date.utc_day()),
        Event::Tag(tag) => tag.tagger.as_ref().map(|t| t.date.utc_day()),
        _ => None,
    }
}

/// Which fields a /regex/ searches, by flag letter. With no flags the
/// search covers every text field except blob content and committishes.
fn text_search_hit(repo: &Repository, index: usize, regex: &regex::bytes::Regex, flags: &str) -> bool {
    let want = |letter: char| flags.contains(letter) || flags.is_empty();
    match &repo.events[index] {
        Event::Commit(commit) => {
            (want('c') && regex.is_match(&commit.comment))
                || (want('b') && regex.is_match(commit.branch.as_bytes()))
                || (want('C')
                    && (regex.is_match(commit.committer.name.as_bytes())
                        || regex.is_match(commit.committer.email.as_bytes())))
                || (want('a')
                    && commit.authors.iter().any(|a| {
                        regex.is_match(a.name.as_bytes()) || regex.is_match(a.email.as_bytes())
                    }))
        }
        Event::Tag(tag) => {
            (want('n') && regex.is_match(tag.name.as_bytes()))
                || (want('c') && regex.is_match(&tag.comment))
                || (want('t')
                    && tag.tagger.as_ref().is_some_and(|t| {
                        regex.is_match(t.name.as_bytes()) || regex.is_match(t.email.as_bytes())
                    }))
                || (flags.contains('r') && regex.is_match(tag.committish.emit().as_bytes()))
        }
        Event::Reset(reset) => {
            (want('n') && regex.is_match(reset.ref_name.as_bytes()))
                || (flags.contains('r')
                    && reset
                        .committish
                        .as_ref()
                        .is_some_and(|c| regex.is_match(c.emit().as_bytes())))
        }
        Event::Passthrough(passthrough) => want('p') && regex.is_match(&passthrough.text),
        Event::Blob(blob) => {
            flags.contains('B')
                && blob
                    .materialize(repo.source_handle.as_ref())
                    .is_ok_and(|content| regex.is_match(&content))
        }
        Event::Callout(_) => false,
    }
}

/// Path-set resolution. Flags: `a` requires every touched path to match,
/// `c` matches against the checkout manifest instead of touched paths, and
/// any of `DMRCN` restricts which fileop types are considered.
fn path_set(
    repo: &Repository,
    pre: &OrderedIntSet,
    matcher: &PathMatcher,
    flags: &str,
) -> Result<OrderedIntSet> {
    let all_must_match = flags.contains('a');
    let checkout = flags.contains('c');
    let op_filter: String = flags.chars().filter(|c| "DMRCN".contains(*c)).collect();
    let op_wanted = |op: &FileOp| -> bool {
        if op_filter.is_empty() {
            return true;
        }
        let letter = match op {
            FileOp::Modify { .. } => 'M',
            FileOp::Delete { .. } => 'D',
            FileOp::Rename { .. } => 'R',
            FileOp::Copy { .. } => 'C',
            FileOp::Note { .. } => 'N',
            FileOp::DeleteAll => 'D',
        };
        op_filter.contains(letter)
    };

    let mut hits = OrderedIntSet::new();
    let mut matched_blobs: Vec<String> = Vec::new();
    for index in pre.iter() {
        let Some(commit) = repo.events[index].as_commit() else {
            continue;
        };
        let hit = if checkout {
            let Some(mark) = commit.mark.as_deref() else {
                continue;
            };
            let manifest = repo.manifest(mark)?;
            let paths = manifest.paths();
            if all_must_match {
                !paths.is_empty() && paths.iter().all(|p| matcher.matches(p.as_bstr()))
            } else {
                paths.iter().any(|p| matcher.matches(p.as_bstr()))
            }
        } else {
            let considered: Vec<&FileOp> =
                commit.fileops.iter().filter(|op| op_wanted(op)).collect();
            let match_op = |op: &FileOp| op.paths().iter().any(|p| matcher.matches(p));
            if all_must_match {
                !considered.is_empty() && considered.iter().all(|op| match_op(op))
            } else {
                considered.iter().any(|op| match_op(op))
            }
        };
        if hit {
            hits.push(index);
            for op in &commit.fileops {
                if op.paths().iter().any(|p| matcher.matches(p))
                    && let Some(mark) = op.blob_mark()
                {
                    matched_blobs.push(mark.to_owned());
                }
            }
        }
    }
    // Blobs referenced at matching paths join the set.
    for mark in matched_blobs {
        if let Some(i) = repo.find_mark(&mark)
            && pre.contains(i)
        {
            hits.push(i);
        }
    }
    hits.sort();
    Ok(hits)
}

fn visibility_hit(repo: &Repository, index: usize, letters: &str) -> bool {
    let event = &repo.events[index];
    for letter in letters.chars() {
        let hit = match letter {
            'C' => matches!(event, Event::Commit(_)),
            'T' => matches!(event, Event::Tag(_)),
            'B' => matches!(event, Event::Blob(_)),
            'R' => matches!(event, Event::Reset(_)),
            'P' => matches!(event, Event::Passthrough(_)),
            'H' => event
                .as_commit()
                .is_some_and(|c| c.children.is_empty()),
            'O' => event.as_commit().is_some_and(|c| c.parents.is_empty()),
            'M' => event.as_commit().is_some_and(crate::event::Commit::is_merge),
            'F' => event.as_commit().is_some_and(|c| c.children.len() > 1),
            'L' => event
                .as_commit()
                .is_some_and(|c| unclean_comment(c.comment.as_bstr())),
            'I' => event.as_commit().is_some_and(|c| {
                let (_, had_errors) =
                    encoding_rs::UTF_8.decode_without_bom_handling(&c.comment);
                had_errors
            }),
            'D' => event.as_commit().is_some_and(crate::event::Commit::all_deletes),
            'N' => has_legacy_cookie(repo, event),
            'Z' => event.as_commit().is_some_and(crate::event::Commit::is_empty),
            'U' => event.as_commit().is_some_and(crate::event::Commit::has_callouts),
            _ => false,
        };
        if hit {
            return true;
        }
    }
    false
}

/// A multi-line comment whose second line is not blank; gitspace tooling
/// expects a blank separator after the summary line.
fn unclean_comment(comment: &BStr) -> bool {
    let mut lines = comment.lines();
    let Some(_summary) = lines.next() else {
        return false;
    };
    match lines.next() {
        Some(second) => !second.trim().is_empty(),
        None => false,
    }
}

fn has_legacy_cookie(repo: &Repository, event: &Event) -> bool {
    match event {
        Event::Blob(blob) => blob.cookie.is_some(),
        Event::Commit(commit) => commit.fileops.iter().any(|op| {
            op.blob_mark()
                .and_then(|mark| repo.blob_by_mark(mark))
                .is_some_and(|blob| blob.cookie.is_some())
        }),
        _ => false,
    }
}

fn apply_function(repo: &Repository, name: &str, base: OrderedIntSet) -> Result<OrderedIntSet> {
    match name {
        "min" => Ok(base.iter().min().into_iter().collect()),
        "max" => Ok(base.iter().max().into_iter().collect()),
        "amp" => {
            if base.is_empty() {
                Ok(OrderedIntSet::new())
            } else {
                Ok((0..repo.events.len()).collect())
            }
        }
        "pre" => Ok(base
            .iter()
            .filter_map(|i| i.checked_sub(1))
            .collect()),
        "suc" => Ok(base
            .iter()
            .map(|i| i + 1)
            .filter(|&i| i < repo.events.len())
            .collect()),
        "srt" => {
            let mut out = base;
            out.sort();
            Ok(out)
        }
        "rev" => {
            let mut out = base;
            out.reverse();
            Ok(out)
        }
        "par" | "chn" | "anc" | "dsc" => graph_walk(repo, name, base),
        _ => Err(command_error(format!("unknown selection function @{name}()"))),
    }
}

/// Graph-walking functions: @par/@chn are first generation only, @anc/@dsc
/// are the reflexive-transitive closures.
fn graph_walk(repo: &Repository, name: &str, base: OrderedIntSet) -> Result<OrderedIntSet> {
    let forward = matches!(name, "chn" | "dsc");
    let transitive = matches!(name, "anc" | "dsc");
    let step = |index: usize| -> Vec<usize> {
        let Some(commit) = repo.commit_at(index) else {
            return Vec::new();
        };
        if forward {
            commit
                .children
                .iter()
                .filter_map(|m| repo.find_mark(m))
                .collect()
        } else {
            commit
                .parent_marks()
                .into_iter()
                .filter_map(|m| repo.find_mark(m))
                .collect()
        }
    };
    let mut out = OrderedIntSet::new();
    if transitive {
        // Reflexive closure: the seeds are included.
        let mut queue: Vec<usize> = base.iter().collect();
        while let Some(index) = queue.pop() {
            if out.contains(index) {
                continue;
            }
            out.push(index);
            queue.extend(step(index));
        }
    } else {
        for index in base.iter() {
            for next in step(index) {
                out.push(next);
            }
        }
    }
    out.sort();
    Ok(out)
}
