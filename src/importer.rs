use crate::attribution::Attribution;
use crate::config::ReadOptions;
use crate::error::ParseError;
use crate::event::Blob;
use crate::event::BlobBody;
use crate::event::BlobRef;
use crate::event::Commit;
use crate::event::Committish;
use crate::event::Cookie;
use crate::event::Event;
use crate::event::FileOp;
use crate::event::Passthrough;
use crate::event::Reset;
use crate::event::Tag;
use crate::event::is_valid_mode;
use crate::repository::Repository;
use crate::util::take_path_token;
use anyhow::Result;
use bstr::BString;
use bstr::ByteSlice as _;
use lazy_static::lazy_static;
use std::cell::RefCell;
use std::io::BufRead;
use std::io::BufReader;
use std::io::Read;
use std::path::Path;

/// How much of a blob's head is scanned for dollar cookies.
const COOKIE_SCAN_LIMIT: usize = 8192;

lazy_static! {
    static ref DOLLAR_ID: regex::bytes::Regex =
        regex::bytes::Regex::new(r"\$Id: *([^ ]+) +(\d+) ").unwrap();
    static ref DOLLAR_REVISION: regex::bytes::Regex =
        regex::bytes::Regex::new(r"\$Revision: *(\d+) *\$").unwrap();
    static ref DOLLAR_LASTCHANGED: regex::bytes::Regex =
        regex::bytes::Regex::new(r"\$LastChangedRev: *(\d+) *\$").unwrap();
}

/// Scans blob content for CVS/Subversion keyword-expansion cookies and
/// returns the embedded `(path, revision)` identity if one is present.
pub fn scan_dollar_cookie(content: &[u8]) -> Option<Cookie> {
    let head = &content[..content.len().min(COOKIE_SCAN_LIMIT)];
    if let Some(caps) = DOLLAR_ID.captures(head) {
        return Some(Cookie {
            path: caps.get(1).unwrap().as_bytes().into(),
            rev: String::from_utf8_lossy(caps.get(2).unwrap().as_bytes()).into_owned(),
        });
    }
    for pattern in [&*DOLLAR_REVISION, &*DOLLAR_LASTCHANGED] {
        if let Some(caps) = pattern.captures(head) {
            return Some(Cookie {
                path: BString::from(""),
                rev: String::from_utf8_lossy(caps.get(1).unwrap().as_bytes()).into_owned(),
            });
        }
    }
    None
}

/// Reads a repository from a stream file, auto-detecting the dialect. For
/// regular files, blob content stays in the file as byte ranges and the
/// handle is retained for on-demand reads.
pub fn read_stream_file(path: &Path, name: &str, options: &ReadOptions) -> Result<Repository> {
    let file = std::fs::File::open(path)?;
    let mut parser = StreamParser::new(BufReader::new(file), name, options, true);
    parser.run()?;
    let mut repo = parser.finish();
    repo.source_handle = Some(RefCell::new(std::fs::File::open(path)?));
    Ok(repo)
}

/// Reads a repository from in-memory bytes (or anything unseekable); blob
/// content is held in memory.
pub fn read_stream_bytes(data: &[u8], name: &str, options: &ReadOptions) -> Result<Repository> {
    let mut parser = StreamParser::new(BufReader::new(data), name, options, false);
    parser.run()?;
    Ok(parser.finish())
}

pub(crate) struct StreamParser<'a, R: BufRead> {
    reader: R,
    /// Current line with the trailing LF stripped.
    line: BString,
    /// 1-origin line number of `line`.
    lineno: u64,
    /// Byte offset just past the end of `line` (including its LF).
    offset: u64,
    eof: bool,
    repo: Repository,
    options: &'a ReadOptions,
    /// Blob byte ranges refer into the source file when set.
    seekable: bool,
    /// Parse warnings queued for flushing after the parse completes, so a
    /// big repository's diagnostics are not interleaved with progress text.
    pub warnings: Vec<String>,
}

impl<'a, R: BufRead> StreamParser<'a, R> {
    pub(crate) fn new(reader: R, name: &str, options: &'a ReadOptions, seekable: bool) -> Self {
        Self {
            reader,
            line: BString::from(""),
            lineno: 0,
            offset: 0,
            eof: false,
            repo: Repository::new(name),
            options,
            seekable,
            warnings: Vec::new(),
        }
    }

    pub(crate) fn finish(self) -> Repository {
        for warning in &self.warnings {
            log::warn!("{warning}");
        }
        self.repo
    }

    fn err(&self, message: impl Into<String>) -> anyhow::Error {
        ParseError::new(self.lineno, message).into()
    }

    /// Reads the next line into `self.line` without its trailing LF.
    /// Returns false at end of input.
    fn advance(&mut self) -> Result<bool> {
        self.line.clear();
        let mut raw = Vec::new();
        let bytes = self.reader.read_until(b'\n', &mut raw)?;
        if bytes == 0 {
            self.eof = true;
            return Ok(false);
        }
        self.lineno += 1;
        self.offset += bytes as u64;
        if raw.last() == Some(&b'\n') {
            raw.pop();
        }
        self.line = raw.into();
        Ok(true)
    }

    fn read_exact_bytes(&mut self, count: u64) -> Result<BString> {
        let mut buf = vec![0u8; count as usize];
        self.reader
            .read_exact(&mut buf)
            .map_err(|_| self.err("truncated data block"))?;
        self.offset += count;
        self.lineno += buf.iter().filter(|&&b| b == b'\n').count() as u64;
        Ok(buf.into())
    }

    fn skip_bytes(&mut self, count: u64) -> Result<()> {
        // Even in seek mode the reader is a plain BufRead, so consume
        // forward; the blob body records the absolute range.
        let mut remaining = count;
        let mut chunk = [0u8; 8192];
        while remaining > 0 {
            let take = remaining.min(chunk.len() as u64) as usize;
            self.reader
                .read_exact(&mut chunk[..take])
                .map_err(|_| self.err("truncated data block"))?;
            remaining -= take as u64;
        }
        self.offset += count;
        Ok(())
    }

    /// Parses a `data` directive and returns the payload. In seekable mode
    /// `for_blob` payloads are skipped and returned as a byte range.
    fn read_data(&mut self, for_blob: bool) -> Result<(Option<BString>, Option<(u64, u64)>)> {
        let Some(arg) = self.line.strip_prefix(b"data ") else {
            return Err(self.err(format!("expected 'data' line, found {:?}", self.line)));
        };
        if let Some(delim) = arg.strip_prefix(b"<<") {
            let delim: BString = delim.into();
            let mut content = BString::from("");
            loop {
                if !self.advance()? {
                    return Err(self.err(format!("heredoc delimiter {delim:?} never found")));
                }
                if self.line == delim {
                    break;
                }
                content.extend_from_slice(&self.line);
                content.push(b'\n');
            }
            return Ok((Some(content), None));
        }
        let count: u64 = arg
            .to_str()
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.err(format!("bad data length {arg:?}")))?;
        if for_blob && self.seekable {
            let start = self.offset;
            self.skip_bytes(count)?;
            return Ok((None, Some((start, count))));
        }
        let content = self.read_exact_bytes(count)?;
        Ok((Some(content), None))
    }

    /// Consumes the optional LF allowed after a counted data block, leaving
    /// the next real line loaded.
    fn advance_past_data(&mut self) -> Result<()> {
        if self.advance()? && self.line.is_empty() {
            self.advance()?;
        }
        Ok(())
    }

    fn parse_blob(&mut self) -> Result<()> {
        if !self.advance()? {
            return Err(self.err("truncated blob"));
        }
        let mark = match self.line.strip_prefix(b"mark ") {
            Some(mark) => {
                let mark = mark.to_str().map_err(|_| self.err("non-UTF8 mark"))?.to_owned();
                if !self.advance()? {
                    return Err(self.err("truncated blob"));
                }
                mark
            }
            None => return Err(self.err("blob without a mark")),
        };
        self.repo.note_mark(&mark);
        let (content, range) = self.read_data(true)?;
        let blob = match (content, range) {
            (Some(content), _) => {
                let cookie = scan_dollar_cookie(&content);
                let mut blob = Blob::new(mark, BlobBody::Memory(content));
                blob.cookie = cookie;
                blob
            }
            // Cookie scanning of range blobs is deferred to lint time;
            // scanning here would defeat the seek optimization.
            (None, Some((start, len))) => Blob::new(mark, BlobBody::Range { start, len }),
            (None, None) => unreachable!(),
        };
        self.repo.events.push(Event::Blob(blob));
        self.advance_past_data()
    }

    fn parse_attribution(&mut self, keyword: &[u8]) -> Result<Option<Attribution>> {
        let mut prefix = keyword.to_vec();
        prefix.push(b' ');
        let Some(body) = self.line.strip_prefix(prefix.as_slice()) else {
            return Ok(None);
        };
        let attribution = Attribution::parse(body.as_bstr())
            .map_err(|e| self.err(format!("malformed attribution: {e}")))?;
        Ok(Some(attribution))
    }

    fn parse_optional_committish(&mut self, keyword: &[u8]) -> Option<Committish> {
        let mut prefix = keyword.to_vec();
        prefix.push(b' ');
        let body = self.line.strip_prefix(prefix.as_slice())?;
        let text = body.to_str().ok()?.trim().to_owned();
        if text.starts_with(':') {
            Some(Committish::Mark(text))
        } else {
            // An action stamp or foreign hash; keep it as a callout.
            Some(Committish::Callout(text))
        }
    }

    fn parse_fileop(&mut self) -> Result<Option<FileOp>> {
        let line = self.line.clone();
        let op = if let Some(rest) = line.strip_prefix(b"M ") {
            let Some(space) = rest.find_byte(b' ') else {
                return Err(self.err("malformed M fileop"));
            };
            let mode = rest[..space]
                .to_str()
                .map_err(|_| self.err("bad mode"))?
                .to_owned();
            if !is_valid_mode(&mode) {
                return Err(self.err(format!("invalid file mode {mode}")));
            }
            let rest = &rest[space + 1..];
            let Some(space) = rest.find_byte(b' ') else {
                return Err(self.err("malformed M fileop"));
            };
            let dataref = rest[..space].to_str().map_err(|_| self.err("bad dataref"))?;
            let (path, _) = take_path_token(&rest[space + 1..], true)
                .map_err(|e| self.err(format!("bad path: {e}")))?;
            let blobref = if dataref == "inline" {
                if !self.advance()? {
                    return Err(self.err("truncated inline data"));
                }
                let (content, _) = self.read_data(false)?;
                self.advance_past_data()?;
                BlobRef::Inline(content.unwrap())
            } else if dataref.starts_with(':') {
                self.advance()?;
                BlobRef::Mark(dataref.to_owned())
            } else {
                return Err(self.err(format!("unknown M ref {dataref}")));
            };
            return Ok(Some(FileOp::Modify {
                mode,
                blobref,
                path,
            }));
        } else if let Some(rest) = line.strip_prefix(b"D ") {
            let (path, _) =
                take_path_token(rest, true).map_err(|e| self.err(format!("bad path: {e}")))?;
            FileOp::Delete { path }
        } else if let Some(rest) = line.strip_prefix(b"R ") {
            let (source, rest) =
                take_path_token(rest, false).map_err(|e| self.err(format!("bad path: {e}")))?;
            let (target, _) =
                take_path_token(rest, true).map_err(|e| self.err(format!("bad path: {e}")))?;
            FileOp::Rename { source, target }
        } else if let Some(rest) = line.strip_prefix(b"C ") {
            let (source, rest) =
                take_path_token(rest, false).map_err(|e| self.err(format!("bad path: {e}")))?;
            let (target, _) =
                take_path_token(rest, true).map_err(|e| self.err(format!("bad path: {e}")))?;
            FileOp::Copy { source, target }
        } else if let Some(rest) = line.strip_prefix(b"N ") {
            let Some(space) = rest.find_byte(b' ') else {
                return Err(self.err("malformed N fileop"));
            };
            let dataref = rest[..space].to_str().map_err(|_| self.err("bad dataref"))?;
            let (path, _) = take_path_token(&rest[space + 1..], true)
                .map_err(|e| self.err(format!("bad path: {e}")))?;
            let blobref = if dataref == "inline" {
                if !self.advance()? {
                    return Err(self.err("truncated inline data"));
                }
                let (content, _) = self.read_data(false)?;
                self.advance_past_data()?;
                BlobRef::Inline(content.unwrap())
            } else {
                self.advance()?;
                BlobRef::Mark(dataref.to_owned())
            };
            return Ok(Some(FileOp::Note { blobref, path }));
        } else if line.as_slice() == b"deleteall" {
            FileOp::DeleteAll
        } else {
            return Ok(None);
        };
        self.advance()?;
        Ok(Some(op))
    }

    /// Normalizes a freshly parsed comment per the `--canonicalize` read
    /// option.
    fn cook_comment(&self, comment: BString) -> BString {
        if !self.options.canonicalize {
            return comment;
        }
        let text = comment.replace(b"\r\n", b"\n");
        match String::from_utf8(text) {
            Ok(s) => crate::util::ensure_one_trailing_newline(
                s.lines().map(str::trim_end).collect::<Vec<_>>().join("\n"),
            )
            .into(),
            Err(e) => e.into_bytes().into(),
        }
    }

    fn parse_commit(&mut self) -> Result<()> {
        let branch = self
            .line
            .strip_prefix(b"commit ")
            .unwrap()
            .to_str()
            .map_err(|_| self.err("non-UTF8 branch name"))?
            .trim()
            .to_owned();
        if !self.advance()? {
            return Err(self.err("truncated commit"));
        }
        let mut mark = None;
        if let Some(m) = self.line.strip_prefix(b"mark ") {
            let m = m.to_str().map_err(|_| self.err("non-UTF8 mark"))?.to_owned();
            self.repo.note_mark(&m);
            mark = Some(m);
            if !self.advance()? {
                return Err(self.err("truncated commit"));
            }
        }
        let mut authors = Vec::new();
        while let Some(author) = self.parse_attribution(b"author")? {
            authors.push(author);
            if !self.advance()? {
                return Err(self.err("truncated commit"));
            }
        }
        let Some(committer) = self.parse_attribution(b"committer")? else {
            return Err(self.err("commit without committer"));
        };
        if !self.advance()? {
            return Err(self.err("truncated commit"));
        }
        let (comment, _) = self.read_data(false)?;
        let comment = self.cook_comment(comment.unwrap());
        self.advance_past_data()?;

        let mut commit = Commit::new(branch, committer);
        commit.mark = mark;
        commit.authors = authors;
        commit.comment = comment;

        if let Some(parent) = self.parse_optional_committish(b"from") {
            commit.parents.push(parent);
            self.advance()?;
        }
        while let Some(parent) = self.parse_optional_committish(b"merge") {
            commit.parents.push(parent);
            self.advance()?;
        }
        loop {
            if self.eof || self.line.is_empty() {
                break;
            }
            if let Some(rest) = self.line.clone().strip_prefix(b"property ") {
                self.parse_property(rest, &mut commit)?;
                self.advance()?;
                continue;
            }
            match self.parse_fileop()? {
                Some(op) => commit.fileops.push(op),
                None => break,
            }
        }
        if let Some(legacy) = commit.properties.get("legacy-id") {
            commit.legacy_id = legacy.to_str().ok().map(str::to_owned);
        }
        if let (Some(legacy), Some(mark)) = (&commit.legacy_id, &commit.mark) {
            self.repo.legacy_map.insert(legacy.clone(), mark.clone());
        }
        self.repo.events.push(Event::Commit(commit));
        Ok(())
    }

    /// `property <name> [<length> <value>]`; a bare name is a boolean.
    fn parse_property(&mut self, rest: &[u8], commit: &mut Commit) -> Result<()> {
        let rest = rest.as_bstr();
        let (name, remainder) = match rest.find_byte(b' ') {
            Some(idx) => (&rest[..idx], &rest[idx + 1..]),
            None => {
                commit.properties.insert(
                    rest.to_str().map_err(|_| self.err("non-UTF8 property"))?,
                    BString::from("true"),
                );
                return Ok(());
            }
        };
        let name = name
            .to_str()
            .map_err(|_| self.err("non-UTF8 property name"))?
            .to_owned();
        let Some(space) = remainder.find_byte(b' ') else {
            return Err(self.err("malformed property line"));
        };
        let length: usize = remainder[..space]
            .to_str()
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| self.err("bad property length"))?;
        let mut value: BString = remainder[space + 1..].into();
        // A property value may continue across lines up to its declared
        // length.
        while value.len() < length {
            value.push(b'\n');
            if value.len() >= length {
                break;
            }
            if !self.advance()? {
                return Err(self.err("truncated property value"));
            }
            value.extend_from_slice(&self.line);
        }
        value.truncate(length);
        commit.properties.insert(name, value);
        Ok(())
    }

    fn parse_tag(&mut self) -> Result<()> {
        let name = self
            .line
            .strip_prefix(b"tag ")
            .unwrap()
            .to_str()
            .map_err(|_| self.err("non-UTF8 tag name"))?
            .trim()
            .to_owned();
        if !self.advance()? {
            return Err(self.err("truncated tag"));
        }
        let Some(committish) = self.parse_optional_committish(b"from") else {
            return Err(self.err(format!("tag {name} without 'from'")));
        };
        if !self.advance()? {
            return Err(self.err("truncated tag"));
        }
        let mut tag = Tag::new(name, committish);
        if let Some(tagger) = self.parse_attribution(b"tagger")? {
            tag.tagger = Some(tagger);
            if !self.advance()? {
                return Err(self.err("truncated tag"));
            }
        }
        let (comment, _) = self.read_data(false)?;
        tag.comment = self.cook_comment(comment.unwrap());
        self.repo.events.push(Event::Tag(tag));
        self.advance_past_data()
    }

    fn parse_reset(&mut self) -> Result<()> {
        let ref_name = self
            .line
            .strip_prefix(b"reset ")
            .unwrap()
            .to_str()
            .map_err(|_| self.err("non-UTF8 ref name"))?
            .trim()
            .to_owned();
        let mut reset = Reset::new(ref_name, None);
        if self.advance()? {
            match self.parse_optional_committish(b"from") {
                Some(committish) => {
                    reset.committish = Some(committish);
                    self.repo.events.push(Event::Reset(reset));
                    self.advance()?;
                }
                None => self.repo.events.push(Event::Reset(reset)),
            }
        } else {
            self.repo.events.push(Event::Reset(reset));
        }
        Ok(())
    }

    fn parse_passthrough(&mut self) -> Result<()> {
        if let Some(rest) = self.line.strip_prefix(b"#reposurgeon sourcetype ") {
            if let Ok(kind) = rest.to_str() {
                self.repo.sourcetype = Some(kind.trim().to_owned());
            }
        }
        self.repo.events.push(Event::Passthrough(Passthrough {
            text: self.line.clone(),
        }));
        self.advance()?;
        Ok(())
    }

    /// The main directive loop for the fast-import dialect.
    pub(crate) fn run(&mut self) -> Result<()> {
        if !self.advance()? {
            return Ok(());
        }
        // Skip leading blank lines before dialect detection.
        while self.line.is_empty() {
            if !self.advance()? {
                return Ok(());
            }
        }
        if self.line.starts_with(b"SVN-fs-dump-format-version:") {
            return Err(self.err(
                "Subversion dump input must go through the svn reader, not the fast-import parser",
            ));
        }
        loop {
            if self.eof {
                break;
            }
            if self.line.is_empty() {
                if !self.advance()? {
                    break;
                }
                continue;
            }
            if self.line.as_slice() == b"blob" {
                self.parse_blob()?;
            } else if self.line.starts_with(b"commit ") {
                self.parse_commit()?;
            } else if self.line.starts_with(b"tag ") {
                self.parse_tag()?;
            } else if self.line.starts_with(b"reset ") {
                self.parse_reset()?;
            } else if self.line.starts_with(b"#") {
                self.parse_passthrough()?;
            } else if self.line.as_slice() == b"done" {
                self.repo.events.push(Event::Passthrough(Passthrough {
                    text: self.line.clone(),
                }));
                break;
            } else if self.line.starts_with(b"feature ")
                || self.line.starts_with(b"option ")
                || self.line.starts_with(b"checkpoint")
                || self.line.starts_with(b"progress ")
            {
                // Unknown-but-harmless directives survive as passthroughs.
                self.parse_passthrough()?;
            } else {
                return Err(self.err(format!("unexpected directive {:?}", self.line)));
            }
        }
        self.resolve_structure()?;
        Ok(())
    }

    /// Post-parse pass: child links, structural sanity.
    fn resolve_structure(&mut self) -> Result<()> {
        self.repo.rebuild_children();
        for complaint in self.repo.check_invariants() {
            self.warnings.push(complaint);
        }
        Ok(())
    }
}

/// Detects the stream dialect and reads a repository from `path`.
/// Subversion dumps are recognized by their leading
/// `SVN-fs-dump-format-version:` header.
pub fn read_auto_file(path: &Path, name: &str, options: &ReadOptions) -> Result<Repository> {
    let mut head = [0u8; 64];
    let mut file = std::fs::File::open(path)?;
    let got = file.read(&mut head)?;
    let is_svn = is_svn_dump(&head[..got]);
    drop(file);
    if is_svn {
        let file = std::fs::File::open(path)?;
        crate::svnlift::read_svn_dump(BufReader::new(file), name, options)
    } else {
        read_stream_file(path, name, options)
    }
}

/// Detects the stream dialect and reads a repository from memory.
pub fn read_auto_bytes(data: &[u8], name: &str, options: &ReadOptions) -> Result<Repository> {
    if is_svn_dump(data) {
        crate::svnlift::read_svn_dump(BufReader::new(data), name, options)
    } else {
        read_stream_bytes(data, name, options)
    }
}

fn is_svn_dump(head: &[u8]) -> bool {
    bstr::ByteSlice::lines(head)
        .find(|line| !line.trim().is_empty())
        .is_some_and(|line| line.starts_with(b"SVN-fs-dump-format-version:"))
}
