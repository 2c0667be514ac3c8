use crate::error::ParseError;
use crate::orderedset::OrderedMap;
use anyhow::Result;
use bstr::BString;
use bstr::ByteSlice as _;
use std::collections::HashMap;
use std::io::BufRead;
use std::io::Read;

/// One entry in a Subversion revision: an action applied to a path.
#[derive(Debug, Clone)]
pub struct NodeAction {
    pub revision: u64,
    pub path: String,
    pub kind: NodeKind,
    pub action: ActionKind,
    pub from_rev: Option<u64>,
    pub from_path: Option<String>,
    pub content_hash: Option<String>,
    pub blob: Option<BString>,
    pub props: Option<OrderedMap<BString>>,
    /// Marked for removal by dead-branch elimination.
    pub dead: bool,
    /// Derived: paths visible under this node just before a delete/replace
    /// was applied.
    pub deleted_paths: Vec<BString>,
    /// Derived: `(source-relative path, source node)` entries captured from
    /// the copy-source filemap snapshot.
    pub copied_entries: Vec<(BString, NodeRef)>,
    /// Derived: the node that previously held this path, for content and
    /// mode inheritance on prop-only changes.
    pub prior: Option<NodeRef>,
    /// Derived: whether the copy target already had content when the copy
    /// landed (distinguishes branch creation from resurrection).
    pub target_preexisting: bool,
}

/// Identifies the NodeAction that last touched a path: `(revision,
/// node index within that revision)`.
pub type NodeRef = (u64, usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
    /// Deletes often omit Node-kind.
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Add,
    Change,
    Delete,
    Replace,
}

impl NodeAction {
    pub fn is_copy(&self) -> bool {
        self.from_path.is_some()
    }

    pub fn has_properties(&self) -> bool {
        self.props.is_some()
    }

    pub fn property(&self, name: &str) -> Option<&BString> {
        self.props.as_ref().and_then(|p| p.get(name))
    }
}

/// A revision record: its properties (log, author, date and anything else)
/// plus its ordered node actions.
#[derive(Debug, Clone)]
pub struct RevisionRecord {
    pub revision: u64,
    pub props: OrderedMap<BString>,
    pub nodes: Vec<NodeAction>,
}

impl RevisionRecord {
    pub fn log(&self) -> Option<&BString> {
        self.props.get("svn:log")
    }

    pub fn author(&self) -> Option<&BString> {
        self.props.get("svn:author")
    }

    pub fn date(&self) -> Option<&BString> {
        self.props.get("svn:date")
    }
}

#[derive(Debug, Clone, Default)]
pub struct SvnDump {
    pub format: u32,
    pub uuid: Option<String>,
    pub revisions: Vec<RevisionRecord>,
}

struct DumpParser<R: BufRead> {
    reader: R,
    lineno: u64,
}

impl<R: BufRead> DumpParser<R> {
    fn err(&self, message: impl Into<String>) -> anyhow::Error {
        ParseError::new(self.lineno, message).into()
    }

    fn next_line(&mut self) -> Result<Option<BString>> {
        let mut raw = Vec::new();
        if self.reader.read_until(b'\n', &mut raw)? == 0 {
            return Ok(None);
        }
        self.lineno += 1;
        if raw.last() == Some(&b'\n') {
            raw.pop();
        }
        Ok(Some(raw.into()))
    }

    /// Reads a `Key: value` header block terminated by a blank line (or
    /// EOF). Returns None if the stream ends before any header.
    fn read_headers(&mut self) -> Result<Option<OrderedMap<String>>> {
        let mut headers = OrderedMap::new();
        loop {
            let Some(line) = self.next_line()? else {
                return Ok(if headers.is_empty() { None } else { Some(headers) });
            };
            if line.is_empty() {
                if headers.is_empty() {
                    continue;
                }
                return Ok(Some(headers));
            }
            let Some((key, value)) = line.split_once_str(b": ") else {
                return Err(self.err(format!("malformed header line {line:?}")));
            };
            let key = key.to_str().map_err(|_| self.err("non-UTF8 header"))?;
            let value = value.to_str().map_err(|_| self.err("non-UTF8 header"))?;
            headers.insert(key.to_owned(), value.to_owned());
        }
    }

    fn read_exact(&mut self, count: usize) -> Result<BString> {
        let mut buf = vec![0u8; count];
        self.reader
            .read_exact(&mut buf)
            .map_err(|_| self.err("truncated content block"))?;
        self.lineno += buf.iter().filter(|&&b| b == b'\n').count() as u64;
        Ok(buf.into())
    }

    /// Parses a `K`/`V` property block ending in PROPS-END. Format 3 delta
    /// dumps also carry `D <len>` deletions, which map to empty values.
    fn read_props(&mut self, _length: usize) -> Result<OrderedMap<BString>> {
        let mut props = OrderedMap::new();
        loop {
            let Some(line) = self.next_line()? else {
                return Err(self.err("property block without PROPS-END"));
            };
            if line.as_slice() == b"PROPS-END" {
                return Ok(props);
            }
            if let Some(len) = line.strip_prefix(b"K ") {
                let len: usize = parse_len(len).ok_or_else(|| self.err("bad K length"))?;
                let key = self.read_exact(len)?;
                self.expect_newline()?;
                let Some(vline) = self.next_line()? else {
                    return Err(self.err("property key without value"));
                };
                let Some(vlen) = vline.strip_prefix(b"V ") else {
                    return Err(self.err(format!("expected V line, found {vline:?}")));
                };
                let vlen: usize = parse_len(vlen).ok_or_else(|| self.err("bad V length"))?;
                let value = self.read_exact(vlen)?;
                self.expect_newline()?;
                props.insert(
                    key.to_str().map_err(|_| self.err("non-UTF8 property name"))?,
                    value,
                );
            } else if let Some(len) = line.strip_prefix(b"D ") {
                let len: usize = parse_len(len).ok_or_else(|| self.err("bad D length"))?;
                let key = self.read_exact(len)?;
                self.expect_newline()?;
                props.insert(
                    key.to_str().map_err(|_| self.err("non-UTF8 property name"))?,
                    BString::from(""),
                );
            } else {
                return Err(self.err(format!("unexpected property line {line:?}")));
            }
        }
    }

    fn expect_newline(&mut self) -> Result<()> {
        let mut buf = [0u8; 1];
        self.reader
            .read_exact(&mut buf)
            .map_err(|_| self.err("truncated property block"))?;
        if buf[0] != b'\n' {
            return Err(self.err("property value not LF-terminated"));
        }
        self.lineno += 1;
        Ok(())
    }
}

fn parse_len(bytes: &[u8]) -> Option<usize> {
    bytes.to_str().ok()?.trim().parse().ok()
}

/// Parses a Subversion dumpfile (format versions 1 and 2, and the
/// non-delta parts of 3) into its revision records.
pub fn parse_dump(reader: impl BufRead) -> Result<SvnDump> {
    let mut parser = DumpParser { reader, lineno: 0 };
    let mut dump = SvnDump::default();

    let Some(preamble) = parser.read_headers()? else {
        return Err(parser.err("empty dump stream"));
    };
    let Some(version) = preamble.get("SVN-fs-dump-format-version") else {
        return Err(parser.err("not a Subversion dump stream"));
    };
    dump.format = version
        .trim()
        .parse()
        .map_err(|_| parser.err(format!("bad dump format version {version:?}")))?;
    if dump.format > 3 {
        return Err(parser.err(format!("unsupported dump format version {}", dump.format)));
    }

    loop {
        let Some(headers) = parser.read_headers()? else {
            break;
        };
        if let Some(uuid) = headers.get("UUID") {
            dump.uuid = Some(uuid.clone());
            continue;
        }
        if let Some(revision) = headers.get("Revision-number") {
            let revision: u64 = revision
                .parse()
                .map_err(|_| parser.err(format!("bad revision number {revision:?}")))?;
            let prop_len: usize = headers
                .get("Prop-content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let props = if prop_len > 0 {
                parser.read_props(prop_len)?
            } else {
                OrderedMap::new()
            };
            dump.revisions.push(RevisionRecord {
                revision,
                props,
                nodes: Vec::new(),
            });
            continue;
        }
        if let Some(path) = headers.get("Node-path") {
            let Some(record) = dump.revisions.last_mut() else {
                return Err(parser.err("node record before any revision"));
            };
            let kind = match headers.get("Node-kind").map(String::as_str) {
                Some("file") => NodeKind::File,
                Some("dir") => NodeKind::Dir,
                None => NodeKind::Unknown,
                Some(other) => {
                    return Err(parser.err(format!("unknown node kind {other:?}")));
                }
            };
            let action = match headers.get("Node-action").map(String::as_str) {
                Some("add") => ActionKind::Add,
                Some("change") => ActionKind::Change,
                Some("delete") => ActionKind::Delete,
                Some("replace") => ActionKind::Replace,
                other => {
                    return Err(parser.err(format!("missing or unknown node action {other:?}")));
                }
            };
            let from_rev = headers
                .get("Node-copyfrom-rev")
                .and_then(|v| v.parse().ok());
            let from_path = headers.get("Node-copyfrom-path").cloned();
            let prop_len: usize = headers
                .get("Prop-content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let text_len: Option<usize> = headers
                .get("Text-content-length")
                .and_then(|v| v.parse().ok());
            let props = if prop_len > 0 {
                Some(parser.read_props(prop_len)?)
            } else {
                None
            };
            let blob = match text_len {
                Some(len) => Some(parser.read_exact(len)?),
                None => None,
            };
            record.nodes.push(NodeAction {
                revision: record.revision,
                path: path.trim_matches('/').to_owned(),
                kind,
                action,
                from_rev,
                from_path: from_path.map(|p| p.trim_matches('/').to_owned()),
                content_hash: headers.get("Text-content-md5").cloned(),
                blob,
                props,
                dead: false,
                deleted_paths: Vec::new(),
                copied_entries: Vec::new(),
                prior: None,
                target_preexisting: false,
            });
            continue;
        }
        return Err(parser.err(format!(
            "unrecognized record with headers {:?}",
            headers.iter().map(|(k, _)| k).collect::<Vec<_>>()
        )));
    }
    Ok(dump)
}

fn prop_block(props: &OrderedMap<BString>) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in props.iter() {
        out.extend_from_slice(format!("K {}\n{}\nV {}\n", key.len(), key, value.len()).as_bytes());
        out.extend_from_slice(value);
        out.push(b'\n');
    }
    out.extend_from_slice(b"PROPS-END\n");
    out
}

/// A node record prepared for dump emission.
#[derive(Debug, Clone)]
pub struct DumpNode {
    pub path: String,
    pub kind: NodeKind,
    pub action: ActionKind,
    pub from_rev: Option<u64>,
    pub from_path: Option<String>,
    pub props: Option<OrderedMap<BString>>,
    pub text: Option<BString>,
}

/// Writes one revision record in dump form.
pub fn write_revision(
    out: &mut (impl std::io::Write + ?Sized),
    revision: u64,
    props: &OrderedMap<BString>,
    nodes: &[DumpNode],
) -> Result<()> {
    let prop_bytes = prop_block(props);
    writeln!(out, "Revision-number: {revision}")?;
    writeln!(out, "Prop-content-length: {}", prop_bytes.len())?;
    writeln!(out, "Content-length: {}", prop_bytes.len())?;
    writeln!(out)?;
    out.write_all(&prop_bytes)?;
    writeln!(out)?;
    for node in nodes {
        writeln!(out, "Node-path: {}", node.path)?;
        if node.kind != NodeKind::Unknown {
            writeln!(
                out,
                "Node-kind: {}",
                if node.kind == NodeKind::File { "file" } else { "dir" }
            )?;
        }
        let action = match node.action {
            ActionKind::Add => "add",
            ActionKind::Change => "change",
            ActionKind::Delete => "delete",
            ActionKind::Replace => "replace",
        };
        writeln!(out, "Node-action: {action}")?;
        if let (Some(rev), Some(path)) = (node.from_rev, &node.from_path) {
            writeln!(out, "Node-copyfrom-rev: {rev}")?;
            writeln!(out, "Node-copyfrom-path: {path}")?;
        }
        let prop_bytes = node.props.as_ref().map(prop_block);
        let prop_len = prop_bytes.as_ref().map_or(0, Vec::len);
        let text_len = node.text.as_ref().map_or(0, |t| t.len());
        if prop_bytes.is_some() {
            writeln!(out, "Prop-content-length: {prop_len}")?;
        }
        if let Some(text) = &node.text {
            writeln!(out, "Text-content-length: {}", text.len())?;
        }
        if prop_bytes.is_some() || node.text.is_some() {
            writeln!(out, "Content-length: {}", prop_len + text_len)?;
        }
        writeln!(out)?;
        if let Some(bytes) = prop_bytes {
            out.write_all(&bytes)?;
        }
        if let Some(text) = &node.text {
            out.write_all(text)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Writes the dump preamble.
pub fn write_preamble(out: &mut (impl std::io::Write + ?Sized), uuid: Option<&str>) -> Result<()> {
    writeln!(out, "SVN-fs-dump-format-version: 2")?;
    writeln!(out)?;
    if let Some(uuid) = uuid {
        writeln!(out, "UUID: {uuid}")?;
        writeln!(out)?;
    }
    Ok(())
}

/// Maps a git ref to the Subversion directory the dump writer uses.
fn svn_branch_dir(branch: &str) -> String {
    if branch == "refs/heads/master" {
        "trunk".to_owned()
    } else if let Some(tag) = branch.strip_prefix("refs/tags/") {
        format!("tags/{tag}")
    } else if let Some(name) = branch.strip_prefix("refs/heads/") {
        format!("branches/{name}")
    } else {
        format!("branches/{branch}")
    }
}

/// Writes the repository as a Subversion dump stream. This path is
/// inherently lossy: gitspace history compresses into the copy-based model,
/// merges become svn:mergeinfo, author identities lose everything but the
/// local part of the email, and annotated tags become directory copies
/// under tags/. It does not round-trip through the reader.
pub fn write_dump(repo: &crate::repository::Repository, out: &mut (impl std::io::Write + ?Sized)) -> Result<()> {
    use crate::event::BlobRef;
    use crate::event::Event;
    use crate::event::FileOp;
    use crate::event::MODE_EXECUTABLE;
    use crate::event::MODE_SYMLINK;

    write_preamble(out, None)?;
    // Revision 0 carries only a date, like a fresh svnadmin create.
    let zero_date = repo
        .events
        .iter()
        .filter_map(Event::as_commit)
        .map(|c| c.committer.date)
        .min();
    let mut props = OrderedMap::new();
    if let Some(date) = zero_date {
        props.insert("svn:date", BString::from(date.svn_form()));
    }
    write_revision(out, 0, &props, &[])?;

    let mut revision = 0u64;
    // Already-created directories, plus the dump revision that realized
    // each commit mark, for copyfrom links.
    let mut created_dirs: std::collections::HashSet<String> = std::collections::HashSet::new();
    let mut mark_rev: HashMap<String, u64> = HashMap::new();

    let blob_text = |blobref: &BlobRef, mode: &str| -> Result<BString> {
        let content = match blobref {
            BlobRef::Inline(data) => data.clone(),
            BlobRef::Mark(mark) => repo
                .blob_by_mark(mark)
                .map(|b| b.materialize(repo.source_handle.as_ref()))
                .transpose()?
                .unwrap_or_default(),
        };
        if mode == MODE_SYMLINK {
            let mut text = BString::from("link ");
            text.extend_from_slice(&content);
            Ok(text)
        } else {
            Ok(content)
        }
    };

    for event in &repo.events {
        match event {
            Event::Commit(commit) => {
                revision += 1;
                let branch_dir = svn_branch_dir(&commit.branch);
                let mut nodes: Vec<DumpNode> = Vec::new();

                // Parent directories of the branch dir, then the branch dir
                // itself; new branches copy from their first foreign parent.
                for ancestor in ancestor_dirs(&branch_dir) {
                    if created_dirs.insert(ancestor.clone()) {
                        nodes.push(DumpNode {
                            path: ancestor,
                            kind: NodeKind::Dir,
                            action: ActionKind::Add,
                            from_rev: None,
                            from_path: None,
                            props: None,
                            text: None,
                        });
                    }
                }
                if created_dirs.insert(branch_dir.clone()) {
                    let copy_source = commit.first_parent_mark().and_then(|parent| {
                        let parent_commit = repo.commit_by_mark(parent)?;
                        if parent_commit.branch == commit.branch {
                            return None;
                        }
                        let source_dir = svn_branch_dir(&parent_commit.branch);
                        let source_rev = mark_rev.get(parent)?;
                        Some((source_dir, *source_rev))
                    });
                    nodes.push(DumpNode {
                        path: branch_dir.clone(),
                        kind: NodeKind::Dir,
                        action: ActionKind::Add,
                        from_rev: copy_source.as_ref().map(|(_, rev)| *rev),
                        from_path: copy_source.map(|(dir, _)| dir),
                        props: None,
                        text: None,
                    });
                }

                // Merges are expressed as svn:mergeinfo on the branch dir.
                if commit.parents.len() > 1 {
                    let mut value = BString::from("");
                    for parent in commit.parent_marks().iter().skip(1) {
                        if let (Some(parent_commit), Some(rev)) =
                            (repo.commit_by_mark(parent), mark_rev.get(*parent))
                        {
                            let dir = svn_branch_dir(&parent_commit.branch);
                            value.extend_from_slice(format!("/{dir}:1-{rev}\n").as_bytes());
                        }
                    }
                    if !value.is_empty() {
                        let mut props = OrderedMap::new();
                        props.insert("svn:mergeinfo", value);
                        nodes.push(DumpNode {
                            path: branch_dir.clone(),
                            kind: NodeKind::Dir,
                            action: ActionKind::Change,
                            from_rev: None,
                            from_path: None,
                            props: Some(props),
                            text: None,
                        });
                    }
                }

                let parent_manifest = match commit.first_parent_mark() {
                    Some(parent) => repo.manifest(parent)?,
                    None => crate::event::Manifest::new(),
                };
                for op in &commit.fileops {
                    match op {
                        FileOp::Modify {
                            mode,
                            blobref,
                            path,
                        } => {
                            let mut props = OrderedMap::new();
                            if mode == MODE_EXECUTABLE {
                                props.insert("svn:executable", BString::from("*"));
                            }
                            if mode == MODE_SYMLINK {
                                props.insert("svn:special", BString::from("*"));
                            }
                            let action = if parent_manifest.contains(path.as_bstr()) {
                                ActionKind::Change
                            } else {
                                ActionKind::Add
                            };
                            nodes.push(DumpNode {
                                path: format!("{}/{}", branch_dir, path.to_str_lossy()),
                                kind: NodeKind::File,
                                action,
                                from_rev: None,
                                from_path: None,
                                props: (!props.is_empty()).then_some(props),
                                text: Some(blob_text(blobref, mode)?),
                            });
                        }
                        FileOp::Delete { path } => {
                            nodes.push(DumpNode {
                                path: format!("{}/{}", branch_dir, path.to_str_lossy()),
                                kind: NodeKind::Unknown,
                                action: ActionKind::Delete,
                                from_rev: None,
                                from_path: None,
                                props: None,
                                text: None,
                            });
                        }
                        FileOp::Rename { source, target } => {
                            nodes.push(DumpNode {
                                path: format!("{}/{}", branch_dir, target.to_str_lossy()),
                                kind: NodeKind::File,
                                action: ActionKind::Add,
                                from_rev: Some(revision - 1),
                                from_path: Some(format!(
                                    "{}/{}",
                                    branch_dir,
                                    source.to_str_lossy()
                                )),
                                props: None,
                                text: None,
                            });
                            nodes.push(DumpNode {
                                path: format!("{}/{}", branch_dir, source.to_str_lossy()),
                                kind: NodeKind::Unknown,
                                action: ActionKind::Delete,
                                from_rev: None,
                                from_path: None,
                                props: None,
                                text: None,
                            });
                        }
                        FileOp::Copy { source, target } => {
                            nodes.push(DumpNode {
                                path: format!("{}/{}", branch_dir, target.to_str_lossy()),
                                kind: NodeKind::File,
                                action: ActionKind::Add,
                                from_rev: Some(revision - 1),
                                from_path: Some(format!(
                                    "{}/{}",
                                    branch_dir,
                                    source.to_str_lossy()
                                )),
                                props: None,
                                text: None,
                            });
                        }
                        FileOp::DeleteAll => {
                            nodes.push(DumpNode {
                                path: branch_dir.clone(),
                                kind: NodeKind::Dir,
                                action: ActionKind::Delete,
                                from_rev: None,
                                from_path: None,
                                props: None,
                                text: None,
                            });
                            created_dirs.remove(&branch_dir);
                        }
                        // Notes have no Subversion representation.
                        FileOp::Note { .. } => {}
                    }
                }

                let mut props = OrderedMap::new();
                let mut log = commit.comment.clone();
                if log.ends_with(b"\n") {
                    log.pop();
                }
                props.insert("svn:log", log);
                let local = commit
                    .committer
                    .email
                    .split('@')
                    .next()
                    .unwrap_or("no-author");
                props.insert("svn:author", BString::from(local));
                props.insert("svn:date", BString::from(commit.committer.date.svn_form()));
                write_revision(out, revision, &props, &nodes)?;
                if let Some(mark) = &commit.mark {
                    mark_rev.insert(mark.clone(), revision);
                }
            }
            Event::Tag(tag) => {
                let Some(target_rev) = tag.committish.mark().and_then(|m| mark_rev.get(m)) else {
                    continue;
                };
                let Some(target) = tag
                    .committish
                    .mark()
                    .and_then(|m| repo.commit_by_mark(m))
                else {
                    continue;
                };
                revision += 1;
                let mut nodes = Vec::new();
                for ancestor in ancestor_dirs(&format!("tags/{}", tag.name)) {
                    if created_dirs.insert(ancestor.clone()) {
                        nodes.push(DumpNode {
                            path: ancestor,
                            kind: NodeKind::Dir,
                            action: ActionKind::Add,
                            from_rev: None,
                            from_path: None,
                            props: None,
                            text: None,
                        });
                    }
                }
                nodes.push(DumpNode {
                    path: format!("tags/{}", tag.name),
                    kind: NodeKind::Dir,
                    action: ActionKind::Add,
                    from_rev: Some(*target_rev),
                    from_path: Some(svn_branch_dir(&target.branch)),
                    props: None,
                    text: None,
                });
                let mut props = OrderedMap::new();
                let mut log = tag.comment.clone();
                if log.ends_with(b"\n") {
                    log.pop();
                }
                props.insert("svn:log", log);
                if let Some(tagger) = &tag.tagger {
                    let local = tagger.email.split('@').next().unwrap_or("no-author");
                    props.insert("svn:author", BString::from(local));
                    props.insert("svn:date", BString::from(tagger.date.svn_form()));
                }
                write_revision(out, revision, &props, &nodes)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn ancestor_dirs(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut acc = String::new();
    let components: Vec<&str> = path.split('/').collect();
    for component in &components[..components.len().saturating_sub(1)] {
        if !acc.is_empty() {
            acc.push('/');
        }
        acc.push_str(component);
        out.push(acc.clone());
    }
    out
}
